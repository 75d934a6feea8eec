//! Named, typed values exposed by peers.
//!
//! A peer declares each value once with an `E` line carrying its type
//! code and then sends `V` updates. The payload variant is fixed by the
//! declared type; updates are parsed field by field with the parameter
//! cursor and written back in the same text form.

use crate::error::{ParamError, ValueError};
use crate::lexer::ParamCursor;
use astro::consts::*;
use serde::Serialize;

// ─── Payload ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ValuePayload {
    String(String),
    Integer(i32),
    Time(f64),
    Double(f64),
    Float(f32),
    Bool(bool),
    Selection { index: usize, names: Vec<String> },
    Long(i64),
    RaDec { ra: f64, dec: f64 },
    AltAz { alt: f64, az: f64 },
    StringArray(Vec<String>),
    IntegerArray(Vec<i32>),
    DoubleArray(Vec<f64>),
    TimeArray(Vec<f64>),
    BoolArray(Vec<bool>),
}

fn fmt_double(v: f64) -> String {
    if v.is_nan() {
        "nan".to_string()
    } else {
        format!("{v:e}")
    }
}

fn fmt_float(v: f32) -> String {
    if v.is_nan() {
        "nan".to_string()
    } else {
        format!("{v:e}")
    }
}

fn quote(s: &str) -> String {
    format!("\"{s}\"")
}

/// Quoted fields end at the next `"` and lines at `\n` or NUL, so such
/// strings cannot be written back verbatim.
fn quotable(s: &str) -> bool {
    !s.contains(['"', '\r', '\n', '\0'])
}

fn join<T>(items: &[T], f: impl Fn(&T) -> String) -> String {
    items.iter().map(f).collect::<Vec<_>>().join(" ")
}

impl ValuePayload {
    /// Empty payload for a wire type code.
    pub fn for_type(type_code: u32) -> Result<Self, ValueError> {
        let base = type_code & VALUE_BASE_TYPE;
        let payload = if type_code & VALUE_EXT_TYPE == VALUE_ARRAY {
            match base {
                VALUE_STRING => ValuePayload::StringArray(Vec::new()),
                VALUE_INTEGER => ValuePayload::IntegerArray(Vec::new()),
                VALUE_DOUBLE => ValuePayload::DoubleArray(Vec::new()),
                VALUE_TIME => ValuePayload::TimeArray(Vec::new()),
                VALUE_BOOL => ValuePayload::BoolArray(Vec::new()),
                _ => return Err(ValueError::UnsupportedType { type_code }),
            }
        } else if type_code & VALUE_EXT_TYPE != 0 {
            return Err(ValueError::UnsupportedType { type_code });
        } else {
            match base {
                VALUE_STRING => ValuePayload::String(String::new()),
                VALUE_INTEGER => ValuePayload::Integer(0),
                VALUE_TIME => ValuePayload::Time(f64::NAN),
                VALUE_DOUBLE => ValuePayload::Double(f64::NAN),
                VALUE_FLOAT => ValuePayload::Float(f32::NAN),
                VALUE_BOOL => ValuePayload::Bool(false),
                VALUE_SELECTION => ValuePayload::Selection {
                    index: 0,
                    names: Vec::new(),
                },
                VALUE_LONGINT => ValuePayload::Long(0),
                VALUE_RADEC => ValuePayload::RaDec {
                    ra: f64::NAN,
                    dec: f64::NAN,
                },
                VALUE_ALTAZ => ValuePayload::AltAz {
                    alt: f64::NAN,
                    az: f64::NAN,
                },
                _ => return Err(ValueError::UnsupportedType { type_code }),
            }
        };
        Ok(payload)
    }

    pub fn type_code(&self) -> u32 {
        match self {
            ValuePayload::String(_) => VALUE_STRING,
            ValuePayload::Integer(_) => VALUE_INTEGER,
            ValuePayload::Time(_) => VALUE_TIME,
            ValuePayload::Double(_) => VALUE_DOUBLE,
            ValuePayload::Float(_) => VALUE_FLOAT,
            ValuePayload::Bool(_) => VALUE_BOOL,
            ValuePayload::Selection { .. } => VALUE_SELECTION,
            ValuePayload::Long(_) => VALUE_LONGINT,
            ValuePayload::RaDec { .. } => VALUE_RADEC,
            ValuePayload::AltAz { .. } => VALUE_ALTAZ,
            ValuePayload::StringArray(_) => VALUE_STRING | VALUE_ARRAY,
            ValuePayload::IntegerArray(_) => VALUE_INTEGER | VALUE_ARRAY,
            ValuePayload::DoubleArray(_) => VALUE_DOUBLE | VALUE_ARRAY,
            ValuePayload::TimeArray(_) => VALUE_TIME | VALUE_ARRAY,
            ValuePayload::BoolArray(_) => VALUE_BOOL | VALUE_ARRAY,
        }
    }

    /// Field text following the value name on a `V` line.
    pub fn to_wire(&self) -> String {
        match self {
            ValuePayload::String(s) => quote(s),
            ValuePayload::Integer(v) => v.to_string(),
            ValuePayload::Time(v) | ValuePayload::Double(v) => fmt_double(*v),
            ValuePayload::Float(v) => fmt_float(*v),
            ValuePayload::Bool(v) => u8::from(*v).to_string(),
            ValuePayload::Selection { index, .. } => index.to_string(),
            ValuePayload::Long(v) => v.to_string(),
            ValuePayload::RaDec { ra, dec } => format!("{} {}", fmt_double(*ra), fmt_double(*dec)),
            ValuePayload::AltAz { alt, az } => format!("{} {}", fmt_double(*alt), fmt_double(*az)),
            ValuePayload::StringArray(v) => join(v, |s| quote(s)),
            ValuePayload::IntegerArray(v) => join(v, |i| i.to_string()),
            ValuePayload::DoubleArray(v) | ValuePayload::TimeArray(v) => join(v, |d| fmt_double(*d)),
            ValuePayload::BoolArray(v) => join(v, |b| u8::from(*b).to_string()),
        }
    }

    /// Fails when a string field cannot be carried by `to_wire`.
    pub fn check_wire(&self) -> Result<(), ValueError> {
        let strings = match self {
            ValuePayload::String(s) => std::slice::from_ref(s),
            ValuePayload::StringArray(v) => v.as_slice(),
            _ => return Ok(()),
        };
        match strings.iter().find(|s| !quotable(s)) {
            Some(text) => Err(ValueError::Unquotable { text: text.clone() }),
            None => Ok(()),
        }
    }

    /// Replace the payload with fields read from `params`, keeping the
    /// variant. On error the payload is left untouched.
    pub fn parse(&mut self, params: &mut ParamCursor<'_>, now: f64) -> Result<(), ParamError> {
        let parsed = match self {
            ValuePayload::String(_) => ValuePayload::String(params.next_string()?.to_string()),
            ValuePayload::Integer(_) => ValuePayload::Integer(params.next_integer()?),
            ValuePayload::Time(_) => ValuePayload::Time(params.next_double_time(now)?),
            ValuePayload::Double(_) => ValuePayload::Double(params.next_double()?),
            ValuePayload::Float(_) => ValuePayload::Float(params.next_float()?),
            ValuePayload::Bool(_) => ValuePayload::Bool(params.next_bool()?),
            ValuePayload::Selection { names, .. } => {
                let token = params.next_string()?;
                let index = match token.parse::<usize>() {
                    Ok(i) => i,
                    Err(_) => names.iter().position(|n| n == token).ok_or_else(|| {
                        ParamError::Invalid {
                            expected: "selection",
                            token: token.to_string(),
                        }
                    })?,
                };
                if !names.is_empty() && index >= names.len() {
                    return Err(ParamError::Invalid {
                        expected: "selection",
                        token: token.to_string(),
                    });
                }
                ValuePayload::Selection {
                    index,
                    names: names.clone(),
                }
            }
            ValuePayload::Long(_) => ValuePayload::Long(params.next_long()?),
            ValuePayload::RaDec { .. } => {
                let ra = params.next_double()?;
                let dec = if params.param_end() { ra } else { params.next_double()? };
                ValuePayload::RaDec { ra, dec }
            }
            ValuePayload::AltAz { .. } => {
                let alt = params.next_double()?;
                let az = if params.param_end() { alt } else { params.next_double()? };
                ValuePayload::AltAz { alt, az }
            }
            ValuePayload::StringArray(_) => {
                let mut v = Vec::new();
                while !params.param_end() {
                    v.push(params.next_string()?.to_string());
                }
                ValuePayload::StringArray(v)
            }
            ValuePayload::IntegerArray(_) => {
                let mut v = Vec::new();
                while !params.param_end() {
                    v.push(params.next_integer()?);
                }
                ValuePayload::IntegerArray(v)
            }
            ValuePayload::DoubleArray(_) => {
                let mut v = Vec::new();
                while !params.param_end() {
                    v.push(params.next_double()?);
                }
                ValuePayload::DoubleArray(v)
            }
            ValuePayload::TimeArray(_) => {
                let mut v = Vec::new();
                while !params.param_end() {
                    v.push(params.next_double_time(now)?);
                }
                ValuePayload::TimeArray(v)
            }
            ValuePayload::BoolArray(_) => {
                let mut v = Vec::new();
                while !params.param_end() {
                    v.push(params.next_bool()?);
                }
                ValuePayload::BoolArray(v)
            }
        };
        params.expect_end()?;
        *self = parsed;
        Ok(())
    }
}

// ─── Value ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Value {
    name: String,
    description: String,
    flags: u32,
    payload: ValuePayload,
    #[serde(skip)]
    changed: bool,
}

impl Value {
    /// New value from a meta-info declaration. The type is taken from the
    /// `VALUE_MASK` bits of `flags`.
    pub fn new(name: &str, description: &str, flags: u32) -> Result<Self, ValueError> {
        Ok(Self {
            name: name.to_string(),
            description: description.to_string(),
            flags,
            payload: ValuePayload::for_type(flags & VALUE_MASK)?,
            changed: false,
        })
    }

    pub fn with_payload(name: &str, payload: ValuePayload) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            flags: payload.type_code(),
            payload,
            changed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn type_code(&self) -> u32 {
        self.payload.type_code()
    }

    pub fn payload(&self) -> &ValuePayload {
        &self.payload
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub fn reset_changed(&mut self) {
        self.changed = false;
    }

    /// Warning or error flag raised by the peer.
    pub fn is_failed(&self) -> bool {
        self.flags & VALUE_BAD_MASK != 0
    }

    /// Redeclare with new flags. The payload is reset only if the type changed.
    pub fn redeclare(&mut self, description: &str, flags: u32) -> Result<(), ValueError> {
        if (flags & VALUE_MASK) != self.type_code() {
            self.payload = ValuePayload::for_type(flags & VALUE_MASK)?;
        }
        self.description = description.to_string();
        self.flags = flags;
        Ok(())
    }

    pub fn set_payload(&mut self, payload: ValuePayload) -> Result<(), ValueError> {
        if payload.type_code() != self.type_code() {
            return Err(ValueError::WrongType {
                name: self.name.clone(),
                expected: self.type_code(),
                found: payload.type_code(),
            });
        }
        if payload != self.payload {
            self.changed = true;
        }
        self.payload = payload;
        Ok(())
    }

    /// Parse an update; the value is marked changed on success.
    pub fn set_from_wire(&mut self, params: &mut ParamCursor<'_>, now: f64) -> Result<(), ParamError> {
        self.payload.parse(params, now)?;
        self.changed = true;
        Ok(())
    }

    /// Full `V` line for this value.
    pub fn to_wire_line(&self) -> String {
        format!("{PROTO_VALUE} {} {}", self.name, self.payload.to_wire())
    }

    pub fn clear_selection(&mut self) -> Result<(), ValueError> {
        match &mut self.payload {
            ValuePayload::Selection { index, names } => {
                names.clear();
                *index = 0;
                Ok(())
            }
            other => Err(ValueError::WrongType {
                name: self.name.clone(),
                expected: VALUE_SELECTION,
                found: other.type_code(),
            }),
        }
    }

    pub fn add_selection(&mut self, selname: &str) -> Result<(), ValueError> {
        match &mut self.payload {
            ValuePayload::Selection { names, .. } => {
                names.push(selname.to_string());
                Ok(())
            }
            other => Err(ValueError::WrongType {
                name: self.name.clone(),
                expected: VALUE_SELECTION,
                found: other.type_code(),
            }),
        }
    }

    /// Numeric view of scalar payloads.
    pub fn value_double(&self) -> Option<f64> {
        match &self.payload {
            ValuePayload::Integer(v) => Some(f64::from(*v)),
            ValuePayload::Time(v) | ValuePayload::Double(v) => Some(*v),
            ValuePayload::Float(v) => Some(f64::from(*v)),
            ValuePayload::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            ValuePayload::Selection { index, .. } => Some(*index as f64),
            ValuePayload::Long(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn value_integer(&self) -> Option<i64> {
        match &self.payload {
            ValuePayload::Integer(v) => Some(i64::from(*v)),
            ValuePayload::Long(v) => Some(*v),
            ValuePayload::Bool(v) => Some(i64::from(*v)),
            ValuePayload::Selection { index, .. } => i64::try_from(*index).ok(),
            ValuePayload::Time(v) | ValuePayload::Double(v) if v.is_finite() => Some(*v as i64),
            _ => None,
        }
    }

    /// Display text; selections show the selected name.
    pub fn value_char(&self) -> String {
        match &self.payload {
            ValuePayload::String(s) => s.clone(),
            ValuePayload::Selection { index, names } => names
                .get(*index)
                .cloned()
                .unwrap_or_else(|| index.to_string()),
            other => other.to_wire(),
        }
    }
}

// ─── Registry ───────────────────────────────────────────────────────

/// Values of one peer, in declaration order.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct ValueSet {
    values: Vec<Value>,
}

impl ValueSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.iter().find(|v| v.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.values.iter_mut().find(|v| v.name == name)
    }

    /// Lookup requiring a type; mismatch is an error.
    pub fn get_typed(&self, name: &str, type_code: u32) -> Result<&Value, ValueError> {
        let value = self.get(name).ok_or_else(|| ValueError::NotFound {
            name: name.to_string(),
        })?;
        if value.type_code() != type_code {
            return Err(ValueError::WrongType {
                name: name.to_string(),
                expected: type_code,
                found: value.type_code(),
            });
        }
        Ok(value)
    }

    /// Insert or replace by name.
    pub fn insert(&mut self, value: Value) {
        match self.values.iter_mut().find(|v| v.name == value.name) {
            Some(slot) => *slot = value,
            None => self.values.push(value),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let index = self.values.iter().position(|v| v.name == name)?;
        Some(self.values.remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }

    pub fn failed(&self) -> impl Iterator<Item = &Value> {
        self.values.iter().filter(|v| v.is_failed())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn reset_changed(&mut self) {
        self.values.iter_mut().for_each(Value::reset_changed);
    }
}
