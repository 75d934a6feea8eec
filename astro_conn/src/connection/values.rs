//! Value registry access and value updates sent to the peer.

use super::{Connection, Transport};
use crate::error::{ConnError, ValueError};
use crate::value::{Value, ValuePayload, ValueSet};
use astro::consts::{PROTO_VALUE, VALUE_INFOTIME, VALUE_SELECTION};

impl<S: Transport> Connection<S> {
    pub fn values(&self) -> &ValueSet {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut ValueSet {
        &mut self.values
    }

    pub fn get_value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Lookup requiring `type_code`; a mismatch is a caller error.
    pub fn get_value_type(&self, name: &str, type_code: u32) -> Result<&Value, ValueError> {
        self.values.get_typed(name, type_code)
    }

    fn existing(&self, name: &str) -> Result<&Value, ValueError> {
        self.values.get(name).ok_or_else(|| ValueError::NotFound {
            name: name.to_string(),
        })
    }

    pub fn value_double(&self, name: &str) -> Result<f64, ValueError> {
        let value = self.existing(name)?;
        value.value_double().ok_or(ValueError::UnsupportedType {
            type_code: value.type_code(),
        })
    }

    pub fn value_integer(&self, name: &str) -> Result<i64, ValueError> {
        let value = self.existing(name)?;
        value.value_integer().ok_or(ValueError::UnsupportedType {
            type_code: value.type_code(),
        })
    }

    pub fn value_char(&self, name: &str) -> Result<String, ValueError> {
        Ok(self.existing(name)?.value_char())
    }

    /// Name of the selected entry of a selection value.
    pub fn value_selection(&self, name: &str) -> Result<String, ValueError> {
        Ok(self.get_value_type(name, VALUE_SELECTION)?.value_char())
    }

    /// Values the peer flags as warning or error.
    pub fn failed_values(&self) -> Vec<&Value> {
        self.values.failed().collect()
    }

    /// Peer's `infotime` value, if declared and set.
    pub fn info_time(&self) -> Option<f64> {
        self.values
            .get(VALUE_INFOTIME)
            .and_then(Value::value_double)
            .filter(|t| !t.is_nan())
    }

    /// True when `infotime` moved since the last [`reset_info_time`](Self::reset_info_time).
    pub fn info_time_changed(&self) -> bool {
        match (self.info_time(), self.last_info_time) {
            (Some(now), Some(last)) => now != last,
            (Some(_), None) => true,
            _ => false,
        }
    }

    pub fn reset_info_time(&mut self) {
        self.last_info_time = self.info_time();
    }

    /// Send a value update for `name`.
    pub fn send_value(&mut self, name: &str, payload: &ValuePayload) -> Result<(), ConnError> {
        payload.check_wire()?;
        self.send_value_raw(name, &payload.to_wire())
    }

    /// Send a value update with preformatted fields.
    pub fn send_value_raw(&mut self, name: &str, fields: &str) -> Result<(), ConnError> {
        self.send_msg(&format!("{PROTO_VALUE} {name} {fields}"))
    }
}
