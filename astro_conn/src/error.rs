//! Connection error types.
//!
//! [`ParamError`] is local to one protocol line: the line is rejected and
//! the connection carries on. [`ConnError`] means the connection went
//! through its error funnel (or was never usable) and the owning block has
//! to decide on reconnection.

use crate::state::ConnState;
use astro_shared_memory::ShmError;
use thiserror::Error;

/// Malformed or unexpected line parameters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamError {
    #[error("missing parameter")]
    Missing,

    #[error("invalid {expected} parameter '{token}'")]
    Invalid {
        expected: &'static str,
        token: String,
    },

    #[error("unexpected trailing parameters '{rest}'")]
    Trailing { rest: String },

    #[error("unknown value {name}")]
    UnknownValue { name: String },

    #[error("value {name} is not a {expected}")]
    WrongType { name: String, expected: &'static str },

    #[error("unsupported: {what}")]
    Unsupported { what: String },
}

/// Fatal-to-this-connection conditions.
#[derive(Debug, Error)]
pub enum ConnError {
    #[error("I/O error on connection '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection '{name}' closed by peer")]
    Closed { name: String },

    #[error("protocol violation on connection '{name}': {reason}")]
    Protocol { name: String, reason: String },

    #[error("connection '{name}' timed out")]
    Timeout { name: String },

    #[error("connection '{name}' is not usable in state {state}")]
    NotConnected { name: String, state: ConnState },

    #[error("cannot resolve address {addr}")]
    Resolve {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("authorization not pending on connection '{name}' (state {state})")]
    AuthNotPending { name: String, state: ConnState },

    #[error("authorization failed on connection '{name}'")]
    AuthFailed { name: String },

    #[error("unknown data connection {id}")]
    UnknownDataConn { id: i32 },

    #[error("data connection {id} has no channel {chan}")]
    UnknownChannel { id: i32, chan: usize },

    #[error("shared memory error: {0}")]
    Shm(#[from] ShmError),

    #[error("line for connection '{name}' cannot be sent: {line:?}")]
    Unsendable { name: String, line: String },

    #[error(transparent)]
    Value(#[from] ValueError),
}

/// Data channel bookkeeping failures.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("no data channel {chan}")]
    NoChannel { chan: usize },

    #[error("chunk of {chunk} bytes exceeds the {remaining} bytes still owed")]
    ChunkTooLarge { chunk: usize, remaining: usize },

    #[error("bad data header: {0}")]
    Header(#[from] ParamError),

    #[error("channel {chan} is not read from the socket")]
    NotSocket { chan: usize },

    #[error("I/O error while reading data: {0}")]
    Io(#[from] std::io::Error),

    #[error("shared memory error: {0}")]
    Shm(#[from] ShmError),

    #[error("announced channel sizes overflow")]
    SizeOverflow,

    #[error("announced transfer of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },
}

/// Value registry lookups.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    #[error("cannot find value with name {name}")]
    NotFound { name: String },

    #[error("value {name} has wrong type: expected {expected:#x}, found {found:#x}")]
    WrongType {
        name: String,
        expected: u32,
        found: u32,
    },

    #[error("unsupported value type {type_code:#x}")]
    UnsupportedType { type_code: u32 },

    #[error("string {text:?} cannot be sent inside quotes")]
    Unquotable { text: String },
}
