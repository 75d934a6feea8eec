//! Connection state and role.

use serde::Serialize;
use std::fmt;

/// Lifecycle state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnState {
    Unknown,
    ResolvingDevice,
    Connecting,
    InProgress,
    Connected,
    Broken,
    Delete,
    AuthPending,
    AuthOk,
    AuthFailed,
}

impl ConnState {
    /// Queued commands may go on the wire.
    pub fn accepts_commands(self) -> bool {
        matches!(self, ConnState::Connected | ConnState::AuthOk)
    }

    /// Terminal for the current socket; only the owning block may revive it.
    pub fn is_dead(self) -> bool {
        matches!(self, ConnState::Broken | ConnState::Delete)
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnState::Unknown => "UNKNOWN",
            ConnState::ResolvingDevice => "RESOLVING_DEVICE",
            ConnState::Connecting => "CONNECTING",
            ConnState::InProgress => "INPROGRESS",
            ConnState::Connected => "CONNECTED",
            ConnState::Broken => "BROKEN",
            ConnState::Delete => "DELETE",
            ConnState::AuthPending => "AUTH_PENDING",
            ConnState::AuthOk => "AUTH_OK",
            ConnState::AuthFailed => "AUTH_FAILED",
        };
        f.write_str(name)
    }
}

/// Logical role of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnType {
    #[default]
    NotDefined,
    ClientServer,
    DeviceServer,
    DeviceDevice,
}
