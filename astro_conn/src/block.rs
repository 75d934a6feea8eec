//! Hooks the owning event loop provides to its connections.
//!
//! A block owns many connections, polls their sockets and routes commands
//! and events between them. Connections never call back into each other;
//! everything they observe is reported through [`Block`]. Every hook has a
//! do-nothing default so a block implements only what it routes.

use crate::command::{Command, OriginatorId};
use crate::data::DataChannels;
use crate::error::ParamError;
use crate::lexer::ParamCursor;
use crate::message::Message;
use crate::state::{ConnState, ConnType};
use crate::value::Value;
use astro::state::ServerState;

/// Identity of the connection raising a hook.
#[derive(Debug, Clone, Copy)]
pub struct PeerRef<'a> {
    pub name: &'a str,
    pub centrald_id: i32,
    pub centrald_num: i32,
    pub conn_type: ConnType,
}

/// How a handled command line is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineReply {
    /// Answer `+000 OK`.
    Ok,
    /// Handled; the handler answered itself or no answer is due.
    Silent,
}

/// Asynchronous notifications passed between a block and its connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A command queued with an originator completed.
    CommandReturned {
        originator: OriginatorId,
        command: String,
        status: i32,
    },
    /// The coordinator's state changed; its BOP bits gate every queue.
    MasterStateChanged { state: u32 },
    /// Drop all queued commands.
    QueClear,
    /// An originator went away; forget it on queued commands.
    DeleteOriginator { originator: OriginatorId },
}

/// Device announced by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAddress {
    pub centrald_num: i32,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub device_type: i32,
}

/// Client announced by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub centrald_id: i32,
    pub login: String,
    pub name: String,
}

#[allow(unused_variables)]
pub trait Block {
    fn post_event(&mut self, event: Event) {}

    fn conn_state_changed(&mut self, peer: PeerRef<'_>, old: ConnState, new: ConnState) {}

    /// Fired once per terminal condition. `code < 0` I/O error, `0` end of
    /// stream, `> 0` unusable bytes were read.
    fn connection_error(&mut self, peer: PeerRef<'_>, code: isize) {}

    fn state_changed(&mut self, peer: PeerRef<'_>, state: &ServerState, msg: Option<&str>) {}

    fn device_ready(&mut self, peer: PeerRef<'_>) {}

    fn device_idle(&mut self, peer: PeerRef<'_>) {}

    fn progress(&mut self, peer: PeerRef<'_>, start: f64, end: f64) {}

    fn message(&mut self, peer: PeerRef<'_>, msg: &Message) {}

    fn value_changed(&mut self, peer: PeerRef<'_>, value: &Value) {}

    /// Completion of a command that went on the wire.
    fn command_return(&mut self, peer: PeerRef<'_>, cmd: &Command, status: i32) {}

    /// `X` line from the peer.
    fn set_value(
        &mut self,
        peer: PeerRef<'_>,
        params: &mut ParamCursor<'_>,
    ) -> Result<LineReply, ParamError> {
        Err(ParamError::Unsupported {
            what: "setting values".to_string(),
        })
    }

    /// Any other command line. `None` means the block does not know it.
    fn command(
        &mut self,
        peer: PeerRef<'_>,
        command: &str,
        params: &mut ParamCursor<'_>,
    ) -> Option<Result<LineReply, ParamError>> {
        None
    }

    fn add_address(&mut self, address: DeviceAddress) {}

    fn delete_address(&mut self, centrald_num: i32, name: &str) {}

    fn add_client(&mut self, client: ClientInfo) {}

    fn delete_client(&mut self, centrald_id: i32) {}

    fn status_info(&mut self, peer: PeerRef<'_>) {}

    fn new_data_conn(&mut self, peer: PeerRef<'_>, id: i32) {}

    fn data_received(&mut self, peer: PeerRef<'_>, id: i32, channels: &DataChannels) {}

    fn full_data_received(&mut self, peer: PeerRef<'_>, id: i32, channels: &DataChannels) {}

    fn fits_data(&mut self, peer: PeerRef<'_>, path: &str) {}
}
