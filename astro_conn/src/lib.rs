//! # Astro Connection Engine
//!
//! Per-connection protocol engine of the observatory control network.
//! Device and client processes talk a line-oriented ASCII protocol over
//! TCP; each [`Connection`] owns one socket and keeps the peer's view:
//! its status word, its BOP (block operation) state, its named values and
//! any bulk data transfers in flight.
//!
//! ## Wire Format
//!
//! ```text
//! info                      command line, answered by one completion
//! +000 OK / -003 bad value  completion reply
//! S 4 "exposing"            status update
//! B 4 16777216              status and BOP state
//! V exposure 1e1            value update
//! C 1 0 2 1024 1024         binary transfer announcement
//! D 1 0 512                 binary chunk header, raw bytes follow
//! I 2 32768 1 0             shared memory transfer announcement
//! ```
//!
//! ## Command Queue
//!
//! Commands are sent strictly in queue order with at most one in flight.
//! A command carrying a `not_bop` mask waits at the queue head while the
//! peer's BOP state intersects it, and everything queued behind waits too.
//!
//! The owning event loop implements [`Block`] and calls `add`, `receive`,
//! `writable` and `idle` on every connection it polls.

pub mod block;
pub mod command;
pub mod connection;
pub mod data;
pub mod error;
pub mod lexer;
pub mod message;
pub mod state;
pub mod value;

pub use block::{Block, ClientInfo, DeviceAddress, Event, LineReply, PeerRef};
pub use command::{Command, CommandQueue, OriginatorId, RunningStatus};
pub use connection::{Connection, Transport, wall_time};
pub use data::{DataChannels, DataRead, DataWrite, ReadChannel, WriteChannel};
pub use error::{ConnError, DataError, ParamError, ValueError};
pub use lexer::ParamCursor;
pub use message::Message;
pub use state::{ConnState, ConnType};
pub use value::{Value, ValuePayload, ValueSet};
