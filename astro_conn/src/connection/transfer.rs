//! Sending bulk data, progress and messages to the peer.

use super::{Connection, Transport};
use crate::data::{DataChannels, DataWrite, ReadChannel, WriteChannel};
use crate::error::{ConnError, DataError};
use crate::message::Message;
use astro::consts::*;
use astro_shared_memory::DataSharedWrite;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::{debug, warn};

impl<S: Transport> Connection<S> {
    fn next_data_conn(&mut self) -> i32 {
        self.data_conn = self.data_conn.wrapping_add(1).max(1);
        self.data_conn
    }

    fn channel_error(&self, id: i32, chan: usize, e: DataError) -> ConnError {
        match e {
            DataError::NoChannel { .. } => ConnError::UnknownChannel { id, chan },
            DataError::Shm(shm) => ConnError::Shm(shm),
            other => ConnError::Protocol {
                name: self.name.clone(),
                reason: other.to_string(),
            },
        }
    }

    // ─── Socket channels ────────────────────────────────────────────

    /// Announce a binary transfer of `sizes.len()` channels; returns its id.
    pub fn start_binary_data(&mut self, data_type: i32, sizes: &[usize]) -> Result<i32, ConnError> {
        let write = DataWrite::new(sizes).map_err(|e| ConnError::Protocol {
            name: self.name.clone(),
            reason: e.to_string(),
        })?;
        let id = self.next_data_conn();
        let mut header = format!("{PROTO_BINARY} {id} {data_type} {}", sizes.len());
        for size in sizes {
            header.push(' ');
            header.push_str(&size.to_string());
        }
        self.send_msg(&header)?;
        self.write_channels
            .insert(id, WriteChannel::Socket(write));
        debug!("Connection {} started binary data {id}", self.name);
        Ok(id)
    }

    /// Send one chunk of channel `chan`.
    pub fn send_binary_data(&mut self, id: i32, chan: usize, data: &[u8]) -> Result<(), ConnError> {
        let written = match self.write_channels.get_mut(&id) {
            Some(WriteChannel::Socket(write)) => write.data_written(chan, data.len()),
            Some(WriteChannel::Shared(_)) => Err(DataError::NotSocket { chan }),
            None => return Err(ConnError::UnknownDataConn { id }),
        };
        if let Err(e) = written {
            return Err(self.channel_error(id, chan, e));
        }
        self.send_msg(&format!("{PROTO_DATA} {id} {chan} {}", data.len()))?;
        self.send_bytes(data)
    }

    pub fn end_binary_data(&mut self, id: i32) -> Result<(), ConnError> {
        match self.write_channels.remove(&id) {
            Some(WriteChannel::Socket(write)) => {
                if write.data_size() > 0 {
                    warn!(
                        "Connection {} ends binary data {id} with {} bytes unsent",
                        self.name,
                        write.data_size()
                    );
                }
            }
            Some(other) => {
                self.write_channels.insert(id, other);
                return Err(ConnError::UnknownDataConn { id });
            }
            None => return Err(ConnError::UnknownDataConn { id }),
        }
        self.send_msg(&format!("{PROTO_BINARY_KILLED} {id}"))
    }

    // ─── Shared channels ────────────────────────────────────────────

    /// Announce `segnums` of `writer` as a transfer; returns its id.
    pub fn start_shared_data(&mut self, writer: &DataSharedWrite, segnums: &[usize]) -> Result<i32, ConnError> {
        let id = self.next_data_conn();
        let mut header = format!("{PROTO_SHARED} {id} {} {}", writer.shm_id(), segnums.len());
        for seg in segnums {
            header.push(' ');
            header.push_str(&seg.to_string());
        }
        self.send_msg(&header)?;
        self.write_channels
            .insert(id, WriteChannel::Shared(writer.clone()));
        debug!("Connection {} started shared data {id} in {}", self.name, writer.shm_id());
        Ok(id)
    }

    /// Close a shared transfer. An incomplete one marks every channel done
    /// so readers stop waiting.
    pub fn end_shared_data(&mut self, id: i32, complete: bool) -> Result<(), ConnError> {
        match self.write_channels.remove(&id) {
            Some(WriteChannel::Shared(mut writer)) => {
                if !complete {
                    writer.end_channels()?;
                }
            }
            Some(other) => {
                self.write_channels.insert(id, other);
                return Err(ConnError::UnknownDataConn { id });
            }
            None => return Err(ConnError::UnknownDataConn { id }),
        }
        let op = if complete { PROTO_SHARED_FULL } else { PROTO_SHARED_KILLED };
        self.send_msg(&format!("{op} {id}"))
    }

    /// Bytes still to be produced on an open transfer.
    pub fn write_data_size(&self, id: i32) -> Result<usize, ConnError> {
        let channel = self
            .write_channels
            .get(&id)
            .ok_or(ConnError::UnknownDataConn { id })?;
        channel.data_size().map_err(|e| ConnError::Protocol {
            name: self.name.clone(),
            reason: e.to_string(),
        })
    }

    // ─── Read side inspection ───────────────────────────────────────

    pub fn read_data(&self, id: i32) -> Option<&DataChannels> {
        self.read_channels.get(&id).or(match &self.finished_read {
            Some((finished, channels)) if *finished == id => Some(channels),
            _ => None,
        })
    }

    /// Channel `chan` of the newest incoming transfer.
    pub fn last_data_channel(&self, chan: usize) -> Option<&ReadChannel> {
        let id = self.last_read?;
        self.read_data(id)?.get(chan)
    }

    // ─── Misc ───────────────────────────────────────────────────────

    /// Hand a FITS file to the peer by path; the file is made readable for
    /// everyone first.
    pub fn fits_data_transfer(&mut self, path: &Path) -> Result<(), ConnError> {
        fs::set_permissions(path, fs::Permissions::from_mode(0o666)).map_err(|source| ConnError::Io {
            name: self.name.clone(),
            source,
        })?;
        self.send_msg(&format!("{COMMAND_DATA_IN_FITS} {}", path.display()))
    }

    pub fn send_progress(&mut self, start: f64, end: f64) -> Result<(), ConnError> {
        self.send_msg(&format!("{PROTO_PROGRESS} {start:e} {end:e}"))
    }

    pub fn send_message(&mut self, msg: &Message) -> Result<(), ConnError> {
        self.send_msg(&msg.to_wire())
    }
}
