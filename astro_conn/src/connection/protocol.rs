//! Reading: buffer management, line splitting and dispatch by op-code.

use super::{Connection, Transport, wall_time};
use crate::block::{Block, ClientInfo, DeviceAddress, Event, LineReply};
use crate::data::{DataChannels, total_size};
use crate::error::{ConnError, DataError, ParamError};
use crate::lexer::ParamCursor;
use crate::message::Message;
use crate::value::Value;
use astro::consts::*;
use astro::state::{DEVICE_STATUS_MASK, StateFlags};
use astro_shared_memory::DataSharedRead;
use std::io::{self, Read};
use std::time::Instant;
use tracing::{debug, error, trace, warn};

/// Result of one line handler. `Violation` means the peer stream can no
/// longer be trusted.
enum Handled {
    Line(Result<LineReply, ParamError>),
    Violation(DataError),
}

impl From<Result<LineReply, ParamError>> for Handled {
    fn from(result: Result<LineReply, ParamError>) -> Self {
        Handled::Line(result)
    }
}

fn is_command_return(cmd: &str) -> bool {
    let mut chars = cmd.chars();
    matches!(chars.next(), Some('+' | '-'))
        && !chars.as_str().is_empty()
        && chars.all(|c| c.is_ascii_digit())
}

fn state_param(params: &mut ParamCursor<'_>) -> Result<u32, ParamError> {
    let value = params.next_long()?;
    u32::try_from(value).map_err(|_| ParamError::Invalid {
        expected: "state",
        token: value.to_string(),
    })
}

fn optional_text<'a>(params: &mut ParamCursor<'a>) -> Option<&'a str> {
    let rest = params.whole_string();
    if rest.is_empty() { None } else { Some(rest.trim_matches('"')) }
}

fn sizes(params: &mut ParamCursor<'_>, count: usize) -> Result<Vec<usize>, ParamError> {
    (0..count).map(|_| params.next_size()).collect()
}

impl<S: Transport> Connection<S> {
    /// Socket is readable: read what is there and process complete lines.
    pub fn receive(&mut self, block: &mut dyn Block) -> Result<(), ConnError> {
        let result = self.receive_inner(block);
        self.flush_notices(block);
        result
    }

    fn receive_inner(&mut self, block: &mut dyn Block) -> Result<(), ConnError> {
        if self.sock.is_none() {
            return Err(self.dead());
        }
        if let Some((id, chan)) = self.active_read {
            if self.buf.is_empty() {
                return self.receive_binary(id, chan, block);
            }
        }

        let old = self.buf.len();
        self.buf.resize(old + self.config.buffer_chunk, 0);
        let read = match self.sock.as_mut() {
            Some(sock) => sock.read(&mut self.buf[old..]),
            None => return Err(self.dead()),
        };
        match read {
            Ok(0) => {
                self.buf.truncate(old);
                self.connection_error(0);
                Err(ConnError::Closed {
                    name: self.name.clone(),
                })
            }
            Ok(n) => {
                self.buf.truncate(old + n);
                self.last_data = Instant::now();
                trace!("Connection {} read {n} bytes", self.name);
                self.process_buffer(block)
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                self.buf.truncate(old);
                Ok(())
            }
            Err(source) => {
                self.buf.truncate(old);
                self.connection_error(-1);
                Err(ConnError::Io {
                    name: self.name.clone(),
                    source,
                })
            }
        }
    }

    /// Raw chunk bytes read straight into the active channel.
    fn receive_binary(&mut self, id: i32, chan: usize, block: &mut dyn Block) -> Result<(), ConnError> {
        let (Some(sock), Some(channels)) = (self.sock.as_mut(), self.read_channels.get_mut(&id)) else {
            return Err(self.dead());
        };
        match channels.get_data(chan, sock) {
            Ok(0) => {
                self.connection_error(0);
                Err(ConnError::Closed {
                    name: self.name.clone(),
                })
            }
            Ok(_) => {
                self.last_data = Instant::now();
                self.chunk_progress(id, chan, block);
                Ok(())
            }
            Err(DataError::Io(e)) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => Ok(()),
            Err(DataError::Io(source)) => {
                self.connection_error(-1);
                Err(ConnError::Io {
                    name: self.name.clone(),
                    source,
                })
            }
            Err(e) => Err(self.violation(1, e)),
        }
    }

    /// Finish the active chunk when complete and report progress.
    fn chunk_progress(&mut self, id: i32, chan: usize, block: &mut dyn Block) {
        let Some(channels) = self.read_channels.get(&id) else {
            self.active_read = None;
            return;
        };
        if channels.chunk_size(chan).unwrap_or(0) > 0 {
            return;
        }
        self.active_read = None;
        let peer = self.peer_ref();
        block.data_received(peer, id, channels);
        if matches!(channels.rest_size(), Ok(0)) {
            debug!("Connection {} data {id} complete", self.name);
            block.full_data_received(peer, id, channels);
        }
    }

    fn violation(&mut self, code: isize, reason: impl ToString) -> ConnError {
        self.connection_error(code);
        ConnError::Protocol {
            name: self.name.clone(),
            reason: reason.to_string(),
        }
    }

    /// Dispatch every complete line in the buffer; bytes owed to an active
    /// binary chunk are consumed first. A line longer than `max_line` ends
    /// the connection.
    fn process_buffer(&mut self, block: &mut dyn Block) -> Result<(), ConnError> {
        while self.sock.is_some() {
            if let Some((id, chan)) = self.active_read {
                let taken = match self.read_channels.get_mut(&id) {
                    Some(channels) => channels.add_data(chan, &self.buf),
                    None => Err(DataError::NoChannel { chan }),
                };
                match taken {
                    Ok(n) => {
                        self.buf.drain(..n);
                    }
                    Err(e) => return Err(self.violation(1, e)),
                }
                self.chunk_progress(id, chan, block);
                if self.active_read.is_some() {
                    break;
                }
                continue;
            }

            let max_line = self.config.max_line;
            let Some(end) = self
                .buf
                .iter()
                .position(|&b| matches!(b, b'\n' | 0))
            else {
                if self.buf.len() > max_line {
                    let len = self.buf.len();
                    return Err(self.violation(len as isize, format!("no line end within {max_line} bytes")));
                }
                break;
            };
            if end > max_line {
                return Err(self.violation(end as isize, format!("line of {end} bytes exceeds {max_line}")));
            }
            let raw: Vec<u8> = self.buf.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw[..end]);
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            self.process_line(line, block)?;
        }
        Ok(())
    }

    /// Handle one protocol line.
    pub fn process_line(&mut self, line: &str, block: &mut dyn Block) -> Result<(), ConnError> {
        let (cmd, mut params) = ParamCursor::split_command(line);
        debug!("Connection {} line '{line}'", self.name);

        if is_command_return(cmd) {
            return self.command_return_line(cmd, &mut params, block);
        }

        let handled: Handled = match cmd {
            PROTO_STATUS => self.status_line(&mut params, block).into(),
            PROTO_STATUS_PROGRESS => self.status_progress_line(&mut params, block).into(),
            PROTO_BOP_STATE => self.bop_state_line(&mut params, block).into(),
            PROTO_PROGRESS => self.progress_line(&mut params, block).into(),
            PROTO_TECHNICAL => self.technical_line(&mut params).into(),
            PROTO_MESSAGE => Message::parse(&mut params)
                .map(|msg| {
                    block.message(self.peer_ref(), &msg);
                    LineReply::Silent
                })
                .into(),
            PROTO_METAINFO => self.metainfo_line(&mut params).into(),
            PROTO_SELMETAINFO => self.selmetainfo_line(&mut params).into(),
            PROTO_VALUE => self.value_line(&mut params, block).into(),
            PROTO_BINARY => self.binary_header_line(&mut params, block),
            PROTO_DATA => self.data_line(&mut params),
            PROTO_BINARY_KILLED => self.binary_end_line(&mut params),
            PROTO_SHARED => self.shared_header_line(&mut params, block).into(),
            PROTO_SHARED_FULL => self.shared_end_line(&mut params, true, block).into(),
            PROTO_SHARED_KILLED => self.shared_end_line(&mut params, false, block).into(),
            COMMAND_DATA_IN_FITS => params
                .next_string()
                .map(|path| {
                    block.fits_data(self.peer_ref(), path);
                    LineReply::Silent
                })
                .into(),
            PROTO_SET_VALUE => {
                let result = block.set_value(self.peer_ref(), &mut params);
                return self.reply(result);
            }
            _ => {
                let result = self.command(cmd, &mut params, block);
                return self.reply(result);
            }
        };

        match handled {
            Handled::Line(Ok(_)) => Ok(()),
            Handled::Line(Err(e)) => {
                warn!("Connection {} ignoring '{line}': {e}", self.name);
                Ok(())
            }
            Handled::Violation(e) => Err(self.violation(line.len() as isize, e)),
        }
    }

    /// Answer a command line from the peer.
    fn reply(&mut self, result: Result<LineReply, ParamError>) -> Result<(), ConnError> {
        match result {
            Ok(LineReply::Ok) => self.send_command_end(DEVDEM_OK, "OK"),
            Ok(LineReply::Silent) => Ok(()),
            Err(ParamError::Unsupported { what }) => {
                self.send_command_end(DEVDEM_E_HW, &format!("unknow command: {what}"))
            }
            Err(e) => self.send_command_end(
                DEVDEM_E_PARAMSNUM,
                &format!("invalid parameters/invalid number of parameters: {e}"),
            ),
        }
    }

    fn command(
        &mut self,
        cmd: &str,
        params: &mut ParamCursor<'_>,
        block: &mut dyn Block,
    ) -> Result<LineReply, ParamError> {
        match cmd {
            "device" => {
                let centrald_num = params.next_integer()?;
                let name = params.next_string()?.to_string();
                let host = params.next_string()?.to_string();
                let port = params.next_integer()?;
                let port = u16::try_from(port).map_err(|_| ParamError::Invalid {
                    expected: "port",
                    token: port.to_string(),
                })?;
                let device_type = params.next_integer()?;
                params.expect_end()?;
                block.add_address(DeviceAddress {
                    centrald_num,
                    name,
                    host,
                    port,
                    device_type,
                });
                Ok(LineReply::Silent)
            }
            "delete_device" => {
                let centrald_num = params.next_integer()?;
                let name = params.next_string()?;
                params.expect_end()?;
                block.delete_address(centrald_num, name);
                Ok(LineReply::Silent)
            }
            "client" => {
                let centrald_id = params.next_integer()?;
                let login = params.next_string()?.to_string();
                let name = params.next_string()?.to_string();
                params.expect_end()?;
                block.add_client(ClientInfo {
                    centrald_id,
                    login,
                    name,
                });
                Ok(LineReply::Silent)
            }
            "delete_client" => {
                let centrald_id = params.next_integer()?;
                params.expect_end()?;
                block.delete_client(centrald_id);
                Ok(LineReply::Silent)
            }
            "status_info" => {
                params.expect_end()?;
                block.status_info(self.peer_ref());
                Ok(LineReply::Ok)
            }
            _ => block.command(self.peer_ref(), cmd, params).unwrap_or_else(|| {
                Err(ParamError::Unsupported {
                    what: cmd.to_string(),
                })
            }),
        }
    }

    /// `+N` / `-N` completion of the oldest command on the wire.
    fn command_return_line(
        &mut self,
        cmd: &str,
        params: &mut ParamCursor<'_>,
        block: &mut dyn Block,
    ) -> Result<(), ConnError> {
        let Ok(status) = cmd.parse::<i32>() else {
            return Err(self.violation(cmd.len() as isize, format!("bad return code '{cmd}'")));
        };
        let text = params.whole_string();
        let Some(command) = self.queue.take_reply() else {
            error!("Connection {} unexpected command return {status} '{text}'", self.name);
            return Ok(());
        };
        if status < 0 {
            warn!(
                "Connection {} command '{}' failed ({status}): {text}",
                self.name,
                command.text()
            );
        } else {
            debug!("Connection {} command '{}' returned {status}", self.name, command.text());
        }
        block.command_return(self.peer_ref(), &command, status);
        if let Some(originator) = command.originator() {
            block.post_event(Event::CommandReturned {
                originator,
                command: command.text().to_string(),
                status,
            });
        }
        self.queue.finish_running();
        self.send_next()
    }

    // ─── Status ─────────────────────────────────────────────────────

    fn set_server_state(&mut self, value: u32, msg: Option<&str>, block: &mut dyn Block) {
        let was_not_ready = self.server_state.intersects(StateFlags::NOT_READY.bits());
        self.server_state.set_value(value);
        let peer = self.peer_ref();
        block.state_changed(peer, &self.server_state, msg);
        if was_not_ready && !self.server_state.intersects(StateFlags::NOT_READY.bits()) {
            block.device_ready(peer);
        }
        if self.server_state.mask_value_changed(DEVICE_STATUS_MASK) && self.server_state.is_idle() {
            block.device_idle(peer);
        }
    }

    fn status_line(&mut self, params: &mut ParamCursor<'_>, block: &mut dyn Block) -> Result<LineReply, ParamError> {
        let value = state_param(params)?;
        let msg = optional_text(params);
        self.set_server_state(value, msg, block);
        self.retry_send();
        Ok(LineReply::Silent)
    }

    fn status_progress_line(
        &mut self,
        params: &mut ParamCursor<'_>,
        block: &mut dyn Block,
    ) -> Result<LineReply, ParamError> {
        let value = state_param(params)?;
        let start = params.next_double()?;
        let end = params.next_double()?;
        let msg = optional_text(params);
        self.progress = Some((start, end));
        self.set_server_state(value, msg, block);
        block.progress(self.peer_ref(), start, end);
        self.retry_send();
        Ok(LineReply::Silent)
    }

    fn bop_state_line(&mut self, params: &mut ParamCursor<'_>, block: &mut dyn Block) -> Result<LineReply, ParamError> {
        let value = state_param(params)?;
        let bop = state_param(params)?;
        params.expect_end()?;
        self.bop_state.set_value(bop);
        self.set_server_state(value, None, block);
        self.retry_send();
        Ok(LineReply::Silent)
    }

    fn progress_line(&mut self, params: &mut ParamCursor<'_>, block: &mut dyn Block) -> Result<LineReply, ParamError> {
        let start = params.next_double()?;
        let end = params.next_double()?;
        params.expect_end()?;
        self.progress = Some((start, end));
        block.progress(self.peer_ref(), start, end);
        Ok(LineReply::Silent)
    }

    /// A status change may have released the command held by BOP. Send
    /// failures already went through the error funnel.
    fn retry_send(&mut self) {
        if let Err(e) = self.send_next() {
            debug!("Connection {} held command not sent: {e}", self.name);
        }
    }

    fn technical_line(&mut self, params: &mut ParamCursor<'_>) -> Result<LineReply, ParamError> {
        let what = params.next_string()?;
        params.expect_end()?;
        match what {
            TECHNICAL_READY => {
                if let Err(e) = self.send_msg(&format!("{PROTO_TECHNICAL} {TECHNICAL_OK}")) {
                    debug!("Connection {} keep-alive answer lost: {e}", self.name);
                }
                Ok(LineReply::Silent)
            }
            TECHNICAL_OK => Ok(LineReply::Silent),
            other => Err(ParamError::Invalid {
                expected: "technical",
                token: other.to_string(),
            }),
        }
    }

    // ─── Values ─────────────────────────────────────────────────────

    fn metainfo_line(&mut self, params: &mut ParamCursor<'_>) -> Result<LineReply, ParamError> {
        let flags = params.next_long()?;
        let flags = u32::try_from(flags).map_err(|_| ParamError::Invalid {
            expected: "value flags",
            token: flags.to_string(),
        })?;
        let name = params.next_string()?;
        let description = params.next_string_opt().unwrap_or("");
        params.expect_end()?;
        let unsupported = |e: crate::error::ValueError| ParamError::Unsupported { what: e.to_string() };
        match self.values.get_mut(name) {
            Some(value) => value.redeclare(description, flags).map_err(unsupported)?,
            None => self
                .values
                .insert(Value::new(name, description, flags).map_err(unsupported)?),
        }
        trace!("Connection {} declared value {name} ({flags:#x})", self.name);
        Ok(LineReply::Silent)
    }

    fn selmetainfo_line(&mut self, params: &mut ParamCursor<'_>) -> Result<LineReply, ParamError> {
        let name = params.next_string()?;
        let selname = params.next_string_opt();
        params.expect_end()?;
        let value = self.values.get_mut(name).ok_or_else(|| ParamError::UnknownValue {
            name: name.to_string(),
        })?;
        let result = match selname {
            Some(selname) => value.add_selection(selname),
            None => value.clear_selection(),
        };
        result.map_err(|_| ParamError::WrongType {
            name: name.to_string(),
            expected: "selection",
        })?;
        Ok(LineReply::Silent)
    }

    fn value_line(&mut self, params: &mut ParamCursor<'_>, block: &mut dyn Block) -> Result<LineReply, ParamError> {
        let name = params.next_string()?;
        let value = self.values.get_mut(name).ok_or_else(|| ParamError::UnknownValue {
            name: name.to_string(),
        })?;
        value.set_from_wire(params, wall_time())?;
        if let Some(value) = self.values.get(name) {
            block.value_changed(self.peer_ref(), value);
        }
        Ok(LineReply::Silent)
    }

    // ─── Data channels ──────────────────────────────────────────────

    /// `C <id> <type> <channum> <sizes...>`
    fn binary_header_line(&mut self, params: &mut ParamCursor<'_>, block: &mut dyn Block) -> Handled {
        let parsed = (|| {
            let id = params.next_integer()?;
            let data_type = params.next_integer()?;
            let channum = params.next_size()?;
            let sizes = sizes(params, channum)?;
            params.expect_end()?;
            Ok::<_, ParamError>((id, data_type, sizes))
        })();
        let (id, data_type, sizes) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => return Handled::Line(Err(e)),
        };
        let max = self.config.max_data;
        match total_size(&sizes) {
            Some(size) if size <= max => {}
            Some(size) => return Handled::Violation(DataError::TooLarge { size, max }),
            None => return Handled::Violation(DataError::SizeOverflow),
        }
        let mut channels = DataChannels::new();
        channels.init_from_connection(data_type, &sizes);
        debug!("Connection {} binary data {id}: {} channels, {:?} bytes", self.name, sizes.len(), sizes);
        self.read_channels.insert(id, channels);
        self.last_read = Some(id);
        block.new_data_conn(self.peer_ref(), id);
        Handled::Line(Ok(LineReply::Silent))
    }

    /// `D <id> <chan> <size>`, `size` raw bytes follow.
    fn data_line(&mut self, params: &mut ParamCursor<'_>) -> Handled {
        let parsed = (|| {
            let id = params.next_integer()?;
            let chan = params.next_size()?;
            let size = params.next_size()?;
            params.expect_end()?;
            Ok::<_, ParamError>((id, chan, size))
        })();
        let (id, chan, size) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => return Handled::Violation(e.into()),
        };
        let Some(channels) = self.read_channels.get_mut(&id) else {
            return Handled::Violation(DataError::NoChannel { chan });
        };
        if let Err(e) = channels.read_data_size(chan, size) {
            return Handled::Violation(e);
        }
        if size > 0 {
            self.active_read = Some((id, chan));
        }
        Handled::Line(Ok(LineReply::Silent))
    }

    /// `H <id>`: sender closed the binary transfer.
    fn binary_end_line(&mut self, params: &mut ParamCursor<'_>) -> Handled {
        let id = match params.next_integer() {
            Ok(id) => id,
            Err(e) => return Handled::Line(Err(e)),
        };
        self.close_read(id);
        Handled::Line(Ok(LineReply::Silent))
    }

    fn close_read(&mut self, id: i32) {
        let Some(channels) = self.read_channels.remove(&id) else {
            warn!("Connection {} end of unknown data {id}", self.name);
            return;
        };
        match channels.rest_size() {
            Ok(0) => trace!("Connection {} data {id} closed", self.name),
            Ok(rest) => warn!("Connection {} data {id} closed with {rest} bytes missing", self.name),
            Err(e) => warn!("Connection {} data {id} closed: {e}", self.name),
        }
        if self.active_read.is_some_and(|(active, _)| active == id) {
            self.active_read = None;
        }
        self.finished_read = Some((id, channels));
    }

    /// `I <id> <shm id> <channum> <segments...>`
    fn shared_header_line(&mut self, params: &mut ParamCursor<'_>, block: &mut dyn Block) -> Result<LineReply, ParamError> {
        let id = params.next_integer()?;
        let shm_id = params.next_integer()?;
        let channum = params.next_size()?;
        let segments = sizes(params, channum)?;
        params.expect_end()?;

        let attached = DataSharedRead::attach(shm_id).map_err(DataError::from).and_then(|reader| {
            let mut channels = DataChannels::new();
            channels.init_shared_from_connection(&reader, &segments)?;
            Ok(channels)
        });
        match attached {
            Ok(channels) => {
                debug!("Connection {} shared data {id} in {shm_id}, segments {segments:?}", self.name);
                self.read_channels.insert(id, channels);
                self.last_read = Some(id);
                block.new_data_conn(self.peer_ref(), id);
            }
            Err(e) => error!("Connection {} cannot attach shared data {id} ({shm_id}): {e}", self.name),
        }
        Ok(LineReply::Silent)
    }

    /// `J <id>` complete or `K <id>` killed.
    fn shared_end_line(
        &mut self,
        params: &mut ParamCursor<'_>,
        complete: bool,
        block: &mut dyn Block,
    ) -> Result<LineReply, ParamError> {
        let id = params.next_integer()?;
        params.expect_end()?;
        if complete {
            if let Some(channels) = self.read_channels.get(&id) {
                let peer = self.peer_ref();
                block.data_received(peer, id, channels);
                block.full_data_received(peer, id, channels);
            }
        } else {
            warn!("Connection {} shared data {id} killed", self.name);
        }
        self.close_read(id);
        Ok(LineReply::Silent)
    }
}
