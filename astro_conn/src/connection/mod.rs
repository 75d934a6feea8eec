//! One peer connection: socket, line buffer, command queue, peer status,
//! values and data channels.
//!
//! A connection is driven by its owning block on a single thread:
//!
//! ```text
//! block poll loop
//!   ├─ add()       → fd + interest
//!   ├─ receive()   → read, split lines, dispatch
//!   ├─ writable()  → finish a pending connect, flush queued output
//!   └─ idle()      → keep-alive and inactivity timeout
//! ```
//!
//! None of the hooks block. Outgoing lines are appended to an outbound
//! queue and written as far as the socket takes them; the rest goes out
//! from `writable()` while `add()` asks for `POLLOUT`.
//!
//! Every fatal condition goes through [`Connection::connection_error`],
//! which fires once, moves the state to `Broken` or `Delete` and fails
//! commands whose reply can no longer arrive. Notifications raised where no
//! block is at hand are queued and delivered on the next block call.

mod protocol;
mod transfer;
mod values;

use crate::block::{Block, Event, PeerRef};
use crate::command::{Command, CommandQueue, OriginatorId};
use crate::data::{DataChannels, WriteChannel};
use crate::error::ConnError;
use crate::state::{ConnState, ConnType};
use crate::value::ValueSet;
use astro::config::ConnectionConfig;
use astro::consts::{DEVDEM_E_SYSTEM, PROTO_TECHNICAL, TECHNICAL_READY};
use astro::state::{BOP_MASK, ServerState};
use nix::poll::{PollFd, PollFlags};
use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, trace, warn};

// ─── Transport ──────────────────────────────────────────────────────

/// Stream socket a connection can own.
pub trait Transport: Read + Write + AsFd {
    /// Pending socket error (`SO_ERROR`), used to finish a non-blocking connect.
    fn take_error(&self) -> io::Result<Option<io::Error>>;

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn take_error(&self) -> io::Result<Option<io::Error>> {
        TcpStream::take_error(self)
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        TcpStream::set_nonblocking(self, nonblocking)
    }
}

impl Transport for UnixStream {
    fn take_error(&self) -> io::Result<Option<io::Error>> {
        UnixStream::take_error(self)
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        UnixStream::set_nonblocking(self, nonblocking)
    }
}

/// Seconds since the epoch as used on the wire.
pub fn wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

#[derive(Debug)]
enum Notice {
    StateChanged { old: ConnState, new: ConnState },
    Error { code: isize },
    Returned { cmd: Command, status: i32 },
}

// ─── Connection ─────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Connection<S: Transport> {
    config: ConnectionConfig,
    sock: Option<S>,

    name: String,
    key: i32,
    centrald_num: i32,
    centrald_id: i32,
    conn_type: ConnType,
    conn_state: ConnState,

    buf: Vec<u8>,
    out: VecDeque<u8>,
    queue: CommandQueue,

    server_state: ServerState,
    bop_state: ServerState,
    master_state: ServerState,
    progress: Option<(f64, f64)>,

    values: ValueSet,
    last_info_time: Option<f64>,

    data_conn: i32,
    read_channels: BTreeMap<i32, DataChannels>,
    last_read: Option<i32>,
    finished_read: Option<(i32, DataChannels)>,
    active_read: Option<(i32, usize)>,
    write_channels: BTreeMap<i32, WriteChannel>,

    last_data: Instant,
    last_good_send: Instant,
    last_send_ready: Option<Instant>,
    error_reported: bool,
    notices: Vec<Notice>,
}

impl<S: Transport> Connection<S> {
    /// Connection without a socket, state `Unknown`.
    pub fn new(name: &str, config: ConnectionConfig) -> Self {
        let now = Instant::now();
        Self {
            config,
            sock: None,
            name: name.to_string(),
            key: 0,
            centrald_num: -1,
            centrald_id: -1,
            conn_type: ConnType::NotDefined,
            conn_state: ConnState::Unknown,
            buf: Vec::new(),
            out: VecDeque::new(),
            queue: CommandQueue::new(),
            server_state: ServerState::default(),
            bop_state: ServerState::default(),
            master_state: ServerState::default(),
            progress: None,
            values: ValueSet::new(),
            last_info_time: None,
            data_conn: 0,
            read_channels: BTreeMap::new(),
            last_read: None,
            finished_read: None,
            active_read: None,
            write_channels: BTreeMap::new(),
            last_data: now,
            last_good_send: now,
            last_send_ready: None,
            error_reported: false,
            notices: Vec::new(),
        }
    }

    /// Wrap an established stream (accepted or paired); state `Connected`.
    pub fn from_stream(stream: S, name: &str, config: ConnectionConfig) -> Result<Self, ConnError> {
        stream.set_nonblocking(true).map_err(|source| ConnError::Io {
            name: name.to_string(),
            source,
        })?;
        Ok(Self {
            sock: Some(stream),
            conn_state: ConnState::Connected,
            ..Self::new(name, config)
        })
    }

    // ─── Identity ───────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn key(&self) -> i32 {
        self.key
    }

    pub fn set_key(&mut self, key: i32) {
        self.key = key;
    }

    pub fn centrald_num(&self) -> i32 {
        self.centrald_num
    }

    pub fn centrald_id(&self) -> i32 {
        self.centrald_id
    }

    pub fn set_centrald(&mut self, num: i32, id: i32) {
        self.centrald_num = num;
        self.centrald_id = id;
    }

    pub fn conn_type(&self) -> ConnType {
        self.conn_type
    }

    pub fn set_conn_type(&mut self, conn_type: ConnType) {
        self.conn_type = conn_type;
    }

    pub fn peer_ref(&self) -> PeerRef<'_> {
        PeerRef {
            name: &self.name,
            centrald_id: self.centrald_id,
            centrald_num: self.centrald_num,
            conn_type: self.conn_type,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn conn_timeout(&self) -> Duration {
        self.config.timeout()
    }

    pub fn set_conn_timeout(&mut self, timeout: Duration) {
        self.config.timeout_s = timeout.as_secs();
    }

    // ─── State machine ──────────────────────────────────────────────

    pub fn conn_state(&self) -> ConnState {
        self.conn_state
    }

    pub fn is_conn_state(&self, state: ConnState) -> bool {
        self.conn_state == state
    }

    /// Every transition after construction goes through here. Returns
    /// false when `new` is already the current state.
    fn enter_state(&mut self, new: ConnState) -> bool {
        let old = self.conn_state;
        if old == new {
            return false;
        }
        self.conn_state = new;
        debug!("Connection {} state {old} -> {new}", self.name);
        self.notices.push(Notice::StateChanged { old, new });
        true
    }

    /// Change state. Entering a state that accepts commands releases the
    /// queue; `AuthFailed` is terminal.
    pub fn set_conn_state(&mut self, new: ConnState) -> Result<(), ConnError> {
        if !self.enter_state(new) {
            return Ok(());
        }
        match new {
            ConnState::Connected | ConnState::AuthOk => self.send_next(),
            ConnState::AuthFailed => {
                self.connection_error(1);
                Err(ConnError::AuthFailed {
                    name: self.name.clone(),
                })
            }
            _ => Ok(()),
        }
    }

    pub fn request_authorization(&mut self) -> Result<(), ConnError> {
        self.set_conn_state(ConnState::AuthPending)
    }

    pub fn authorization_ok(&mut self) -> Result<(), ConnError> {
        if self.conn_state != ConnState::AuthPending {
            return Err(ConnError::AuthNotPending {
                name: self.name.clone(),
                state: self.conn_state,
            });
        }
        info!("Connection {} authorized", self.name);
        self.set_conn_state(ConnState::AuthOk)
    }

    pub fn authorization_failed(&mut self) -> Result<(), ConnError> {
        if self.conn_state != ConnState::AuthPending {
            return Err(ConnError::AuthNotPending {
                name: self.name.clone(),
                state: self.conn_state,
            });
        }
        warn!("Connection {} authorization failed", self.name);
        self.set_conn_state(ConnState::AuthFailed)
    }

    /// Funnel for every condition that makes the socket unusable.
    ///
    /// `code < 0` I/O error, `0` end of stream, `> 0` bytes were read but
    /// cannot be accepted. Acts once until the connection is revived.
    pub fn connection_error(&mut self, code: isize) {
        if self.error_reported {
            return;
        }
        self.error_reported = true;
        match code {
            c if c < 0 => error!("Connection {} I/O error ({c})", self.name),
            0 => info!("Connection {} closed by peer", self.name),
            c => error!("Connection {} protocol violation ({c} bytes)", self.name),
        }
        self.sock = None;
        self.buf.clear();
        self.out.clear();
        self.active_read = None;
        self.enter_state(if self.config.can_delete {
            ConnState::Delete
        } else {
            ConnState::Broken
        });
        for cmd in self.queue.abort_in_flight() {
            self.notices.push(Notice::Returned {
                cmd,
                status: DEVDEM_E_SYSTEM,
            });
        }
        self.notices.push(Notice::Error { code });
    }

    fn dead(&self) -> ConnError {
        ConnError::NotConnected {
            name: self.name.clone(),
            state: self.conn_state,
        }
    }

    /// Deliver notifications queued while no block was at hand.
    pub fn flush_notices(&mut self, block: &mut dyn Block) {
        for notice in std::mem::take(&mut self.notices) {
            let peer = self.peer_ref();
            match notice {
                Notice::StateChanged { old, new } => block.conn_state_changed(peer, old, new),
                Notice::Error { code } => block.connection_error(peer, code),
                Notice::Returned { cmd, status } => {
                    block.command_return(peer, &cmd, status);
                    if let Some(originator) = cmd.originator() {
                        block.post_event(Event::CommandReturned {
                            originator,
                            command: cmd.text().to_string(),
                            status,
                        });
                    }
                }
            }
        }
    }

    // ─── Event loop hooks ───────────────────────────────────────────

    /// Descriptor and interest for the block's poll set.
    pub fn add(&self) -> Option<PollFd<'_>> {
        let sock = self.sock.as_ref()?;
        let mut events = PollFlags::POLLIN | PollFlags::POLLPRI;
        if self.conn_state == ConnState::InProgress || !self.out.is_empty() {
            events |= PollFlags::POLLOUT;
        }
        Some(PollFd::new(sock.as_fd(), events))
    }

    /// Socket became writable: completes a non-blocking connect and writes
    /// queued output.
    pub fn writable(&mut self, block: &mut dyn Block) -> Result<(), ConnError> {
        let result = self.finish_connect().and_then(|()| self.flush_out());
        self.flush_notices(block);
        result
    }

    fn finish_connect(&mut self) -> Result<(), ConnError> {
        if self.conn_state != ConnState::InProgress {
            return Ok(());
        }
        let sock = self.sock.as_ref().ok_or_else(|| self.dead())?;
        match sock.take_error() {
            Ok(None) => {
                self.last_data = Instant::now();
                self.set_conn_state(ConnState::Connected)
            }
            Ok(Some(source)) | Err(source) => {
                self.connection_error(-1);
                Err(ConnError::Io {
                    name: self.name.clone(),
                    source,
                })
            }
        }
    }

    pub fn idle(&mut self, block: &mut dyn Block) -> Result<(), ConnError> {
        self.idle_at(Instant::now(), block)
    }

    /// Keep-alive and inactivity check against `now`.
    pub fn idle_at(&mut self, now: Instant, block: &mut dyn Block) -> Result<(), ConnError> {
        let result = self.check_timeout(now);
        self.flush_notices(block);
        result
    }

    /// A keep-alive probe is due: nothing sent or received for a fraction
    /// of the timeout and no probe in that window.
    pub fn reached_send_timeout(&self, now: Instant) -> bool {
        let window = self.config.timeout() / self.config.keepalive_fraction.max(1);
        let quiet = |t: Instant| now.saturating_duration_since(t) >= window;
        quiet(self.last_data)
            && quiet(self.last_good_send)
            && self.last_send_ready.is_none_or(quiet)
    }

    fn check_timeout(&mut self, now: Instant) -> Result<(), ConnError> {
        if self.sock.is_none()
            || !matches!(
                self.conn_state,
                ConnState::Connected | ConnState::AuthPending | ConnState::AuthOk
            )
            || self.config.timeout_s == 0
        {
            return Ok(());
        }
        let stalled = !self.out.is_empty()
            && now.saturating_duration_since(self.last_good_send) > self.config.timeout();
        if stalled || now.saturating_duration_since(self.last_data) > self.config.timeout() {
            warn!("Connection {} timed out ({} bytes unsent)", self.name, self.out.len());
            self.connection_error(-1);
            return Err(ConnError::Timeout {
                name: self.name.clone(),
            });
        }
        if self.reached_send_timeout(now) {
            trace!("Connection {} sending keep-alive", self.name);
            self.send_msg(&format!("{PROTO_TECHNICAL} {TECHNICAL_READY}"))?;
            self.last_send_ready = Some(now);
        }
        Ok(())
    }

    /// Notification addressed to this connection.
    pub fn post_event(&mut self, event: Event, block: &mut dyn Block) -> Result<(), ConnError> {
        let result = match event {
            Event::MasterStateChanged { state } => {
                self.master_state.set_value(state);
                self.send_next()
            }
            Event::QueClear => {
                self.que_clear();
                Ok(())
            }
            Event::DeleteOriginator { originator } => {
                self.delete_connection(originator);
                Ok(())
            }
            Event::CommandReturned { .. } => Ok(()),
        };
        self.flush_notices(block);
        result
    }

    // ─── Sending ────────────────────────────────────────────────────

    /// Queue one protocol line and write what the socket takes now.
    pub fn send_msg(&mut self, msg: &str) -> Result<(), ConnError> {
        if msg.contains(['\r', '\n', '\0']) {
            return Err(ConnError::Unsendable {
                name: self.name.clone(),
                line: msg.to_string(),
            });
        }
        let mut line = String::with_capacity(msg.len() + 2);
        line.push_str(msg);
        line.push_str("\r\n");
        trace!("Connection {} send '{msg}'", self.name);
        self.send_bytes(line.as_bytes())
    }

    fn send_bytes(&mut self, data: &[u8]) -> Result<(), ConnError> {
        if self.sock.is_none() {
            return Err(self.dead());
        }
        self.out.extend(data);
        self.flush_out()
    }

    /// Bytes queued but not yet accepted by the socket.
    pub fn pending_send(&self) -> usize {
        self.out.len()
    }

    /// Write queued output until the socket would block.
    fn flush_out(&mut self) -> Result<(), ConnError> {
        if self.conn_state == ConnState::InProgress {
            return Ok(());
        }
        let Some(sock) = self.sock.as_mut() else {
            return Ok(());
        };
        match write_pending(sock, &mut self.out) {
            Ok(0) => Ok(()),
            Ok(n) => {
                trace!("Connection {} wrote {n} bytes, {} queued", self.name, self.out.len());
                self.last_good_send = Instant::now();
                Ok(())
            }
            Err(source) => {
                self.connection_error(-1);
                Err(ConnError::Io {
                    name: self.name.clone(),
                    source,
                })
            }
        }
    }

    /// Completion reply for a command received from the peer.
    pub fn send_command_end(&mut self, num: i32, msg: &str) -> Result<(), ConnError> {
        self.send_msg(&format!("{num:+04} {msg}"))
    }

    // ─── Command queue ──────────────────────────────────────────────

    /// BOP bits the head of the queue is tested against.
    pub fn full_bop_state(&self) -> u32 {
        self.bop_state.value() | self.server_state.bop_bits() | (self.master_state.value() & BOP_MASK)
    }

    fn send_next(&mut self) -> Result<(), ConnError> {
        if !self.conn_state.accepts_commands() || self.sock.is_none() {
            return Ok(());
        }
        match self.queue.next_to_send(self.full_bop_state()) {
            Some(text) => {
                debug!("Connection {} sending command '{text}'", self.name);
                self.send_msg(&text)
            }
            None => Ok(()),
        }
    }

    /// Queue `cmd`; it goes out at once if nothing is ahead of it and BOP
    /// allows.
    pub fn que_command(&mut self, cmd: Command) -> Result<(), ConnError> {
        if self.conn_state.is_dead() {
            return Err(self.dead());
        }
        self.queue.push_back(cmd);
        self.send_next()
    }

    /// Queue `cmd` ahead of everything waiting.
    pub fn que_command_front(&mut self, cmd: Command) -> Result<(), ConnError> {
        if self.conn_state.is_dead() {
            return Err(self.dead());
        }
        self.queue.push_front(cmd);
        self.send_next()
    }

    /// Write `cmd` now, ignoring the queue and BOP.
    pub fn que_send(&mut self, cmd: Command) -> Result<(), ConnError> {
        self.send_msg(cmd.text())?;
        self.queue.send_bypass(cmd);
        Ok(())
    }

    pub fn que_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn que_clear(&mut self) -> usize {
        let dropped = self.queue.clear();
        if dropped > 0 {
            debug!("Connection {} dropped {dropped} queued commands", self.name);
        }
        dropped
    }

    pub fn que_empty_for_originator(&self, originator: OriginatorId) -> bool {
        self.queue.empty_for_originator(originator)
    }

    pub fn command_originator_pending(&self, originator: OriginatorId) -> bool {
        self.queue.originator_pending(originator)
    }

    /// `originator` went away; its commands still run unobserved.
    pub fn delete_connection(&mut self, originator: OriginatorId) {
        self.queue.delete_originator(originator);
    }

    pub fn command_queue(&self) -> &CommandQueue {
        &self.queue
    }

    // ─── Peer status ────────────────────────────────────────────────

    pub fn server_state(&self) -> &ServerState {
        &self.server_state
    }

    pub fn bop_state(&self) -> &ServerState {
        &self.bop_state
    }

    pub fn master_state(&self) -> &ServerState {
        &self.master_state
    }

    /// Description of the peer's generic status bits.
    pub fn state_string(&self) -> String {
        self.server_state.describe()
    }

    /// Percentage through the last announced progress window.
    pub fn get_progress(&self, now: f64) -> Option<f64> {
        let (start, end) = self.progress?;
        if !start.is_finite() || !end.is_finite() || end <= start {
            return None;
        }
        Some(((now - start) / (end - start) * 100.0).clamp(0.0, 100.0))
    }
}

impl Connection<TcpStream> {
    /// Start a non-blocking TCP connect to `addr`.
    pub fn connect(addr: &str, name: &str, config: ConnectionConfig) -> Result<Self, ConnError> {
        let mut conn = Self::new(name, config);
        conn.connect_to(addr)?;
        Ok(conn)
    }

    /// (Re)connect; state ends in `InProgress` or `Connected`.
    pub fn connect_to(&mut self, addr: &str) -> Result<(), ConnError> {
        self.set_conn_state(ConnState::ResolvingDevice)?;
        let resolved = addr
            .to_socket_addrs()
            .map_err(|source| ConnError::Resolve {
                addr: addr.to_string(),
                source,
            })?
            .next()
            .ok_or_else(|| ConnError::Resolve {
                addr: addr.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no address"),
            })?;
        let (stream, pending) = nonblocking_connect(resolved).map_err(|source| ConnError::Io {
            name: self.name.clone(),
            source,
        })?;
        self.sock = Some(stream);
        self.buf.clear();
        self.out.clear();
        self.error_reported = false;
        self.last_data = Instant::now();
        self.last_send_ready = None;
        info!("Connection {} connecting to {resolved}", self.name);
        if pending {
            self.set_conn_state(ConnState::InProgress)
        } else {
            self.set_conn_state(ConnState::Connected)
        }
    }
}

fn nonblocking_connect(addr: SocketAddr) -> io::Result<(TcpStream, bool)> {
    use nix::sys::socket::{AddressFamily, SockFlag, SockType, SockaddrLike, SockaddrStorage, socket};

    let family = match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    };
    let fd = socket(
        family,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    let sockaddr = SockaddrStorage::from(addr);
    // SAFETY: `sockaddr` outlives the call and `len()` is its initialised size.
    let rc = unsafe { libc::connect(fd.as_raw_fd(), sockaddr.as_ptr(), sockaddr.len()) };
    let pending = if rc == 0 {
        false
    } else {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            return Err(err);
        }
        true
    };
    Ok((TcpStream::from(fd), pending))
}

/// Drain `out` into `sock` until it is empty or the socket would block;
/// returns the bytes written.
fn write_pending<S: Transport>(sock: &mut S, out: &mut VecDeque<u8>) -> io::Result<usize> {
    let mut written = 0;
    while !out.is_empty() {
        let (front, _) = out.as_slices();
        match sock.write(front) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => {
                out.drain(..n);
                written += n;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}
