//! Poll-driven block owning the event loop of a single device connection.
//!
//! ```text
//! loop
//!   ├─ poll(conn.add(), tick)
//!   ├─ POLLOUT        → writable()
//!   ├─ POLLIN / HUP   → receive()
//!   └─ every tick     → idle()
//! ```

use astro::consts::MESSAGE_ERROR;
use astro::state::ServerState;
use astro_conn::{Block, Command, ConnError, ConnState, Connection, Message, PeerRef, Value};
use nix::errno::Errno;
use nix::poll::{PollFlags, PollTimeout, poll};
use std::net::TcpStream;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Poll tick; `idle` runs at least this often.
const TICK_MS: u16 = 100;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error(transparent)]
    Conn(#[from] ConnError),

    #[error("poll failed: {0}")]
    Poll(#[from] Errno),

    #[error("connection {name} lost ({state})")]
    Lost { name: String, state: ConnState },

    #[error("commands still pending after {waited:?}")]
    Timeout { waited: Duration },

    #[error("{count} command(s) failed")]
    CommandsFailed { count: usize },
}

/// Command that came back with a negative status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub command: String,
    pub status: i32,
}

#[derive(Debug, Default)]
pub struct PollBlock {
    failures: Vec<Failure>,
    returned: usize,
}

impl PollBlock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> &[Failure] {
        &self.failures
    }

    pub fn returned(&self) -> usize {
        self.returned
    }

    /// One poll round over the connection's interest, then the idle hook.
    pub fn poll_once(&mut self, conn: &mut Connection<TcpStream>) -> Result<(), ProbeError> {
        let revents = {
            let Some(fd) = conn.add() else {
                return Err(ProbeError::Lost {
                    name: conn.name().to_string(),
                    state: conn.conn_state(),
                });
            };
            let mut fds = [fd];
            match poll(&mut fds, PollTimeout::from(TICK_MS)) {
                Ok(0) => PollFlags::empty(),
                Ok(_) => fds[0].revents().unwrap_or(PollFlags::empty()),
                Err(Errno::EINTR) => PollFlags::empty(),
                Err(e) => return Err(e.into()),
            }
        };

        if revents.contains(PollFlags::POLLOUT) {
            conn.writable(self)?;
        }
        if revents.intersects(PollFlags::POLLIN | PollFlags::POLLPRI | PollFlags::POLLHUP | PollFlags::POLLERR) {
            conn.receive(self)?;
        }
        conn.idle(self)?;
        Ok(())
    }

    /// Poll until `done` holds or `wait` elapses.
    pub fn run_until(
        &mut self,
        conn: &mut Connection<TcpStream>,
        wait: Duration,
        mut done: impl FnMut(&Connection<TcpStream>) -> bool,
    ) -> Result<(), ProbeError> {
        let start = Instant::now();
        while !done(conn) {
            if start.elapsed() >= wait {
                return Err(ProbeError::Timeout { waited: wait });
            }
            self.poll_once(conn)?;
        }
        Ok(())
    }

    /// Wait for the connection, queue `commands` and run until every reply
    /// is in.
    pub fn run_commands(
        &mut self,
        conn: &mut Connection<TcpStream>,
        commands: Vec<Command>,
        wait: Duration,
    ) -> Result<(), ProbeError> {
        self.run_until(conn, wait, |c| c.conn_state().accepts_commands())?;
        info!("Connected to {}", conn.name());
        for cmd in commands {
            conn.que_command(cmd)?;
        }
        self.run_until(conn, wait, Connection::que_empty)?;
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(ProbeError::CommandsFailed {
                count: self.failures.len(),
            })
        }
    }
}

impl Block for PollBlock {
    fn conn_state_changed(&mut self, peer: PeerRef<'_>, old: ConnState, new: ConnState) {
        debug!("{} {old} -> {new}", peer.name);
    }

    fn connection_error(&mut self, peer: PeerRef<'_>, code: isize) {
        warn!("{} connection error {code}", peer.name);
    }

    fn state_changed(&mut self, peer: PeerRef<'_>, state: &ServerState, msg: Option<&str>) {
        debug!(
            "{} state {:#010x} ({}) {}",
            peer.name,
            state.value(),
            state.describe(),
            msg.unwrap_or("")
        );
    }

    fn message(&mut self, _peer: PeerRef<'_>, msg: &Message) {
        if msg.message_type & MESSAGE_ERROR != 0 {
            error!("{}: {}", msg.origin, msg.text);
        } else {
            info!("{} [{}]: {}", msg.origin, msg.type_name(), msg.text);
        }
    }

    fn value_changed(&mut self, peer: PeerRef<'_>, value: &Value) {
        trace!("{} {} = {}", peer.name, value.name(), value.value_char());
    }

    fn command_return(&mut self, peer: PeerRef<'_>, cmd: &Command, status: i32) {
        self.returned += 1;
        if status < 0 {
            error!("{} '{}' failed with {status}", peer.name, cmd.text());
            self.failures.push(Failure {
                command: cmd.text().to_string(),
                status,
            });
        } else {
            info!("{} '{}' returned {status}", peer.name, cmd.text());
        }
    }
}

/// Values as `name = value` lines.
pub fn render_plain(conn: &Connection<TcpStream>) -> String {
    let mut out = String::new();
    for value in conn.values().iter() {
        let marker = if value.is_failed() { " !" } else { "" };
        out.push_str(&format!("{} = {}{marker}\n", value.name(), value.value_char()));
    }
    out
}

pub fn render_json(conn: &Connection<TcpStream>) -> Result<String, serde_json::Error> {
    let doc = serde_json::json!({
        "device": conn.name(),
        "state": conn.server_state().value(),
        "state_string": conn.state_string(),
        "values": conn.values(),
    });
    serde_json::to_string_pretty(&doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use astro::config::ConnectionConfig;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::thread;

    fn fake_device(replies: &'static str) -> (String, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            let mut writer = sock.try_clone().unwrap();
            writer
                .write_all(b"E 4 \"temp\" \"CCD temperature\"\r\nV temp -2e1\r\n")
                .unwrap();
            let mut seen = Vec::new();
            let mut reader = BufReader::new(sock);
            for reply in replies.lines() {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                seen.push(line.trim_end().to_string());
                writer.write_all(format!("{reply}\r\n").as_bytes()).unwrap();
            }
            seen
        });
        (addr, handle)
    }

    #[test]
    fn commands_run_in_order_and_values_print() {
        let (addr, device) = fake_device("+000 OK\n+000 OK");
        let mut conn = Connection::connect(&addr, "C0", ConnectionConfig::default()).unwrap();
        let mut block = PollBlock::new();
        block
            .run_commands(
                &mut conn,
                vec![Command::new("info"), Command::new("base_info")],
                Duration::from_secs(5),
            )
            .unwrap();
        assert_eq!(block.returned(), 2);
        assert_eq!(device.join().unwrap(), vec!["info", "base_info"]);

        block
            .run_until(&mut conn, Duration::from_secs(5), |c| c.get_value("temp").is_some())
            .unwrap();
        assert_eq!(render_plain(&conn), "temp = -2e1\n");
        let json: serde_json::Value = serde_json::from_str(&render_json(&conn).unwrap()).unwrap();
        assert_eq!(json["device"], "C0");
        assert_eq!(json["values"][0]["name"], "temp");
    }

    #[test]
    fn failed_command_reported() {
        let (addr, device) = fake_device("-003 no such filter");
        let mut conn = Connection::connect(&addr, "W0", ConnectionConfig::default()).unwrap();
        let mut block = PollBlock::new();
        let result = block.run_commands(&mut conn, vec![Command::new("filter X")], Duration::from_secs(5));
        assert!(matches!(result, Err(ProbeError::CommandsFailed { count: 1 })));
        assert_eq!(
            block.failures(),
            &[Failure {
                command: "filter X".to_string(),
                status: -3,
            }]
        );
        device.join().unwrap();
    }
}
