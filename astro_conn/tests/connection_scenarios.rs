//! Connection behaviour against a scripted peer on the other end of a
//! socket pair.

use astro::config::ConnectionConfig;
use astro::consts::DEVDEM_E_SYSTEM;
use astro_conn::{
    Block, Command, ConnError, ConnState, Connection, DataChannels, Event, LineReply, Message,
    OriginatorId, ParamCursor, ParamError, PeerRef, Value, ValueError, ValuePayload,
};
use astro_shared_memory::DataSharedWrite;
use nix::poll::PollFlags;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpListener;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

// ─── Recording block ────────────────────────────────────────────────

#[derive(Default)]
struct Recorder {
    returns: Vec<(String, i32)>,
    events: Vec<Event>,
    states: Vec<(ConnState, ConnState)>,
    errors: Vec<isize>,
    values: Vec<String>,
    messages: Vec<Message>,
    ready: usize,
    idle: usize,
    new_data: Vec<i32>,
    full_data: Vec<i32>,
    addresses: Vec<String>,
    fits: Vec<String>,
}

impl Block for Recorder {
    fn post_event(&mut self, event: Event) {
        self.events.push(event);
    }

    fn conn_state_changed(&mut self, _peer: PeerRef<'_>, old: ConnState, new: ConnState) {
        self.states.push((old, new));
    }

    fn connection_error(&mut self, _peer: PeerRef<'_>, code: isize) {
        self.errors.push(code);
    }

    fn device_ready(&mut self, _peer: PeerRef<'_>) {
        self.ready += 1;
    }

    fn device_idle(&mut self, _peer: PeerRef<'_>) {
        self.idle += 1;
    }

    fn message(&mut self, _peer: PeerRef<'_>, msg: &Message) {
        self.messages.push(msg.clone());
    }

    fn value_changed(&mut self, _peer: PeerRef<'_>, value: &Value) {
        self.values.push(value.name().to_string());
    }

    fn command_return(&mut self, _peer: PeerRef<'_>, cmd: &Command, status: i32) {
        self.returns.push((cmd.text().to_string(), status));
    }

    fn command(
        &mut self,
        _peer: PeerRef<'_>,
        command: &str,
        params: &mut ParamCursor<'_>,
    ) -> Option<Result<LineReply, ParamError>> {
        match command {
            "ping" => Some(params.expect_end().map(|_| LineReply::Ok)),
            _ => None,
        }
    }

    fn add_address(&mut self, address: astro_conn::DeviceAddress) {
        self.addresses.push(address.name);
    }

    fn new_data_conn(&mut self, _peer: PeerRef<'_>, id: i32) {
        self.new_data.push(id);
    }

    fn full_data_received(&mut self, _peer: PeerRef<'_>, id: i32, _channels: &DataChannels) {
        self.full_data.push(id);
    }

    fn fits_data(&mut self, _peer: PeerRef<'_>, path: &str) {
        self.fits.push(path.to_string());
    }
}

// ─── Helpers ────────────────────────────────────────────────────────

fn pair() -> (Connection<UnixStream>, UnixStream) {
    let (local, peer) = UnixStream::pair().unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let conn = Connection::from_stream(local, "C0", ConnectionConfig::default()).unwrap();
    (conn, peer)
}

fn read_line(peer: &mut impl Read) -> String {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        peer.read_exact(&mut byte).unwrap();
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    String::from_utf8(line).unwrap().trim_end_matches('\r').to_string()
}

fn assert_nothing_sent(peer: &UnixStream) {
    peer.set_nonblocking(true).unwrap();
    let mut buf = [0u8; 64];
    let mut reader = peer;
    let result = reader.read(&mut buf);
    assert!(matches!(result, Err(ref e) if e.kind() == ErrorKind::WouldBlock), "{result:?}");
    peer.set_nonblocking(false).unwrap();
}

fn feed(conn: &mut Connection<UnixStream>, peer: &mut UnixStream, block: &mut Recorder, text: &str) {
    peer.write_all(text.as_bytes()).unwrap();
    conn.receive(block).unwrap();
}

// ─── Command queue ──────────────────────────────────────────────────

#[test]
fn command_sent_immediately_and_returned() {
    let (mut conn, mut peer) = pair();
    let mut block = Recorder::default();

    conn.que_command(Command::new("info")).unwrap();
    assert_eq!(read_line(&mut peer), "info");
    assert!(!conn.que_empty());

    feed(&mut conn, &mut peer, &mut block, "+000 OK\n");
    assert_eq!(block.returns, vec![("info".to_string(), 0)]);
    assert!(conn.que_empty());
}

#[test]
fn bop_state_holds_command_until_cleared() {
    let (mut conn, mut peer) = pair();
    let mut block = Recorder::default();

    feed(&mut conn, &mut peer, &mut block, "B 0 4\n");
    assert_eq!(conn.bop_state().value(), 4);

    conn.que_command(Command::new("expose").with_bop(0x4)).unwrap();
    conn.que_command(Command::new("info")).unwrap();
    assert!(!conn.que_empty());
    assert_nothing_sent(&peer);

    feed(&mut conn, &mut peer, &mut block, "B 0 0\n");
    assert_eq!(read_line(&mut peer), "expose");
    assert_nothing_sent(&peer);

    feed(&mut conn, &mut peer, &mut block, "+000 OK\n");
    assert_eq!(read_line(&mut peer), "info");
    feed(&mut conn, &mut peer, &mut block, "-003 busy\n");
    assert_eq!(
        block.returns,
        vec![("expose".to_string(), 0), ("info".to_string(), -3)]
    );
    assert!(conn.que_empty());
}

#[test]
fn master_state_gates_queue() {
    let (mut conn, mut peer) = pair();
    let mut block = Recorder::default();

    conn.post_event(Event::MasterStateChanged { state: 0x0100_0000 }, &mut block)
        .unwrap();
    conn.que_command(Command::new("move").with_bop(0x0100_0000)).unwrap();
    assert_nothing_sent(&peer);

    conn.post_event(Event::MasterStateChanged { state: 0 }, &mut block)
        .unwrap();
    assert_eq!(read_line(&mut peer), "move");
}

#[test]
fn originator_notified_on_completion() {
    let (mut conn, mut peer) = pair();
    let mut block = Recorder::default();
    let me = OriginatorId(3);

    conn.que_command(Command::new("move 10 20").with_originator(me)).unwrap();
    assert!(conn.command_originator_pending(me));
    assert_eq!(read_line(&mut peer), "move 10 20");

    feed(&mut conn, &mut peer, &mut block, "-004 cannot move\n");
    assert!(conn.que_empty_for_originator(me));
    assert_eq!(
        block.events,
        vec![Event::CommandReturned {
            originator: me,
            command: "move 10 20".to_string(),
            status: -4,
        }]
    );
}

#[test]
fn que_clear_keeps_command_on_the_wire() {
    let (mut conn, mut peer) = pair();
    let mut block = Recorder::default();

    conn.que_command(Command::new("a")).unwrap();
    conn.que_command(Command::new("b")).unwrap();
    conn.que_command(Command::new("c")).unwrap();
    assert_eq!(read_line(&mut peer), "a");

    conn.post_event(Event::QueClear, &mut block).unwrap();
    feed(&mut conn, &mut peer, &mut block, "+000 OK\n");
    assert_eq!(block.returns, vec![("a".to_string(), 0)]);
    assert!(conn.que_empty());
    assert_nothing_sent(&peer);
}

#[test]
fn que_send_bypasses_held_queue() {
    let (mut conn, mut peer) = pair();
    let mut block = Recorder::default();

    feed(&mut conn, &mut peer, &mut block, "B 0 1\n");
    conn.que_command(Command::new("held").with_bop(1)).unwrap();
    conn.que_send(Command::new("killall")).unwrap();
    assert_eq!(read_line(&mut peer), "killall");

    feed(&mut conn, &mut peer, &mut block, "+000 OK\n");
    assert_eq!(block.returns, vec![("killall".to_string(), 0)]);
    assert!(!conn.que_empty());
}

#[test]
fn unexpected_return_is_ignored() {
    let (mut conn, mut peer) = pair();
    let mut block = Recorder::default();
    feed(&mut conn, &mut peer, &mut block, "+000 OK\n");
    assert!(block.returns.is_empty());
    assert_eq!(conn.conn_state(), ConnState::Connected);
}

// ─── Failure funnel ─────────────────────────────────────────────────

#[test]
fn peer_close_fails_in_flight_command_once() {
    let (mut conn, mut peer) = pair();
    let mut block = Recorder::default();

    conn.que_command(Command::new("info")).unwrap();
    assert_eq!(read_line(&mut peer), "info");
    drop(peer);

    assert!(matches!(conn.receive(&mut block), Err(ConnError::Closed { .. })));
    assert_eq!(conn.conn_state(), ConnState::Delete);
    assert_eq!(block.errors, vec![0]);
    assert_eq!(block.returns, vec![("info".to_string(), DEVDEM_E_SYSTEM)]);
    assert_eq!(block.states, vec![(ConnState::Connected, ConnState::Delete)]);

    assert!(matches!(
        conn.receive(&mut block),
        Err(ConnError::NotConnected { .. })
    ));
    assert_eq!(block.errors.len(), 1);
    assert!(conn.que_command(Command::new("again")).is_err());
}

#[test]
fn broken_when_deletion_disabled() {
    let (local, peer) = UnixStream::pair().unwrap();
    let config = ConnectionConfig {
        can_delete: false,
        ..ConnectionConfig::default()
    };
    let mut conn = Connection::from_stream(local, "T0", config).unwrap();
    let mut block = Recorder::default();
    drop(peer);
    assert!(conn.receive(&mut block).is_err());
    assert_eq!(conn.conn_state(), ConnState::Broken);
}

#[test]
fn bad_data_header_is_protocol_violation() {
    let (mut conn, mut peer) = pair();
    let mut block = Recorder::default();
    peer.write_all(b"D 9 0 10\n").unwrap();
    assert!(matches!(
        conn.receive(&mut block),
        Err(ConnError::Protocol { .. })
    ));
    assert_eq!(block.errors, vec![8]);
}

// ─── Keep-alive ─────────────────────────────────────────────────────

#[test]
fn answers_keepalive_probe() {
    let (mut conn, mut peer) = pair();
    let mut block = Recorder::default();
    feed(&mut conn, &mut peer, &mut block, "T ready\n");
    assert_eq!(read_line(&mut peer), "T OK");
    feed(&mut conn, &mut peer, &mut block, "T OK\n");
    assert_nothing_sent(&peer);
}

#[test]
fn idle_probes_then_times_out() {
    let (mut conn, mut peer) = pair();
    let mut block = Recorder::default();
    let start = Instant::now();

    conn.idle_at(start + Duration::from_secs(10), &mut block).unwrap();
    assert_nothing_sent(&peer);

    conn.idle_at(start + Duration::from_secs(100), &mut block).unwrap();
    assert_eq!(read_line(&mut peer), "T ready");

    assert!(matches!(
        conn.idle_at(start + Duration::from_secs(400), &mut block),
        Err(ConnError::Timeout { .. })
    ));
    assert_eq!(conn.conn_state(), ConnState::Delete);
    assert_eq!(block.errors, vec![-1]);
}

// ─── Status and values ──────────────────────────────────────────────

#[test]
fn status_updates_raise_ready_and_idle() {
    let (mut conn, mut peer) = pair();
    let mut block = Recorder::default();

    feed(&mut conn, &mut peer, &mut block, "S 262145 \"cooling\"\n");
    assert_eq!(conn.server_state().value(), 0x0004_0001);
    assert_eq!(block.ready, 0);

    feed(&mut conn, &mut peer, &mut block, "S 0\n");
    assert_eq!(block.ready, 1);
    assert_eq!(block.idle, 1);
    assert_eq!(conn.state_string(), "idle");

    feed(&mut conn, &mut peer, &mut block, "R 2 100 200\n");
    assert_eq!(conn.get_progress(150.0), Some(50.0));
    assert_eq!(conn.get_progress(500.0), Some(100.0));
}

#[test]
fn values_declared_and_updated() {
    let (mut conn, mut peer) = pair();
    let mut block = Recorder::default();

    feed(
        &mut conn,
        &mut peer,
        &mut block,
        "E 4 \"temp\" \"CCD temperature\"\nV temp -2.05e1\nE 7 \"filter\" \"filter wheel\"\nF filter R\nF filter V\nV filter 1\n",
    );
    assert_eq!(conn.value_double("temp").unwrap(), -20.5);
    assert_eq!(conn.value_selection("filter").unwrap(), "V");
    assert_eq!(block.values, vec!["temp", "filter"]);

    feed(&mut conn, &mut peer, &mut block, "V unknown 1\nV temp warm\n");
    assert_eq!(conn.value_double("temp").unwrap(), -20.5);
    assert_eq!(conn.conn_state(), ConnState::Connected);

    feed(&mut conn, &mut peer, &mut block, "E 3 \"infotime\" \"\"\nV infotime 1700000000\n");
    assert!(conn.info_time_changed());
    conn.reset_info_time();
    assert!(!conn.info_time_changed());
    assert_eq!(conn.info_time(), Some(1_700_000_000.0));

    feed(&mut conn, &mut peer, &mut block, "E 2097156 \"temp\" \"CCD temperature\"\n");
    assert_eq!(conn.failed_values().len(), 1);
    assert_eq!(conn.value_double("temp").unwrap(), -20.5);
}

#[test]
fn message_forwarded() {
    let (mut conn, mut peer) = pair();
    let mut block = Recorder::default();
    feed(&mut conn, &mut peer, &mut block, "M 1700000000 0 C0 1 shutter jammed\n");
    assert_eq!(block.messages.len(), 1);
    assert_eq!(block.messages[0].text, "shutter jammed");
}

// ─── Commands from the peer ─────────────────────────────────────────

#[test]
fn peer_commands_answered() {
    let (mut conn, mut peer) = pair();
    let mut block = Recorder::default();

    feed(&mut conn, &mut peer, &mut block, "ping\n");
    assert_eq!(read_line(&mut peer), "+000 OK");

    feed(&mut conn, &mut peer, &mut block, "ping now\n");
    assert!(read_line(&mut peer).starts_with("-002 invalid parameters"));

    feed(&mut conn, &mut peer, &mut block, "foo\n");
    assert_eq!(read_line(&mut peer), "-004 unknow command: foo");

    feed(&mut conn, &mut peer, &mut block, "device 2 C0 localhost 5555 3\n");
    assert_eq!(block.addresses, vec!["C0"]);
    assert_nothing_sent(&peer);
}

#[test]
fn send_helpers_format_lines() {
    let (mut conn, mut peer) = pair();
    conn.send_command_end(0, "OK").unwrap();
    conn.send_command_end(-2, "bad").unwrap();
    conn.send_progress(1.5, 3.0).unwrap();
    conn.send_value_raw("exposure", "1e1").unwrap();
    assert_eq!(read_line(&mut peer), "+000 OK");
    assert_eq!(read_line(&mut peer), "-002 bad");
    assert_eq!(read_line(&mut peer), "P 1.5e0 3e0");
    assert_eq!(read_line(&mut peer), "V exposure 1e1");
}

// ─── Authorization ──────────────────────────────────────────────────

#[test]
fn authorization_releases_queue() {
    let (mut conn, mut peer) = pair();
    conn.request_authorization().unwrap();
    conn.que_command(Command::new("info")).unwrap();
    assert_nothing_sent(&peer);

    conn.authorization_ok().unwrap();
    assert_eq!(conn.conn_state(), ConnState::AuthOk);
    assert_eq!(read_line(&mut peer), "info");
    assert!(matches!(
        conn.authorization_ok(),
        Err(ConnError::AuthNotPending { .. })
    ));
}

#[test]
fn authorization_failure_tears_down() {
    let (mut conn, _peer) = pair();
    let mut block = Recorder::default();
    conn.request_authorization().unwrap();
    assert!(matches!(
        conn.authorization_failed(),
        Err(ConnError::AuthFailed { .. })
    ));
    conn.flush_notices(&mut block);
    assert_eq!(conn.conn_state(), ConnState::Delete);
    assert_eq!(block.errors, vec![1]);
}

// ─── Data transfers between two connections ─────────────────────────

fn connected_pair() -> (Connection<UnixStream>, Connection<UnixStream>) {
    let (a, b) = UnixStream::pair().unwrap();
    let config = ConnectionConfig::default();
    (
        Connection::from_stream(a, "C0", config.clone()).unwrap(),
        Connection::from_stream(b, "client", config).unwrap(),
    )
}

#[test]
fn binary_transfer_between_connections() {
    let (mut sender, mut receiver) = connected_pair();
    let mut block = Recorder::default();

    let id = sender.start_binary_data(1, &[3, 2]).unwrap();
    sender.send_binary_data(id, 0, b"abc").unwrap();
    sender.send_binary_data(id, 1, b"xy").unwrap();
    assert!(sender.send_binary_data(id, 1, b"z").is_err());
    sender.end_binary_data(id).unwrap();
    assert!(matches!(
        sender.end_binary_data(id),
        Err(ConnError::UnknownDataConn { .. })
    ));

    receiver.receive(&mut block).unwrap();
    assert_eq!(block.new_data, vec![id]);
    assert_eq!(block.full_data, vec![id]);
    let chan0 = receiver.last_data_channel(0).unwrap();
    assert_eq!(chan0.data().unwrap(), b"abc");
    let chan1 = receiver.last_data_channel(1).unwrap();
    assert_eq!(chan1.data().unwrap(), b"xy");
    assert_eq!(receiver.conn_state(), ConnState::Connected);
}

#[test]
fn chunk_split_across_reads() {
    let (mut conn, mut peer) = pair();
    let mut block = Recorder::default();

    feed(&mut conn, &mut peer, &mut block, "C 4 0 1 6\nD 4 0 6\nabc");
    assert!(block.full_data.is_empty());
    feed(&mut conn, &mut peer, &mut block, "def");
    assert_eq!(block.full_data, vec![4]);
    feed(&mut conn, &mut peer, &mut block, "H 4\n");
    assert_eq!(conn.last_data_channel(0).unwrap().data().unwrap(), b"abcdef");
}

#[test]
fn shared_transfer_between_connections() {
    let (mut sender, mut receiver) = connected_pair();
    let mut block = Recorder::default();

    let mut writer = DataSharedWrite::create(2, 64).unwrap();
    let seg = writer.add_client(16, 0, 5).unwrap();
    let id = sender.start_shared_data(&writer, &[seg]).unwrap();
    writer.write_channel(0, b"hello").unwrap();
    assert_eq!(sender.write_data_size(id).unwrap(), 11);
    sender.end_shared_data(id, true).unwrap();

    receiver.receive(&mut block).unwrap();
    assert_eq!(block.new_data, vec![id]);
    assert_eq!(block.full_data, vec![id]);
    let channel = receiver.last_data_channel(0).unwrap();
    assert_eq!(channel.data().unwrap(), b"hello");
}

#[test]
fn killed_shared_transfer_marks_channels_done() {
    let (mut sender, mut receiver) = connected_pair();
    let mut block = Recorder::default();

    let mut writer = DataSharedWrite::create(1, 32).unwrap();
    let seg = writer.add_client(32, 0, 8).unwrap();
    let id = sender.start_shared_data(&writer, &[seg]).unwrap();
    sender.end_shared_data(id, false).unwrap();
    assert_eq!(writer.channel_size(0).unwrap(), 0);

    receiver.receive(&mut block).unwrap();
    assert!(block.full_data.is_empty());
    assert!(receiver.last_data_channel(0).is_some());
}

#[test]
fn fits_file_handed_over_by_path() {
    use std::os::unix::fs::PermissionsExt;

    let (mut sender, mut receiver) = connected_pair();
    let mut block = Recorder::default();
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("image.fits");
    std::fs::write(&path, b"SIMPLE  =                    T").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();

    sender.fits_data_transfer(&path).unwrap();
    let mode = std::fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o666);

    receiver.receive(&mut block).unwrap();
    assert_eq!(block.fits, vec![path.display().to_string()]);
}

// ─── TCP connect ────────────────────────────────────────────────────

#[test]
fn tcp_connect_completes_on_writable() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let mut block = Recorder::default();

    let mut conn = Connection::connect(&addr, "T0", ConnectionConfig::default()).unwrap();
    assert!(matches!(
        conn.conn_state(),
        ConnState::InProgress | ConnState::Connected
    ));
    assert!(conn.add().is_some());

    let (mut peer, _) = listener.accept().unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    conn.writable(&mut block).unwrap();
    assert_eq!(conn.conn_state(), ConnState::Connected);

    conn.que_command(Command::new("info")).unwrap();
    assert_eq!(read_line(&mut peer), "info");
}

#[test]
fn unresolvable_address_rejected() {
    assert!(matches!(
        Connection::connect("no-such-host.invalid:1", "X", ConnectionConfig::default()),
        Err(ConnError::Resolve { .. })
    ));
}

// ─── Limits and back-pressure ───────────────────────────────────────

fn pair_with(config: ConnectionConfig) -> (Connection<UnixStream>, UnixStream) {
    let (local, peer) = UnixStream::pair().unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    (Connection::from_stream(local, "C0", config).unwrap(), peer)
}

fn receive_until_error(conn: &mut Connection<UnixStream>, block: &mut Recorder) -> ConnError {
    for _ in 0..16 {
        if let Err(e) = conn.receive(block) {
            return e;
        }
    }
    panic!("connection kept accepting input");
}

#[test]
fn huge_binary_header_closes_connection() {
    let (mut conn, mut peer) = pair();
    let mut block = Recorder::default();
    let line = format!("C 1 0 1 {}", usize::MAX);
    peer.write_all(format!("{line}\r\n").as_bytes()).unwrap();

    assert!(matches!(
        conn.receive(&mut block),
        Err(ConnError::Protocol { .. })
    ));
    assert_eq!(block.errors, vec![line.len() as isize]);
    assert_eq!(block.states, vec![(ConnState::Connected, ConnState::Delete)]);
    assert!(block.new_data.is_empty());
}

#[test]
fn overflowing_channel_sizes_close_connection() {
    let (mut conn, mut peer) = pair();
    let mut block = Recorder::default();
    peer.write_all(format!("C 1 0 2 {} 1\n", usize::MAX).as_bytes()).unwrap();
    assert!(matches!(
        conn.receive(&mut block),
        Err(ConnError::Protocol { .. })
    ));
    assert_eq!(conn.conn_state(), ConnState::Delete);
}

#[test]
fn binary_transfer_limited_by_max_data() {
    let config = ConnectionConfig {
        max_data: 1024,
        ..ConnectionConfig::default()
    };
    let (mut conn, mut peer) = pair_with(config.clone());
    let mut block = Recorder::default();
    feed(&mut conn, &mut peer, &mut block, "C 2 0 2 1000 24\n");
    assert_eq!(block.new_data, vec![2]);

    let (mut conn, mut peer) = pair_with(config);
    let mut block = Recorder::default();
    peer.write_all(b"C 3 0 2 1000 25\n").unwrap();
    assert!(matches!(
        conn.receive(&mut block),
        Err(ConnError::Protocol { .. })
    ));
    assert!(block.new_data.is_empty());
}

#[test]
fn endless_line_closes_connection() {
    let config = ConnectionConfig {
        max_line: 4096,
        ..ConnectionConfig::default()
    };
    let (mut conn, mut peer) = pair_with(config);
    let mut block = Recorder::default();
    peer.write_all(&[b'x'; 5000]).unwrap();

    assert!(matches!(
        receive_until_error(&mut conn, &mut block),
        ConnError::Protocol { .. }
    ));
    assert_eq!(block.errors.len(), 1);
    assert!(block.errors[0] > 4096);
    assert_eq!(conn.conn_state(), ConnState::Delete);
}

#[test]
fn overlong_terminated_line_closes_connection() {
    let config = ConnectionConfig {
        max_line: 4096,
        ..ConnectionConfig::default()
    };
    let (mut conn, mut peer) = pair_with(config);
    let mut block = Recorder::default();
    let mut line = b"M ".to_vec();
    line.extend_from_slice(&[b'y'; 4500]);
    line.push(b'\n');
    peer.write_all(&line).unwrap();

    assert!(matches!(
        receive_until_error(&mut conn, &mut block),
        ConnError::Protocol { .. }
    ));
    assert!(block.messages.is_empty());
    assert!(block.errors[0] > 4096);
}

#[test]
fn large_send_queues_instead_of_blocking() {
    let (mut conn, peer) = pair();
    let mut block = Recorder::default();
    let fields = "7".repeat(4 << 20);

    let started = Instant::now();
    conn.send_value_raw("image", &fields).unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(conn.conn_state(), ConnState::Connected);
    assert!(conn.pending_send() > 0);
    assert!(conn.add().unwrap().events().contains(PollFlags::POLLOUT));

    // keep-alive and replies queue behind the pending bytes
    conn.send_command_end(0, "OK").unwrap();

    let expected = "V image ".len() + fields.len() + 2 + "+000 OK\r\n".len();
    let reader = std::thread::spawn(move || {
        let mut peer = peer;
        let mut received = Vec::with_capacity(expected);
        let mut buf = [0u8; 64 * 1024];
        while received.len() < expected {
            let n = peer.read(&mut buf).unwrap();
            assert!(n > 0, "sender closed early");
            received.extend_from_slice(&buf[..n]);
        }
        received
    });

    let deadline = Instant::now() + Duration::from_secs(10);
    while conn.pending_send() > 0 {
        assert!(Instant::now() < deadline, "queued output never drained");
        conn.writable(&mut block).unwrap();
        std::thread::sleep(Duration::from_millis(1));
    }
    let received = reader.join().unwrap();
    assert_eq!(received.len(), expected);
    assert!(received.starts_with(b"V image 777"));
    assert!(received.ends_with(b"7\r\n+000 OK\r\n"));
    assert!(block.errors.is_empty());
    assert!(!conn.add().unwrap().events().contains(PollFlags::POLLOUT));
}

#[test]
fn stalled_output_times_out() {
    let (mut conn, _peer) = pair();
    let mut block = Recorder::default();
    conn.send_value_raw("image", &"7".repeat(4 << 20)).unwrap();
    assert!(conn.pending_send() > 0);

    let start = Instant::now();
    conn.idle_at(start + Duration::from_secs(10), &mut block).unwrap();
    assert!(matches!(
        conn.idle_at(start + Duration::from_secs(301), &mut block),
        Err(ConnError::Timeout { .. })
    ));
    assert_eq!(conn.pending_send(), 0);
    assert_eq!(block.errors, vec![-1]);
}

#[test]
fn unquotable_values_refused_before_sending() {
    let (mut conn, mut peer) = pair();
    assert!(matches!(
        conn.send_value("camera", &ValuePayload::String("a\"b".to_string())),
        Err(ConnError::Value(ValueError::Unquotable { .. }))
    ));
    assert!(matches!(
        conn.send_value(
            "filters",
            &ValuePayload::StringArray(vec!["R".to_string(), "V\nS 0".to_string()])
        ),
        Err(ConnError::Value(ValueError::Unquotable { .. }))
    ));
    assert!(matches!(
        conn.send_value_raw("camera", "1\nS 0 injected"),
        Err(ConnError::Unsendable { .. })
    ));
    assert_nothing_sent(&peer);
    assert_eq!(conn.conn_state(), ConnState::Connected);

    conn.send_value("camera", &ValuePayload::String("a b".to_string()))
        .unwrap();
    assert_eq!(read_line(&mut peer), "V camera \"a b\"");
}
