//! Protocol and system-wide constants.
//!
//! Single source of truth for op-codes, completion codes, value type codes
//! and numeric limits shared by the connection engine and shared memory.

// ─── Protocol op-codes ──────────────────────────────────────────────

/// Value update: `V <name> <fields...>`.
pub const PROTO_VALUE: &str = "V";
/// Value set request: `X <name> <op> <fields...>`.
pub const PROTO_SET_VALUE: &str = "X";
/// Authorization: `A <centrald id> <key>`.
pub const PROTO_AUTH: &str = "A";
/// Peer status: `S <state> [msg]`.
pub const PROTO_STATUS: &str = "S";
/// Progress window: `P <start> <end>`.
pub const PROTO_PROGRESS: &str = "P";
/// Status combined with progress: `R <state> <start> <end> [msg]`.
pub const PROTO_STATUS_PROGRESS: &str = "R";
/// BOP state update: `B <state> <bop>`.
pub const PROTO_BOP_STATE: &str = "B";
/// Technical line used for keep-alive probes.
pub const PROTO_TECHNICAL: &str = "T";
/// Log message: `M <sec> <usec> <origin> <type> <text...>`.
pub const PROTO_MESSAGE: &str = "M";
/// Value declaration: `E <type> "<name>" "<description>"`.
pub const PROTO_METAINFO: &str = "E";
/// Selection names: `F <name> [<selection name>]`.
pub const PROTO_SELMETAINFO: &str = "F";
/// Binary channel header: `C <id> <type> <channum> <sizes...>`.
pub const PROTO_BINARY: &str = "C";
/// Binary chunk header: `D <id> <chan> <size>`, raw bytes follow.
pub const PROTO_DATA: &str = "D";
/// Binary channel end: `H <id>`.
pub const PROTO_BINARY_KILLED: &str = "H";
/// Shared channel header: `I <id> <shm id> <channum> <segments...>`.
pub const PROTO_SHARED: &str = "I";
/// Shared channel complete: `J <id>`.
pub const PROTO_SHARED_FULL: &str = "J";
/// Shared channel aborted: `K <id>`.
pub const PROTO_SHARED_KILLED: &str = "K";
/// Data stored in a FITS file: `fits_data <path>`.
pub const COMMAND_DATA_IN_FITS: &str = "fits_data";

/// Keep-alive probe body.
pub const TECHNICAL_READY: &str = "ready";
/// Keep-alive probe answer.
pub const TECHNICAL_OK: &str = "OK";

// ─── Completion codes ───────────────────────────────────────────────

pub const DEVDEM_OK: i32 = 0;
pub const DEVDEM_E_COMMAND: i32 = -1;
pub const DEVDEM_E_PARAMSNUM: i32 = -2;
pub const DEVDEM_E_PARAMSVAL: i32 = -3;
pub const DEVDEM_E_HW: i32 = -4;
pub const DEVDEM_E_SYSTEM: i32 = -5;
pub const DEVDEM_E_PRIORITY: i32 = -6;
pub const DEVDEM_E_TIMEOUT: i32 = -7;
pub const DEVDEM_E_IGNORE: i32 = -8;
pub const DEVDEM_I_QUED: i32 = 1;

// ─── Value type codes ───────────────────────────────────────────────

pub const VALUE_STRING: u32 = 0x01;
pub const VALUE_INTEGER: u32 = 0x02;
pub const VALUE_TIME: u32 = 0x03;
pub const VALUE_DOUBLE: u32 = 0x04;
pub const VALUE_FLOAT: u32 = 0x05;
pub const VALUE_BOOL: u32 = 0x06;
pub const VALUE_SELECTION: u32 = 0x07;
pub const VALUE_LONGINT: u32 = 0x08;
pub const VALUE_RADEC: u32 = 0x09;
pub const VALUE_ALTAZ: u32 = 0x0a;

/// Extended type: array of the base type.
pub const VALUE_ARRAY: u32 = 0x40;
/// Base type bits.
pub const VALUE_BASE_TYPE: u32 = 0x0f;
/// Extended type bits.
pub const VALUE_EXT_TYPE: u32 = 0x70;
/// Base and extended type bits.
pub const VALUE_MASK: u32 = 0x7f;
/// Value is recorded into FITS headers.
pub const VALUE_FITS: u32 = 0x100;

/// Value is in warning state.
pub const VALUE_WARNING: u32 = 0x0010_0000;
/// Value is in error state.
pub const VALUE_ERROR: u32 = 0x0020_0000;
/// Warning and error bits.
pub const VALUE_BAD_MASK: u32 = 0x0030_0000;

/// Name of the value carrying the peer's last info timestamp.
pub const VALUE_INFOTIME: &str = "infotime";

// ─── Message types ──────────────────────────────────────────────────

pub const MESSAGE_ERROR: u32 = 0x01;
pub const MESSAGE_WARNING: u32 = 0x02;
pub const MESSAGE_INFO: u32 = 0x04;
pub const MESSAGE_DEBUG: u32 = 0x08;

// ─── Limits & defaults ──────────────────────────────────────────────

/// Maximum concurrent readers of one shared-memory data segment.
pub const MAX_SHARED_CLIENTS: usize = 10;

/// Default connection inactivity timeout in seconds.
pub const DEFAULT_CONN_TIMEOUT_S: u64 = 300;

/// Default growth step of the connection input buffer in bytes.
pub const DEFAULT_BUFFER_CHUNK: usize = 2000;

/// Keep-alive probes are sent at most every `timeout / fraction`.
pub const DEFAULT_KEEPALIVE_FRACTION: u32 = 4;

/// Longest protocol line accepted from a peer, in bytes.
pub const DEFAULT_MAX_LINE: usize = 64 * 1024;

/// Largest binary transfer a peer may announce, in bytes over all channels.
pub const DEFAULT_MAX_DATA: usize = 1 << 30;
