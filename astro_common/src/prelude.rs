//! Prelude module for common re-exports.
//!
//! ```rust
//! use astro_common::prelude::*;
//! ```

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{
    ConfigError, ConfigLoader, ConnectionConfig, LogLevel, NodeConfig, SharedConfig,
    SharedMemoryConfig,
};

// ─── Peer status ────────────────────────────────────────────────────
pub use crate::state::{
    BOP_MASK, BOP_WHILE_STATE, DEVICE_STATUS_MASK, ServerState, StateFlags,
};

// ─── Limits ─────────────────────────────────────────────────────────
pub use crate::consts::{DEFAULT_CONN_TIMEOUT_S, MAX_SHARED_CLIENTS};
