//! Configuration loading traits and types.
//!
//! Every process reads one TOML file. The values are handed explicitly to
//! the objects that need them; nothing is looked up through a global.
//!
//! # Usage
//!
//! ```rust,no_run
//! use astro_common::config::{ConfigLoader, ConfigError, NodeConfig};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = NodeConfig::load(Path::new("probe.toml"))?;
//!     config.validate()?;
//!     println!("Service: {}", config.shared.service_name);
//!     Ok(())
//! }
//! ```

use crate::consts::{
    DEFAULT_BUFFER_CHUNK, DEFAULT_CONN_TIMEOUT_S, DEFAULT_KEEPALIVE_FRACTION, DEFAULT_MAX_DATA,
    DEFAULT_MAX_LINE,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
///
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Common configuration fields shared across all processes.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "probe-01"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Application instance identifier.
    pub service_name: String,
}

impl SharedConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if `service_name` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-connection tuning passed into every `Connection`.
///
/// ```toml
/// [connection]
/// timeout_s = 300
/// buffer_chunk = 2000
/// keepalive_fraction = 4
/// max_line = 65536
/// max_data = 1073741824
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Inactivity timeout in seconds; 0 disables keep-alive and timeout checks.
    pub timeout_s: u64,
    /// Growth step of the input buffer.
    pub buffer_chunk: usize,
    /// Keep-alive probes go out at most every `timeout / keepalive_fraction`.
    pub keepalive_fraction: u32,
    /// Broken connections move to DELETE instead of BROKEN.
    pub can_delete: bool,
    /// Longest line accepted from the peer; longer input is a protocol violation.
    pub max_line: usize,
    /// Largest binary transfer the peer may announce.
    pub max_data: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout_s: DEFAULT_CONN_TIMEOUT_S,
            buffer_chunk: DEFAULT_BUFFER_CHUNK,
            keepalive_fraction: DEFAULT_KEEPALIVE_FRACTION,
            can_delete: true,
            max_line: DEFAULT_MAX_LINE,
            max_data: DEFAULT_MAX_DATA,
        }
    }
}

impl ConnectionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_s)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_chunk == 0 {
            return Err(ConfigError::ValidationError(
                "connection.buffer_chunk must be positive".to_string(),
            ));
        }
        if self.keepalive_fraction == 0 {
            return Err(ConfigError::ValidationError(
                "connection.keepalive_fraction must be positive".to_string(),
            ));
        }
        if self.max_line < self.buffer_chunk {
            return Err(ConfigError::ValidationError(format!(
                "connection.max_line ({}) must be at least buffer_chunk ({})",
                self.max_line, self.buffer_chunk
            )));
        }
        Ok(())
    }
}

/// Geometry of a shared-memory region created by a data writer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SharedMemoryConfig {
    /// Number of data segments (one semaphore each).
    pub segments: usize,
    /// Size of one data segment in bytes.
    pub segment_size: usize,
}

impl Default for SharedMemoryConfig {
    fn default() -> Self {
        Self {
            segments: 2,
            segment_size: 1 << 20,
        }
    }
}

impl SharedMemoryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.segments == 0 || self.segments > i32::MAX as usize {
            return Err(ConfigError::ValidationError(format!(
                "shared_memory.segments out of range: {}",
                self.segments
            )));
        }
        if self.segment_size == 0 {
            return Err(ConfigError::ValidationError(
                "shared_memory.segment_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Complete configuration of one process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub shared: SharedConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub shared_memory: SharedMemoryConfig,
}

impl NodeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;
        self.connection.validate()?;
        self.shared_memory.validate()
    }
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}
