//! Astro Common Library
//!
//! Shared constants, peer status masks and configuration loading used by
//! every crate of the observatory communication workspace.
//!
//! # Module Structure
//!
//! - [`consts`] - Protocol op-codes, completion codes and limits
//! - [`state`] - [`state::ServerState`] bitmask value object
//! - [`config`] - Configuration loading traits and types
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! Add to your `Cargo.toml` with alias for shorter imports:
//! ```toml
//! [dependencies]
//! astro = { package = "astro_common", path = "../astro_common" }
//! ```
//!
//! Then import:
//! ```rust
//! use astro_common::consts::*;
//! use astro_common::config::{ConfigLoader, SharedConfig};
//! ```

pub mod config;
pub mod consts;
pub mod prelude;
pub mod state;
