//! Platform system call wrappers.

#[cfg(target_os = "linux")]
pub mod sysv;
