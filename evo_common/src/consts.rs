//! System-wide constants for the EVO workspace.
//!
//! Single source of truth for values shared by every crate. Protocol
//! defaults live in [`crate::canopen::consts`].

/// Environment variable overriding the tracing filter.
pub const LOG_FILTER_ENV: &str = "RUST_LOG";

/// Maximum CAN payload length in bytes.
pub const CAN_MAX_DLC: usize = 8;
