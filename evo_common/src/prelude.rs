//! Prelude module for common re-exports.
//!
//! This module provides convenient re-exports of commonly used types
//! so that consumers can do `use evo_common::prelude::*;` and get
//! the most important types without listing individual paths.
//!
//! # Usage
//!
//! ```rust
//! use evo_common::prelude::*;
//! ```

// ─── Logging ────────────────────────────────────────────────────────
pub use crate::config::LogLevel;

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::canopen::config::{
    BusConfig, MotorConfig, NetworkConfig, NodeConfig, SupervisionConfig,
};
pub use crate::config::{ConfigError, ConfigLoader, SharedConfig};

// ─── CANopen State ──────────────────────────────────────────────────
pub use crate::canopen::state::{MotorState, NmtState, NodeId, OperationMode};

// ─── System Constants ───────────────────────────────────────────────
pub use crate::canopen::consts::{MAX_NODES, MAX_NODE_ID};

