//! EVO Common Library
//!
//! This crate provides shared constants, state types and configuration
//! loading utilities for the EVO CANopen workspace crates.
//!
//! # Module Structure
//!
//! - [`canopen`] - CANopen state enums, constants and network configuration
//! - [`config`] - Configuration loading traits and types
//! - [`consts`] - Workspace-wide constants
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! Add to your `Cargo.toml` with alias for shorter imports:
//! ```toml
//! [dependencies]
//! evo = { package = "evo_common", path = "../evo_common" }
//! ```
//!
//! Then import:
//! ```rust
//! use evo_common::canopen::state::{MotorState, NmtState};
//! use evo_common::config::{ConfigLoader, SharedConfig};
//! ```

pub mod canopen;
pub mod config;
pub mod consts;
pub mod prelude;
