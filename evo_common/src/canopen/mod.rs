//! CANopen shared types, constants and configuration.
//!
//! Used by `evo_canopen` (the protocol engine) and by any crate that reads
//! its device state.

pub mod config;
pub mod consts;
pub mod state;
