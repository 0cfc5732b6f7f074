//! # EVO CANopen Library
//!
//! CANopen master for CiA 402 drives: network management, drive state
//! machine control, expedited SDO, SYNC-scheduled PDO setpoints and node
//! guarding.
//!
//! # Module Structure
//!
//! - [`core`] - CanopenCore: loop threads, bring-up, caller operations
//! - [`frame`], [`codec`] - CAN frames and per-protocol encode/decode
//! - [`registry`] - Devices, groups and their shared state
//! - [`nmt`], [`motor`], [`sdo`], [`pdo`], [`nodeguard`] - protocol logic
//! - [`listener`], [`scheduler`], [`supervisor`] - the three loops
//! - [`transport`] - CanTransport trait, driver registry, virtual bus
//! - [`diagnostics`] - loop counters
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     evo_canopen (single crate)                   │
//! │  caller threads ──► CanopenCore ──► DeviceRegistry (per-device   │
//! │                        │               Mutex + Condvar)          │
//! │          ┌─────────────┼──────────────┐        ▲                 │
//! │          ▼             ▼              ▼        │                 │
//! │     ┌─────────┐  ┌───────────┐  ┌────────────┐ │                 │
//! │     │Listener │  │ Scheduler │  │ Supervisor │ │                 │
//! │     │(receive)│  │(SYNC+RPDO)│  │(node guard)│ │                 │
//! │     └────┬────┘  └─────┬─────┘  └─────┬──────┘ │                 │
//! │          │ dispatch    │              │        │                 │
//! │          └──► SDO / PDO / guard / EMCY handlers┘                 │
//! │                        │                                         │
//! │                        ▼                                         │
//! │                 Bus (send mutex) ──► CanTransport (trait object) │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod bus;
pub mod codec;
pub mod core;
pub mod diagnostics;
pub mod error;
pub mod frame;
pub mod listener;
pub mod motor;
pub mod nmt;
pub mod nodeguard;
pub mod pdo;
pub mod registry;
pub mod scheduler;
pub mod sdo;
pub mod supervisor;
pub mod transport;

// Re-export key types for convenience
pub use crate::core::CanopenCore;
pub use crate::error::{CanopenError, CanopenResult, TransportError};
pub use crate::frame::CanFrame;
pub use crate::registry::{Device, DeviceGroup, DeviceRegistry};
pub use crate::sdo::{SdoData, SdoHandler, SdoKey, SdoValue};
pub use crate::transport::{CanTransport, TransportRegistry};
