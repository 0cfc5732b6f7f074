//! Configuration protocol (expedited SDO).
//!
//! Requests are fire-and-forget; responses arrive asynchronously through
//! the listener and are routed by object key to an [`SdoHandler`]. The
//! handler table is built once before the loops start and never changes.

use evo_common::canopen::state::{NodeId, OperationMode};
use std::collections::BTreeMap;
use tracing::{debug, info, trace, warn};

pub use crate::codec::{SdoData, SdoKey, SdoValue, od};

use crate::bus::Bus;
use crate::codec::{SdoResponse, decode_sdo_response, encode_sdo_read, encode_sdo_write};
use crate::diagnostics::{Counter, Diagnostics};
use crate::error::CanopenResult;
use crate::frame::CanFrame;
use crate::registry::Device;

/// Action taken on an upload response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdoHandler {
    /// Decode the CiA 402 status word into the motor state.
    StatusWord,
    /// Record the reported mode of operation.
    ModesOfOperationDisplay,
    /// Store the raw value in the device's upload map.
    Capture,
}

impl SdoHandler {
    fn apply(&self, device: &Device, key: SdoKey, data: SdoData) {
        match self {
            Self::StatusWord => {
                let word = data.as_u16();
                if let Some(previous) = device.update(|s| s.record_status_word(word)) {
                    debug!(
                        "Node {}: {:?} -> {:?} (status word {:#06x})",
                        device.id(),
                        previous,
                        device.motor_state(),
                        word
                    );
                }
            }
            Self::ModesOfOperationDisplay => {
                let raw = data.as_i8();
                match OperationMode::from_u8(raw as u8) {
                    Some(mode) => device.update(|s| s.operation_mode = mode),
                    None => debug!("Node {}: unsupported operation mode {}", device.id(), raw),
                }
            }
            Self::Capture => device.update(|s| {
                s.uploads.insert(key, data);
            }),
        }
    }
}

/// Object key to handler map.
#[derive(Debug, Clone)]
pub struct SdoHandlerTable {
    handlers: BTreeMap<SdoKey, SdoHandler>,
}

impl SdoHandlerTable {
    /// Table with the mandatory handlers (status word, mode display).
    pub fn new() -> Self {
        let mut handlers = BTreeMap::new();
        handlers.insert(od::STATUSWORD, SdoHandler::StatusWord);
        handlers.insert(od::MODES_OF_OPERATION_DISPLAY, SdoHandler::ModesOfOperationDisplay);
        Self { handlers }
    }

    /// Add or replace a handler.
    pub fn insert(&mut self, key: SdoKey, handler: SdoHandler) {
        self.handlers.insert(key, handler);
    }

    /// Handler for a key.
    pub fn get(&self, key: &SdoKey) -> Option<SdoHandler> {
        self.handlers.get(key).copied()
    }

    /// Number of handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// True if no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for SdoHandlerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Extend<(SdoKey, SdoHandler)> for SdoHandlerTable {
    fn extend<I: IntoIterator<Item = (SdoKey, SdoHandler)>>(&mut self, iter: I) {
        self.handlers.extend(iter);
    }
}

/// Request the value of `key` from `node`.
pub fn send_read(bus: &Bus, node: NodeId, key: SdoKey) -> CanopenResult<()> {
    bus.send(&encode_sdo_read(node, key))
}

/// Write `value` to `key` on `node`. The value variant fixes the width.
pub fn send_write(bus: &Bus, node: NodeId, key: SdoKey, value: SdoValue) -> CanopenResult<()> {
    trace!("Node {}: SDO write {} = {:?}", node, key, value);
    bus.send(&encode_sdo_write(node, key, value))
}

/// Route one response frame from `device`.
pub(crate) fn handle_response(
    table: &SdoHandlerTable,
    device: &Device,
    frame: &CanFrame,
    diagnostics: &Diagnostics,
) -> CanopenResult<()> {
    match decode_sdo_response(frame)? {
        SdoResponse::Upload { key, data } => match table.get(&key) {
            Some(handler) => {
                diagnostics.record(Counter::SdoUploads);
                handler.apply(device, key, data);
            }
            None => debug!("Node {}: no handler for {}, dropped", device.id(), key),
        },
        SdoResponse::DownloadAck { key } => {
            trace!("Node {}: SDO write {} acknowledged", device.id(), key);
        }
        SdoResponse::Abort { key, code } => {
            diagnostics.record(Counter::SdoAborts);
            warn!("Node {}: SDO transfer {} aborted, code {:#010x}", device.id(), key, code);
        }
    }
    Ok(())
}

/// Log the handler table at startup.
pub(crate) fn log_table(table: &SdoHandlerTable) {
    info!("SDO handlers: {:?}", table.handlers.keys().map(|k| k.to_string()).collect::<Vec<_>>());
}
