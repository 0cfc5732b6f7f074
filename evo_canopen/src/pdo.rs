//! Real-time data protocol: SYNC, RPDO1 setpoints and TPDO1 feedback.

use evo_common::canopen::state::NodeId;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::bus::Bus;
use crate::codec::{Tpdo1, decode_tpdo1, encode_rpdo1, encode_sync, mdeg_to_rad};
use crate::diagnostics::{Counter, Diagnostics};
use crate::error::{CanopenError, CanopenResult};
use crate::frame::{CanFrame, tpdo1_cob_id};
use crate::motor::{CW_OPERATION_MODE_SPECIFIC, ControlCommand};
use crate::registry::{Device, DeviceRegistry};

/// Control word streamed while the drive is commanded to
/// OperationEnabled: enable operation with interpolation active.
pub const RPDO_CONTROL_WORD: u16 = ControlCommand::EnableOperation.control_word() | CW_OPERATION_MODE_SPECIFIC;

/// Control word carried by a setpoint for the last commanded word.
/// Only an enable-operation command gets the interpolation bit; any
/// other command is repeated unchanged so the drive stays where it was
/// sent.
pub const fn rpdo_control_word(commanded: u16) -> u16 {
    if commanded == ControlCommand::EnableOperation.control_word() {
        RPDO_CONTROL_WORD
    } else {
        commanded
    }
}

/// Action taken on an incoming PDO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdoHandler {
    /// TPDO1: status word and actual position.
    Tpdo1Feedback,
}

/// COB-ID to `(node, handler)` map.
#[derive(Debug, Clone, Default)]
pub struct PdoHandlerTable {
    handlers: HashMap<u16, (NodeId, PdoHandler)>,
}

impl PdoHandlerTable {
    /// One TPDO1 feedback handler per registered device.
    pub fn for_registry(registry: &DeviceRegistry) -> Self {
        let handlers = registry
            .devices()
            .iter()
            .map(|d| (tpdo1_cob_id(d.id()), (d.id(), PdoHandler::Tpdo1Feedback)))
            .collect();
        Self { handlers }
    }

    /// Handler registered for a COB-ID.
    pub fn get(&self, cob_id: u16) -> Option<(NodeId, PdoHandler)> {
        self.handlers.get(&cob_id).copied()
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

/// Broadcast one SYNC.
pub fn send_sync(bus: &Bus) -> CanopenResult<()> {
    bus.send(&encode_sync())
}

/// One scheduler tick: SYNC, then for every initialized device its
/// setpoint integrated over `dt` in an RPDO1. The send lock is held for
/// the whole tick, and a setpoint advances only once SYNC and its own
/// frame are on the wire.
///
/// Returns the number of setpoints sent.
pub fn tick(bus: &Bus, registry: &DeviceRegistry, dt: Duration, diagnostics: &Diagnostics) -> CanopenResult<usize> {
    let dt_secs = dt.as_secs_f64();
    let sent = bus.with_locked(|tx| {
        tx.send(&encode_sync())?;
        let mut sent = 0;
        for device in registry.devices() {
            let streamed = device.advance_setpoint(dt_secs, |position, commanded| {
                tx.send(&encode_rpdo1(device.id(), rpdo_control_word(commanded), position))
            })?;
            sent += usize::from(streamed);
        }
        Ok::<_, CanopenError>(sent)
    })?;
    diagnostics.record(Counter::SyncTicks);
    Ok(sent)
}

/// Route one incoming PDO.
///
/// # Errors
/// `UnrecognizedMessage` if no handler matches, `MalformedFrame` for a
/// wrong payload.
pub(crate) fn handle_pdo(
    table: &PdoHandlerTable,
    registry: &DeviceRegistry,
    frame: &CanFrame,
    diagnostics: &Diagnostics,
) -> CanopenResult<()> {
    let (node, handler) = table.get(frame.cob_id()).ok_or(CanopenError::UnrecognizedMessage {
        cob_id: frame.cob_id(),
    })?;
    let device = registry.device(node)?;
    match handler {
        PdoHandler::Tpdo1Feedback => {
            let tpdo = decode_tpdo1(frame)?;
            apply_feedback(device, &tpdo, frame.timestamp(), Instant::now());
            diagnostics.record(Counter::PdoFeedback);
        }
    }
    Ok(())
}

/// Apply TPDO1 feedback. Velocity is the position change over the
/// frame timestamp change, or over local receive time when the transport
/// does not stamp frames.
pub(crate) fn apply_feedback(device: &Device, tpdo: &Tpdo1, stamp: Option<Duration>, now: Instant) {
    let position = mdeg_to_rad(tpdo.position_mdeg);
    let changed = device.update(|s| {
        let changed = s.record_status_word(tpdo.status_word);
        let dt = match (stamp, s.feedback_stamp) {
            (Some(current), Some(previous)) if current > previous => Some((current - previous).as_secs_f64()),
            (Some(_), _) => None,
            (None, _) => s
                .feedback_at
                .filter(|&at| now > at)
                .map(|at| (now - at).as_secs_f64()),
        };
        if let Some(dt) = dt.filter(|_| s.feedback_count > 0) {
            s.actual_velocity = (position - s.actual_position) / dt;
        }
        s.actual_position = position;
        s.feedback_stamp = stamp;
        s.feedback_at = Some(now);
        s.feedback_count += 1;
        changed
    });
    if let Some(previous) = changed {
        debug!("Node {}: {:?} -> {:?} (TPDO)", device.id(), previous, device.motor_state());
    }
    trace!("Node {}: feedback {} mdeg", device.id(), tpdo.position_mdeg);
}
