//! Network management.
//!
//! NMT commands are unacknowledged: the recorded state is set when the
//! command is sent, then reconciled by boot-up messages and guarding
//! replies (see `nodeguard`).

use evo_common::canopen::state::NmtState;
use tracing::info;

pub use crate::codec::NmtCommand;

use crate::bus::Bus;
use crate::codec::encode_nmt;
use crate::error::{CanopenError, CanopenResult};
use crate::registry::Device;

/// Command that moves a node into `target`. `None` for `Unknown`.
///
/// `Initialisation` maps to a node reset.
pub const fn command_for(target: NmtState) -> Option<NmtCommand> {
    match target {
        NmtState::Operational => Some(NmtCommand::Start),
        NmtState::Stopped => Some(NmtCommand::Stop),
        NmtState::PreOperational => Some(NmtCommand::EnterPreOperational),
        NmtState::Initialisation => Some(NmtCommand::ResetNode),
        NmtState::Unknown => None,
    }
}

/// Send `command` to `device` and record the resulting state.
pub fn send_command(bus: &Bus, device: &Device, command: NmtCommand) -> CanopenResult<()> {
    bus.send(&encode_nmt(command, device.id()))?;
    let state = command.resulting_state();
    device.update(|s| {
        s.nmt_state = state;
        if state == NmtState::Initialisation {
            s.last_toggle = None;
        }
    });
    info!("Node {}: NMT {:?} -> {:?}", device.id(), command, state);
    Ok(())
}

/// Request `target` on `device`: one frame, no acknowledgement.
///
/// # Errors
/// `UnreachableTransition` for `Unknown` (nothing is sent).
pub fn set_nmt_state(bus: &Bus, device: &Device, target: NmtState) -> CanopenResult<()> {
    let command = command_for(target).ok_or_else(|| CanopenError::UnreachableTransition {
        node: device.id(),
        from: format!("{:?}", device.nmt_state()),
        to: format!("{target:?}"),
    })?;
    send_command(bus, device, command)
}

/// Apply a boot-up message: the node left Initialisation on its own.
pub(crate) fn on_boot_up(device: &Device) {
    device.update(|s| {
        s.nmt_state = NmtState::PreOperational;
        s.last_toggle = None;
    });
    info!("Node {}: boot-up, now {:?}", device.id(), NmtState::PreOperational);
}
