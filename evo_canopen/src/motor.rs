//! CiA 402 drive state machine.
//!
//! The master never sets the drive state directly: it writes control words
//! and waits for the drive to confirm through its status word. The
//! permitted handshakes are listed in [`EDGES`]; [`transition_path`] finds
//! the shortest sequence between two states.

use bitflags::bitflags;
use evo_common::canopen::state::MotorState;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::codec::{SdoValue, od};
use crate::error::{CanopenError, CanopenResult};
use crate::registry::{Device, DeviceState};
use crate::sdo;

// ─── Status word ────────────────────────────────────────────────────

bitflags! {
    /// Status word (0x6041) bits.
    ///
    /// The drive state itself is decoded from the masked pattern in
    /// [`decode_status_word`]; the flags here are inspected individually.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StatusBits: u16 {
        const READY_TO_SWITCH_ON      = 0x0001;
        const SWITCHED_ON             = 0x0002;
        const OPERATION_ENABLED       = 0x0004;
        const FAULT                   = 0x0008;
        /// High voltage applied.
        const VOLTAGE_ENABLED         = 0x0010;
        /// Low active: set while quick stop is NOT engaged.
        const QUICK_STOP              = 0x0020;
        const SWITCH_ON_DISABLED      = 0x0040;
        const WARNING                 = 0x0080;
        const REMOTE                  = 0x0200;
        const TARGET_REACHED          = 0x0400;
        /// Homing attained (homing mode) / IP active (IP mode).
        const OPERATION_MODE_SPECIFIC = 0x1000;
        /// Homing error (homing mode).
        const HOMING_ERROR            = 0x2000;
    }
}

/// Decode the drive state from a status word. `None` for patterns that
/// match no state.
pub fn decode_status_word(word: u16) -> Option<MotorState> {
    match word & 0x4F {
        0x00 => return Some(MotorState::NotReadyToSwitchOn),
        0x40 => return Some(MotorState::SwitchOnDisabled),
        0x0F => return Some(MotorState::FaultReactionActive),
        0x08 => return Some(MotorState::Fault),
        _ => {}
    }
    match word & 0x6F {
        0x21 => Some(MotorState::ReadyToSwitchOn),
        0x23 => Some(MotorState::SwitchedOn),
        0x27 => Some(MotorState::OperationEnabled),
        0x07 => Some(MotorState::QuickStopActive),
        _ => None,
    }
}

/// Canonical status word a drive reports in `state`.
pub const fn status_word_for(state: MotorState) -> u16 {
    match state {
        MotorState::NotReadyToSwitchOn => 0x0000,
        MotorState::SwitchOnDisabled => 0x0040,
        MotorState::ReadyToSwitchOn => 0x0021,
        MotorState::SwitchedOn => 0x0023 | StatusBits::VOLTAGE_ENABLED.bits(),
        MotorState::OperationEnabled => 0x0027 | StatusBits::VOLTAGE_ENABLED.bits(),
        MotorState::QuickStopActive => 0x0007 | StatusBits::VOLTAGE_ENABLED.bits(),
        MotorState::FaultReactionActive => 0x000F,
        MotorState::Fault => 0x0008,
    }
}

// ─── Control word ───────────────────────────────────────────────────

/// Control word bit 4: start homing (homing mode) / enable IP (IP mode).
pub const CW_OPERATION_MODE_SPECIFIC: u16 = 0x0010;

/// Control word commands issued by the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlCommand {
    /// 0x06
    Shutdown,
    /// 0x07, also "disable operation" from OperationEnabled.
    SwitchOn,
    /// 0x0F
    EnableOperation,
    /// 0x00
    DisableVoltage,
    /// 0x02
    QuickStop,
    /// 0x00, first half of a fault reset.
    FaultResetLow,
    /// 0x80, rising edge completes the fault reset.
    FaultResetHigh,
}

impl ControlCommand {
    /// Control word value.
    pub const fn control_word(&self) -> u16 {
        match self {
            Self::Shutdown => 0x0006,
            Self::SwitchOn => 0x0007,
            Self::EnableOperation => 0x000F,
            Self::DisableVoltage => 0x0000,
            Self::QuickStop => 0x0002,
            Self::FaultResetLow => 0x0000,
            Self::FaultResetHigh => 0x0080,
        }
    }
}

/// One handshake: control words written in order, then the state the
/// drive must confirm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionStep {
    /// Control words to write.
    pub commands: &'static [ControlCommand],
    /// State to wait for.
    pub expected: MotorState,
}

use self::ControlCommand as C;
use self::MotorState as S;

/// Permitted handshakes `(from, commands, to)`.
pub const EDGES: &[(MotorState, &[ControlCommand], MotorState)] = &[
    (S::NotReadyToSwitchOn, &[C::Shutdown], S::ReadyToSwitchOn),
    (S::SwitchOnDisabled, &[C::Shutdown], S::ReadyToSwitchOn),
    (S::ReadyToSwitchOn, &[C::SwitchOn], S::SwitchedOn),
    (S::SwitchedOn, &[C::EnableOperation], S::OperationEnabled),
    (S::OperationEnabled, &[C::SwitchOn], S::SwitchedOn),
    (S::SwitchedOn, &[C::Shutdown], S::ReadyToSwitchOn),
    (S::OperationEnabled, &[C::Shutdown], S::ReadyToSwitchOn),
    (S::ReadyToSwitchOn, &[C::DisableVoltage], S::SwitchOnDisabled),
    (S::SwitchedOn, &[C::DisableVoltage], S::SwitchOnDisabled),
    (S::OperationEnabled, &[C::DisableVoltage], S::SwitchOnDisabled),
    (S::OperationEnabled, &[C::QuickStop], S::QuickStopActive),
    (S::QuickStopActive, &[C::DisableVoltage], S::SwitchOnDisabled),
    (S::Fault, &[C::FaultResetLow, C::FaultResetHigh], S::SwitchOnDisabled),
];

const STATE_COUNT: usize = 8;

/// Shortest handshake sequence from `from` to `to`. Empty if equal,
/// `None` if unreachable.
pub fn transition_path(from: MotorState, to: MotorState) -> Option<Vec<TransitionStep>> {
    if from == to {
        return Some(Vec::new());
    }

    let mut via: [Option<(MotorState, &'static [ControlCommand])>; STATE_COUNT] = [None; STATE_COUNT];
    let mut visited = [false; STATE_COUNT];
    let mut queue = VecDeque::from([from]);
    visited[from as usize] = true;

    while let Some(state) = queue.pop_front() {
        for &(src, commands, dst) in EDGES {
            if src != state || visited[dst as usize] {
                continue;
            }
            visited[dst as usize] = true;
            via[dst as usize] = Some((src, commands));
            if dst == to {
                let mut steps = Vec::new();
                let mut cursor = to;
                while let Some((prev, commands)) = via[cursor as usize] {
                    steps.push(TransitionStep {
                        commands,
                        expected: cursor,
                    });
                    if prev == from {
                        break;
                    }
                    cursor = prev;
                }
                steps.reverse();
                return Some(steps);
            }
            queue.push_back(dst);
        }
    }
    None
}

// ─── Driving a device ───────────────────────────────────────────────

/// Confirmation timing.
#[derive(Debug, Clone, Copy)]
pub struct MotorTiming {
    /// Maximum wait for each confirmation.
    pub transition_timeout: Duration,
    /// Status word polling period while waiting.
    pub poll_interval: Duration,
}

/// Drive `device` to `target` through the minimal handshake sequence.
///
/// # Errors
/// - `UnreachableTransition` before any frame is sent if no path exists
/// - `ProtocolTimeout` if a step is not confirmed in time; the recorded
///   state stays at the last confirmed one
/// - `Transport` on send failure
pub fn set_motor_state(
    bus: &Bus,
    device: &Device,
    target: MotorState,
    timing: &MotorTiming,
) -> CanopenResult<()> {
    let current = device.motor_state();
    let path = transition_path(current, target).ok_or_else(|| CanopenError::UnreachableTransition {
        node: device.id(),
        from: format!("{current:?}"),
        to: format!("{target:?}"),
    })?;

    if path.is_empty() {
        debug!("Node {}: already {:?}", device.id(), target);
        return Ok(());
    }
    debug!("Node {}: {:?} -> {:?} in {} steps", device.id(), current, target, path.len());

    for step in &path {
        for command in step.commands {
            write_control_word(bus, device, command.control_word())?;
        }
        await_motor_state(bus, device, step.expected, timing)?;
    }

    info!("Node {}: motor state {:?}", device.id(), target);
    Ok(())
}

/// Write the control word and remember it as the commanded one.
pub(crate) fn write_control_word(bus: &Bus, device: &Device, word: u16) -> CanopenResult<()> {
    sdo::send_write(bus, device.id(), od::CONTROLWORD, SdoValue::U16(word))?;
    device.update(|s| s.control_word = word);
    Ok(())
}

/// Poll the status word until the recorded state equals `expected`.
pub(crate) fn await_motor_state(
    bus: &Bus,
    device: &Device,
    expected: MotorState,
    timing: &MotorTiming,
) -> CanopenResult<()> {
    await_status(bus, device, timing.transition_timeout, timing.poll_interval, &format!("{expected:?}"), |s| {
        s.motor_state == expected
    })
}

/// Poll the status word until `confirmed` holds for the recorded state.
pub(crate) fn await_status(
    bus: &Bus,
    device: &Device,
    timeout: Duration,
    poll_interval: Duration,
    operation: &str,
    mut confirmed: impl FnMut(&DeviceState) -> bool,
) -> CanopenResult<()> {
    let deadline = Instant::now() + timeout;
    loop {
        sdo::send_read(bus, device.id(), od::STATUSWORD)?;
        let poll_deadline = (Instant::now() + poll_interval).min(deadline);
        if device.wait_until(poll_deadline, &mut confirmed) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            warn!(
                "Node {}: {} not confirmed within {}ms (state {:?})",
                device.id(),
                operation,
                timeout.as_millis(),
                device.motor_state()
            );
            return Err(CanopenError::ProtocolTimeout {
                node: device.id(),
                operation: operation.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [MotorState; 8] = [
        S::NotReadyToSwitchOn,
        S::SwitchOnDisabled,
        S::ReadyToSwitchOn,
        S::SwitchedOn,
        S::OperationEnabled,
        S::QuickStopActive,
        S::FaultReactionActive,
        S::Fault,
    ];

    fn commands(path: &[TransitionStep]) -> Vec<u16> {
        path.iter()
            .flat_map(|s| s.commands.iter().map(|c| c.control_word()))
            .collect()
    }

    #[test]
    fn canonical_status_words_decode() {
        for state in ALL {
            assert_eq!(decode_status_word(status_word_for(state)), Some(state), "{state:?}");
        }
        // Manufacturer bits outside the masks are ignored
        assert_eq!(decode_status_word(0x1637), Some(S::OperationEnabled));
        assert_eq!(decode_status_word(0x0250), Some(S::SwitchOnDisabled));
        assert_eq!(decode_status_word(0x0001), None);
    }

    #[test]
    fn status_bits_ignore_reserved() {
        let bits = StatusBits::from_bits_truncate(0x3537);
        assert!(bits.contains(StatusBits::VOLTAGE_ENABLED | StatusBits::HOMING_ERROR));
        assert!(bits.contains(StatusBits::OPERATION_MODE_SPECIFIC));
        assert!(!bits.contains(StatusBits::SWITCH_ON_DISABLED));
        // Bit 8 is reserved
        assert_eq!(bits.bits() & 0x0100, 0);
    }

    #[test]
    fn not_ready_to_operation_enabled() {
        let path = transition_path(S::NotReadyToSwitchOn, S::OperationEnabled).unwrap();
        assert_eq!(commands(&path), vec![0x06, 0x07, 0x0F]);
        let expected: Vec<_> = path.iter().map(|s| s.expected).collect();
        assert_eq!(expected, vec![S::ReadyToSwitchOn, S::SwitchedOn, S::OperationEnabled]);
    }

    #[test]
    fn fault_reset_then_enable() {
        let path = transition_path(S::Fault, S::OperationEnabled).unwrap();
        assert_eq!(commands(&path), vec![0x00, 0x80, 0x06, 0x07, 0x0F]);
        assert_eq!(path.len(), 4);
    }

    #[test]
    fn shortest_paths_down() {
        let path = transition_path(S::OperationEnabled, S::SwitchOnDisabled).unwrap();
        assert_eq!(commands(&path), vec![0x00]);

        let path = transition_path(S::OperationEnabled, S::SwitchedOn).unwrap();
        assert_eq!(commands(&path), vec![0x07]);

        let path = transition_path(S::QuickStopActive, S::OperationEnabled).unwrap();
        assert_eq!(commands(&path), vec![0x00, 0x06, 0x07, 0x0F]);
    }

    #[test]
    fn same_state_is_empty_path() {
        for state in ALL {
            assert_eq!(transition_path(state, state), Some(Vec::new()));
        }
    }

    #[test]
    fn fault_states_are_not_targets() {
        for from in ALL {
            for to in [S::Fault, S::FaultReactionActive, S::NotReadyToSwitchOn] {
                if from != to {
                    assert_eq!(transition_path(from, to), None, "{from:?} -> {to:?}");
                }
            }
        }
        assert_eq!(transition_path(S::FaultReactionActive, S::SwitchOnDisabled), None);
    }

    #[test]
    fn every_operational_state_reachable_from_not_ready() {
        for to in [
            S::SwitchOnDisabled,
            S::ReadyToSwitchOn,
            S::SwitchedOn,
            S::OperationEnabled,
            S::QuickStopActive,
        ] {
            assert!(transition_path(S::NotReadyToSwitchOn, to).is_some(), "{to:?}");
        }
    }
}
