//! State enums shared by the CANopen engine and its consumers.
//!
//! All enums use `#[repr(u8)]`. `NmtState` discriminants are the state codes
//! a node reports in its node-guarding reply, `OperationMode` discriminants
//! are the values of object 0x6060 / 0x6061.

use serde::{Deserialize, Serialize};

/// CANopen node address (1..=127).
pub type NodeId = u8;

/// Network-management state of a node.
///
/// `Unknown` is never reported by a node. It marks a node whose liveness
/// supervision expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NmtState {
    /// Booting; left automatically once the boot-up message is sent.
    Initialisation = 0,
    /// Stopped: only NMT and node guarding are served.
    Stopped = 4,
    /// Operational: PDO exchange active.
    Operational = 5,
    /// Pre-operational: SDO allowed, PDO disabled.
    PreOperational = 127,
    /// Node silent for longer than the liveness tolerance.
    Unknown = 255,
}

impl NmtState {
    /// Convert from a node-guarding state code. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Initialisation),
            4 => Some(Self::Stopped),
            5 => Some(Self::Operational),
            127 => Some(Self::PreOperational),
            255 => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Returns true if PDO traffic is allowed in this state.
    #[inline]
    pub const fn allows_pdo(&self) -> bool {
        matches!(self, Self::Operational)
    }
}

impl Default for NmtState {
    fn default() -> Self {
        Self::Initialisation
    }
}

/// CiA 402 drive state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MotorState {
    /// Low-level power on, drive self-test running.
    NotReadyToSwitchOn = 0,
    /// Initialisation complete, high voltage may be applied.
    SwitchOnDisabled = 1,
    /// High voltage may be switched on.
    ReadyToSwitchOn = 2,
    /// Power amplifier ready.
    SwitchedOn = 3,
    /// Drive follows setpoints.
    OperationEnabled = 4,
    /// Quick-stop function being executed.
    QuickStopActive = 5,
    /// Fault detected, fault reaction running.
    FaultReactionActive = 6,
    /// Drive in fault; needs a fault reset.
    Fault = 7,
}

impl MotorState {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::NotReadyToSwitchOn),
            1 => Some(Self::SwitchOnDisabled),
            2 => Some(Self::ReadyToSwitchOn),
            3 => Some(Self::SwitchedOn),
            4 => Some(Self::OperationEnabled),
            5 => Some(Self::QuickStopActive),
            6 => Some(Self::FaultReactionActive),
            7 => Some(Self::Fault),
            _ => None,
        }
    }

    /// Returns true for states only reachable through a drive fault.
    #[inline]
    pub const fn is_fault(&self) -> bool {
        matches!(self, Self::FaultReactionActive | Self::Fault)
    }
}

impl Default for MotorState {
    fn default() -> Self {
        Self::NotReadyToSwitchOn
    }
}

/// Drive operating mode (objects 0x6060 / 0x6061).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum OperationMode {
    /// No mode reported yet.
    None = 0,
    /// Profile position mode.
    ProfilePosition = 1,
    /// Velocity mode.
    Velocity = 2,
    /// Profile velocity mode.
    ProfileVelocity = 3,
    /// Profile torque mode.
    TorqueProfile = 4,
    /// Homing mode.
    Homing = 6,
    /// Interpolated position mode (SYNC-driven setpoints).
    InterpolatedPosition = 7,
}

impl OperationMode {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::ProfilePosition),
            2 => Some(Self::Velocity),
            3 => Some(Self::ProfileVelocity),
            4 => Some(Self::TorqueProfile),
            6 => Some(Self::Homing),
            7 => Some(Self::InterpolatedPosition),
            _ => None,
        }
    }
}

impl Default for OperationMode {
    fn default() -> Self {
        Self::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nmt_state_codes_round_trip() {
        for state in [
            NmtState::Initialisation,
            NmtState::Stopped,
            NmtState::Operational,
            NmtState::PreOperational,
            NmtState::Unknown,
        ] {
            assert_eq!(NmtState::from_u8(state as u8), Some(state));
        }
        assert_eq!(NmtState::from_u8(1), None);
        assert_eq!(NmtState::from_u8(126), None);
    }

    #[test]
    fn motor_state_defaults_to_not_ready() {
        assert_eq!(MotorState::default(), MotorState::NotReadyToSwitchOn);
        assert_eq!(MotorState::from_u8(8), None);
        assert!(MotorState::Fault.is_fault());
        assert!(!MotorState::QuickStopActive.is_fault());
    }

    #[test]
    fn operation_mode_rejects_reserved_values() {
        assert_eq!(OperationMode::from_u8(5), None);
        assert_eq!(
            OperationMode::from_u8(7),
            Some(OperationMode::InterpolatedPosition)
        );
    }

    #[test]
    fn only_operational_allows_pdo() {
        assert!(NmtState::Operational.allows_pdo());
        assert!(!NmtState::PreOperational.allows_pdo());
        assert!(!NmtState::Unknown.allows_pdo());
    }
}
