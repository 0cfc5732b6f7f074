//! Simulated CiA 402 drive node.
//!
//! Implements the node side of every protocol the master speaks: NMT,
//! SYNC-triggered TPDO1, RPDO1 setpoints, expedited SDO and node guarding.
//! Motion is ideal: the actual position follows the last setpoint.

use evo_common::canopen::state::{MotorState, NmtState, NodeId, OperationMode};
use std::collections::BTreeMap;

use crate::codec::{
    self, Emergency, NmtCommand, SDO_ABORT_NO_OBJECT, SdoData, SdoKey, SdoRequest, SdoValue, od,
};
use crate::frame::{CanFrame, FrameClass};
use crate::motor::{StatusBits, status_word_for};

/// CiA 402 device type (object 0x1000) reported by simulated drives.
const DEVICE_TYPE: u32 = 0x0002_0192;

/// Abort code: data cannot be transferred in the present device state.
const SDO_ABORT_DEVICE_STATE: u32 = 0x0800_0022;

/// Fault injection knobs for a simulated node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeBehavior {
    /// Answer nothing (guarding, SDO, PDO). NMT commands still apply.
    pub silent: bool,
    /// Ignore control words while in this drive state.
    pub stuck_in: Option<MotorState>,
    /// Never report homing attained.
    pub homing_stalls: bool,
}

/// One simulated node.
#[derive(Debug, Clone)]
pub struct VirtualNode {
    id: NodeId,
    nmt: NmtState,
    drive: MotorState,
    mode: i8,
    control_word: u16,
    position_mdeg: i32,
    homing_attained: bool,
    toggle: bool,
    objects: BTreeMap<SdoKey, SdoData>,
    behavior: NodeBehavior,
}

impl VirtualNode {
    /// Node that has booted and sent its boot-up message.
    pub fn new(id: NodeId) -> Self {
        let mut objects = BTreeMap::new();
        objects.insert(SdoKey::new(0x1000, 0), SdoValue::U32(DEVICE_TYPE).into());
        Self {
            id,
            nmt: NmtState::PreOperational,
            drive: MotorState::SwitchOnDisabled,
            mode: OperationMode::None as i8,
            control_word: 0,
            position_mdeg: 0,
            homing_attained: false,
            toggle: false,
            objects,
            behavior: NodeBehavior::default(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn nmt_state(&self) -> NmtState {
        self.nmt
    }

    pub fn drive_state(&self) -> MotorState {
        self.drive
    }

    pub fn position_mdeg(&self) -> i32 {
        self.position_mdeg
    }

    pub fn set_position_mdeg(&mut self, position_mdeg: i32) {
        self.position_mdeg = position_mdeg;
    }

    pub fn object(&self, key: SdoKey) -> Option<SdoData> {
        self.objects.get(&key).copied()
    }

    pub fn behavior(&self) -> NodeBehavior {
        self.behavior
    }

    pub fn set_behavior(&mut self, behavior: NodeBehavior) {
        self.behavior = behavior;
    }

    /// Current status word.
    pub fn status_word(&self) -> u16 {
        let mut word = status_word_for(self.drive);
        if self.mode == OperationMode::Homing as i8 && self.homing_attained {
            word |= StatusBits::OPERATION_MODE_SPECIFIC.bits();
        }
        word
    }

    /// Enter Fault and produce the emergency message.
    pub fn raise_fault(&mut self, error_code: u16) -> Option<CanFrame> {
        self.drive = MotorState::Fault;
        if self.behavior.silent {
            return None;
        }
        Some(codec::encode_emcy(
            self.id,
            &Emergency {
                error_code,
                error_register: 0x01,
                vendor: [0; 5],
            },
        ))
    }

    /// Process one bus frame, pushing any responses to `out`.
    pub fn on_frame(&mut self, frame: &CanFrame, out: &mut Vec<CanFrame>) {
        match frame.class() {
            FrameClass::Nmt => {
                if let Ok((command, target)) = codec::decode_nmt(frame) {
                    if target == 0 || target == self.id {
                        self.on_nmt(command, out);
                    }
                }
            }
            FrameClass::Sync => self.on_sync(out),
            FrameClass::Rpdo1(id) if id == self.id => self.on_rpdo(frame),
            FrameClass::SdoRequest(id) if id == self.id => self.on_sdo(frame, out),
            FrameClass::NodeGuard(id) if id == self.id && frame.is_remote() => self.on_guard(out),
            _ => {}
        }
    }

    fn on_nmt(&mut self, command: NmtCommand, out: &mut Vec<CanFrame>) {
        match command {
            NmtCommand::Start => self.nmt = NmtState::Operational,
            NmtCommand::Stop => self.nmt = NmtState::Stopped,
            NmtCommand::EnterPreOperational => self.nmt = NmtState::PreOperational,
            NmtCommand::ResetNode | NmtCommand::ResetCommunication => {
                if command == NmtCommand::ResetNode {
                    self.drive = MotorState::SwitchOnDisabled;
                    self.mode = OperationMode::None as i8;
                    self.control_word = 0;
                    self.homing_attained = false;
                }
                self.toggle = false;
                self.nmt = NmtState::PreOperational;
                if !self.behavior.silent {
                    out.push(codec::encode_boot_up(self.id));
                }
            }
        }
    }

    fn on_sync(&mut self, out: &mut Vec<CanFrame>) {
        if self.nmt == NmtState::Operational && !self.behavior.silent {
            out.push(codec::encode_tpdo1(self.id, self.status_word(), self.position_mdeg));
        }
    }

    fn on_rpdo(&mut self, frame: &CanFrame) {
        if self.nmt != NmtState::Operational {
            return;
        }
        let Ok(rpdo) = codec::decode_rpdo1(frame) else {
            return;
        };
        self.apply_control_word(rpdo.control_word);
        if self.drive == MotorState::OperationEnabled && self.mode == OperationMode::InterpolatedPosition as i8 {
            self.position_mdeg = rpdo.position_mdeg;
        }
    }

    fn on_sdo(&mut self, frame: &CanFrame, out: &mut Vec<CanFrame>) {
        if self.nmt == NmtState::Stopped || self.behavior.silent {
            return;
        }
        let Ok(request) = codec::decode_sdo_request(frame) else {
            return;
        };
        let response = match request {
            SdoRequest::Read(key) => match self.read_object(key) {
                Some(value) => codec::encode_sdo_upload(self.id, key, value),
                None => codec::encode_sdo_abort(self.id, key, SDO_ABORT_NO_OBJECT),
            },
            SdoRequest::Write(key, data) => {
                if key == od::CONTROLWORD {
                    if data.len() != 2 {
                        out.push(codec::encode_sdo_abort(self.id, key, SDO_ABORT_DEVICE_STATE));
                        return;
                    }
                    self.apply_control_word(data.as_u16());
                } else if key == od::MODES_OF_OPERATION {
                    self.mode = data.as_i8();
                    self.homing_attained = false;
                }
                self.objects.insert(key, data);
                codec::encode_sdo_download_ack(self.id, key)
            }
        };
        out.push(response);
    }

    fn read_object(&self, key: SdoKey) -> Option<SdoValue> {
        if key == od::STATUSWORD {
            return Some(SdoValue::U16(self.status_word()));
        }
        if key == od::MODES_OF_OPERATION_DISPLAY {
            return Some(SdoValue::I8(self.mode));
        }
        self.objects.get(&key).map(|data| match data.len() {
            1 => SdoValue::U8(data.as_u8()),
            2 => SdoValue::U16(data.as_u16()),
            _ => SdoValue::U32(data.as_u32()),
        })
    }

    fn on_guard(&mut self, out: &mut Vec<CanFrame>) {
        if self.behavior.silent {
            return;
        }
        out.push(codec::encode_guard_reply(self.id, self.toggle, self.nmt));
        self.toggle = !self.toggle;
    }

    fn apply_control_word(&mut self, word: u16) {
        let previous = self.control_word;
        self.control_word = word;
        if self.behavior.stuck_in == Some(self.drive) {
            return;
        }

        let next = if self.drive == MotorState::Fault {
            // Fault reset acts on the rising edge of bit 7
            (word & 0x80 != 0 && previous & 0x80 == 0).then_some(MotorState::SwitchOnDisabled)
        } else {
            drive_transition(self.drive, word)
        };
        if let Some(next) = next {
            self.drive = next;
        }

        let start_homing = word & 0x10 != 0 && previous & 0x10 == 0;
        if start_homing
            && self.drive == MotorState::OperationEnabled
            && self.mode == OperationMode::Homing as i8
            && !self.behavior.homing_stalls
        {
            self.homing_attained = true;
            self.position_mdeg = 0;
        }
    }
}

/// Node-side CiA 402 transition for a control word outside Fault.
fn drive_transition(state: MotorState, word: u16) -> Option<MotorState> {
    use evo_common::canopen::state::MotorState::*;

    if word & 0x80 != 0 {
        return None;
    }
    if word & 0x02 == 0 {
        // Disable voltage
        return matches!(state, ReadyToSwitchOn | SwitchedOn | OperationEnabled | QuickStopActive)
            .then_some(SwitchOnDisabled);
    }
    if word & 0x04 == 0 {
        // Quick stop
        return match state {
            OperationEnabled => Some(QuickStopActive),
            ReadyToSwitchOn | SwitchedOn => Some(SwitchOnDisabled),
            _ => None,
        };
    }
    match (word & 0x01 != 0, word & 0x08 != 0, state) {
        (false, _, NotReadyToSwitchOn | SwitchOnDisabled | SwitchedOn | OperationEnabled) => Some(ReadyToSwitchOn),
        (true, false, ReadyToSwitchOn | OperationEnabled) => Some(SwitchedOn),
        (true, true, SwitchedOn | QuickStopActive) => Some(OperationEnabled),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{SdoResponse, decode_sdo_response};

    fn respond(node: &mut VirtualNode, frame: CanFrame) -> Vec<CanFrame> {
        let mut out = Vec::new();
        node.on_frame(&frame, &mut out);
        out
    }

    fn write_cw(node: &mut VirtualNode, word: u16) {
        respond(node, codec::encode_sdo_write(node.id(), od::CONTROLWORD, SdoValue::U16(word)));
    }

    #[test]
    fn control_word_handshake() {
        let mut node = VirtualNode::new(1);
        assert_eq!(node.drive_state(), MotorState::SwitchOnDisabled);
        write_cw(&mut node, 0x06);
        assert_eq!(node.drive_state(), MotorState::ReadyToSwitchOn);
        write_cw(&mut node, 0x07);
        assert_eq!(node.drive_state(), MotorState::SwitchedOn);
        write_cw(&mut node, 0x0F);
        assert_eq!(node.drive_state(), MotorState::OperationEnabled);
        write_cw(&mut node, 0x02);
        assert_eq!(node.drive_state(), MotorState::QuickStopActive);
        write_cw(&mut node, 0x00);
        assert_eq!(node.drive_state(), MotorState::SwitchOnDisabled);
    }

    #[test]
    fn fault_reset_needs_rising_edge() {
        let mut node = VirtualNode::new(1);
        assert!(node.raise_fault(0x2310).is_some());
        write_cw(&mut node, 0x80);
        // previous word was 0x00, so this is a rising edge
        assert_eq!(node.drive_state(), MotorState::SwitchOnDisabled);

        node.raise_fault(0x2310);
        write_cw(&mut node, 0x80);
        assert_eq!(node.drive_state(), MotorState::Fault);
        write_cw(&mut node, 0x00);
        write_cw(&mut node, 0x80);
        assert_eq!(node.drive_state(), MotorState::SwitchOnDisabled);
    }

    #[test]
    fn stuck_node_ignores_control_words() {
        let mut node = VirtualNode::new(1);
        node.set_behavior(NodeBehavior {
            stuck_in: Some(MotorState::SwitchedOn),
            ..Default::default()
        });
        write_cw(&mut node, 0x06);
        write_cw(&mut node, 0x07);
        write_cw(&mut node, 0x0F);
        assert_eq!(node.drive_state(), MotorState::SwitchedOn);
    }

    #[test]
    fn sdo_read_write_and_abort() {
        let mut node = VirtualNode::new(3);
        let key = SdoKey::new(0x2000, 1);

        let out = respond(&mut node, codec::encode_sdo_write(3, key, SdoValue::U16(1234)));
        assert_eq!(decode_sdo_response(&out[0]).unwrap(), SdoResponse::DownloadAck { key });

        let out = respond(&mut node, codec::encode_sdo_read(3, key));
        match decode_sdo_response(&out[0]).unwrap() {
            SdoResponse::Upload { data, .. } => assert_eq!(data.as_u16(), 1234),
            other => panic!("unexpected {other:?}"),
        }

        let out = respond(&mut node, codec::encode_sdo_read(3, SdoKey::new(0x2001, 0)));
        assert!(matches!(
            decode_sdo_response(&out[0]).unwrap(),
            SdoResponse::Abort { code: SDO_ABORT_NO_OBJECT, .. }
        ));

        // Requests to other nodes are ignored
        assert!(respond(&mut node, codec::encode_sdo_read(4, key)).is_empty());
    }

    #[test]
    fn sync_emits_tpdo_only_when_operational() {
        let mut node = VirtualNode::new(2);
        assert!(respond(&mut node, codec::encode_sync()).is_empty());

        respond(&mut node, codec::encode_nmt(NmtCommand::Start, 0));
        let out = respond(&mut node, codec::encode_sync());
        assert_eq!(out.len(), 1);
        let tpdo = codec::decode_tpdo1(&out[0]).unwrap();
        assert_eq!(tpdo.status_word, node.status_word());
    }

    #[test]
    fn guard_replies_alternate_toggle() {
        let mut node = VirtualNode::new(5);
        let first = respond(&mut node, codec::encode_guard_request(5));
        let second = respond(&mut node, codec::encode_guard_request(5));
        let a = codec::decode_guard_reply(&first[0]).unwrap();
        let b = codec::decode_guard_reply(&second[0]).unwrap();
        assert_ne!(a.toggle, b.toggle);
        assert_eq!(a.nmt_state(), Some(NmtState::PreOperational));

        node.set_behavior(NodeBehavior {
            silent: true,
            ..Default::default()
        });
        assert!(respond(&mut node, codec::encode_guard_request(5)).is_empty());
    }

    #[test]
    fn reset_communication_sends_boot_up() {
        let mut node = VirtualNode::new(5);
        respond(&mut node, codec::encode_nmt(NmtCommand::Start, 5));
        let out = respond(&mut node, codec::encode_nmt(NmtCommand::ResetCommunication, 5));
        assert!(codec::decode_guard_reply(&out[0]).unwrap().is_boot_up());
        assert_eq!(node.nmt_state(), NmtState::PreOperational);
    }

    #[test]
    fn homing_sets_status_bit() {
        let mut node = VirtualNode::new(1);
        for word in [0x06, 0x07, 0x0F] {
            write_cw(&mut node, word);
        }
        respond(&mut node, codec::encode_sdo_write(1, od::MODES_OF_OPERATION, SdoValue::I8(6)));
        assert_eq!(node.status_word() & StatusBits::OPERATION_MODE_SPECIFIC.bits(), 0);
        node.set_position_mdeg(5000);
        write_cw(&mut node, 0x1F);
        assert_ne!(node.status_word() & StatusBits::OPERATION_MODE_SPECIFIC.bits(), 0);
        assert_eq!(node.position_mdeg(), 0);
    }

    #[test]
    fn rpdo_moves_only_in_ip_mode() {
        let mut node = VirtualNode::new(1);
        respond(&mut node, codec::encode_nmt(NmtCommand::Start, 1));
        for word in [0x06, 0x07, 0x0F] {
            write_cw(&mut node, word);
        }
        respond(&mut node, codec::encode_rpdo1(1, 0x1F, 1.0));
        assert_eq!(node.position_mdeg(), 0);

        respond(&mut node, codec::encode_sdo_write(1, od::MODES_OF_OPERATION, SdoValue::I8(7)));
        respond(&mut node, codec::encode_rpdo1(1, 0x1F, std::f64::consts::PI));
        assert_eq!(node.position_mdeg(), 180_000);
        assert_eq!(node.drive_state(), MotorState::OperationEnabled);
    }
}
