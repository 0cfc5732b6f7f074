//! Bit-exact encoding and decoding of every CANopen message the engine
//! exchanges, plus the fixed-point angle scaling used on the PDO path.
//!
//! Both directions are provided for each sub-protocol: the master side
//! (used by the engine) and the node side (used by the virtual bus).
//! All multi-byte fields are little-endian.

use evo_common::canopen::state::{NmtState, NodeId};
use std::f64::consts::TAU;

use crate::error::{CanopenError, CanopenResult};
use crate::frame::{
    CanFrame, COB_NMT, COB_SYNC, emcy_cob_id, nodeguard_cob_id, rpdo1_cob_id,
    sdo_request_cob_id, sdo_response_cob_id, tpdo1_cob_id,
};

// ─── Fixed-point scaling ────────────────────────────────────────────

/// Milli-degrees per full revolution.
pub const MDEG_PER_REV: f64 = 360_000.0;

/// Radians to milli-degrees, rounded to nearest. Saturates at the i32 range.
#[inline]
pub fn rad_to_mdeg(phi: f64) -> i32 {
    (phi / TAU * MDEG_PER_REV).round() as i32
}

/// Milli-degrees to radians.
#[inline]
pub fn mdeg_to_rad(alpha: i32) -> f64 {
    alpha as f64 / MDEG_PER_REV * TAU
}

// ─── Object dictionary addressing ───────────────────────────────────

/// Object dictionary address. Ordered index-major, sub-index-minor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SdoKey {
    /// Object index.
    pub index: u16,
    /// Sub-index.
    pub sub_index: u8,
}

impl SdoKey {
    /// Create a key.
    pub const fn new(index: u16, sub_index: u8) -> Self {
        Self { index, sub_index }
    }
}

impl std::fmt::Display for SdoKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06x}:{:02}", self.index, self.sub_index)
    }
}

/// Object dictionary entries used by the engine.
pub mod od {
    use super::SdoKey;

    /// Guard time in ms (u16).
    pub const GUARD_TIME: SdoKey = SdoKey::new(0x100C, 0);
    /// Life-time factor (u8).
    pub const LIFE_TIME_FACTOR: SdoKey = SdoKey::new(0x100D, 0);
    /// Manufacturer-specific SYNC timeout factor.
    pub const SYNC_TIMEOUT_FACTOR: SdoKey = SdoKey::new(0x200E, 0);
    /// CiA 402 control word (u16).
    pub const CONTROLWORD: SdoKey = SdoKey::new(0x6040, 0);
    /// CiA 402 status word (u16).
    pub const STATUSWORD: SdoKey = SdoKey::new(0x6041, 0);
    /// Modes of operation (i8).
    pub const MODES_OF_OPERATION: SdoKey = SdoKey::new(0x6060, 0);
    /// Modes of operation display (i8).
    pub const MODES_OF_OPERATION_DISPLAY: SdoKey = SdoKey::new(0x6061, 0);
    /// Interpolation time period, units (u8).
    pub const IP_TIME_UNITS: SdoKey = SdoKey::new(0x60C2, 1);
    /// Interpolation time period, power-of-ten index (i8).
    pub const IP_TIME_INDEX: SdoKey = SdoKey::new(0x60C2, 2);
}

// ─── SDO (expedited) ────────────────────────────────────────────────

/// Initiate-upload request.
pub const SDO_CMD_READ: u8 = 0x40;
/// Initiate-download request, 1 data byte.
pub const SDO_CMD_WRITE_1: u8 = 0x2F;
/// Initiate-download request, 2 data bytes.
pub const SDO_CMD_WRITE_2: u8 = 0x2B;
/// Initiate-download request, 4 data bytes.
pub const SDO_CMD_WRITE_4: u8 = 0x23;
/// Upload response, 1 data byte.
pub const SDO_RESP_UPLOAD_1: u8 = 0x4F;
/// Upload response, 2 data bytes.
pub const SDO_RESP_UPLOAD_2: u8 = 0x4B;
/// Upload response, 3 data bytes.
pub const SDO_RESP_UPLOAD_3: u8 = 0x47;
/// Upload response, 4 data bytes.
pub const SDO_RESP_UPLOAD_4: u8 = 0x43;
/// Upload response, size not indicated.
pub const SDO_RESP_UPLOAD_UNSIZED: u8 = 0x42;
/// Download acknowledgement.
pub const SDO_RESP_DOWNLOAD_ACK: u8 = 0x60;
/// Abort transfer.
pub const SDO_ABORT: u8 = 0x80;

/// Abort code: object does not exist in the object dictionary.
pub const SDO_ABORT_NO_OBJECT: u32 = 0x0602_0000;

/// Typed value of an expedited SDO write. The variant fixes the width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdoValue {
    /// Unsigned 8-bit.
    U8(u8),
    /// Signed 8-bit.
    I8(i8),
    /// Unsigned 16-bit.
    U16(u16),
    /// Signed 16-bit.
    I16(i16),
    /// Unsigned 32-bit.
    U32(u32),
    /// Signed 32-bit.
    I32(i32),
}

impl SdoValue {
    /// Encoded width in bytes (1, 2 or 4).
    pub const fn width(&self) -> usize {
        match self {
            Self::U8(_) | Self::I8(_) => 1,
            Self::U16(_) | Self::I16(_) => 2,
            Self::U32(_) | Self::I32(_) => 4,
        }
    }

    /// Download command byte for this width.
    pub const fn write_command(&self) -> u8 {
        match self.width() {
            1 => SDO_CMD_WRITE_1,
            2 => SDO_CMD_WRITE_2,
            _ => SDO_CMD_WRITE_4,
        }
    }

    /// Upload response command byte for this width.
    pub const fn upload_command(&self) -> u8 {
        match self.width() {
            1 => SDO_RESP_UPLOAD_1,
            2 => SDO_RESP_UPLOAD_2,
            _ => SDO_RESP_UPLOAD_4,
        }
    }

    /// Little-endian value bytes, zero-padded to four.
    pub fn to_le_bytes(&self) -> [u8; 4] {
        let mut out = [0u8; 4];
        match *self {
            Self::U8(v) => out[0] = v,
            Self::I8(v) => out[0] = v as u8,
            Self::U16(v) => out[..2].copy_from_slice(&v.to_le_bytes()),
            Self::I16(v) => out[..2].copy_from_slice(&v.to_le_bytes()),
            Self::U32(v) => out.copy_from_slice(&v.to_le_bytes()),
            Self::I32(v) => out.copy_from_slice(&v.to_le_bytes()),
        }
        out
    }
}

/// Value carried by an upload response or a download request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdoData {
    bytes: [u8; 4],
    len: usize,
}

impl SdoData {
    /// Wrap raw little-endian bytes, `len` significant.
    pub fn new(bytes: [u8; 4], len: usize) -> Self {
        Self {
            bytes,
            len: len.min(4),
        }
    }

    /// Number of significant bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if no byte is significant.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Significant bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// Low byte as u8.
    pub fn as_u8(&self) -> u8 {
        self.bytes[0]
    }

    /// Low byte as i8.
    pub fn as_i8(&self) -> i8 {
        self.bytes[0] as i8
    }

    /// Low two bytes as u16.
    pub fn as_u16(&self) -> u16 {
        u16::from_le_bytes([self.bytes[0], self.bytes[1]])
    }

    /// Low two bytes as i16.
    pub fn as_i16(&self) -> i16 {
        self.as_u16() as i16
    }

    /// All four bytes as u32.
    pub fn as_u32(&self) -> u32 {
        u32::from_le_bytes(self.bytes)
    }

    /// All four bytes as i32.
    pub fn as_i32(&self) -> i32 {
        self.as_u32() as i32
    }
}

impl From<SdoValue> for SdoData {
    fn from(value: SdoValue) -> Self {
        Self::new(value.to_le_bytes(), value.width())
    }
}

/// Decoded SDO response (node to master).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdoResponse {
    /// Expedited upload carrying the object value.
    Upload {
        /// Object read
        key: SdoKey,
        /// Object value
        data: SdoData,
    },
    /// Download acknowledged.
    DownloadAck {
        /// Object written
        key: SdoKey,
    },
    /// Transfer aborted by the node.
    Abort {
        /// Object addressed
        key: SdoKey,
        /// CiA 301 abort code
        code: u32,
    },
}

/// Decoded SDO request (master to node).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdoRequest {
    /// Initiate upload.
    Read(SdoKey),
    /// Expedited download.
    Write(SdoKey, SdoData),
}

fn sdo_frame(cob_id: u16, command: u8, key: SdoKey, value: [u8; 4]) -> CanFrame {
    let index = key.index.to_le_bytes();
    CanFrame::fixed(
        cob_id,
        [
            command,
            index[0],
            index[1],
            key.sub_index,
            value[0],
            value[1],
            value[2],
            value[3],
        ],
    )
}

fn sdo_parts(frame: &CanFrame) -> CanopenResult<(u8, SdoKey, [u8; 4])> {
    let data = frame.data();
    if frame.is_remote() || data.len() != 8 {
        return Err(CanopenError::MalformedFrame {
            cob_id: frame.cob_id(),
            reason: "SDO frame must carry 8 bytes",
        });
    }
    let key = SdoKey::new(u16::from_le_bytes([data[1], data[2]]), data[3]);
    Ok((data[0], key, [data[4], data[5], data[6], data[7]]))
}

/// Upload (read) request.
pub fn encode_sdo_read(node: NodeId, key: SdoKey) -> CanFrame {
    sdo_frame(sdo_request_cob_id(node), SDO_CMD_READ, key, [0; 4])
}

/// Expedited download (write) request.
pub fn encode_sdo_write(node: NodeId, key: SdoKey, value: SdoValue) -> CanFrame {
    sdo_frame(
        sdo_request_cob_id(node),
        value.write_command(),
        key,
        value.to_le_bytes(),
    )
}

/// Decode a request frame (node side).
pub fn decode_sdo_request(frame: &CanFrame) -> CanopenResult<SdoRequest> {
    let (command, key, value) = sdo_parts(frame)?;
    let len = match command {
        SDO_CMD_READ => return Ok(SdoRequest::Read(key)),
        SDO_CMD_WRITE_1 => 1,
        SDO_CMD_WRITE_2 => 2,
        SDO_CMD_WRITE_4 => 4,
        _ => {
            return Err(CanopenError::MalformedFrame {
                cob_id: frame.cob_id(),
                reason: "unsupported SDO request command",
            });
        }
    };
    Ok(SdoRequest::Write(key, SdoData::new(value, len)))
}

/// Upload response (node side).
pub fn encode_sdo_upload(node: NodeId, key: SdoKey, value: SdoValue) -> CanFrame {
    sdo_frame(
        sdo_response_cob_id(node),
        value.upload_command(),
        key,
        value.to_le_bytes(),
    )
}

/// Download acknowledgement (node side).
pub fn encode_sdo_download_ack(node: NodeId, key: SdoKey) -> CanFrame {
    sdo_frame(sdo_response_cob_id(node), SDO_RESP_DOWNLOAD_ACK, key, [0; 4])
}

/// Abort transfer (node side).
pub fn encode_sdo_abort(node: NodeId, key: SdoKey, code: u32) -> CanFrame {
    sdo_frame(sdo_response_cob_id(node), SDO_ABORT, key, code.to_le_bytes())
}

/// Decode a response frame.
pub fn decode_sdo_response(frame: &CanFrame) -> CanopenResult<SdoResponse> {
    let (command, key, value) = sdo_parts(frame)?;
    let len = match command {
        SDO_RESP_UPLOAD_1 => 1,
        SDO_RESP_UPLOAD_2 => 2,
        SDO_RESP_UPLOAD_3 => 3,
        SDO_RESP_UPLOAD_4 | SDO_RESP_UPLOAD_UNSIZED => 4,
        SDO_RESP_DOWNLOAD_ACK => return Ok(SdoResponse::DownloadAck { key }),
        SDO_ABORT => {
            return Ok(SdoResponse::Abort {
                key,
                code: u32::from_le_bytes(value),
            });
        }
        _ => {
            return Err(CanopenError::MalformedFrame {
                cob_id: frame.cob_id(),
                reason: "unsupported SDO response command",
            });
        }
    };
    let mut bytes = [0u8; 4];
    bytes[..len].copy_from_slice(&value[..len]);
    Ok(SdoResponse::Upload {
        key,
        data: SdoData::new(bytes, len),
    })
}

// ─── NMT ────────────────────────────────────────────────────────────

/// NMT command specifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NmtCommand {
    /// Enter Operational.
    Start = 0x01,
    /// Enter Stopped.
    Stop = 0x02,
    /// Enter Pre-operational.
    EnterPreOperational = 0x80,
    /// Full application reset.
    ResetNode = 0x81,
    /// Communication parameter reset.
    ResetCommunication = 0x82,
}

impl NmtCommand {
    /// Parse a command specifier.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Start),
            0x02 => Some(Self::Stop),
            0x80 => Some(Self::EnterPreOperational),
            0x81 => Some(Self::ResetNode),
            0x82 => Some(Self::ResetCommunication),
            _ => None,
        }
    }

    /// State the node is in right after executing the command.
    pub const fn resulting_state(&self) -> NmtState {
        match self {
            Self::Start => NmtState::Operational,
            Self::Stop => NmtState::Stopped,
            Self::EnterPreOperational => NmtState::PreOperational,
            Self::ResetNode | Self::ResetCommunication => NmtState::Initialisation,
        }
    }
}

/// NMT command frame. Node 0 addresses every node.
pub fn encode_nmt(command: NmtCommand, node: NodeId) -> CanFrame {
    CanFrame::fixed(COB_NMT, [command as u8, node])
}

/// Decode an NMT command frame (node side).
pub fn decode_nmt(frame: &CanFrame) -> CanopenResult<(NmtCommand, NodeId)> {
    let data = frame.data();
    if frame.cob_id() != COB_NMT || data.len() != 2 {
        return Err(CanopenError::MalformedFrame {
            cob_id: frame.cob_id(),
            reason: "NMT frame must carry 2 bytes",
        });
    }
    let command = NmtCommand::from_u8(data[0]).ok_or(CanopenError::MalformedFrame {
        cob_id: frame.cob_id(),
        reason: "unknown NMT command",
    })?;
    Ok((command, data[1]))
}

// ─── SYNC / PDO ─────────────────────────────────────────────────────

/// SYNC frame (no payload).
pub fn encode_sync() -> CanFrame {
    CanFrame::fixed(COB_SYNC, [])
}

/// Contents of RPDO1: control word and interpolation setpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rpdo1 {
    /// CiA 402 control word.
    pub control_word: u16,
    /// Target position in milli-degrees.
    pub position_mdeg: i32,
}

/// Contents of TPDO1: status word and actual position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tpdo1 {
    /// CiA 402 status word.
    pub status_word: u16,
    /// Actual position in milli-degrees.
    pub position_mdeg: i32,
}

fn pdo_frame(cob_id: u16, word: u16, position_mdeg: i32) -> CanFrame {
    let w = word.to_le_bytes();
    let p = position_mdeg.to_le_bytes();
    CanFrame::fixed(cob_id, [w[0], w[1], 0, 0, p[0], p[1], p[2], p[3]])
}

fn pdo_parts(frame: &CanFrame) -> CanopenResult<(u16, i32)> {
    let data = frame.data();
    if frame.is_remote() || data.len() != 8 {
        return Err(CanopenError::MalformedFrame {
            cob_id: frame.cob_id(),
            reason: "PDO1 must carry 8 bytes",
        });
    }
    Ok((
        u16::from_le_bytes([data[0], data[1]]),
        i32::from_le_bytes([data[4], data[5], data[6], data[7]]),
    ))
}

/// RPDO1 with a setpoint in radians.
pub fn encode_rpdo1(node: NodeId, control_word: u16, position_rad: f64) -> CanFrame {
    pdo_frame(rpdo1_cob_id(node), control_word, rad_to_mdeg(position_rad))
}

/// Decode RPDO1 (node side).
pub fn decode_rpdo1(frame: &CanFrame) -> CanopenResult<Rpdo1> {
    let (control_word, position_mdeg) = pdo_parts(frame)?;
    Ok(Rpdo1 {
        control_word,
        position_mdeg,
    })
}

/// TPDO1 (node side).
pub fn encode_tpdo1(node: NodeId, status_word: u16, position_mdeg: i32) -> CanFrame {
    pdo_frame(tpdo1_cob_id(node), status_word, position_mdeg)
}

/// Decode TPDO1.
pub fn decode_tpdo1(frame: &CanFrame) -> CanopenResult<Tpdo1> {
    let (status_word, position_mdeg) = pdo_parts(frame)?;
    Ok(Tpdo1 {
        status_word,
        position_mdeg,
    })
}

// ─── Node guarding ──────────────────────────────────────────────────

/// Node guarding reply or boot-up message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardReply {
    /// Toggle bit (bit 7).
    pub toggle: bool,
    /// State code (bits 0-6).
    pub state: u8,
}

impl GuardReply {
    /// True for the boot-up message (state code 0).
    pub fn is_boot_up(&self) -> bool {
        self.state == 0
    }

    /// Reported NMT state, `None` for unknown codes.
    pub fn nmt_state(&self) -> Option<NmtState> {
        match NmtState::from_u8(self.state) {
            Some(NmtState::Unknown) | None => None,
            state => state,
        }
    }
}

/// Node guarding probe (remote frame).
pub fn encode_guard_request(node: NodeId) -> CanFrame {
    CanFrame::remote(nodeguard_cob_id(node))
}

/// Node guarding reply (node side).
pub fn encode_guard_reply(node: NodeId, toggle: bool, state: NmtState) -> CanFrame {
    let toggle_bit = if toggle { 0x80 } else { 0x00 };
    CanFrame::fixed(nodeguard_cob_id(node), [toggle_bit | (state as u8 & 0x7F)])
}

/// Boot-up message (node side).
pub fn encode_boot_up(node: NodeId) -> CanFrame {
    CanFrame::fixed(nodeguard_cob_id(node), [0x00])
}

/// Decode a node guarding reply or boot-up message.
pub fn decode_guard_reply(frame: &CanFrame) -> CanopenResult<GuardReply> {
    let data = frame.data();
    if frame.is_remote() || data.len() != 1 {
        return Err(CanopenError::MalformedFrame {
            cob_id: frame.cob_id(),
            reason: "guard reply must carry 1 byte",
        });
    }
    Ok(GuardReply {
        toggle: data[0] & 0x80 != 0,
        state: data[0] & 0x7F,
    })
}

// ─── Emergency ──────────────────────────────────────────────────────

/// Emergency message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Emergency {
    /// CiA 301 emergency error code (0 = error reset).
    pub error_code: u16,
    /// Error register (object 0x1001).
    pub error_register: u8,
    /// Manufacturer-specific bytes.
    pub vendor: [u8; 5],
}

/// Emergency message (node side).
pub fn encode_emcy(node: NodeId, emergency: &Emergency) -> CanFrame {
    let code = emergency.error_code.to_le_bytes();
    let v = emergency.vendor;
    CanFrame::fixed(
        emcy_cob_id(node),
        [
            code[0],
            code[1],
            emergency.error_register,
            v[0],
            v[1],
            v[2],
            v[3],
            v[4],
        ],
    )
}

/// Decode an emergency message. Short vendor fields are zero-filled.
pub fn decode_emcy(frame: &CanFrame) -> CanopenResult<Emergency> {
    let data = frame.data();
    if frame.is_remote() || data.len() < 3 {
        return Err(CanopenError::MalformedFrame {
            cob_id: frame.cob_id(),
            reason: "EMCY must carry at least 3 bytes",
        });
    }
    let mut vendor = [0u8; 5];
    for (dst, src) in vendor.iter_mut().zip(&data[3..]) {
        *dst = *src;
    }
    Ok(Emergency {
        error_code: u16::from_le_bytes([data[0], data[1]]),
        error_register: data[2],
        vendor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_point_known_values() {
        assert_eq!(rad_to_mdeg(0.0), 0);
        assert_eq!(rad_to_mdeg(std::f64::consts::PI), 180_000);
        assert_eq!(rad_to_mdeg(-std::f64::consts::FRAC_PI_2), -90_000);
        assert!((mdeg_to_rad(90_000) - std::f64::consts::FRAC_PI_2).abs() < 1e-12);
    }

    #[test]
    fn sdo_write_layout() {
        let frame = encode_sdo_write(5, od::CONTROLWORD, SdoValue::U16(0x000F));
        assert_eq!(frame.cob_id(), 0x605);
        assert_eq!(frame.data(), &[0x2B, 0x40, 0x60, 0x00, 0x0F, 0x00, 0x00, 0x00]);

        let frame = encode_sdo_write(5, od::IP_TIME_INDEX, SdoValue::I8(-3));
        assert_eq!(frame.data(), &[0x2F, 0xC2, 0x60, 0x02, 0xFD, 0x00, 0x00, 0x00]);

        let frame = encode_sdo_write(5, od::GUARD_TIME, SdoValue::U32(0x0102_0304));
        assert_eq!(frame.data()[0], 0x23);
        assert_eq!(&frame.data()[4..], &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn sdo_read_layout() {
        let frame = encode_sdo_read(1, od::STATUSWORD);
        assert_eq!(frame.cob_id(), 0x601);
        assert_eq!(frame.data(), &[0x40, 0x41, 0x60, 0x00, 0, 0, 0, 0]);
        assert_eq!(decode_sdo_request(&frame).unwrap(), SdoRequest::Read(od::STATUSWORD));
    }

    #[test]
    fn written_value_reads_back() {
        let key = SdoKey::new(0x2000, 1);
        let write = encode_sdo_write(3, key, SdoValue::U16(1234));
        let SdoRequest::Write(k, data) = decode_sdo_request(&write).unwrap() else {
            panic!("expected write");
        };
        assert_eq!(k, key);
        assert_eq!(data.len(), 2);

        let upload = encode_sdo_upload(3, key, SdoValue::U16(data.as_u16()));
        match decode_sdo_response(&upload).unwrap() {
            SdoResponse::Upload { key: k, data } => {
                assert_eq!(k, key);
                assert_eq!(data.as_u16(), 1234);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn sdo_response_variants() {
        let ack = encode_sdo_download_ack(2, od::GUARD_TIME);
        assert_eq!(
            decode_sdo_response(&ack).unwrap(),
            SdoResponse::DownloadAck { key: od::GUARD_TIME }
        );

        let abort = encode_sdo_abort(2, od::GUARD_TIME, SDO_ABORT_NO_OBJECT);
        assert_eq!(abort.data()[0], 0x80);
        assert_eq!(
            decode_sdo_response(&abort).unwrap(),
            SdoResponse::Abort {
                key: od::GUARD_TIME,
                code: SDO_ABORT_NO_OBJECT
            }
        );

        let unsized_upload = CanFrame::new(0x582, &[0x42, 0x41, 0x60, 0, 0x37, 0x02, 0, 0]).unwrap();
        match decode_sdo_response(&unsized_upload).unwrap() {
            SdoResponse::Upload { data, .. } => {
                assert_eq!(data.len(), 4);
                assert_eq!(data.as_u16(), 0x0237);
            }
            other => panic!("unexpected {other:?}"),
        }

        let three = CanFrame::new(0x582, &[0x47, 0, 0x20, 0, 1, 2, 3, 0xFF]).unwrap();
        match decode_sdo_response(&three).unwrap() {
            SdoResponse::Upload { data, .. } => assert_eq!(data.as_u32(), 0x0003_0201),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn sdo_rejects_short_and_unknown_commands() {
        let short = CanFrame::new(0x582, &[0x4B, 0x41, 0x60]).unwrap();
        assert!(matches!(
            decode_sdo_response(&short),
            Err(CanopenError::MalformedFrame { .. })
        ));
        let unknown = CanFrame::new(0x582, &[0x21, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        assert!(decode_sdo_response(&unknown).is_err());
    }

    #[test]
    fn nmt_layout() {
        let frame = encode_nmt(NmtCommand::ResetCommunication, 7);
        assert_eq!(frame.cob_id(), 0x000);
        assert_eq!(frame.data(), &[0x82, 7]);
        assert_eq!(
            decode_nmt(&frame).unwrap(),
            (NmtCommand::ResetCommunication, 7)
        );
        assert_eq!(NmtCommand::Start.resulting_state(), NmtState::Operational);
        assert_eq!(NmtCommand::ResetNode.resulting_state(), NmtState::Initialisation);
    }

    #[test]
    fn pdo_layout() {
        let frame = encode_rpdo1(4, 0x1F, std::f64::consts::PI);
        assert_eq!(frame.cob_id(), 0x204);
        let p = 180_000i32.to_le_bytes();
        assert_eq!(frame.data(), &[0x1F, 0x00, 0x00, 0x00, p[0], p[1], p[2], p[3]]);

        let tpdo = encode_tpdo1(4, 0x0237, -45_000);
        assert_eq!(
            decode_tpdo1(&tpdo).unwrap(),
            Tpdo1 {
                status_word: 0x0237,
                position_mdeg: -45_000
            }
        );
        let short = CanFrame::new(0x184, &[0x37, 0x02]).unwrap();
        assert!(decode_tpdo1(&short).is_err());
    }

    #[test]
    fn sync_is_empty() {
        let sync = encode_sync();
        assert_eq!(sync.cob_id(), 0x080);
        assert!(sync.is_empty());
        assert!(!sync.is_remote());
    }

    #[test]
    fn guard_reply_bits() {
        let frame = encode_guard_reply(9, true, NmtState::Operational);
        assert_eq!(frame.cob_id(), 0x709);
        assert_eq!(frame.data(), &[0x85]);

        let reply = decode_guard_reply(&frame).unwrap();
        assert!(reply.toggle);
        assert_eq!(reply.nmt_state(), Some(NmtState::Operational));

        let pre_op = decode_guard_reply(&encode_guard_reply(9, false, NmtState::PreOperational)).unwrap();
        assert_eq!(pre_op.state, 127);
        assert!(!pre_op.toggle);

        let boot = decode_guard_reply(&encode_boot_up(9)).unwrap();
        assert!(boot.is_boot_up());

        assert!(decode_guard_reply(&encode_guard_request(9)).is_err());
        let unknown = decode_guard_reply(&CanFrame::new(0x709, &[0x7F & 3]).unwrap()).unwrap();
        assert_eq!(unknown.nmt_state(), None);
    }

    #[test]
    fn emcy_decoding() {
        let emcy = Emergency {
            error_code: 0x2310,
            error_register: 0x03,
            vendor: [1, 2, 3, 4, 5],
        };
        let frame = encode_emcy(6, &emcy);
        assert_eq!(frame.cob_id(), 0x086);
        assert_eq!(decode_emcy(&frame).unwrap(), emcy);

        let short = CanFrame::new(0x086, &[0x00, 0x00, 0x00]).unwrap();
        assert_eq!(decode_emcy(&short).unwrap().vendor, [0; 5]);
        let too_short = CanFrame::new(0x086, &[0x00]).unwrap();
        assert!(decode_emcy(&too_short).is_err());
    }
}
