//! CAN frame type and COB-ID classification.
//!
//! COB-IDs follow the CANopen predefined connection set: the upper four bits
//! of the 11-bit identifier select the function, the lower seven the node.

use evo_common::canopen::consts::MAX_NODE_ID;
use evo_common::canopen::state::NodeId;
use evo_common::consts::CAN_MAX_DLC;
use heapless::Vec;
use static_assertions::const_assert_eq;
use std::time::Duration;

use crate::error::{CanopenError, CanopenResult};

/// NMT command frames (master to all nodes).
pub const COB_NMT: u16 = 0x000;
/// SYNC broadcast.
pub const COB_SYNC: u16 = 0x080;
/// Emergency messages, plus node id.
pub const COB_EMCY_BASE: u16 = 0x080;
/// Transmit PDO 1 (node to master), plus node id.
pub const COB_TPDO1_BASE: u16 = 0x180;
/// Receive PDO 1 (master to node), plus node id.
pub const COB_RPDO1_BASE: u16 = 0x200;
/// SDO responses (node to master), plus node id.
pub const COB_SDO_RESPONSE_BASE: u16 = 0x580;
/// SDO requests (master to node), plus node id.
pub const COB_SDO_REQUEST_BASE: u16 = 0x600;
/// Node guarding / boot-up, plus node id.
pub const COB_NODEGUARD_BASE: u16 = 0x700;
/// Largest 11-bit identifier.
pub const MAX_COB_ID: u16 = 0x7FF;

const FUNCTION_MASK: u16 = 0x780;
const NODE_MASK: u16 = 0x07F;

/// Frame payload capacity.
pub const FRAME_CAPACITY: usize = 8;

const_assert_eq!(FRAME_CAPACITY, CAN_MAX_DLC);

/// Classic CAN 2.0A frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    cob_id: u16,
    rtr: bool,
    data: Vec<u8, FRAME_CAPACITY>,
    timestamp: Option<Duration>,
}

impl CanFrame {
    /// Build a data frame.
    ///
    /// # Errors
    /// `MalformedFrame` if the identifier exceeds 11 bits or the payload
    /// exceeds 8 bytes.
    pub fn new(cob_id: u16, data: &[u8]) -> CanopenResult<Self> {
        if cob_id > MAX_COB_ID {
            return Err(CanopenError::MalformedFrame {
                cob_id,
                reason: "identifier exceeds 11 bits",
            });
        }
        let data = Vec::from_slice(data).map_err(|_| CanopenError::MalformedFrame {
            cob_id,
            reason: "payload exceeds 8 bytes",
        })?;
        Ok(Self {
            cob_id,
            rtr: false,
            data,
            timestamp: None,
        })
    }

    /// Build a remote transmission request.
    pub fn remote(cob_id: u16) -> Self {
        Self {
            cob_id: cob_id & MAX_COB_ID,
            rtr: true,
            data: Vec::new(),
            timestamp: None,
        }
    }

    /// Build a data frame from a fixed-size payload known to fit.
    pub(crate) fn fixed<const N: usize>(cob_id: u16, bytes: [u8; N]) -> Self {
        debug_assert!(N <= FRAME_CAPACITY);
        let mut data = Vec::new();
        for byte in bytes.into_iter().take(FRAME_CAPACITY) {
            let _ = data.push(byte);
        }
        Self {
            cob_id: cob_id & MAX_COB_ID,
            rtr: false,
            data,
            timestamp: None,
        }
    }

    /// Attach a receive timestamp (monotonic, transport-relative).
    pub fn with_timestamp(mut self, timestamp: Duration) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// 11-bit identifier.
    #[inline]
    pub fn cob_id(&self) -> u16 {
        self.cob_id
    }

    /// True for remote transmission requests.
    #[inline]
    pub fn is_remote(&self) -> bool {
        self.rtr
    }

    /// Payload bytes.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Payload length.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if the payload is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Receive timestamp, if the transport provides one.
    #[inline]
    pub fn timestamp(&self) -> Option<Duration> {
        self.timestamp
    }

    /// Function class of this frame's identifier.
    pub fn class(&self) -> FrameClass {
        classify(self.cob_id)
    }
}

/// Message class derived from a COB-ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    /// NMT command.
    Nmt,
    /// SYNC broadcast.
    Sync,
    /// Emergency message from a node.
    Emergency(NodeId),
    /// Transmit PDO 1 from a node.
    Tpdo1(NodeId),
    /// Receive PDO 1 to a node.
    Rpdo1(NodeId),
    /// SDO response from a node.
    SdoResponse(NodeId),
    /// SDO request to a node.
    SdoRequest(NodeId),
    /// Node guarding probe, reply or boot-up.
    NodeGuard(NodeId),
    /// Anything else (other PDOs, LSS, time stamp, ...).
    Unknown,
}

/// Classify an identifier by its function code and node bits.
pub fn classify(cob_id: u16) -> FrameClass {
    let node = (cob_id & NODE_MASK) as NodeId;
    match (cob_id & FUNCTION_MASK, node) {
        (COB_NMT, 0) => FrameClass::Nmt,
        (COB_SYNC, 0) => FrameClass::Sync,
        (COB_EMCY_BASE, n) => FrameClass::Emergency(n),
        (COB_TPDO1_BASE, n) if n != 0 => FrameClass::Tpdo1(n),
        (COB_RPDO1_BASE, n) if n != 0 => FrameClass::Rpdo1(n),
        (COB_SDO_RESPONSE_BASE, n) if n != 0 => FrameClass::SdoResponse(n),
        (COB_SDO_REQUEST_BASE, n) if n != 0 => FrameClass::SdoRequest(n),
        (COB_NODEGUARD_BASE, n) if n != 0 => FrameClass::NodeGuard(n),
        _ => FrameClass::Unknown,
    }
}

#[inline]
fn node_cob(base: u16, node: NodeId) -> u16 {
    base + (node.min(MAX_NODE_ID) as u16)
}

/// COB-ID of a node's emergency messages.
pub fn emcy_cob_id(node: NodeId) -> u16 {
    node_cob(COB_EMCY_BASE, node)
}

/// COB-ID of a node's TPDO1.
pub fn tpdo1_cob_id(node: NodeId) -> u16 {
    node_cob(COB_TPDO1_BASE, node)
}

/// COB-ID of a node's RPDO1.
pub fn rpdo1_cob_id(node: NodeId) -> u16 {
    node_cob(COB_RPDO1_BASE, node)
}

/// COB-ID of a node's SDO responses.
pub fn sdo_response_cob_id(node: NodeId) -> u16 {
    node_cob(COB_SDO_RESPONSE_BASE, node)
}

/// COB-ID of SDO requests to a node.
pub fn sdo_request_cob_id(node: NodeId) -> u16 {
    node_cob(COB_SDO_REQUEST_BASE, node)
}

/// COB-ID of a node's guarding / boot-up messages.
pub fn nodeguard_cob_id(node: NodeId) -> u16 {
    node_cob(COB_NODEGUARD_BASE, node)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_oversized_frames() {
        assert!(CanFrame::new(0x800, &[]).is_err());
        assert!(CanFrame::new(0x181, &[0; 9]).is_err());

        let frame = CanFrame::new(0x181, &[1, 2, 3]).unwrap();
        assert_eq!(frame.data(), &[1, 2, 3]);
        assert!(!frame.is_remote());
        assert_eq!(frame.timestamp(), None);
    }

    #[test]
    fn remote_frames_have_no_payload() {
        let frame = CanFrame::remote(nodeguard_cob_id(5));
        assert_eq!(frame.cob_id(), 0x705);
        assert!(frame.is_remote());
        assert!(frame.is_empty());
    }

    #[test]
    fn classify_predefined_connection_set() {
        assert_eq!(classify(0x000), FrameClass::Nmt);
        assert_eq!(classify(0x080), FrameClass::Sync);
        assert_eq!(classify(0x083), FrameClass::Emergency(3));
        assert_eq!(classify(0x183), FrameClass::Tpdo1(3));
        assert_eq!(classify(0x203), FrameClass::Rpdo1(3));
        assert_eq!(classify(0x583), FrameClass::SdoResponse(3));
        assert_eq!(classify(0x603), FrameClass::SdoRequest(3));
        assert_eq!(classify(0x77F), FrameClass::NodeGuard(127));
    }

    #[test]
    fn classify_unknown_functions() {
        // TPDO2, RPDO2, time stamp, node-less service ids
        for cob_id in [0x283, 0x303, 0x100, 0x180, 0x700, 0x7E5] {
            assert_eq!(classify(cob_id), FrameClass::Unknown, "{cob_id:#x}");
        }
    }

    #[test]
    fn node_cob_ids() {
        assert_eq!(emcy_cob_id(1), 0x081);
        assert_eq!(tpdo1_cob_id(12), 0x18C);
        assert_eq!(rpdo1_cob_id(12), 0x20C);
        assert_eq!(sdo_response_cob_id(12), 0x58C);
        assert_eq!(sdo_request_cob_id(12), 0x60C);
    }
}
