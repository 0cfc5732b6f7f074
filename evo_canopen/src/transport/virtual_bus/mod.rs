//! In-process simulated CAN bus.
//!
//! Every frame sent by the master is delivered synchronously to all
//! simulated nodes; their responses are timestamped and queued for
//! `receive`. Used by the `--simulate` mode of the binary and by tests,
//! which can inspect transmitted frames and inject faults.

mod node;

pub use node::{NodeBehavior, VirtualNode};

use evo_common::canopen::config::NetworkConfig;
use evo_common::canopen::state::{MotorState, NmtState, NodeId};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::codec::{SdoData, SdoKey};
use crate::error::TransportError;
use crate::frame::CanFrame;
use crate::transport::CanTransport;

/// Registered driver name.
pub const DRIVER_NAME: &str = "virtual";

/// Number of transmitted frames kept for inspection.
const SENT_LOG_CAPACITY: usize = 16_384;

#[derive(Default)]
struct BusState {
    nodes: BTreeMap<NodeId, VirtualNode>,
    inbox: VecDeque<CanFrame>,
    sent: VecDeque<CanFrame>,
    closed: bool,
    fail_sends: bool,
}

/// Simulated bus with attached drive nodes.
pub struct VirtualBus {
    state: Mutex<BusState>,
    ready: Condvar,
    epoch: Instant,
}

impl VirtualBus {
    /// Empty bus.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            ready: Condvar::new(),
            epoch: Instant::now(),
        }
    }

    /// Bus with one simulated node per id.
    pub fn with_nodes(ids: impl IntoIterator<Item = NodeId>) -> Self {
        let bus = Self::new();
        for id in ids {
            bus.add_node(id);
        }
        bus
    }

    /// Attach a freshly booted node.
    pub fn add_node(&self, id: NodeId) {
        self.state.lock().nodes.insert(id, VirtualNode::new(id));
    }

    /// Replace a node's fault injection settings.
    pub fn set_behavior(&self, id: NodeId, behavior: NodeBehavior) {
        if let Some(node) = self.state.lock().nodes.get_mut(&id) {
            node.set_behavior(behavior);
        }
    }

    /// Make a node stop (or resume) answering.
    pub fn set_silent(&self, id: NodeId, silent: bool) {
        if let Some(node) = self.state.lock().nodes.get_mut(&id) {
            let behavior = NodeBehavior {
                silent,
                ..node.behavior()
            };
            node.set_behavior(behavior);
        }
    }

    /// Freeze a node's drive state machine while it is in `state`.
    pub fn set_stuck_in(&self, id: NodeId, state: Option<MotorState>) {
        if let Some(node) = self.state.lock().nodes.get_mut(&id) {
            let behavior = NodeBehavior {
                stuck_in: state,
                ..node.behavior()
            };
            node.set_behavior(behavior);
        }
    }

    /// Drive state of a simulated node.
    pub fn node_drive_state(&self, id: NodeId) -> Option<MotorState> {
        self.state.lock().nodes.get(&id).map(|n| n.drive_state())
    }

    /// NMT state of a simulated node.
    pub fn node_nmt_state(&self, id: NodeId) -> Option<NmtState> {
        self.state.lock().nodes.get(&id).map(|n| n.nmt_state())
    }

    /// Actual position of a simulated node (milli-degrees).
    pub fn node_position_mdeg(&self, id: NodeId) -> Option<i32> {
        self.state.lock().nodes.get(&id).map(|n| n.position_mdeg())
    }

    /// Move a simulated node (e.g. to emulate an external disturbance).
    pub fn set_node_position_mdeg(&self, id: NodeId, position_mdeg: i32) {
        if let Some(node) = self.state.lock().nodes.get_mut(&id) {
            node.set_position_mdeg(position_mdeg);
        }
    }

    /// Object value last written to a simulated node.
    pub fn node_object(&self, id: NodeId, key: SdoKey) -> Option<SdoData> {
        self.state.lock().nodes.get(&id).and_then(|n| n.object(key))
    }

    /// Put a node into Fault and queue its emergency message.
    pub fn raise_fault(&self, id: NodeId, error_code: u16) {
        let mut state = self.state.lock();
        let emcy = state.nodes.get_mut(&id).and_then(|n| n.raise_fault(error_code));
        if let Some(frame) = emcy {
            state.inbox.push_back(frame.with_timestamp(self.epoch.elapsed()));
            self.ready.notify_all();
        }
    }

    /// Queue a foreign frame for the receiver.
    pub fn inject(&self, frame: CanFrame) {
        let frame = match frame.timestamp() {
            Some(_) => frame,
            None => frame.with_timestamp(self.epoch.elapsed()),
        };
        self.state.lock().inbox.push_back(frame);
        self.ready.notify_all();
    }

    /// Frames transmitted by the master, oldest first.
    pub fn sent_frames(&self) -> Vec<CanFrame> {
        self.state.lock().sent.iter().cloned().collect()
    }

    /// Forget transmitted frames.
    pub fn clear_sent(&self) {
        self.state.lock().sent.clear();
    }

    /// Make every following send fail.
    pub fn set_fail_sends(&self, fail: bool) {
        self.state.lock().fail_sends = fail;
    }

    /// Close the bus; pending and future receives fail with `Closed`.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
        info!("Virtual bus closed");
    }
}

impl Default for VirtualBus {
    fn default() -> Self {
        Self::new()
    }
}

impl CanTransport for VirtualBus {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn send(&self, frame: &CanFrame) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if state.fail_sends {
            return Err(TransportError::Send("virtual bus send failure injected".to_string()));
        }

        if state.sent.len() == SENT_LOG_CAPACITY {
            state.sent.pop_front();
        }
        state.sent.push_back(frame.clone());

        let mut responses = Vec::new();
        for node in state.nodes.values_mut() {
            node.on_frame(frame, &mut responses);
        }
        if !responses.is_empty() {
            let stamp = self.epoch.elapsed();
            state
                .inbox
                .extend(responses.into_iter().map(|r| r.with_timestamp(stamp)));
            self.ready.notify_all();
        }
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Result<Option<CanFrame>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(frame) = state.inbox.pop_front() {
                return Ok(Some(frame));
            }
            if state.closed {
                return Err(TransportError::Closed);
            }
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                return Ok(state.inbox.pop_front());
            }
        }
    }
}

/// Transport factory: one simulated node per configured node.
pub fn open(config: &NetworkConfig) -> Result<Arc<dyn CanTransport>, TransportError> {
    let bus = VirtualBus::with_nodes(config.nodes.iter().map(|n| n.id));
    debug!("Virtual bus opened with {} nodes", config.nodes.len());
    Ok(Arc::new(bus))
}
