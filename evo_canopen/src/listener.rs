//! Receive loop: classify every incoming frame and route it to its
//! protocol handler.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use evo_common::canopen::consts::LISTENER_RECEIVE_TIMEOUT_MS;
use evo_common::canopen::state::NodeId;

use crate::bus::Bus;
use crate::codec::decode_emcy;
use crate::diagnostics::{Counter, Diagnostics};
use crate::error::{CanopenError, CanopenResult};
use crate::frame::{CanFrame, FrameClass};
use crate::nodeguard;
use crate::pdo::{self, PdoHandlerTable};
use crate::registry::{Device, DeviceRegistry};
use crate::sdo::{self, SdoHandlerTable};

const RECEIVE_TIMEOUT: Duration = Duration::from_millis(LISTENER_RECEIVE_TIMEOUT_MS);

/// Routing tables for incoming frames. Built once before the loops start.
pub struct Dispatcher {
    registry: Arc<DeviceRegistry>,
    sdo_handlers: SdoHandlerTable,
    pdo_handlers: PdoHandlerTable,
    diagnostics: Arc<Diagnostics>,
}

impl Dispatcher {
    /// Dispatcher with one TPDO1 handler per registered device.
    pub fn new(registry: Arc<DeviceRegistry>, sdo_handlers: SdoHandlerTable, diagnostics: Arc<Diagnostics>) -> Self {
        let pdo_handlers = PdoHandlerTable::for_registry(&registry);
        Self {
            registry,
            sdo_handlers,
            pdo_handlers,
            diagnostics,
        }
    }

    /// Apply one frame.
    ///
    /// # Errors
    /// `UnrecognizedMessage` for frames no handler accepts, `MalformedFrame`
    /// for payloads that do not decode. Device state is untouched in both
    /// cases.
    pub fn dispatch(&self, frame: &CanFrame) -> CanopenResult<()> {
        let cob_id = frame.cob_id();
        match frame.class() {
            FrameClass::SdoResponse(node) => {
                let device = self.known(node, cob_id)?;
                sdo::handle_response(&self.sdo_handlers, device, frame, &self.diagnostics)
            }
            FrameClass::Tpdo1(_) => pdo::handle_pdo(&self.pdo_handlers, &self.registry, frame, &self.diagnostics),
            FrameClass::NodeGuard(node) if !frame.is_remote() => {
                let device = self.known(node, cob_id)?;
                nodeguard::handle_reply(device, frame, Instant::now(), &self.diagnostics)
            }
            FrameClass::Emergency(node) => {
                let device = self.known(node, cob_id)?;
                let emcy = decode_emcy(frame)?;
                self.diagnostics.record(Counter::Emergencies);
                warn!(
                    "Node {}: emergency {:#06x} (error register {:#04x})",
                    node, emcy.error_code, emcy.error_register
                );
                device.update(|s| s.last_emergency = Some(emcy.error_code));
                Ok(())
            }
            _ => Err(CanopenError::UnrecognizedMessage { cob_id }),
        }
    }

    /// Dispatch, counting and logging rejected frames instead of failing.
    pub fn dispatch_logged(&self, frame: &CanFrame) {
        match self.dispatch(frame) {
            Ok(()) => {}
            Err(CanopenError::UnrecognizedMessage { cob_id }) => {
                self.diagnostics.record(Counter::UnrecognizedFrames);
                trace!("Unrecognized frame {:#05x} ({} bytes), dropped", cob_id, frame.len());
            }
            Err(e @ CanopenError::MalformedFrame { .. }) => {
                self.diagnostics.record(Counter::MalformedFrames);
                debug!("{}", e);
            }
            Err(e) => debug!("Frame {:#05x} dropped: {}", frame.cob_id(), e),
        }
    }

    fn known(&self, node: NodeId, cob_id: u16) -> CanopenResult<&Arc<Device>> {
        self.registry
            .device(node)
            .map_err(|_| CanopenError::UnrecognizedMessage { cob_id })
    }
}

/// Receive until `running` is cleared.
///
/// # Errors
/// Transport receive failures end the loop and are returned.
pub fn run(bus: &Bus, dispatcher: &Dispatcher, running: &AtomicBool) -> CanopenResult<()> {
    info!("Listener started on '{}'", bus.name());
    while running.load(Ordering::SeqCst) {
        if let Some(frame) = bus.receive(RECEIVE_TIMEOUT)? {
            dispatcher.dispatch_logged(&frame);
        }
    }
    info!("Listener stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{SdoValue, encode_emcy, encode_guard_reply, encode_sdo_upload, encode_tpdo1, od};
    use crate::codec::Emergency;
    use evo_common::canopen::config::NetworkConfig;
    use evo_common::canopen::state::{MotorState, NmtState};
    use evo_common::config::ConfigLoader;

    fn dispatcher() -> (Dispatcher, Arc<DeviceRegistry>, Arc<Diagnostics>) {
        let config = NetworkConfig::parse(
            "[shared]\nservice_name = \"t\"\n\n[[nodes]]\nid = 5\nname = \"elbow\"\n",
        )
        .unwrap();
        let registry = Arc::new(DeviceRegistry::from_config(&config).unwrap());
        let diagnostics = Arc::new(Diagnostics::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry), SdoHandlerTable::new(), Arc::clone(&diagnostics));
        (dispatcher, registry, diagnostics)
    }

    #[test]
    fn routes_by_frame_class() {
        let (dispatcher, registry, diagnostics) = dispatcher();
        let device = registry.device(5).unwrap();

        dispatcher
            .dispatch(&encode_sdo_upload(5, od::STATUSWORD, SdoValue::U16(0x0021)))
            .unwrap();
        assert_eq!(device.motor_state(), MotorState::ReadyToSwitchOn);

        dispatcher.dispatch(&encode_tpdo1(5, 0x0237, 1000)).unwrap();
        assert_eq!(device.snapshot().feedback_count, 1);

        dispatcher
            .dispatch(&encode_guard_reply(5, false, NmtState::Stopped))
            .unwrap();
        assert_eq!(device.nmt_state(), NmtState::Stopped);

        let emcy = Emergency {
            error_code: 0x2310,
            error_register: 0x03,
            vendor: [0; 5],
        };
        dispatcher.dispatch(&encode_emcy(5, &emcy)).unwrap();
        assert_eq!(device.snapshot().last_emergency, Some(0x2310));
        assert_eq!(diagnostics.snapshot().emergencies, 1);
    }

    #[test]
    fn unrecognized_frames_are_counted_not_applied() {
        let (dispatcher, registry, diagnostics) = dispatcher();
        let before = registry.device(5).unwrap().snapshot();

        for cob_id in [0x3A5u16, 0x586, 0x705, 0x000, 0x605] {
            dispatcher.dispatch_logged(&CanFrame::new(cob_id, &[0x4B, 0x41, 0x60, 0x00, 0x37, 0x02]).unwrap());
        }
        dispatcher.dispatch_logged(&encode_tpdo1(6, 0x0237, 1));

        let after = registry.device(5).unwrap().snapshot();
        assert_eq!(after.status_updates, before.status_updates);
        assert_eq!(after.nmt_state, before.nmt_state);
        assert_eq!(after.feedback_count, 0);
        // 0x705 with 6 bytes is a malformed guard reply from a known node
        assert_eq!(diagnostics.snapshot().malformed_frames, 1);
        assert_eq!(diagnostics.snapshot().unrecognized_frames, 5);
    }

    #[test]
    fn loop_exits_when_flag_cleared() {
        use crate::transport::virtual_bus::VirtualBus;
        let (dispatcher, _, diagnostics) = dispatcher();
        let bus = Bus::new(Arc::new(VirtualBus::new()), diagnostics);
        let running = AtomicBool::new(false);
        run(&bus, &dispatcher, &running).unwrap();
    }
}
