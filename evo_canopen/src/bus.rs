//! Serialized access to the transport.
//!
//! Senders (scheduler, supervisor, caller threads) share one `Bus`; frames
//! leave in the order their `send` calls acquire the lock. The listener is
//! the only receiver.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

use crate::diagnostics::{Counter, Diagnostics};
use crate::error::CanopenResult;
use crate::frame::CanFrame;
use crate::transport::CanTransport;

/// Send access held under [`Bus::with_locked`].
pub struct BusTx<'a> {
    bus: &'a Bus,
}

impl BusTx<'_> {
    /// Transmit one frame.
    pub fn send(&self, frame: &CanFrame) -> CanopenResult<()> {
        self.bus.transmit(frame)
    }
}

/// Shared handle to an open transport.
pub struct Bus {
    transport: Arc<dyn CanTransport>,
    send_lock: Mutex<()>,
    diagnostics: Arc<Diagnostics>,
}

impl Bus {
    /// Wrap an open transport.
    pub fn new(transport: Arc<dyn CanTransport>, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            transport,
            send_lock: Mutex::new(()),
            diagnostics,
        }
    }

    /// Transport driver name.
    pub fn name(&self) -> &str {
        self.transport.name()
    }

    /// Transmit one frame.
    pub fn send(&self, frame: &CanFrame) -> CanopenResult<()> {
        let _guard = self.send_lock.lock();
        self.transmit(frame)
    }

    /// Run `f` with the send lock held. Frames sent through the handle
    /// leave back to back, and `f` may act on each result before the
    /// next frame goes out.
    pub fn with_locked<R>(&self, f: impl FnOnce(&BusTx<'_>) -> R) -> R {
        let _guard = self.send_lock.lock();
        f(&BusTx { bus: self })
    }

    fn transmit(&self, frame: &CanFrame) -> CanopenResult<()> {
        match self.transport.send(frame) {
            Ok(()) => {
                self.diagnostics.record(Counter::FramesSent);
                trace!("TX {:#05x} {:02x?}", frame.cob_id(), frame.data());
                Ok(())
            }
            Err(e) => {
                self.diagnostics.record(Counter::SendErrors);
                warn!("TX {:#05x} failed: {}", frame.cob_id(), e);
                Err(e.into())
            }
        }
    }

    /// Wait up to `timeout` for one frame.
    pub fn receive(&self, timeout: Duration) -> CanopenResult<Option<CanFrame>> {
        let frame = self.transport.receive(timeout)?;
        if let Some(frame) = &frame {
            self.diagnostics.record(Counter::FramesReceived);
            trace!("RX {:#05x} {:02x?}", frame.cob_id(), frame.data());
        }
        Ok(frame)
    }
}
