//! CAN transport capability and driver registry.
//!
//! A transport moves raw frames; everything protocol-related lives above
//! it. Drivers are registered by name in a [`TransportRegistry`] and opened
//! from the network configuration. The registry is constructed at startup
//! and passed to `CanopenCore::open`. No global state.

pub mod virtual_bus;

use evo_common::canopen::config::NetworkConfig;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::TransportError;
use crate::frame::CanFrame;

/// Raw CAN frame transport.
///
/// `send` may be called from several threads; the engine serializes it
/// through `Bus`. `receive` is only called by the listener thread.
pub trait CanTransport: Send + Sync {
    /// Driver name (e.g. "virtual").
    fn name(&self) -> &str;

    /// Transmit one frame.
    fn send(&self, frame: &CanFrame) -> Result<(), TransportError>;

    /// Wait up to `timeout` for one frame. `Ok(None)` on timeout.
    fn receive(&self, timeout: Duration) -> Result<Option<CanFrame>, TransportError>;
}

/// Factory function type for opening a transport.
pub type TransportFactory = fn(&NetworkConfig) -> Result<Arc<dyn CanTransport>, TransportError>;

/// Registry of available transport drivers.
pub struct TransportRegistry {
    factories: HashMap<&'static str, TransportFactory>,
}

impl TransportRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with every built-in driver.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(virtual_bus::DRIVER_NAME, virtual_bus::open);
        registry
    }

    /// Register a transport factory.
    ///
    /// # Panics
    /// Panics if a driver with the same name is already registered.
    pub fn register(&mut self, name: &'static str, factory: TransportFactory) {
        if self.factories.contains_key(name) {
            panic!("Transport '{name}' is already registered");
        }
        self.factories.insert(name, factory);
    }

    /// Get a transport factory by name.
    pub fn get_factory(&self, name: &str) -> Option<TransportFactory> {
        self.factories.get(name).copied()
    }

    /// Open a transport by driver name.
    ///
    /// # Errors
    /// `TransportError::Open` if the driver is unknown or fails to open.
    pub fn open(&self, name: &str, config: &NetworkConfig) -> Result<Arc<dyn CanTransport>, TransportError> {
        let factory = self.get_factory(name).ok_or_else(|| TransportError::Open {
            driver: name.to_string(),
            reason: format!("unknown driver (available: {:?})", self.list_drivers()),
        })?;
        factory(config)
    }

    /// List all registered driver names, sorted.
    pub fn list_drivers(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}
