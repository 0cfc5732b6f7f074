//! CANopen network configuration.
//!
//! Loaded from a single TOML file through [`ConfigLoader`](crate::config::ConfigLoader):
//!
//! ```toml
//! [shared]
//! service_name = "evo-canopen"
//!
//! [bus]
//! driver = "virtual"
//! device = "can0"
//! sync_interval_ms = 10
//!
//! [supervision]
//! guard_time_ms = 500
//!
//! [[nodes]]
//! id = 12
//! name = "shoulder"
//! group = "arm"
//! ```

use crate::canopen::consts::*;
use crate::canopen::state::NodeId;
use crate::config::{ConfigError, ConfigLoader, SharedConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

fn default_driver() -> String {
    DEFAULT_DRIVER.to_string()
}

fn default_device() -> String {
    DEFAULT_DEVICE.to_string()
}

fn default_sync_interval_ms() -> u64 {
    DEFAULT_SYNC_INTERVAL_MS
}

fn default_boot_wait_ms() -> u64 {
    DEFAULT_BOOT_WAIT_MS
}

fn default_guard_time_ms() -> u64 {
    DEFAULT_GUARD_TIME_MS
}

fn default_transition_timeout_ms() -> u64 {
    DEFAULT_TRANSITION_TIMEOUT_MS
}

fn default_status_poll_interval_ms() -> u64 {
    DEFAULT_STATUS_POLL_INTERVAL_MS
}

fn default_homing_timeout_ms() -> u64 {
    DEFAULT_HOMING_TIMEOUT_MS
}

/// Top-level configuration of one CANopen network.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    /// Common service settings.
    #[serde(default)]
    pub shared: SharedConfig,

    /// Transport and SYNC settings.
    #[serde(default)]
    pub bus: BusConfig,

    /// Node guarding settings.
    #[serde(default)]
    pub supervision: SupervisionConfig,

    /// Drive state machine timing.
    #[serde(default)]
    pub motor: MotorConfig,

    /// Nodes on the bus, in registration order.
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

/// Transport and SYNC settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BusConfig {
    /// Transport driver name (e.g. "virtual").
    #[serde(default = "default_driver")]
    pub driver: String,

    /// Device identifier handed to the driver on open.
    #[serde(default = "default_device")]
    pub device: String,

    /// SYNC interval in milliseconds. Fixed for the lifetime of the process.
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,

    /// Wait after a communication reset before nodes are started.
    #[serde(default = "default_boot_wait_ms")]
    pub boot_wait_ms: u64,

    /// CPU core the SYNC scheduler thread is pinned to (`rt` builds only).
    #[serde(default)]
    pub scheduler_cpu: Option<usize>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            driver: default_driver(),
            device: default_device(),
            sync_interval_ms: default_sync_interval_ms(),
            boot_wait_ms: default_boot_wait_ms(),
            scheduler_cpu: None,
        }
    }
}

impl BusConfig {
    /// SYNC interval as a `Duration`.
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    /// Boot wait as a `Duration`.
    pub fn boot_wait(&self) -> Duration {
        Duration::from_millis(self.boot_wait_ms)
    }
}

/// Node guarding settings.
///
/// The liveness tolerance is `guard time × life-time factor`. With the
/// defaults the guard time is `guard_time_ms` and the life-time factor is
/// twice the node count.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisionConfig {
    /// Base guard time per probe round in milliseconds.
    #[serde(default = "default_guard_time_ms")]
    pub guard_time_ms: u64,

    /// Fixed life-time factor. `None` scales it with the node count.
    #[serde(default)]
    pub life_time_factor: Option<u8>,

    /// Multiply the guard time by the node count as well.
    #[serde(default)]
    pub scale_guard_time_by_node_count: bool,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            guard_time_ms: default_guard_time_ms(),
            life_time_factor: None,
            scale_guard_time_by_node_count: false,
        }
    }
}

/// Drive state machine timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MotorConfig {
    /// Maximum wait for one status word confirmation.
    #[serde(default = "default_transition_timeout_ms")]
    pub transition_timeout_ms: u64,

    /// Status word polling period while waiting.
    #[serde(default = "default_status_poll_interval_ms")]
    pub status_poll_interval_ms: u64,

    /// Maximum wait for a homing run.
    #[serde(default = "default_homing_timeout_ms")]
    pub homing_timeout_ms: u64,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            transition_timeout_ms: default_transition_timeout_ms(),
            status_poll_interval_ms: default_status_poll_interval_ms(),
            homing_timeout_ms: default_homing_timeout_ms(),
        }
    }
}

impl MotorConfig {
    /// Transition timeout as a `Duration`.
    pub fn transition_timeout(&self) -> Duration {
        Duration::from_millis(self.transition_timeout_ms)
    }

    /// Poll interval as a `Duration`.
    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }

    /// Homing timeout as a `Duration`.
    pub fn homing_timeout(&self) -> Duration {
        Duration::from_millis(self.homing_timeout_ms)
    }
}

/// One node on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Node id (1..=127).
    pub id: NodeId,

    /// Human-readable name, unique within the network.
    pub name: String,

    /// Group tag. Nodes sharing a tag form a `DeviceGroup`; empty = no group.
    #[serde(default)]
    pub group: String,

    /// Bus identifier. Defaults to `bus.device`.
    #[serde(default)]
    pub bus: Option<String>,
}

impl NetworkConfig {
    /// Load a network configuration file and validate it.
    pub fn load_validated(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the network configuration.
    ///
    /// # Validation Rules
    /// 1. `shared` is valid
    /// 2. `sync_interval_ms`, `guard_time_ms`, `transition_timeout_ms` and
    ///    `status_poll_interval_ms` > 0; `sync_interval_ms` <= 255
    /// 3. Node ids in 1..=127 and unique, at most `MAX_NODES` nodes
    /// 4. Node names non-empty and unique
    /// 5. Effective guard time fits the 16-bit guard time object
    /// 6. Fixed life-time factor, when given, > 0
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;

        if self.bus.sync_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "bus.sync_interval_ms must be greater than 0".to_string(),
            ));
        }
        // Written to the drive as 0x60C2:01 (u8, milliseconds)
        if self.bus.sync_interval_ms > u64::from(u8::MAX) {
            return Err(ConfigError::ValidationError(format!(
                "bus.sync_interval_ms {} exceeds the interpolation period range (max {})",
                self.bus.sync_interval_ms,
                u8::MAX
            )));
        }
        if self.supervision.guard_time_ms == 0 {
            return Err(ConfigError::ValidationError(
                "supervision.guard_time_ms must be greater than 0".to_string(),
            ));
        }
        if self.supervision.life_time_factor == Some(0) {
            return Err(ConfigError::ValidationError(
                "supervision.life_time_factor must be greater than 0".to_string(),
            ));
        }
        if self.motor.transition_timeout_ms == 0 || self.motor.status_poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "motor timeouts must be greater than 0".to_string(),
            ));
        }

        if self.nodes.len() > MAX_NODES {
            return Err(ConfigError::ValidationError(format!(
                "Too many nodes: {} (max {})",
                self.nodes.len(),
                MAX_NODES
            )));
        }

        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        for node in &self.nodes {
            if node.id == 0 || node.id > MAX_NODE_ID {
                return Err(ConfigError::ValidationError(format!(
                    "Node '{}': id {} out of range 1..={}",
                    node.name, node.id, MAX_NODE_ID
                )));
            }
            if node.name.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Node {} has empty name",
                    node.id
                )));
            }
            if !ids.insert(node.id) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate node id: {}",
                    node.id
                )));
            }
            if !names.insert(node.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate node name: {}",
                    node.name
                )));
            }
        }

        if self.effective_guard_time_ms() > u16::MAX as u64 {
            return Err(ConfigError::ValidationError(format!(
                "Effective guard time {}ms exceeds {}ms",
                self.effective_guard_time_ms(),
                u16::MAX
            )));
        }

        Ok(())
    }

    /// Guard time after optional node-count scaling.
    pub fn effective_guard_time_ms(&self) -> u64 {
        if self.supervision.scale_guard_time_by_node_count {
            self.supervision.guard_time_ms * self.nodes.len().max(1) as u64
        } else {
            self.supervision.guard_time_ms
        }
    }

    /// Life-time factor: configured value, or twice the node count.
    pub fn effective_life_time_factor(&self) -> u8 {
        match self.supervision.life_time_factor {
            Some(factor) => factor,
            None => {
                let scaled = self.nodes.len().max(1) * DEFAULT_LIFE_TIME_FACTOR_PER_NODE as usize;
                scaled.min(u8::MAX as usize) as u8
            }
        }
    }

    /// Bus identifier of a node (its own or the network default).
    pub fn node_bus<'a>(&'a self, node: &'a NodeConfig) -> &'a str {
        node.bus.as_deref().unwrap_or(&self.bus.device)
    }

    /// Group tags with their member nodes, in order of first appearance.
    pub fn groups(&self) -> Vec<(String, Vec<&NodeConfig>)> {
        let mut groups: Vec<(String, Vec<&NodeConfig>)> = Vec::new();
        for node in self.nodes.iter().filter(|n| !n.group.is_empty()) {
            match groups.iter_mut().find(|(name, _)| *name == node.group) {
                Some((_, members)) => members.push(node),
                None => groups.push((node.group.clone(), vec![node])),
            }
        }
        groups
    }
}
