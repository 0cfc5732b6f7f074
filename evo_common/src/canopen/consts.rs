//! CANopen engine constants.
//!
//! Defaults used by `NetworkConfig` when a field is omitted, and the limits
//! enforced by its validation.

/// Canonical service name (used for logging).
pub const CANOPEN_SERVICE_NAME: &str = "canopen";

/// Highest valid node id. Node id 0 addresses all nodes in NMT commands.
pub const MAX_NODE_ID: u8 = 127;

/// Maximum number of nodes on one bus.
pub const MAX_NODES: usize = MAX_NODE_ID as usize;

/// Default SYNC / setpoint interval in milliseconds.
pub const DEFAULT_SYNC_INTERVAL_MS: u64 = 10;

/// Default per-probe guard time in milliseconds.
pub const DEFAULT_GUARD_TIME_MS: u64 = 500;

/// Default life-time factor multiplier applied per registered node.
pub const DEFAULT_LIFE_TIME_FACTOR_PER_NODE: u8 = 2;

/// Default wait for a motor state confirmation in milliseconds.
pub const DEFAULT_TRANSITION_TIMEOUT_MS: u64 = 2000;

/// Default status word polling period while waiting for a confirmation.
pub const DEFAULT_STATUS_POLL_INTERVAL_MS: u64 = 10;

/// Default wait for the homing procedure to finish in milliseconds.
pub const DEFAULT_HOMING_TIMEOUT_MS: u64 = 30_000;

/// Default wait after a communication reset before a node is started.
pub const DEFAULT_BOOT_WAIT_MS: u64 = 200;

/// Receive timeout of the listener loop, bounds shutdown latency.
pub const LISTENER_RECEIVE_TIMEOUT_MS: u64 = 50;

/// SCHED_FIFO priority requested by the SYNC scheduler in `rt` builds.
pub const SCHEDULER_RT_PRIORITY: i32 = 80;

/// Default transport driver.
pub const DEFAULT_DRIVER: &str = "virtual";

/// Default bus device identifier.
pub const DEFAULT_DEVICE: &str = "can0";

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/evo/canopen.toml";
