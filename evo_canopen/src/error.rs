//! Error types for the CANopen engine.

use evo_common::canopen::state::NodeId;
use evo_common::config::ConfigError;
use thiserror::Error;

/// Failures of the underlying CAN transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Driver unknown or device could not be opened.
    #[error("Failed to open transport '{driver}': {reason}")]
    Open {
        /// Driver name
        driver: String,
        /// Failure description
        reason: String,
    },

    /// Frame could not be transmitted.
    #[error("CAN send failed: {0}")]
    Send(String),

    /// Receive path failed.
    #[error("CAN receive failed: {0}")]
    Receive(String),

    /// Transport was closed.
    #[error("CAN transport closed")]
    Closed,
}

/// Error type for all CANopen engine operations.
#[derive(Debug, Clone, Error)]
pub enum CanopenError {
    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A confirmation did not arrive in time.
    #[error("Node {node}: {operation} not confirmed within {timeout_ms}ms")]
    ProtocolTimeout {
        /// Node waited on
        node: NodeId,
        /// What was being waited for
        operation: String,
        /// Timeout that expired
        timeout_ms: u64,
    },

    /// No transition path exists between the two states.
    #[error("Node {node}: no transition from {from} to {to}")]
    UnreachableTransition {
        /// Target node
        node: NodeId,
        /// Recorded state
        from: String,
        /// Requested state
        to: String,
    },

    /// Frame does not belong to any handled message class.
    #[error("Unrecognized message on COB-ID {cob_id:#05x}")]
    UnrecognizedMessage {
        /// COB-ID of the frame
        cob_id: u16,
    },

    /// Frame shape does not match its message class.
    #[error("Malformed frame on COB-ID {cob_id:#05x}: {reason}")]
    MalformedFrame {
        /// COB-ID of the frame
        cob_id: u16,
        /// Shape violation
        reason: &'static str,
    },

    /// Node id not registered.
    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    /// Group name not registered.
    #[error("Unknown group: {0}")]
    UnknownGroup(String),

    /// Bulk value slice length differs from the group size.
    #[error("Group '{group}' has {expected} members, got {actual} values")]
    GroupSizeMismatch {
        /// Group name
        group: String,
        /// Group size
        expected: usize,
        /// Supplied length
        actual: usize,
    },

    /// Position or velocity input is NaN or infinite.
    #[error("Node {node}: non-finite {field}")]
    NonFinite {
        /// Target node
        node: NodeId,
        /// Rejected field
        field: &'static str,
    },

    /// Drive reported a homing error (status word bit 13).
    #[error("Node {0}: homing error reported by drive")]
    HomingFailed(NodeId),

    /// Configuration loading or validation failed.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Operation needs the engine loops, which are not running.
    #[error("CANopen engine is not running")]
    NotRunning,

    /// `start()` called twice.
    #[error("CANopen engine is already running")]
    AlreadyRunning,

    /// A loop thread could not be spawned or panicked.
    #[error("Loop '{0}' failed to run")]
    LoopPanicked(&'static str),
}

/// Result alias for engine operations.
pub type CanopenResult<T> = Result<T, CanopenError>;
