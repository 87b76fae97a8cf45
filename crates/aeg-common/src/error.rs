use thiserror::Error;

/// Structured error taxonomy for the acquisition engine.
///
/// Transport and decode failures are recovered locally (retry executor,
/// device worker) and never reach a control-plane caller through this
/// type; see the propagation policy in the crate-level docs.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    /// Pre-start or runtime-mutation configuration validation failed.
    #[error("configuration invalid at {path}: {message}")]
    ConfigurationInvalid {
        /// Dotted field path of the offending value.
        path: String,
        /// Human-readable description.
        message: String,
    },

    /// `add_device` was called with a `device_id` already in the fleet.
    #[error("device already exists: {0}")]
    DuplicateDevice(String),

    /// `remove_device`/`update_device`/`get_device_health` referenced an unknown device.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Transport failed to establish a connection.
    #[error("transport connect failed: {0}")]
    TransportConnectFailed(String),

    /// A transport read did not complete within its timeout.
    #[error("transport read timed out after {0:?}")]
    TransportReadTimeout(std::time::Duration),

    /// A transport read failed for a reason other than timeout.
    #[error("transport read failed: {0}")]
    TransportReadFailed(String),

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    TransportClosedByPeer,

    /// Raw bytes could not be decoded into a typed reading.
    #[error("decode failed: {0}")]
    DecodeFailed(String),

    /// No protocol template in the catalog matched during discovery.
    #[error("no protocol template matched")]
    PatternNoMatch,

    /// The time-series backend could not be reached.
    #[error("tsdb backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The time-series backend rejected a write.
    #[error("tsdb write failed: {0}")]
    BackendWriteFailed(String),

    /// The operation was cancelled cooperatively.
    #[error("operation cancelled")]
    Cancelled,

    /// Programmer error; should never surface in normal operation.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// True if this error represents a cooperative cancellation rather than a fault.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
