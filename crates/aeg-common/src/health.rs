//! The per-device health record and its status lattice.

use chrono::{DateTime, Utc};

/// Coarse-grained device status derived from recent poll outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    /// No poll outcome has been recorded yet.
    #[default]
    Unknown,
    /// Polling normally, no recent failures.
    Online,
    /// Polling, but the last cycle had a failed channel or overran.
    Warning,
    /// Reserved for externally-observed faults; the engine itself only
    /// ever derives `Online`/`Warning`/`Offline` (see `DeviceWorker::status`).
    Error,
    /// `consecutive_failures` reached the configured threshold, or the
    /// device was explicitly torn down.
    Offline,
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Online => "online",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Offline => "offline",
        };
        write!(f, "{s}")
    }
}

/// Immutable snapshot of one device's health, published to the health stream.
///
/// Each mutation produces a fresh snapshot rather than mutating in place,
/// matching the per-device atomic-swap policy described for the health
/// tracker's shared map.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceHealth {
    /// Device identity this snapshot describes.
    pub device_id: String,
    /// Derived status.
    pub status: DeviceStatus,
    /// Total poll cycles attempted.
    pub total_reads: u64,
    /// Poll cycles with at least one successful channel.
    pub successful_reads: u64,
    /// Consecutive cycles where every enabled channel failed.
    pub consecutive_failures: u32,
    /// Timestamp of the most recent fully successful read, if any.
    pub last_successful_read_at: Option<DateTime<Utc>>,
    /// Exponentially weighted moving average of per-cycle latency, in milliseconds.
    pub average_latency_ms: f64,
    /// Message from the most recent failure, if any.
    pub last_error: Option<String>,
    /// Protocol template currently in use (scale devices only).
    pub protocol_template_in_use: Option<String>,
    /// Whether the transport reports itself connected.
    pub is_connected: bool,
    /// Time this snapshot was produced.
    pub updated_at: DateTime<Utc>,
}

impl DeviceHealth {
    /// The initial snapshot for a device that has just been added, before
    /// any poll cycle has run.
    #[must_use]
    pub fn unknown(device_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.into(),
            status: DeviceStatus::Unknown,
            total_reads: 0,
            successful_reads: 0,
            consecutive_failures: 0,
            last_successful_read_at: None,
            average_latency_ms: 0.0,
            last_error: None,
            protocol_template_in_use: None,
            is_connected: false,
            updated_at: now,
        }
    }

    /// Success rate in `[0, 1]`; `0.0` when no reads have been attempted.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total_reads == 0 {
            0.0
        } else {
            self.successful_reads as f64 / self.total_reads as f64
        }
    }

    /// The terminal snapshot emitted when a device is torn down.
    #[must_use]
    pub fn terminal_offline(&self, now: DateTime<Utc>) -> Self {
        Self {
            status: DeviceStatus::Offline,
            is_connected: false,
            updated_at: now,
            ..self.clone()
        }
    }

    /// The snapshot emitted when a worker restarts under an id that already
    /// has a health record (e.g. `update_device` recreating the worker).
    /// Status and connectivity reset to their pre-poll values; the running
    /// counters are preserved.
    #[must_use]
    pub fn reinitialized(&self, now: DateTime<Utc>) -> Self {
        Self {
            status: DeviceStatus::Unknown,
            is_connected: false,
            updated_at: now,
            ..self.clone()
        }
    }
}
