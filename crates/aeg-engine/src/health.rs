//! Turns per-cycle poll outcomes into derived [`DeviceHealth`] snapshots and
//! publishes them to the health stream.

use std::sync::Arc;
use std::time::Duration;

use acq_common::{update_latency_ms, DeviceHealth, DeviceStatus, Ewma};
use chrono::{DateTime, Utc};
use tracing::info;

use crate::bus::HealthBus;

/// What one poll cycle produced, handed to the tracker by the device worker.
#[derive(Debug, Clone, Default)]
pub struct PollOutcome {
    /// Channels that read successfully this cycle.
    pub successes: u32,
    /// Channels that failed this cycle.
    pub failures: u32,
    /// Wall-clock time spent on the cycle.
    pub duration: Duration,
    /// Whether the cycle ran past its scheduled deadline.
    pub overran: bool,
    /// Whether the transport reported itself disconnected this cycle.
    pub disconnected: bool,
    /// Error messages from any failed channel, most recent last.
    pub errors: Vec<String>,
}

/// Derives [`DeviceHealth`] from a stream of [`PollOutcome`]s and publishes
/// snapshots to a shared [`HealthBus`].
pub struct HealthTracker {
    bus: Arc<HealthBus>,
}

impl HealthTracker {
    /// Build a tracker publishing through the given bus.
    #[must_use]
    pub fn new(bus: Arc<HealthBus>) -> Self {
        Self { bus }
    }

    /// The bus this tracker publishes through, for subscribers and snapshot queries.
    #[must_use]
    pub fn bus(&self) -> &Arc<HealthBus> {
        &self.bus
    }

    /// Publish the initial record for a newly added device. If a snapshot
    /// already exists for `device_id` (a worker restarting under the same
    /// id, as `update_device` does), its running counters are carried over
    /// rather than reset to zero; only status and connectivity reset.
    pub fn record_initial(&self, device_id: &str, now: DateTime<Utc>) {
        let snapshot = match self.bus.get(device_id) {
            Some(previous) => previous.reinitialized(now),
            None => DeviceHealth::unknown(device_id, now),
        };
        self.bus.publish(snapshot);
    }

    /// Publish a terminal `offline` record for a device being torn down.
    /// Does not remove the device from the latest-known map; call
    /// [`HealthTracker::forget`] once the terminal snapshot has been
    /// observed by whoever needs it.
    pub fn record_terminal(&self, device_id: &str, now: DateTime<Utc>) {
        let previous = self
            .bus
            .get(device_id)
            .unwrap_or_else(|| DeviceHealth::unknown(device_id, now));
        self.bus.publish(previous.terminal_offline(now));
    }

    /// Drop a device from the latest-known snapshot map.
    pub fn forget(&self, device_id: &str) {
        self.bus.remove(device_id);
    }

    /// Fold one cycle's outcome into the device's running health record and
    /// publish the resulting snapshot.
    #[allow(clippy::too_many_arguments)]
    pub fn record_outcome(
        &self,
        device_id: &str,
        max_consecutive_failures: u32,
        outcome: &PollOutcome,
        now: DateTime<Utc>,
        latency_ewma: &mut Ewma,
        protocol_template_in_use: Option<String>,
        is_connected: bool,
    ) -> DeviceHealth {
        let previous = self
            .bus
            .get(device_id)
            .unwrap_or_else(|| DeviceHealth::unknown(device_id, now));

        let any_success = outcome.successes > 0;
        let total_reads = previous.total_reads + 1;
        let successful_reads = previous.successful_reads + u64::from(any_success);
        let consecutive_failures = if any_success {
            0
        } else {
            previous.consecutive_failures + 1
        };
        let last_successful_read_at = if any_success {
            Some(now)
        } else {
            previous.last_successful_read_at
        };
        let average_latency_ms = update_latency_ms(latency_ewma, outcome.duration);
        let last_error = outcome
            .errors
            .last()
            .cloned()
            .or_else(|| previous.last_error.clone());

        let status = if outcome.disconnected {
            DeviceStatus::Offline
        } else if consecutive_failures >= max_consecutive_failures {
            DeviceStatus::Offline
        } else if outcome.failures > 0 || outcome.overran {
            DeviceStatus::Warning
        } else {
            DeviceStatus::Online
        };

        if status != previous.status {
            info!(device_id, from = %previous.status, to = %status, "device status changed");
        }

        let snapshot = DeviceHealth {
            device_id: device_id.to_string(),
            status,
            total_reads,
            successful_reads,
            consecutive_failures,
            last_successful_read_at,
            average_latency_ms,
            last_error,
            protocol_template_in_use,
            is_connected,
            updated_at: now,
        };

        self.bus.publish(snapshot.clone());
        snapshot
    }
}
