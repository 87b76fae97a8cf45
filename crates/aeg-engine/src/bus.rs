//! Fan-out channels connecting device workers to subscribers (the TSDB
//! writer, the control API's streaming endpoints, and any other listener).

use acq_common::{DeviceHealth, Observation};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Publishes [`Observation`]s to every subscriber. Backed by a broadcast
/// channel: a subscriber that falls behind the configured capacity drops
/// the oldest unread observations rather than blocking the publisher.
#[derive(Debug, Clone)]
pub struct ObservationBus {
    tx: broadcast::Sender<Observation>,
}

impl ObservationBus {
    /// Build a bus with the given per-subscriber queue capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an observation. Never blocks; silently dropped only if there
    /// are no subscribers at all.
    pub fn publish(&self, observation: Observation) {
        let _ = self.tx.send(observation);
    }

    /// Subscribe to the stream of observations from this point forward.
    #[must_use]
    pub fn subscribe(&self) -> BroadcastStream<Observation> {
        BroadcastStream::new(self.tx.subscribe())
    }

    /// Number of currently live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Publishes [`DeviceHealth`] snapshots. Keeps a `device_id -> latest`
/// map alongside the broadcast channel, so a subscriber's view of any
/// device converges on the latest snapshot even if it drops intermediate
/// updates under load ("drop oldest, except the latest known value").
#[derive(Debug, Clone)]
pub struct HealthBus {
    tx: broadcast::Sender<DeviceHealth>,
    latest: DashMap<String, DeviceHealth>,
}

impl HealthBus {
    /// Build a bus with the given per-subscriber queue capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            latest: DashMap::new(),
        }
    }

    /// Publish a health snapshot, updating the latest-known map and
    /// notifying subscribers.
    pub fn publish(&self, health: DeviceHealth) {
        self.latest.insert(health.device_id.clone(), health.clone());
        let _ = self.tx.send(health);
    }

    /// Remove a device from the latest-known map (on teardown).
    pub fn remove(&self, device_id: &str) {
        self.latest.remove(device_id);
    }

    /// The most recent snapshot for one device, if any has been published.
    #[must_use]
    pub fn get(&self, device_id: &str) -> Option<DeviceHealth> {
        self.latest.get(device_id).map(|e| e.value().clone())
    }

    /// The most recent snapshot for every known device.
    #[must_use]
    pub fn get_all(&self) -> Vec<DeviceHealth> {
        self.latest.iter().map(|e| e.value().clone()).collect()
    }

    /// Subscribe to the live stream of health updates from this point forward.
    #[must_use]
    pub fn subscribe(&self) -> BroadcastStream<DeviceHealth> {
        BroadcastStream::new(self.tx.subscribe())
    }
}
