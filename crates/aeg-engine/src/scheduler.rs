//! Supervises the device fleet: owns one worker per configured device,
//! gates concurrent poll cycles, and serializes fleet mutations.
//!
//! Reads (`workers`, health snapshots) stay lock-free via `DashMap`; adds,
//! removes, and updates serialize through a single mutex so two concurrent
//! mutations of the same device can never interleave.

use std::sync::Arc;
use std::time::Duration;

use acq_common::error::{EngineError, EngineResult};
use acq_common::DeviceConfig;
use acq_protocol::ProtocolTemplate;
use dashmap::DashMap;
use tokio::sync::{Mutex, Semaphore};
use tracing::info;

use crate::bus::ObservationBus;
use crate::health::HealthTracker;
use crate::worker::{self, WorkerHandle};

/// Default time a worker is given to finish its in-flight cycle after `stop`.
pub const DEFAULT_STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Owns the live set of device workers and admits fleet mutations.
pub struct Scheduler {
    workers: DashMap<String, WorkerHandle>,
    mutation_lock: Mutex<()>,
    parallelism: Arc<Semaphore>,
    templates: Arc<Vec<ProtocolTemplate>>,
    bus: Arc<ObservationBus>,
    health: Arc<HealthTracker>,
    stop_grace_period: Duration,
}

impl Scheduler {
    /// Build a scheduler gating concurrent poll cycles at `max_concurrent_devices`.
    #[must_use]
    pub fn new(
        max_concurrent_devices: usize,
        templates: Vec<ProtocolTemplate>,
        bus: Arc<ObservationBus>,
        health: Arc<HealthTracker>,
    ) -> Self {
        Self {
            workers: DashMap::new(),
            mutation_lock: Mutex::new(()),
            parallelism: Arc::new(Semaphore::new(max_concurrent_devices.max(1))),
            templates: Arc::new(templates),
            bus,
            health,
            stop_grace_period: DEFAULT_STOP_GRACE_PERIOD,
        }
    }

    /// Override the grace period workers are given to finish an in-flight
    /// cycle when stopped.
    #[must_use]
    pub fn with_stop_grace_period(mut self, grace_period: Duration) -> Self {
        self.stop_grace_period = grace_period;
        self
    }

    /// Number of workers currently in the fleet.
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.workers.len()
    }

    /// Whether `device_id` has a worker.
    #[must_use]
    pub fn contains(&self, device_id: &str) -> bool {
        self.workers.contains_key(device_id)
    }

    /// Start a worker for each device in `devices`. Fails fast (and starts
    /// nothing further) on the first duplicate `device_id`.
    pub async fn start(&self, devices: Vec<DeviceConfig>) -> EngineResult<()> {
        let _guard = self.mutation_lock.lock().await;
        for device in devices {
            self.spawn_worker(device)?;
        }
        Ok(())
    }

    /// Add a single device to the running fleet.
    pub async fn add(&self, device: DeviceConfig) -> EngineResult<()> {
        let _guard = self.mutation_lock.lock().await;
        self.spawn_worker(device)
    }

    /// Stop and remove a device. The worker is given `stop_grace_period` to
    /// finish any in-flight cycle before its task is abandoned.
    pub async fn remove(&self, device_id: &str) -> EngineResult<()> {
        let _guard = self.mutation_lock.lock().await;
        self.stop_worker(device_id, self.stop_grace_period, true).await
    }

    /// Replace a device's configuration: equivalent to `remove` followed by
    /// `add`. The health tracker's running statistics for `device_id` are
    /// carried over, since it is addressed by `device_id` rather than by
    /// worker identity: the prior snapshot is left in the health map
    /// (rather than forgotten) so the respawned worker's initial record
    /// resumes from it instead of resetting to zero.
    pub async fn update(&self, device: DeviceConfig) -> EngineResult<()> {
        let _guard = self.mutation_lock.lock().await;
        let device_id = device.device_id.clone();
        if self.workers.contains_key(&device_id) {
            self.stop_worker(&device_id, self.stop_grace_period, false).await?;
        }
        self.spawn_worker(device)
    }

    /// Stop every worker, giving each `grace_period` to finish its
    /// in-flight cycle before its task is abandoned.
    pub async fn stop(&self, grace_period: Duration) {
        let _guard = self.mutation_lock.lock().await;
        let ids: Vec<String> = self.workers.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let _ = self.stop_worker(&id, grace_period, true).await;
        }
    }

    fn spawn_worker(&self, device: DeviceConfig) -> EngineResult<()> {
        let device_id = device.device_id.clone();
        if self.workers.contains_key(&device_id) {
            return Err(EngineError::DuplicateDevice(device_id));
        }

        let handle = worker::spawn(
            device,
            Arc::clone(&self.bus),
            Arc::clone(&self.health),
            Arc::clone(&self.templates),
            Arc::clone(&self.parallelism),
        );
        info!(device_id, "device worker started");
        self.workers.insert(device_id, handle);
        Ok(())
    }

    /// Tear down one worker. When `forget` is `true` its health record is
    /// removed from the latest-known map (an explicit `remove`); when
    /// `false` the terminal snapshot is left in place so a worker respawned
    /// under the same id (an `update`) resumes its running counters.
    async fn stop_worker(&self, device_id: &str, grace_period: Duration, forget: bool) -> EngineResult<()> {
        let (_, handle) = self
            .workers
            .remove(device_id)
            .ok_or_else(|| EngineError::DeviceNotFound(device_id.to_string()))?;

        handle.stop();
        if !handle.join_with_timeout(grace_period).await {
            tracing::warn!(device_id, "worker did not stop within its grace period");
        }
        if forget {
            self.health.forget(device_id);
        }
        info!(device_id, "device worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acq_common::config::{CounterChannelConfig, DeviceKind};
    use std::collections::BTreeMap;

    fn device(id: &str) -> DeviceConfig {
        DeviceConfig {
            device_id: id.to_string(),
            host: "127.0.0.1".to_string(),
            port: 1,
            connect_timeout_ms: 50,
            read_timeout_ms: 20,
            retry_delay_ms: 10,
            max_retries: 1,
            poll_interval_ms: 500,
            max_consecutive_failures: 3,
            tags: BTreeMap::new(),
            kind: DeviceKind::CounterModbusTcp {
                unit_id: 1,
                channels: vec![CounterChannelConfig {
                    channel_number: 0,
                    ..CounterChannelConfig::default()
                }],
            },
        }
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(
            4,
            acq_protocol::builtin_templates(),
            Arc::new(ObservationBus::new(16)),
            Arc::new(HealthTracker::new(Arc::new(crate::bus::HealthBus::new(16)))),
        )
        .with_stop_grace_period(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn add_then_remove_changes_device_count() {
        let scheduler = scheduler();
        scheduler.add(device("D1")).await.unwrap();
        assert_eq!(scheduler.device_count(), 1);
        assert!(scheduler.contains("D1"));

        scheduler.remove("D1").await.unwrap();
        assert_eq!(scheduler.device_count(), 0);
    }

    #[tokio::test]
    async fn add_rejects_duplicate_device_id() {
        let scheduler = scheduler();
        scheduler.add(device("D1")).await.unwrap();
        let err = scheduler.add(device("D1")).await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicateDevice(id) if id == "D1"));
    }

    #[tokio::test]
    async fn remove_rejects_unknown_device() {
        let scheduler = scheduler();
        let err = scheduler.remove("ghost").await.unwrap_err();
        assert!(matches!(err, EngineError::DeviceNotFound(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn update_replaces_a_running_worker() {
        let scheduler = scheduler();
        scheduler.add(device("D1")).await.unwrap();
        scheduler.update(device("D1")).await.unwrap();
        assert_eq!(scheduler.device_count(), 1);
    }

    #[tokio::test]
    async fn update_preserves_total_reads_and_successful_reads() {
        let scheduler = scheduler();

        // A long poll interval so exactly one cycle runs (against the
        // unreachable address `device` points at) before `update` tears the
        // worker down - nothing further can perturb the counters in between.
        let mut long_interval = device("D1");
        long_interval.poll_interval_ms = 60_000;
        scheduler.add(long_interval).await.unwrap();

        let before_deadline = tokio::time::Instant::now() + Duration::from_millis(500);
        let before = loop {
            if let Some(snapshot) = scheduler.health.bus().get("D1") {
                if snapshot.total_reads >= 1 {
                    break snapshot;
                }
            }
            if tokio::time::Instant::now() >= before_deadline {
                panic!("first poll cycle did not complete in time");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        // An unparsable host, so the respawned worker's transport build
        // fails synchronously before any further cycle can run.
        let mut broken = device("D1");
        broken.host = "not-a-valid-host".to_string();
        scheduler.update(broken).await.unwrap();

        let after_deadline = tokio::time::Instant::now() + Duration::from_millis(500);
        let after = loop {
            if let Some(snapshot) = scheduler.health.bus().get("D1") {
                if snapshot.status == acq_common::DeviceStatus::Offline {
                    break snapshot;
                }
            }
            if tokio::time::Instant::now() >= after_deadline {
                panic!("respawned worker did not publish its terminal record in time");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        assert_eq!(after.total_reads, before.total_reads);
        assert_eq!(after.successful_reads, before.successful_reads);
    }

    #[tokio::test]
    async fn stop_tears_down_every_worker() {
        let scheduler = scheduler();
        scheduler.add(device("D1")).await.unwrap();
        scheduler.add(device("D2")).await.unwrap();
        scheduler.stop(Duration::from_millis(200)).await;
        assert_eq!(scheduler.device_count(), 0);
    }
}
