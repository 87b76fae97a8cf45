//! Top-level engine handle: the embeddable Control API described in the
//! crate's external-interfaces contract.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use acq_common::error::{EngineError, EngineResult};
use acq_common::{ConfigurationError, DeviceConfig, DeviceHealth, EngineConfig, Observation};
use acq_protocol::{discover_protocol, DiscoveryConfig, ProtocolTemplate};
use acq_transport::{ModbusTcpConfig, ModbusTcpTransport};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bus::{HealthBus, ObservationBus};
use crate::health::HealthTracker;
use crate::scheduler::Scheduler;
use crate::tsdb::TsdbWriter;

/// Outcome of a one-off connectivity probe against a device configuration
/// that is not (yet) part of the running fleet.
#[derive(Debug, Clone)]
pub struct ConnectivityTestResult {
    /// Whether the probe obtained at least one reading.
    pub success: bool,
    /// Wall-clock time the probe took.
    pub duration: Duration,
    /// Protocol template that worked, for scale devices.
    pub working_protocol: Option<String>,
    /// Observations collected during the probe, if any.
    pub sample_observations: Vec<Observation>,
    /// Human-readable detail, populated on failure.
    pub diagnostics: Option<String>,
}

/// Embeddable acquisition engine: owns the scheduler, the observation and
/// health buses, and the TSDB writer; validates configuration on every
/// mutation per the propagation policy.
pub struct Engine {
    scheduler: Scheduler,
    bus: Arc<ObservationBus>,
    health: Arc<HealthTracker>,
    tsdb: Arc<TsdbWriter>,
    templates: Arc<Vec<ProtocolTemplate>>,
    tsdb_task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    running: Mutex<bool>,
}

impl Engine {
    /// Validate `config` and build an engine from it. Does not start any
    /// workers; call [`Engine::start`] for that.
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        let errors = config.validate();
        if let Some(first) = errors.into_iter().next() {
            return Err(configuration_error_to_engine_error(&first));
        }

        let templates = acq_protocol::compile_catalog(&config.protocol_templates).map_err(|e| {
            EngineError::ConfigurationInvalid {
                path: format!("protocol_templates.{}", e.id),
                message: e.message,
            }
        })?;

        let bus = Arc::new(ObservationBus::new(config.bus.observation_queue_capacity));
        let health_bus = Arc::new(HealthBus::new(config.bus.health_queue_capacity));
        let health = Arc::new(HealthTracker::new(health_bus));
        let tsdb = Arc::new(TsdbWriter::new(config.tsdb.clone()));
        let scheduler = Scheduler::new(
            config.max_concurrent_devices,
            templates.clone(),
            Arc::clone(&bus),
            Arc::clone(&health),
        );

        Ok(Self {
            scheduler,
            bus,
            health,
            tsdb,
            templates: Arc::new(templates),
            tsdb_task: Mutex::new(None),
            running: Mutex::new(false),
        })
    }

    /// Start every configured device and the TSDB drain task.
    pub async fn start(&self, devices: Vec<DeviceConfig>) -> EngineResult<()> {
        let mut running = self.running.lock().await;
        if *running {
            return Ok(());
        }

        for device in &devices {
            let errors = device.validate();
            if let Some(first) = errors.into_iter().next() {
                return Err(configuration_error_to_engine_error(&first));
            }
        }

        self.scheduler.start(devices).await?;

        let cancel = CancellationToken::new();
        let tsdb = Arc::clone(&self.tsdb);
        let observations = self.bus.subscribe();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            tsdb.run(observations, task_cancel).await;
        });
        *self.tsdb_task.lock().await = Some((cancel, task));

        *running = true;
        info!("engine started");
        Ok(())
    }

    /// Stop every worker and the TSDB task, giving each `grace_period` to
    /// finish in-flight work.
    pub async fn stop(&self, grace_period: Duration) {
        let mut running = self.running.lock().await;
        if !*running {
            return;
        }

        self.scheduler.stop(grace_period).await;

        if let Some((cancel, task)) = self.tsdb_task.lock().await.take() {
            cancel.cancel();
            let _ = tokio::time::timeout(grace_period, task).await;
        }

        *running = false;
        info!("engine stopped");
    }

    /// Whether the engine currently has workers running.
    pub async fn is_running(&self) -> bool {
        *self.running.lock().await
    }

    /// Add a device to the running fleet.
    pub async fn add_device(&self, config: DeviceConfig) -> EngineResult<()> {
        if let Some(first) = config.validate().into_iter().next() {
            return Err(configuration_error_to_engine_error(&first));
        }
        self.scheduler.add(config).await
    }

    /// Remove a device from the running fleet.
    pub async fn remove_device(&self, device_id: &str) -> EngineResult<()> {
        self.scheduler.remove(device_id).await
    }

    /// Replace a device's configuration; statistics are carried over per
    /// the health tracker's `device_id`-keyed map.
    pub async fn update_device(&self, config: DeviceConfig) -> EngineResult<()> {
        if let Some(first) = config.validate().into_iter().next() {
            return Err(configuration_error_to_engine_error(&first));
        }
        self.scheduler.update(config).await
    }

    /// Latest known health snapshot for one device.
    #[must_use]
    pub fn get_device_health(&self, device_id: &str) -> Option<DeviceHealth> {
        self.health.bus().get(device_id)
    }

    /// Latest known health snapshot for every device.
    #[must_use]
    pub fn get_all_device_health(&self) -> Vec<DeviceHealth> {
        self.health.bus().get_all()
    }

    /// Observations dropped by the TSDB writer because its buffer was full.
    #[must_use]
    pub fn tsdb_dropped_points(&self) -> u64 {
        self.tsdb.dropped_points()
    }

    /// Subscribe to the observation stream from this point forward.
    #[must_use]
    pub fn observations_stream(&self) -> BroadcastStream<Observation> {
        self.bus.subscribe()
    }

    /// Subscribe to the health stream from this point forward.
    #[must_use]
    pub fn health_stream(&self) -> BroadcastStream<DeviceHealth> {
        self.health.bus().subscribe()
    }

    /// Probe a candidate device configuration without adding it to the
    /// fleet: connect, attempt one read per enabled channel (running
    /// protocol discovery first for scale devices unless forced), and
    /// report the outcome.
    pub async fn test_connectivity(
        &self,
        config: &DeviceConfig,
        cancel: &CancellationToken,
    ) -> ConnectivityTestResult {
        let started = std::time::Instant::now();
        let addr: SocketAddr = match format!("{}:{}", config.host, config.port).parse() {
            Ok(addr) => addr,
            Err(e) => {
                return ConnectivityTestResult {
                    success: false,
                    duration: started.elapsed(),
                    working_protocol: None,
                    sample_observations: Vec::new(),
                    diagnostics: Some(format!("invalid socket address: {e}")),
                };
            }
        };

        match &config.kind {
            acq_common::DeviceKind::CounterModbusTcp { unit_id, .. } => {
                let transport = ModbusTcpTransport::new(ModbusTcpConfig {
                    server_addr: addr,
                    unit_id: *unit_id,
                    connect_timeout: config.connect_timeout(),
                    read_timeout: config.read_timeout(),
                    max_retries: 1,
                    ..ModbusTcpConfig::default()
                });
                match transport.test(cancel).await {
                    true => ConnectivityTestResult {
                        success: true,
                        duration: started.elapsed(),
                        working_protocol: None,
                        sample_observations: Vec::new(),
                        diagnostics: None,
                    },
                    false => ConnectivityTestResult {
                        success: false,
                        duration: started.elapsed(),
                        working_protocol: None,
                        sample_observations: Vec::new(),
                        diagnostics: Some("failed to connect".to_string()),
                    },
                }
            }
            acq_common::DeviceKind::ScaleTcpSerial {
                forced_protocol_template_id,
                ..
            } => {
                let template = if let Some(id) = forced_protocol_template_id {
                    self.templates.iter().find(|t| &t.id == id).cloned()
                } else {
                    discover_protocol(addr, &self.templates, &DiscoveryConfig::default(), cancel).await
                };

                match template {
                    Some(t) => ConnectivityTestResult {
                        success: true,
                        duration: started.elapsed(),
                        working_protocol: Some(t.id),
                        sample_observations: Vec::new(),
                        diagnostics: None,
                    },
                    None => ConnectivityTestResult {
                        success: false,
                        duration: started.elapsed(),
                        working_protocol: None,
                        sample_observations: Vec::new(),
                        diagnostics: Some("no protocol template matched".to_string()),
                    },
                }
            }
        }
    }

    /// Wait for the next observation(s) produced by a running device's
    /// enabled channels, up to `timeout`.
    pub async fn read_now(
        &self,
        device_id: &str,
        timeout: Duration,
    ) -> EngineResult<Vec<Observation>> {
        if !self.scheduler.contains(device_id) {
            return Err(EngineError::DeviceNotFound(device_id.to_string()));
        }

        let mut stream = self.bus.subscribe();
        let mut collected = Vec::new();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, next_from_stream(&mut stream)).await {
                Ok(Some(observation)) if observation.device_id == device_id => {
                    collected.push(observation);
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }

        Ok(collected)
    }

    /// Run protocol discovery against a raw-TCP device that is not part of
    /// the fleet.
    pub async fn discover_protocol(
        &self,
        host: &str,
        port: u16,
        cancel: &CancellationToken,
    ) -> EngineResult<Option<ProtocolTemplate>> {
        let addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|e| EngineError::ConfigurationInvalid {
                path: "host".to_string(),
                message: format!("invalid socket address: {e}"),
            })?;
        Ok(discover_protocol(addr, &self.templates, &DiscoveryConfig::default(), cancel).await)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default()).expect("default configuration is always valid")
    }
}

async fn next_from_stream(stream: &mut BroadcastStream<Observation>) -> Option<Observation> {
    use futures::StreamExt;
    loop {
        match stream.next().await {
            Some(Ok(observation)) => return Some(observation),
            Some(Err(_lagged)) => continue,
            None => return None,
        }
    }
}

fn configuration_error_to_engine_error(error: &ConfigurationError) -> EngineError {
    EngineError::ConfigurationInvalid {
        path: error.path.clone(),
        message: error.message.clone(),
    }
}
