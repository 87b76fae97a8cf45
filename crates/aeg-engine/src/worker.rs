//! Per-device polling worker: owns one transport connection and runs the
//! acquire → decode → rate → validate → publish pipeline for every enabled
//! channel, once per poll cycle.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use acq_common::error::EngineResult;
use acq_common::{
    DecodedValue, DeviceConfig, DeviceKind, Ewma, Observation, Quality, RawValue, WorkerState,
};
use acq_protocol::{
    decode_counter, decode_scale, discover_protocol, validator::ChannelLimits, DiscoveryConfig,
    ProtocolTemplate,
};
use acq_transport::{ModbusTcpConfig, ModbusTcpTransport, RawTcpConfig, RawTcpTransport};
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::bus::ObservationBus;
use crate::health::{HealthTracker, PollOutcome};
use crate::rate::RateEngine;

/// Handle to a spawned device worker: cancel it, or await its termination.
pub struct WorkerHandle {
    device_id: String,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// The device this worker is polling.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Signal the worker to stop. The in-flight cycle (if any) is
    /// cancelled; the worker flushes a terminal health record before
    /// `join` resolves.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for the worker task to finish, up to `grace_period`. Returns
    /// `true` if it finished in time.
    pub async fn join_with_timeout(self, grace_period: Duration) -> bool {
        tokio::time::timeout(grace_period, self.join).await.is_ok()
    }
}

enum Transport {
    Counter(ModbusTcpTransport),
    Scale(RawTcpTransport),
}

/// Spawn a worker for `config`, polling at `config.poll_interval_ms` until
/// stopped. `templates` is the protocol catalog available for scale
/// discovery (built-ins plus user-configured templates).
#[must_use]
pub fn spawn(
    config: DeviceConfig,
    bus: Arc<ObservationBus>,
    health: Arc<HealthTracker>,
    templates: Arc<Vec<ProtocolTemplate>>,
    parallelism: Arc<Semaphore>,
) -> WorkerHandle {
    let cancel = CancellationToken::new();
    let device_id = config.device_id.clone();
    let worker_cancel = cancel.clone();

    let join = tokio::spawn(async move {
        run(config, bus, health, templates, parallelism, worker_cancel).await;
    });

    WorkerHandle {
        device_id,
        cancel,
        join,
    }
}

fn build_transport(config: &DeviceConfig) -> EngineResult<Transport> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| {
            acq_common::error::EngineError::ConfigurationInvalid {
                path: format!("devices.{}.host", config.device_id),
                message: format!("invalid socket address: {e}"),
            }
        })?;

    match &config.kind {
        DeviceKind::CounterModbusTcp { unit_id, .. } => Ok(Transport::Counter(ModbusTcpTransport::new(
            ModbusTcpConfig {
                server_addr: addr,
                unit_id: *unit_id,
                connect_timeout: config.connect_timeout(),
                read_timeout: config.read_timeout(),
                retry_delay: config.retry_delay(),
                max_retries: config.max_retries.max(1),
                ..ModbusTcpConfig::default()
            },
        ))),
        DeviceKind::ScaleTcpSerial { .. } => Ok(Transport::Scale(RawTcpTransport::new(RawTcpConfig {
            server_addr: addr,
            connect_timeout: config.connect_timeout(),
            ..RawTcpConfig::default()
        }))),
    }
}

async fn run(
    config: DeviceConfig,
    bus: Arc<ObservationBus>,
    health: Arc<HealthTracker>,
    templates: Arc<Vec<ProtocolTemplate>>,
    parallelism: Arc<Semaphore>,
    cancel: CancellationToken,
) {
    health.record_initial(&config.device_id, Utc::now());

    let transport = match build_transport(&config) {
        Ok(t) => t,
        Err(e) => {
            warn!(device_id = %config.device_id, error = %e, "worker failed to build transport");
            health.record_terminal(&config.device_id, Utc::now());
            return;
        }
    };

    let mut rate_engines: HashMap<u16, RateEngine> = HashMap::new();
    for (channel_number, window) in channel_windows(&config) {
        let rollover_bits = match &config.kind {
            DeviceKind::CounterModbusTcp { channels, .. } => channels
                .iter()
                .find(|c| c.channel_number == channel_number)
                .map(|c| c.register_count.bit_width()),
            DeviceKind::ScaleTcpSerial { .. } => None,
        };
        rate_engines.insert(channel_number, RateEngine::new(window, rollover_bits));
    }

    let mut latency_ewma = Ewma::default();
    let mut protocol_template: Option<ProtocolTemplate> = resolve_forced_template(&config, &templates);
    let mut state = WorkerState::Idle;
    let mut next_deadline = Instant::now();
    let poll_interval = config.poll_interval();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        tokio::select! {
            () = tokio::time::sleep_until(next_deadline.into()) => {}
            () = cancel.cancelled() => break,
        }

        if let Err(e) = state.transition_to(WorkerState::Polling) {
            warn!(device_id = %config.device_id, error = %e, "worker state transition rejected");
        }

        let permit = tokio::select! {
            p = parallelism.acquire() => p.ok(),
            () = cancel.cancelled() => None,
        };
        if permit.is_none() && cancel.is_cancelled() {
            break;
        }

        let cycle_start = Instant::now();
        let outcome = run_cycle(
            &config,
            &transport,
            &mut protocol_template,
            &templates,
            &mut rate_engines,
            &bus,
            &cancel,
        )
        .await;
        drop(permit);

        let cycle_elapsed = cycle_start.elapsed();
        let overran = cycle_elapsed > poll_interval;
        let mut outcome = outcome;
        outcome.duration = cycle_elapsed;
        outcome.overran = overran;
        if overran {
            warn!(device_id = %config.device_id, "poll cycle overran its deadline");
        }

        health.record_outcome(
            &config.device_id,
            config.max_consecutive_failures,
            &outcome,
            Utc::now(),
            &mut latency_ewma,
            protocol_template.as_ref().map(|t| t.id.clone()),
            !outcome.disconnected,
        );

        next_deadline += poll_interval;
        let now = Instant::now();
        while next_deadline < now {
            next_deadline += poll_interval;
        }

        let _ = state.transition_to(WorkerState::Sleeping);
        let _ = state.transition_to(WorkerState::Idle);
    }

    let _ = state.transition_to(WorkerState::Stopping);
    health.record_terminal(&config.device_id, Utc::now());
    let _ = state.transition_to(WorkerState::Stopped);
}

fn channel_windows(config: &DeviceConfig) -> Vec<(u16, Duration)> {
    match &config.kind {
        DeviceKind::CounterModbusTcp { channels, .. } => channels
            .iter()
            .map(|c| (c.channel_number, Duration::from_secs(c.rate_window_seconds.max(1))))
            .collect(),
        DeviceKind::ScaleTcpSerial { channels, .. } => channels
            .iter()
            .map(|c| (c.channel_number, Duration::from_secs(c.rate_window_seconds.max(1))))
            .collect(),
    }
}

fn resolve_forced_template(
    config: &DeviceConfig,
    templates: &[ProtocolTemplate],
) -> Option<ProtocolTemplate> {
    match &config.kind {
        DeviceKind::ScaleTcpSerial {
            forced_protocol_template_id: Some(id),
            ..
        } => templates.iter().find(|t| &t.id == id).cloned(),
        _ => None,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_cycle(
    config: &DeviceConfig,
    transport: &Transport,
    protocol_template: &mut Option<ProtocolTemplate>,
    templates: &[ProtocolTemplate],
    rate_engines: &mut HashMap<u16, RateEngine>,
    bus: &ObservationBus,
    cancel: &CancellationToken,
) -> PollOutcome {
    let mut outcome = PollOutcome::default();

    match (&config.kind, transport) {
        (DeviceKind::CounterModbusTcp { channels, .. }, Transport::Counter(modbus)) => {
            for channel in channels.iter().filter(|c| c.enabled) {
                if cancel.is_cancelled() {
                    break;
                }
                match modbus
                    .read_registers(channel.start_register, channel.register_count.register_len(), cancel)
                    .await
                {
                    Ok(read) => {
                        let decoded = decode_counter(&read.words, channel);
                        let rate = rate_engines
                            .get_mut(&channel.channel_number)
                            .and_then(|r| r.record(decoded.raw as f64));
                        let limits = ChannelLimits::for_counter(channel);
                        let quality = acq_protocol::assign_quality(decoded.raw as f64, rate, &limits);

                        let tags = Observation::with_engine_tags(
                            &config.device_id,
                            channel.channel_number,
                            &config.tags,
                        );
                        bus.publish(Observation {
                            device_id: config.device_id.clone(),
                            channel_number: channel.channel_number,
                            timestamp: Utc::now(),
                            acquisition_duration: read.duration,
                            raw_value: RawValue::Counter {
                                registers: read.words,
                            },
                            decoded_value: DecodedValue::Counter {
                                value: decoded.scaled,
                                unit: "count".to_string(),
                            },
                            rate,
                            quality,
                            stability: None,
                            tags,
                        });
                        outcome.successes += 1;
                    }
                    Err(e) => {
                        outcome.failures += 1;
                        outcome.disconnected = outcome.disconnected || !modbus.is_connected().await;
                        outcome.errors.push(e.to_string());
                    }
                }
            }
        }
        (DeviceKind::ScaleTcpSerial { channels, .. }, Transport::Scale(raw_tcp)) => {
            if protocol_template.is_none() {
                *protocol_template = discover_protocol(
                    socket_addr(config),
                    templates,
                    &DiscoveryConfig::default(),
                    cancel,
                )
                .await;
            }

            let Some(template) = protocol_template.clone() else {
                outcome.failures += channels.iter().filter(|c| c.enabled).count() as u32;
                outcome
                    .errors
                    .push("no protocol template discovered".to_string());
                return outcome;
            };

            let response = template
                .commands
                .first()
                .cloned()
                .map(|cmd| raw_tcp.send_and_receive(&cmd, config.read_timeout(), cancel));

            let frame = match response {
                Some(fut) => fut.await,
                None => Err(acq_common::error::EngineError::ConfigurationInvalid {
                    path: format!("devices.{}.kind.forced_protocol_template_id", config.device_id),
                    message: "protocol template has no commands".to_string(),
                }),
            };

            match frame {
                Ok(bytes) => {
                    let text = String::from_utf8_lossy(&bytes).to_string();
                    for channel in channels.iter().filter(|c| c.enabled) {
                        match decode_scale(&text, &template, channel) {
                            Ok(decoded) => {
                                let value_f64: f64 = decoded.value.try_into().unwrap_or(f64::NAN);
                                let rate = rate_engines
                                    .get_mut(&channel.channel_number)
                                    .and_then(|r| r.record(value_f64));
                                let limits = ChannelLimits::for_scale(channel);
                                let quality = if value_f64.is_nan() {
                                    Quality::ConfigurationError
                                } else {
                                    acq_protocol::assign_quality(value_f64, rate, &limits)
                                };

                                let tags = Observation::with_engine_tags(
                                    &config.device_id,
                                    channel.channel_number,
                                    &config.tags,
                                );
                                bus.publish(Observation {
                                    device_id: config.device_id.clone(),
                                    channel_number: channel.channel_number,
                                    timestamp: Utc::now(),
                                    acquisition_duration: config.read_timeout(),
                                    raw_value: RawValue::Scale { frame: text.clone() },
                                    decoded_value: DecodedValue::Weight {
                                        value: decoded.value,
                                        unit: decoded.unit,
                                    },
                                    rate,
                                    quality,
                                    stability: Some(decoded.stable),
                                    tags,
                                });
                                outcome.successes += 1;
                            }
                            Err(e) => {
                                outcome.failures += 1;
                                outcome.errors.push(e.to_string());
                            }
                        }
                    }
                }
                Err(e) => {
                    outcome.failures += channels.iter().filter(|c| c.enabled).count() as u32;
                    outcome.disconnected = outcome.disconnected || !matches!(
                        raw_tcp.connection_state(),
                        acq_transport::ConnectionState::Connected
                    );
                    outcome.errors.push(e.to_string());
                    *protocol_template = None;
                }
            }
        }
        _ => {
            outcome.failures += 1;
            outcome.errors.push(format!(
                "device {} configuration kind does not match its transport",
                config.device_id
            ));
        }
    }

    outcome
}

fn socket_addr(config: &DeviceConfig) -> SocketAddr {
    format!("{}:{}", config.host, config.port)
        .parse()
        .expect("validated at config load")
}
