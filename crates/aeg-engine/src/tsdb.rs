//! Time-series backend writer: batches observations off the bus and flushes
//! them to the configured backend, retrying transient write failures.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use acq_common::error::{EngineError, EngineResult};
use acq_common::{
    execute, Classification, Observation, RawValue, RetryPolicy, TsdbBackend, TsdbConfig,
};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone)]
enum Backend {
    Null,
    File(PathBuf),
}

/// Subscribes to the observation bus, batches points by size or time, and
/// writes them to the configured backend.
pub struct TsdbWriter {
    config: TsdbConfig,
    backend: Backend,
    dropped_points: AtomicU64,
}

impl TsdbWriter {
    /// Build a writer for the given configuration. Does not start consuming
    /// observations until [`TsdbWriter::run`] is driven.
    #[must_use]
    pub fn new(config: TsdbConfig) -> Self {
        let backend = match &config.backend {
            TsdbBackend::None => Backend::Null,
            TsdbBackend::File { path } => Backend::File(path.clone()),
        };
        Self {
            config,
            backend,
            dropped_points: AtomicU64::new(0),
        }
    }

    /// Points dropped because the in-memory buffer exceeded
    /// `max_buffered_points` before a flush could drain it. A diagnostic
    /// counter, not a hard error: the writer keeps running.
    #[must_use]
    pub fn dropped_points(&self) -> u64 {
        self.dropped_points.load(Ordering::Relaxed)
    }

    /// Ping the backend with a short timeout. The null backend always
    /// reports healthy.
    pub async fn is_healthy(&self, cancel: &CancellationToken) -> bool {
        match &self.backend {
            Backend::Null => true,
            Backend::File(path) => {
                let parent = path.parent().unwrap_or_else(|| std::path::Path::new("."));
                tokio::select! {
                    result = tokio::time::timeout(Duration::from_secs(2), tokio::fs::metadata(parent)) => {
                        matches!(result, Ok(Ok(_)))
                    }
                    () = cancel.cancelled() => false,
                }
            }
        }
    }

    /// Drain `observations` until the stream ends or `cancel` fires,
    /// flushing on batch-size or flush-interval boundaries and once more on
    /// exit to avoid losing a partial final batch.
    pub async fn run(&self, observations: BroadcastStream<Observation>, cancel: CancellationToken) {
        let mut observations = observations;
        let mut buffer: Vec<Observation> = Vec::new();
        let mut flush_interval =
            tokio::time::interval(Duration::from_millis(self.config.flush_interval_ms.max(1)));
        flush_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                item = observations.next() => {
                    match item {
                        Some(Ok(observation)) => {
                            self.push(&mut buffer, observation);
                            if buffer.len() >= self.config.write_batch_size {
                                self.flush(&mut buffer).await;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "tsdb writer lagged behind the observation bus");
                        }
                        None => break,
                    }
                }
                _ = flush_interval.tick() => {
                    if !buffer.is_empty() {
                        self.flush(&mut buffer).await;
                    }
                }
                () = cancel.cancelled() => break,
            }
        }

        if !buffer.is_empty() {
            self.flush(&mut buffer).await;
        }
    }

    fn push(&self, buffer: &mut Vec<Observation>, observation: Observation) {
        buffer.push(observation);
        self.trim_to_capacity(buffer);
    }

    fn trim_to_capacity(&self, buffer: &mut Vec<Observation>) {
        while buffer.len() > self.config.max_buffered_points {
            buffer.remove(0);
            self.dropped_points.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Flush `buffer` to the backend. On persistent failure (retry budget
    /// exhausted) the batch is requeued at the front of the buffer rather
    /// than discarded, so a sustained backend outage surfaces as buffer
    /// growth and `dropped_points` accrual rather than silent data loss.
    async fn flush(&self, buffer: &mut Vec<Observation>) {
        let points = std::mem::take(buffer);
        let policy: RetryPolicy = self.config.retry.into();
        let backend = &self.backend;
        let cancel = CancellationToken::new();

        let result = execute(
            || write_batch(backend, &points),
            &policy,
            |_: &EngineError| Classification::Transient,
            &cancel,
        )
        .await;

        if !result.is_ok() {
            warn!(
                error = ?result.error,
                points = points.len(),
                "tsdb write failed after retry budget exhausted, requeuing batch"
            );
            buffer.splice(0..0, points);
            self.trim_to_capacity(buffer);
        }
    }
}

async fn write_batch(backend: &Backend, points: &[Observation]) -> EngineResult<()> {
    match backend {
        Backend::Null => Ok(()),
        Backend::File(path) => {
            let mut body = String::new();
            for point in points {
                body.push_str(&line_protocol(point));
                body.push('\n');
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .map_err(|e| EngineError::BackendUnavailable(e.to_string()))?;
            file.write_all(body.as_bytes())
                .await
                .map_err(|e| EngineError::BackendWriteFailed(e.to_string()))?;
            Ok(())
        }
    }
}

fn line_protocol(observation: &Observation) -> String {
    let mut tags = format!(
        "device_id={},channel={}",
        observation.device_id, observation.channel_number
    );
    for (key, value) in &observation.tags {
        if key == "device_id" || key == "channel" {
            continue;
        }
        tags.push(',');
        tags.push_str(key);
        tags.push('=');
        tags.push_str(value);
    }

    let quality = serde_json::to_string(&observation.quality).unwrap_or_default();
    let value = observation.decoded_value.as_f64();
    let raw_value = raw_value_field(&observation.raw_value);
    let timestamp_ns = observation.timestamp.timestamp_nanos_opt().unwrap_or(0);

    let mut fields = format!("value={value},raw_value={raw_value},quality={quality}");
    if let Some(rate) = observation.rate {
        fields.push_str(&format!(",rate={rate}"));
    }

    format!("observation,{tags} {fields} {timestamp_ns}")
}

/// Render a channel's untouched raw value as a line-protocol field. Counter
/// registers are recombined using the same low-word-first convention the
/// decoder uses, so this matches `value` for an unscaled counter; scale
/// frames are written as a quoted string field.
fn raw_value_field(raw: &RawValue) -> String {
    match raw {
        RawValue::Counter { registers } => {
            let mut combined: u64 = 0;
            for (i, word) in registers.iter().enumerate() {
                combined |= u64::from(*word) << (16 * i);
            }
            format!("{combined}i")
        }
        RawValue::Scale { frame } => format!("{frame:?}"),
    }
}
