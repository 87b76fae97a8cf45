//! Acquisition daemon entry point.
//!
//! Wires the engine's collaborators into a runnable service: loads and
//! validates configuration, starts the device fleet, and blocks until a
//! shutdown signal arrives.

mod signals;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use acq_common::EngineConfig;
use acq_engine::Engine;

use crate::signals::wait_for_shutdown;

/// Default grace period given to in-flight work when shutting down.
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Acquisition daemon command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "acq-daemon",
    about = "Acquisition engine daemon - counter and scale device polling service",
    version,
    long_about = None
)]
struct Args {
    /// Path to an engine configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,

    /// Seconds given to in-flight work to finish on shutdown.
    #[arg(long, default_value_t = DEFAULT_STOP_GRACE.as_secs())]
    stop_grace_seconds: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "starting acquisition daemon");

    let config = load_config(&args)?;
    info!(
        devices = config.devices.len(),
        max_concurrent_devices = config.max_concurrent_devices,
        "configuration loaded"
    );

    let engine = Engine::new(config.clone()).context("engine configuration rejected")?;

    engine
        .start(config.devices)
        .await
        .context("failed to start device fleet")?;
    info!("engine started, entering service loop");

    let reason = wait_for_shutdown().await.context("signal handler failed")?;
    info!(%reason, "shutdown signal received, stopping engine");

    let grace_period = Duration::from_secs(args.stop_grace_seconds);
    engine.stop(grace_period).await;

    print_final_statistics(&engine);
    info!("acquisition daemon shutdown complete");
    Ok(())
}

/// Initialize logging at the requested level, honoring `RUST_LOG` if set.
fn init_logging(level: &str) {
    let filter = format!(
        "acq_daemon={level},acq_engine={level},acq_transport={level},acq_protocol={level},acq_common={level}"
    );

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Load configuration from file, or fall back to built-in defaults.
fn load_config(args: &Args) -> Result<EngineConfig> {
    if let Some(config_path) = &args.config {
        EngineConfig::from_file(config_path)
            .with_context(|| format!("failed to load config from {config_path:?}"))
    } else {
        let default_path = PathBuf::from("config/default.toml");
        if default_path.exists() {
            info!(?default_path, "using default configuration file");
            EngineConfig::from_file(&default_path)
                .with_context(|| format!("failed to load default config from {default_path:?}"))
        } else {
            info!("no config file found, using built-in defaults");
            Ok(EngineConfig::default())
        }
    }
}

/// Log a final per-device health and writer summary before exit.
fn print_final_statistics(engine: &Engine) {
    info!(
        dropped_points = engine.tsdb_dropped_points(),
        "time-series writer summary"
    );

    for health in engine.get_all_device_health() {
        if health.consecutive_failures > 0 || health.last_error.is_some() {
            warn!(
                device_id = %health.device_id,
                status = %health.status,
                total_reads = health.total_reads,
                successful_reads = health.successful_reads,
                consecutive_failures = health.consecutive_failures,
                last_error = ?health.last_error,
                "final device health"
            );
        } else {
            info!(
                device_id = %health.device_id,
                status = %health.status,
                total_reads = health.total_reads,
                successful_reads = health.successful_reads,
                "final device health"
            );
        }
    }
}
