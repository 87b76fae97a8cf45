//! Unix signal handling for graceful daemon shutdown.
//!
//! SIGTERM and SIGINT both request a graceful stop; SIGHUP is accepted and
//! logged but triggers no action, since the engine's control API has no
//! hot-reload-from-disk operation.

use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

/// What a received signal means to the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGTERM received.
    Terminate,
    /// SIGINT received (Ctrl+C).
    Interrupt,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::Terminate => write!(f, "SIGTERM"),
            ShutdownReason::Interrupt => write!(f, "SIGINT"),
        }
    }
}

/// Wait for the first shutdown-triggering signal, logging any SIGHUPs that
/// arrive first.
pub async fn wait_for_shutdown() -> std::io::Result<ShutdownReason> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut hangup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = terminate.recv() => return Ok(ShutdownReason::Terminate),
            _ = interrupt.recv() => return Ok(ShutdownReason::Interrupt),
            _ = hangup.recv() => {
                info!("SIGHUP received; configuration hot-reload is not supported, ignoring");
            }
        }
    }
}
