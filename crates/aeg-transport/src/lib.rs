//! Wire transports the acquisition engine drives: a Modbus/TCP client for
//! counter modules ([`modbus`]) and a raw byte-stream client for
//! TCP-attached serial scales ([`raw_tcp`]).

pub mod modbus;
pub mod raw_tcp;

pub use modbus::{ModbusTcpConfig, ModbusTcpTransport, ReadOutcome};
pub use raw_tcp::{RawTcpConfig, RawTcpTransport};

use std::time::{Duration, Instant};

/// Connection lifecycle shared by both transports: `disconnected ->
/// connecting -> connected -> disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No live socket.
    #[default]
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// Socket established and usable.
    Connected,
}

/// Tracks the cooldown window a transport must respect between connect
/// attempts once one has failed, so a down device doesn't get hammered.
#[derive(Debug)]
pub(crate) struct ConnectCooldown {
    window: Duration,
    last_attempt: Option<Instant>,
}

impl ConnectCooldown {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            last_attempt: None,
        }
    }

    /// True if a connect attempt may proceed right now.
    pub(crate) fn may_attempt(&self) -> bool {
        match self.last_attempt {
            None => true,
            Some(t) => t.elapsed() >= self.window,
        }
    }

    pub(crate) fn record_attempt(&mut self) {
        self.last_attempt = Some(Instant::now());
    }
}

/// Default cooldown between connect attempts (§4.2).
pub const DEFAULT_CONNECTION_COOLDOWN: Duration = Duration::from_secs(5);
