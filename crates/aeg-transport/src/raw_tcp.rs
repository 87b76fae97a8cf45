//! Async raw TCP client for serial-over-TCP scale indicators.
//!
//! Unlike the framed Modbus transport, this client has no idea how a
//! device's protocol is structured: it maintains a connection, spawns a
//! background task that republishes everything the peer sends as
//! byte chunks on a broadcast channel, and exposes a request/response
//! helper built on top of that stream for callers (the decoder/discovery
//! layers) that do know the framing.

use std::net::SocketAddr;
use std::time::Duration;

use acq_common::error::{EngineError, EngineResult};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{ConnectCooldown, ConnectionState, DEFAULT_CONNECTION_COOLDOWN};

/// Configuration for one raw TCP connection.
#[derive(Debug, Clone)]
pub struct RawTcpConfig {
    /// Device address.
    pub server_addr: SocketAddr,
    /// Timeout for establishing the TCP connection.
    pub connect_timeout: Duration,
    /// Minimum spacing between connect attempts.
    pub connection_cooldown: Duration,
    /// Capacity of the broadcast channel republishing received bytes.
    /// Slow subscribers that fall this many chunks behind lose the oldest.
    pub received_bytes_capacity: usize,
    /// Read buffer size for a single `read()` syscall.
    pub read_chunk_size: usize,
    /// Disable Nagle's algorithm (`TCP_NODELAY`); on by default.
    pub nodelay: bool,
}

impl Default for RawTcpConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:9000".parse().expect("valid default address"),
            connect_timeout: Duration::from_secs(3),
            connection_cooldown: DEFAULT_CONNECTION_COOLDOWN,
            received_bytes_capacity: 256,
            read_chunk_size: 4096,
            nodelay: true,
        }
    }
}

struct Inner {
    writer_half: Option<tokio::net::tcp::OwnedWriteHalf>,
    read_task: Option<JoinHandle<()>>,
    cooldown: ConnectCooldown,
}

/// One raw TCP connection to a serial-over-TCP scale.
pub struct RawTcpTransport {
    config: RawTcpConfig,
    inner: Mutex<Inner>,
    received_tx: broadcast::Sender<Bytes>,
    status_tx: watch::Sender<ConnectionState>,
}

impl RawTcpTransport {
    /// Build a transport for the given configuration. Does not connect.
    #[must_use]
    pub fn new(config: RawTcpConfig) -> Self {
        let (received_tx, _rx) = broadcast::channel(config.received_bytes_capacity);
        let (status_tx, _rx) = watch::channel(ConnectionState::Disconnected);
        let cooldown = ConnectCooldown::new(config.connection_cooldown);
        Self {
            config,
            inner: Mutex::new(Inner {
                writer_half: None,
                read_task: None,
                cooldown,
            }),
            received_tx,
            status_tx,
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        *self.status_tx.borrow()
    }

    /// Stream of connection state transitions, starting with the current one.
    pub fn connection_status_stream(&self) -> WatchStream<ConnectionState> {
        WatchStream::new(self.status_tx.subscribe())
    }

    /// Stream of byte chunks received from the peer. Subscribe before
    /// sending a request if the response must not be missed.
    pub fn received_bytes_stream(&self) -> BroadcastStream<Bytes> {
        BroadcastStream::new(self.received_tx.subscribe())
    }

    /// Establish the connection and spawn the background read loop,
    /// respecting the cooldown window.
    pub async fn connect(&self, cancel: &CancellationToken) -> bool {
        let mut guard = self.inner.lock().await;

        if guard.writer_half.is_some() {
            return true;
        }
        if !guard.cooldown.may_attempt() {
            return false;
        }
        if cancel.is_cancelled() {
            return false;
        }

        guard.cooldown.record_attempt();
        let _ = self.status_tx.send(ConnectionState::Connecting);

        let connect_fut = TcpStream::connect(self.config.server_addr);
        let result = tokio::select! {
            r = tokio::time::timeout(self.config.connect_timeout, connect_fut) => r,
            () = cancel.cancelled() => {
                let _ = self.status_tx.send(ConnectionState::Disconnected);
                return false;
            }
        };

        let stream = match result {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(addr = %self.config.server_addr, error = %e, "raw tcp connect failed");
                let _ = self.status_tx.send(ConnectionState::Disconnected);
                return false;
            }
            Err(_timeout) => {
                warn!(addr = %self.config.server_addr, "raw tcp connect timed out");
                let _ = self.status_tx.send(ConnectionState::Disconnected);
                return false;
            }
        };

        if let Err(e) = stream.set_nodelay(self.config.nodelay) {
            warn!(error = %e, "failed to set TCP_NODELAY");
        }

        let (mut read_half, write_half) = stream.into_split();
        let chunk_size = self.config.read_chunk_size;
        let received_tx = self.received_tx.clone();
        let status_tx = self.status_tx.clone();
        let addr = self.config.server_addr;

        let read_task = tokio::spawn(async move {
            let mut buf = vec![0u8; chunk_size];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        debug!(%addr, "raw tcp peer closed connection");
                        let _ = status_tx.send(ConnectionState::Disconnected);
                        return;
                    }
                    Ok(n) => {
                        trace!(%addr, bytes = n, "raw tcp chunk received");
                        let _ = received_tx.send(Bytes::copy_from_slice(&buf[..n]));
                    }
                    Err(e) => {
                        warn!(%addr, error = %e, "raw tcp read failed");
                        let _ = status_tx.send(ConnectionState::Disconnected);
                        return;
                    }
                }
            }
        });

        guard.writer_half = Some(write_half);
        guard.read_task = Some(read_task);
        let _ = self.status_tx.send(ConnectionState::Connected);
        debug!(addr = %self.config.server_addr, "raw tcp transport connected");
        true
    }

    /// Tear down the connection and stop the background read task. Idempotent.
    pub async fn disconnect(&self) {
        let mut guard = self.inner.lock().await;
        guard.writer_half = None;
        if let Some(task) = guard.read_task.take() {
            task.abort();
        }
        let _ = self.status_tx.send(ConnectionState::Disconnected);
    }

    /// Write bytes to the peer, connecting first if necessary.
    pub async fn send(&self, bytes: &[u8], cancel: &CancellationToken) -> EngineResult<()> {
        if self.connection_state() != ConnectionState::Connected && !self.connect(cancel).await {
            return Err(EngineError::TransportConnectFailed(
                "raw tcp not connected".to_string(),
            ));
        }

        let mut guard = self.inner.lock().await;
        let writer = guard
            .writer_half
            .as_mut()
            .ok_or_else(|| EngineError::TransportReadFailed("not connected".to_string()))?;
        writer
            .write_all(bytes)
            .await
            .map_err(|e| EngineError::TransportReadFailed(format!("write failed: {e}")))?;
        Ok(())
    }

    /// Send a request and collect response bytes until `response_timeout`
    /// elapses with no further chunks, or cancellation fires. Subscribes to
    /// the received-bytes stream before writing, so a reply that arrives
    /// between subscribe and write is never dropped.
    pub async fn send_and_receive(
        &self,
        bytes: &[u8],
        response_timeout: Duration,
        cancel: &CancellationToken,
    ) -> EngineResult<Vec<u8>> {
        let mut rx = self.received_tx.subscribe();
        self.send(bytes, cancel).await?;

        let mut collected = Vec::new();
        loop {
            tokio::select! {
                chunk = tokio::time::timeout(response_timeout, rx.recv()) => {
                    match chunk {
                        Ok(Ok(bytes)) => {
                            collected.extend_from_slice(&bytes);
                        }
                        Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                            warn!(skipped, "raw tcp receiver lagged; response may be incomplete");
                        }
                        Ok(Err(broadcast::error::RecvError::Closed)) => {
                            return Err(EngineError::TransportClosedByPeer);
                        }
                        Err(_timeout) => {
                            if collected.is_empty() {
                                return Err(EngineError::TransportReadTimeout(response_timeout));
                            }
                            return Ok(collected);
                        }
                    }
                }
                () = cancel.cancelled() => return Err(EngineError::Cancelled),
            }
        }
    }

    /// Probe connectivity.
    pub async fn test(&self, cancel: &CancellationToken) -> bool {
        self.connect(cancel).await
    }
}
