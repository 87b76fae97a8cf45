//! Async Modbus/TCP client for counter modules.
//!
//! Speaks the Modbus TCP Application Protocol (MBAP header wrapping a
//! function-0x03 Read Holding Registers PDU) over a single long-lived
//! connection per device, with connect cooldown and read-failure retry.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use acq_common::error::{EngineError, EngineResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{ConnectCooldown, ConnectionState, DEFAULT_CONNECTION_COOLDOWN};

/// Modbus function code for Read Holding Registers.
const FUNCTION_READ_HOLDING_REGISTERS: u8 = 0x03;
/// High bit set on the echoed function code marks an exception response.
const EXCEPTION_FLAG: u8 = 0x80;

/// Modbus exception codes (response PDU byte 1 on an exception reply).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    /// Illegal function code.
    IllegalFunction,
    /// Illegal data address.
    IllegalDataAddress,
    /// Illegal data value.
    IllegalDataValue,
    /// Server device failure.
    ServerDeviceFailure,
    /// Acknowledge (request accepted, processing).
    Acknowledge,
    /// Server device busy.
    ServerDeviceBusy,
    /// Gateway path unavailable.
    GatewayPathUnavailable,
    /// Gateway target device failed to respond.
    GatewayTargetFailed,
    /// A code this client does not recognize.
    Unknown(u8),
}

impl ExceptionCode {
    fn from_byte(byte: u8) -> Self {
        match byte {
            0x01 => Self::IllegalFunction,
            0x02 => Self::IllegalDataAddress,
            0x03 => Self::IllegalDataValue,
            0x04 => Self::ServerDeviceFailure,
            0x05 => Self::Acknowledge,
            0x06 => Self::ServerDeviceBusy,
            0x0A => Self::GatewayPathUnavailable,
            0x0B => Self::GatewayTargetFailed,
            other => Self::Unknown(other),
        }
    }
}

impl std::fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IllegalFunction => write!(f, "illegal function"),
            Self::IllegalDataAddress => write!(f, "illegal data address"),
            Self::IllegalDataValue => write!(f, "illegal data value"),
            Self::ServerDeviceFailure => write!(f, "server device failure"),
            Self::Acknowledge => write!(f, "acknowledge"),
            Self::ServerDeviceBusy => write!(f, "server device busy"),
            Self::GatewayPathUnavailable => write!(f, "gateway path unavailable"),
            Self::GatewayTargetFailed => write!(f, "gateway target failed"),
            Self::Unknown(code) => write!(f, "unknown (0x{code:02X})"),
        }
    }
}

/// The Modbus TCP Application Protocol header.
#[derive(Debug, Clone, Copy)]
struct MbapHeader {
    transaction_id: u16,
    protocol_id: u16,
    length: u16,
    unit_id: u8,
}

impl MbapHeader {
    const SIZE: usize = 7;

    fn new(transaction_id: u16, pdu_length: u16, unit_id: u8) -> Self {
        Self {
            transaction_id,
            protocol_id: 0,
            length: pdu_length + 1,
            unit_id,
        }
    }

    fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..2].copy_from_slice(&self.transaction_id.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.protocol_id.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.length.to_be_bytes());
        bytes[6] = self.unit_id;
        bytes
    }

    fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            unit_id: bytes[6],
        }
    }
}

/// Configuration for one Modbus/TCP connection.
#[derive(Debug, Clone)]
pub struct ModbusTcpConfig {
    /// Device address.
    pub server_addr: SocketAddr,
    /// Modbus unit identifier (slave address).
    pub unit_id: u8,
    /// Timeout for establishing the TCP connection.
    pub connect_timeout: Duration,
    /// Timeout for a single request/response round trip.
    pub read_timeout: Duration,
    /// Delay before reconnecting after a read failure.
    pub retry_delay: Duration,
    /// Maximum attempts (including the first) per `read_registers` call.
    pub max_retries: u32,
    /// Minimum spacing between connect attempts.
    pub connection_cooldown: Duration,
    /// Enable `SO_KEEPALIVE`.
    pub keepalive: bool,
    /// Disable Nagle's algorithm (`TCP_NODELAY`); on by default.
    pub nodelay: bool,
}

impl Default for ModbusTcpConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:502".parse().expect("valid default address"),
            unit_id: 1,
            connect_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_secs(1),
            retry_delay: Duration::from_millis(500),
            max_retries: 3,
            connection_cooldown: DEFAULT_CONNECTION_COOLDOWN,
            keepalive: true,
            nodelay: true,
        }
    }
}

/// Outcome of a successful [`ModbusTcpTransport::read_registers`] call.
#[derive(Debug, Clone)]
pub struct ReadOutcome {
    /// Raw 16-bit register words, first register first, each already
    /// unpacked big-endian off the wire.
    pub words: Vec<u16>,
    /// Total elapsed time across all attempts, including backoff delay.
    pub duration: Duration,
}

struct Inner {
    stream: Option<TcpStream>,
    state: ConnectionState,
    transaction_id: u16,
    cooldown: ConnectCooldown,
}

/// One Modbus/TCP connection to one counter device.
pub struct ModbusTcpTransport {
    config: ModbusTcpConfig,
    inner: Mutex<Inner>,
}

impl ModbusTcpTransport {
    /// Build a transport for the given configuration. Does not connect.
    #[must_use]
    pub fn new(config: ModbusTcpConfig) -> Self {
        let cooldown = ConnectCooldown::new(config.connection_cooldown);
        Self {
            config,
            inner: Mutex::new(Inner {
                stream: None,
                state: ConnectionState::Disconnected,
                transaction_id: 0,
                cooldown,
            }),
        }
    }

    /// Current connection state.
    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.state == ConnectionState::Connected
    }

    /// Establish the connection, respecting the cooldown window. Returns the
    /// resulting connected state (not necessarily a fresh attempt: a call
    /// inside the cooldown window returns the cached state untouched).
    pub async fn connect(&self, cancel: &CancellationToken) -> bool {
        let mut guard = self.inner.lock().await;

        if guard.state == ConnectionState::Connected {
            return true;
        }
        if !guard.cooldown.may_attempt() {
            return false;
        }
        if cancel.is_cancelled() {
            return false;
        }

        guard.cooldown.record_attempt();
        guard.state = ConnectionState::Connecting;

        let connect_fut = TcpStream::connect(self.config.server_addr);
        let result = tokio::select! {
            r = tokio::time::timeout(self.config.connect_timeout, connect_fut) => r,
            () = cancel.cancelled() => {
                guard.state = ConnectionState::Disconnected;
                return false;
            }
        };

        match result {
            Ok(Ok(stream)) => {
                if let Err(e) = configure_socket(&stream, &self.config) {
                    warn!(error = %e, "failed to apply socket options");
                }
                guard.stream = Some(stream);
                guard.state = ConnectionState::Connected;
                debug!(addr = %self.config.server_addr, "modbus transport connected");
                true
            }
            Ok(Err(e)) => {
                warn!(addr = %self.config.server_addr, error = %e, "modbus connect failed");
                guard.state = ConnectionState::Disconnected;
                false
            }
            Err(_timeout) => {
                warn!(addr = %self.config.server_addr, "modbus connect timed out");
                guard.state = ConnectionState::Disconnected;
                false
            }
        }
    }

    /// Tear down the connection. Idempotent.
    pub async fn disconnect(&self) {
        let mut guard = self.inner.lock().await;
        guard.stream = None;
        guard.state = ConnectionState::Disconnected;
    }

    /// Probe connectivity without requiring a subsequent read.
    pub async fn test(&self, cancel: &CancellationToken) -> bool {
        self.connect(cancel).await
    }

    /// Read `count` holding registers starting at `start`, retrying per
    /// §4.2: on any read failure the connection is dropped, `retry_delay`
    /// elapses, and a fresh connect/read attempt is made, up to
    /// `max_retries` attempts total.
    pub async fn read_registers(
        &self,
        start: u16,
        count: u16,
        cancel: &CancellationToken,
    ) -> EngineResult<ReadOutcome> {
        let started = Instant::now();
        let attempts = self.config.max_retries.max(1);
        let mut last_err = EngineError::TransportConnectFailed("no attempts made".to_string());

        for attempt in 0..attempts {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            if !self.is_connected().await && !self.connect(cancel).await {
                last_err = EngineError::TransportConnectFailed(format!(
                    "attempt {}/{attempts} failed to connect",
                    attempt + 1
                ));
                self.delay_before_retry(cancel).await;
                continue;
            }

            match self.try_read_registers(start, count, cancel).await {
                Ok(words) => {
                    return Ok(ReadOutcome {
                        words,
                        duration: started.elapsed(),
                    })
                }
                Err(e) => {
                    self.disconnect().await;
                    let cancelled = e.is_cancelled();
                    last_err = e;
                    if cancelled {
                        return Err(last_err);
                    }
                    self.delay_before_retry(cancel).await;
                }
            }
        }

        Err(last_err)
    }

    async fn delay_before_retry(&self, cancel: &CancellationToken) {
        tokio::select! {
            () = tokio::time::sleep(self.config.retry_delay) => {}
            () = cancel.cancelled() => {}
        }
    }

    async fn try_read_registers(
        &self,
        start: u16,
        count: u16,
        cancel: &CancellationToken,
    ) -> EngineResult<Vec<u16>> {
        let io_fut = self.do_read_registers(start, count);
        tokio::select! {
            r = tokio::time::timeout(self.config.read_timeout, io_fut) => {
                match r {
                    Ok(inner) => inner,
                    Err(_) => Err(EngineError::TransportReadTimeout(self.config.read_timeout)),
                }
            }
            () = cancel.cancelled() => Err(EngineError::Cancelled),
        }
    }

    async fn do_read_registers(&self, start: u16, count: u16) -> EngineResult<Vec<u16>> {
        let mut guard = self.inner.lock().await;
        let transaction_id = guard.transaction_id;
        guard.transaction_id = guard.transaction_id.wrapping_add(1);

        let stream = guard
            .stream
            .as_mut()
            .ok_or_else(|| EngineError::TransportReadFailed("not connected".to_string()))?;

        let pdu = [
            FUNCTION_READ_HOLDING_REGISTERS,
            (start >> 8) as u8,
            (start & 0xFF) as u8,
            (count >> 8) as u8,
            (count & 0xFF) as u8,
        ];
        let header = MbapHeader::new(transaction_id, pdu.len() as u16, self.config.unit_id);

        let mut request = Vec::with_capacity(MbapHeader::SIZE + pdu.len());
        request.extend_from_slice(&header.to_bytes());
        request.extend_from_slice(&pdu);

        trace!(transaction_id, "sending modbus read request");
        stream
            .write_all(&request)
            .await
            .map_err(|e| EngineError::TransportReadFailed(format!("write failed: {e}")))?;

        let mut header_buf = [0u8; MbapHeader::SIZE];
        read_exact_or_closed(stream, &mut header_buf).await?;
        let response_header = MbapHeader::from_bytes(&header_buf);

        if response_header.transaction_id != transaction_id {
            return Err(EngineError::TransportReadFailed(format!(
                "transaction id mismatch: expected {transaction_id}, got {}",
                response_header.transaction_id
            )));
        }
        if response_header.protocol_id != 0 {
            return Err(EngineError::TransportReadFailed(format!(
                "invalid protocol id: {}",
                response_header.protocol_id
            )));
        }
        if response_header.unit_id != self.config.unit_id {
            return Err(EngineError::TransportReadFailed(format!(
                "unit id mismatch: expected {}, got {}",
                self.config.unit_id, response_header.unit_id
            )));
        }

        let pdu_len = response_header
            .length
            .checked_sub(1)
            .ok_or_else(|| EngineError::TransportReadFailed("invalid response length".into()))?
            as usize;
        if pdu_len == 0 || pdu_len > 253 {
            return Err(EngineError::TransportReadFailed(format!(
                "implausible response length: {pdu_len}"
            )));
        }

        let mut pdu_buf = vec![0u8; pdu_len];
        read_exact_or_closed(stream, &mut pdu_buf).await?;

        let function = pdu_buf[0];
        if function & EXCEPTION_FLAG != 0 {
            let code = pdu_buf.get(1).copied().map(ExceptionCode::from_byte);
            return Err(EngineError::TransportReadFailed(format!(
                "modbus exception: {}",
                code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
            )));
        }
        if function != FUNCTION_READ_HOLDING_REGISTERS {
            return Err(EngineError::TransportReadFailed(format!(
                "function code mismatch: expected 0x{FUNCTION_READ_HOLDING_REGISTERS:02X}, got 0x{function:02X}"
            )));
        }

        let byte_count = *pdu_buf
            .get(1)
            .ok_or_else(|| EngineError::TransportReadFailed("response too short".to_string()))?
            as usize;
        let expected_bytes = count as usize * 2;
        if byte_count != expected_bytes {
            return Err(EngineError::TransportReadFailed(format!(
                "byte count mismatch: expected {expected_bytes}, got {byte_count}"
            )));
        }
        if pdu_buf.len() < 2 + byte_count {
            return Err(EngineError::TransportReadFailed(
                "response truncated".to_string(),
            ));
        }

        let mut registers = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let offset = 2 + i * 2;
            registers.push(u16::from_be_bytes([pdu_buf[offset], pdu_buf[offset + 1]]));
        }

        Ok(registers)
    }
}

async fn read_exact_or_closed(stream: &mut TcpStream, buf: &mut [u8]) -> EngineResult<()> {
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(EngineError::TransportClosedByPeer)
        }
        Err(e) => Err(EngineError::TransportReadFailed(e.to_string())),
    }
}

fn configure_socket(stream: &TcpStream, config: &ModbusTcpConfig) -> std::io::Result<()> {
    let sock_ref = socket2::SockRef::from(stream);
    sock_ref.set_keepalive(config.keepalive)?;
    stream.set_nodelay(config.nodelay)?;
    Ok(())
}
