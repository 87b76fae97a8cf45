//! Mock Modbus TCP server for integration testing.
//!
//! Provides a configurable TCP server that speaks the Modbus TCP protocol,
//! allowing integration tests to verify client behavior against a real
//! network connection with controllable fault injection.
//!
//! # Example
//!
//! ```ignore
//! use mock_modbus_server::{MockBehavior, MockModbusServer};
//!
//! let server = MockModbusServer::start(MockBehavior::Normal).unwrap();
//! let addr = server.local_addr();
//! ```

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

const FUNCTION_READ_HOLDING_REGISTERS: u8 = 0x03;
const EXCEPTION_FLAG: u8 = 0x80;

/// Configurable behavior for the mock server, for fault injection testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    /// Respond correctly to every request.
    Normal,
    /// Return a Modbus exception response with the given code.
    Exception(u8),
    /// Accept the connection, receive the request, then drop it without replying.
    DropConnection,
    /// Reply with a response body shorter than the declared byte count.
    CorruptResponse,
    /// Reply with a transaction id that does not match the request.
    WrongTransactionId,
    /// Reply with a unit id that does not match the request.
    WrongUnitId,
}

/// Backing store for holding registers the mock server serves reads from.
#[derive(Debug, Clone)]
pub struct RegisterBank {
    pub holding_registers: [u16; 256],
}

impl Default for RegisterBank {
    fn default() -> Self {
        Self {
            holding_registers: [0; 256],
        }
    }
}

/// A running mock Modbus TCP server.
pub struct MockModbusServer {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MockModbusServer {
    /// Start a server on an OS-assigned port with the given register bank
    /// and fault-injection behavior.
    pub fn start(behavior: MockBehavior, bank: RegisterBank) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let bank = Arc::new(Mutex::new(bank));

        let thread_shutdown = Arc::clone(&shutdown);
        let handle = thread::spawn(move || {
            while !thread_shutdown.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        let bank = Arc::clone(&bank);
                        handle_connection(stream, behavior, &bank);
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(std::time::Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            addr,
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for MockModbusServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn handle_connection(mut stream: TcpStream, behavior: MockBehavior, bank: &Mutex<RegisterBank>) {
    stream
        .set_read_timeout(Some(std::time::Duration::from_secs(2)))
        .ok();

    loop {
        let mut header = [0u8; 7];
        if stream.read_exact(&mut header).is_err() {
            return;
        }
        let transaction_id = u16::from_be_bytes([header[0], header[1]]);
        let length = u16::from_be_bytes([header[4], header[5]]);
        let unit_id = header[6];

        let mut pdu = vec![0u8; length as usize - 1];
        if stream.read_exact(&mut pdu).is_err() {
            return;
        }

        if behavior == MockBehavior::DropConnection {
            return;
        }

        let response = build_response(transaction_id, unit_id, &pdu, behavior, bank);
        if stream.write_all(&response).is_err() {
            return;
        }
    }
}

fn build_response(
    transaction_id: u16,
    unit_id: u8,
    pdu: &[u8],
    behavior: MockBehavior,
    bank: &Mutex<RegisterBank>,
) -> Vec<u8> {
    let resp_transaction_id = match behavior {
        MockBehavior::WrongTransactionId => transaction_id.wrapping_add(1),
        _ => transaction_id,
    };
    let resp_unit_id = match behavior {
        MockBehavior::WrongUnitId => unit_id.wrapping_add(1),
        _ => unit_id,
    };

    let pdu_bytes = if let MockBehavior::Exception(code) = behavior {
        vec![pdu[0] | EXCEPTION_FLAG, code]
    } else if pdu[0] == FUNCTION_READ_HOLDING_REGISTERS {
        let start = u16::from_be_bytes([pdu[1], pdu[2]]) as usize;
        let count = u16::from_be_bytes([pdu[3], pdu[4]]) as usize;
        let guard = bank.lock().unwrap();
        let mut body = vec![FUNCTION_READ_HOLDING_REGISTERS, (count * 2) as u8];
        for reg in &guard.holding_registers[start..start + count] {
            body.extend_from_slice(&reg.to_be_bytes());
        }
        if behavior == MockBehavior::CorruptResponse {
            body.truncate(body.len().saturating_sub(1));
        }
        body
    } else {
        vec![pdu[0] | EXCEPTION_FLAG, 0x01]
    };

    let mut response = Vec::with_capacity(7 + pdu_bytes.len());
    response.extend_from_slice(&resp_transaction_id.to_be_bytes());
    response.extend_from_slice(&0u16.to_be_bytes());
    response.extend_from_slice(&((pdu_bytes.len() + 1) as u16).to_be_bytes());
    response.push(resp_unit_id);
    response.extend_from_slice(&pdu_bytes);
    response
}
