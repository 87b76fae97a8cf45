//! Integration tests for [`acq_transport::ModbusTcpTransport`] against a
//! real TCP connection to a mock Modbus server.

#[path = "mock_modbus_server.rs"]
mod mock_modbus_server;

use std::time::Duration;

use acq_transport::{ModbusTcpConfig, ModbusTcpTransport};
use mock_modbus_server::{MockBehavior, MockModbusServer, RegisterBank};
use tokio_util::sync::CancellationToken;

fn config_for(addr: std::net::SocketAddr) -> ModbusTcpConfig {
    ModbusTcpConfig {
        server_addr: addr,
        unit_id: 1,
        connect_timeout: Duration::from_millis(500),
        read_timeout: Duration::from_millis(500),
        retry_delay: Duration::from_millis(20),
        max_retries: 2,
        connection_cooldown: Duration::from_millis(0),
        ..ModbusTcpConfig::default()
    }
}

#[tokio::test]
async fn reads_holding_registers_from_live_server() {
    let mut bank = RegisterBank::default();
    bank.holding_registers[0] = 0x1234;
    bank.holding_registers[1] = 0x5678;

    let server = MockModbusServer::start(MockBehavior::Normal, bank).unwrap();
    let transport = ModbusTcpTransport::new(config_for(server.local_addr()));
    let cancel = CancellationToken::new();

    let outcome = transport.read_registers(0, 2, &cancel).await.unwrap();
    assert_eq!(outcome.words, vec![0x1234, 0x5678]);
}

#[tokio::test]
async fn surfaces_modbus_exception_as_error() {
    let server =
        MockModbusServer::start(MockBehavior::Exception(0x02), RegisterBank::default()).unwrap();
    let transport = ModbusTcpTransport::new(config_for(server.local_addr()));
    let cancel = CancellationToken::new();

    let result = transport.read_registers(0, 2, &cancel).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn dropped_connection_is_retried_and_eventually_fails() {
    let server =
        MockModbusServer::start(MockBehavior::DropConnection, RegisterBank::default()).unwrap();
    let transport = ModbusTcpTransport::new(config_for(server.local_addr()));
    let cancel = CancellationToken::new();

    let result = transport.read_registers(0, 2, &cancel).await;
    assert!(result.is_err());
    assert!(!transport.is_connected().await);
}

#[tokio::test]
async fn wrong_transaction_id_is_rejected() {
    let server =
        MockModbusServer::start(MockBehavior::WrongTransactionId, RegisterBank::default())
            .unwrap();
    let transport = ModbusTcpTransport::new(config_for(server.local_addr()));
    let cancel = CancellationToken::new();

    let result = transport.read_registers(0, 1, &cancel).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn wrong_unit_id_is_rejected() {
    let server =
        MockModbusServer::start(MockBehavior::WrongUnitId, RegisterBank::default()).unwrap();
    let transport = ModbusTcpTransport::new(config_for(server.local_addr()));
    let cancel = CancellationToken::new();

    let result = transport.read_registers(0, 1, &cancel).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn corrupt_response_is_rejected() {
    let server =
        MockModbusServer::start(MockBehavior::CorruptResponse, RegisterBank::default()).unwrap();
    let transport = ModbusTcpTransport::new(config_for(server.local_addr()));
    let cancel = CancellationToken::new();

    let result = transport.read_registers(0, 4, &cancel).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn cancellation_aborts_a_pending_read() {
    let server =
        MockModbusServer::start(MockBehavior::DropConnection, RegisterBank::default()).unwrap();
    let transport = ModbusTcpTransport::new(config_for(server.local_addr()));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = transport.read_registers(0, 1, &cancel).await;
    assert!(matches!(result, Err(e) if e.is_cancelled()));
}
