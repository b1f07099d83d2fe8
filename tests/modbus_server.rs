//! Listener behaviour over real sockets, with and without fault injection.

use std::net::SocketAddr;
use std::sync::Arc;

use plant_sim::devices::layout::{bms, pcs};
use plant_sim::devices::{build_context, DeviceKind};
use plant_sim::error::ClientError;
use plant_sim::faults::FaultProfile;
use plant_sim::modbus::pdu::{parse_response, FunctionCode, Request, ResponseBody};
use plant_sim::modbus::{ClientSettings, ModbusTcpClient, ModbusTcpServer, RegisterPeer};
use plant_sim::registers::{DeviceContext, ServerContext};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

struct TestServer {
    addr: SocketAddr,
    device: Arc<DeviceContext>,
    shutdown: CancellationToken,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve(kind: DeviceKind, unit_id: u8, faults: FaultProfile) -> TestServer {
    let device = Arc::new(build_context(kind, unit_id, &[]).unwrap());
    let server = ModbusTcpServer::bind(
        "127.0.0.1:0",
        Arc::new(ServerContext::single(Arc::clone(&device))),
        faults,
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(server.run(shutdown.clone()));
    TestServer {
        addr,
        device,
        shutdown,
    }
}

fn client(server: &TestServer, unit_id: u8, settings: ClientSettings) -> ModbusTcpClient {
    ModbusTcpClient::new("test", server.addr.to_string(), unit_id, settings)
}

fn quick() -> ClientSettings {
    ClientSettings {
        connect_timeout_ms: 500,
        request_timeout_ms: 300,
        retries: 1,
    }
}

/// Read exactly one response ADU off a raw stream.
async fn read_adu(stream: &mut TcpStream) -> Vec<u8> {
    let mut header = [0u8; 6];
    stream.read_exact(&mut header).await.unwrap();
    let len = u16::from_be_bytes([header[4], header[5]]) as usize;
    let mut rest = vec![0u8; len];
    stream.read_exact(&mut rest).await.unwrap();
    [header.to_vec(), rest].concat()
}

#[tokio::test]
async fn test_write_then_read_over_tcp() {
    let server = serve(DeviceKind::Pcs, 2, FaultProfile::default()).await;
    let client = client(&server, 2, quick());

    client.write_single_register(pcs::POWER_SETPOINT, 0xFE0C).await.unwrap();
    assert_eq!(
        client.read_holding_registers(pcs::POWER_SETPOINT, 2).await.unwrap(),
        vec![0xFE0C, 0]
    );
    assert_eq!(server.device.holding().read_one(pcs::POWER_SETPOINT).unwrap(), 0xFE0C);
}

#[tokio::test]
async fn test_address_errors_are_exception_2() {
    let server = serve(DeviceKind::Pcs, 2, FaultProfile::default()).await;
    let client = client(&server, 2, quick());

    let err = client.write_single_register(10, 1).await.unwrap_err();
    assert!(matches!(err, ClientError::Exception { function: 0x06, code: 2 }));
    let err = client.read_input_registers(8, 3).await.unwrap_err();
    assert!(matches!(err, ClientError::Exception { function: 0x04, code: 2 }));
}

#[tokio::test]
async fn test_unsupported_table_rejects_read_and_write() {
    let server = serve(DeviceKind::Bms, 4, FaultProfile::default()).await;
    let client = client(&server, 4, quick());

    let err = client.read_holding_registers(0, 1).await.unwrap_err();
    assert!(matches!(err, ClientError::Exception { function: 0x03, code: 2 }));
    let err = client.write_single_register(0, 1).await.unwrap_err();
    assert!(matches!(err, ClientError::Exception { function: 0x06, code: 2 }));
    assert_eq!(client.read_input_registers(bms::SOC, 3).await.unwrap(), vec![0, 0, 0]);
}

#[tokio::test]
async fn test_coalesced_requests_and_bad_frames() {
    let server = serve(DeviceKind::Pcs, 2, FaultProfile::default()).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    let mut bad = Request::new(1, 2, FunctionCode::ReadInputRegisters, 0, 1).to_bytes();
    bad[3] = 0x07; // protocol id
    let mut wire = bad;
    wire.extend(Request::new(2, 2, FunctionCode::WriteSingleRegister, 0, 500).to_bytes());
    wire.extend(Request::new(3, 2, FunctionCode::ReadHoldingRegisters, 0, 1).to_bytes());
    stream.write_all(&wire).await.unwrap();

    let first = parse_response(&read_adu(&mut stream).await).unwrap();
    assert_eq!(first.transaction_id, 2);
    assert_eq!(first.body, ResponseBody::Written { address: 0, value: 500 });
    let second = parse_response(&read_adu(&mut stream).await).unwrap();
    assert_eq!(second.transaction_id, 3);
    assert_eq!(second.body, ResponseBody::Registers(vec![500]));
}

#[tokio::test]
async fn test_byte_by_byte_request() {
    let server = serve(DeviceKind::Pcs, 2, FaultProfile::default()).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream.set_nodelay(true).unwrap();

    for byte in Request::new(9, 2, FunctionCode::ReadInputRegisters, 0, 1).to_bytes() {
        stream.write_all(&[byte]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    let response = parse_response(&read_adu(&mut stream).await).unwrap();
    assert_eq!(response.transaction_id, 9);
    assert_eq!(response.body, ResponseBody::Registers(vec![0]));
}

#[tokio::test]
async fn test_fragmented_responses_reassemble() {
    let faults = FaultProfile {
        chunk_min: 2,
        chunk_max: 6,
        seed: Some(11),
        ..Default::default()
    };
    let server = serve(DeviceKind::Pcs, 2, faults).await;
    let client = client(&server, 2, quick());

    for value in 0..20u16 {
        client.write_single_register(1, value).await.unwrap();
        assert_eq!(client.read_holding_registers(0, 2).await.unwrap(), vec![0, value]);
    }
}

#[tokio::test]
async fn test_dropped_response_times_out() {
    let faults = FaultProfile {
        drop_rate: 1.0,
        ..Default::default()
    };
    let server = serve(DeviceKind::Pcs, 2, faults).await;
    let client = client(&server, 2, quick());

    let err = client.read_input_registers(0, 1).await.unwrap_err();
    assert!(matches!(err, ClientError::Timeout { .. }), "{err}");
}

#[tokio::test]
async fn test_forced_close_after_response() {
    let faults = FaultProfile {
        close_rate: 1.0,
        ..Default::default()
    };
    let server = serve(DeviceKind::Pcs, 2, faults).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    let mut wire = Request::new(1, 2, FunctionCode::ReadInputRegisters, 0, 1).to_bytes();
    wire.extend(Request::new(2, 2, FunctionCode::ReadInputRegisters, 0, 1).to_bytes());
    stream.write_all(&wire).await.unwrap();

    let response = parse_response(&read_adu(&mut stream).await).unwrap();
    assert_eq!(response.transaction_id, 1);
    let mut rest = Vec::new();
    let n = timeout(Duration::from_secs(2), stream.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0, "second request must not be answered");

    // Every other attempt hits a dead connection and is retried on a new one
    let client = client(
        &server,
        2,
        ClientSettings {
            retries: 3,
            ..quick()
        },
    );
    for _ in 0..3 {
        assert_eq!(client.read_input_registers(0, 1).await.unwrap(), vec![0]);
    }
}

#[tokio::test]
async fn test_bind_rejects_inverted_fault_ranges() {
    let device = Arc::new(build_context(DeviceKind::Pcs, 2, &[]).unwrap());
    let faults = FaultProfile {
        chunk_min: 6,
        chunk_max: 2,
        ..Default::default()
    };
    let err = ModbusTcpServer::bind(
        "127.0.0.1:0",
        Arc::new(ServerContext::single(device)),
        faults,
    )
    .await
    .err()
    .unwrap();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
}

#[tokio::test]
async fn test_unknown_unit_gets_no_reply() {
    let server = serve(DeviceKind::Pcs, 2, FaultProfile::default()).await;
    let err = client(&server, 7, quick())
        .read_input_registers(0, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Timeout { .. }));
}
