use fieldgate::config::TransportConfig;
use fieldgate::modbus::{MockCall, MockTransport, ModbusTransport, Transport};
use fieldgate::registers::ReadCapability;
use std::time::Duration;

fn tcp(host: &str) -> TransportConfig {
    TransportConfig::Tcp {
        host: host.to_string(),
        port: 502,
    }
}

#[test]
fn modbus_transport_starts_disconnected() {
    let transport = ModbusTransport::new("lan", &tcp("127.0.0.1"), Duration::from_millis(500));
    assert!(!transport.is_connected());
    assert_eq!(transport.connection_status(), Some(false));
}

#[tokio::test]
async fn modbus_connect_invalid_address_errors() {
    let mut transport = ModbusTransport::new("lan", &tcp("bad host"), Duration::from_millis(500));
    let err = transport.connect().await.unwrap_err();
    assert!(err.to_string().contains("Cannot resolve"));
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn modbus_read_on_unreachable_serial_port_fails() {
    let endpoint = TransportConfig::Rtu {
        path: "/dev/fieldgate-does-not-exist".to_string(),
        baud_rate: 9600,
        parity: Default::default(),
        data_bits: 8,
        stop_bits: 1,
    };
    let mut transport = ModbusTransport::new("rs485", &endpoint, Duration::from_millis(200));
    let err = transport
        .read_block(1, ReadCapability::InputRegisters, 0x1012, 1)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("serial port"));
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn mock_transport_serves_register_image() {
    let mock = MockTransport::new();
    mock.set_registers(1, 0x0010, &[7, 8, 9]);
    let mut handle = mock.clone();

    let words = handle
        .read_block(1, ReadCapability::HoldingRegisters, 0x000F, 4)
        .await
        .unwrap();
    assert_eq!(words, vec![0, 7, 8, 9]);

    // Other slaves see their own image
    let words = handle
        .read_block(2, ReadCapability::HoldingRegisters, 0x0010, 1)
        .await
        .unwrap();
    assert_eq!(words, vec![0]);
    assert_eq!(mock.read_count(), 2);
}

#[tokio::test]
async fn mock_transport_bit_reads_are_normalized() {
    let mock = MockTransport::new();
    mock.set_registers(1, 0, &[0, 5, 1]);
    let mut handle = mock.clone();
    let words = handle
        .read_block(1, ReadCapability::DiscreteInputs, 0, 3)
        .await
        .unwrap();
    assert_eq!(words, vec![0, 1, 1]);
}

#[tokio::test]
async fn mock_transport_failures_and_writes() {
    let mock = MockTransport::new();
    let mut handle = mock.clone();

    mock.fail_address(0x2002);
    let err = handle.write_multiple(1, 0x2002, &[0, 3]).await.unwrap_err();
    assert!(!err.is_connection_error());

    mock.clear_failures();
    handle.write_single(1, 0xFFFF, 0x0700).await.unwrap();
    assert_eq!(mock.register(1, 0xFFFF), Some(0x0700));

    mock.set_offline(true);
    let err = handle
        .read_block(1, ReadCapability::HoldingRegisters, 0, 1)
        .await
        .unwrap_err();
    assert!(err.is_connection_error());

    assert!(matches!(
        mock.calls()[1],
        MockCall::WriteSingle {
            address: 0xFFFF,
            word: 0x0700,
            ..
        }
    ));
}
