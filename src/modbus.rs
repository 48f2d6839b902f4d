//! Fieldbus transport for Fieldgate
//!
//! [`Transport`] is the seam between device nodes and the wire. The production
//! implementation, [`ModbusTransport`], speaks Modbus TCP or RTU through
//! `tokio-modbus`, bounds every request with a timeout and reconnects lazily
//! after a connection-class failure. Nodes sharing a port share one
//! [`SharedTransport`], whose mutex serializes the half-duplex link.

pub mod mock;

pub use mock::{MockCall, MockTransport};

use crate::config::{SerialParity, TransportConfig};
use crate::error::{FieldgateError, Result};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use crate::registers::ReadCapability;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_modbus::client::{Context, rtu, tcp};
use tokio_modbus::prelude::*;

/// Register-oriented fieldbus operations used by device nodes
#[async_trait]
pub trait Transport: Send {
    /// Read `count` words starting at `start`. Coil and discrete-input reads
    /// come back as one 0/1 word per address.
    async fn read_block(
        &mut self,
        slave_id: u8,
        capability: ReadCapability,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>>;

    async fn write_single(&mut self, slave_id: u8, address: u16, word: u16) -> Result<()>;

    async fn write_multiple(&mut self, slave_id: u8, start: u16, words: &[u16]) -> Result<()>;

    /// `Some(true)` when a link is up, `None` when the transport cannot tell
    fn connection_status(&self) -> Option<bool> {
        None
    }
}

/// One transport shared by every node on a port
pub type SharedTransport = Arc<Mutex<dyn Transport>>;

/// Wrap a transport for sharing between nodes
pub fn shared<T: Transport + 'static>(transport: T) -> SharedTransport {
    Arc::new(Mutex::new(transport))
}

/// Modbus TCP/RTU client with lazy reconnect
pub struct ModbusTransport {
    /// Open connection, if any
    client: Option<Context>,

    /// Link parameters
    endpoint: TransportConfig,

    /// Connection timeout
    connection_timeout: Duration,

    /// Per-request timeout
    operation_timeout: Duration,

    /// Consecutive failed connection attempts, for log throttling
    failed_connects: u32,

    /// Logger
    logger: StructuredLogger,
}

impl ModbusTransport {
    /// Create a transport; nothing is opened until the first request
    pub fn new(port_name: &str, endpoint: &TransportConfig, operation_timeout: Duration) -> Self {
        let logger =
            get_logger_with_context(LogContext::new("modbus").with_field("port", port_name.to_string()));
        Self {
            client: None,
            endpoint: endpoint.clone(),
            connection_timeout: Duration::from_secs(5),
            operation_timeout,
            failed_connects: 0,
            logger,
        }
    }

    /// Open the link
    pub async fn connect(&mut self) -> Result<()> {
        let result = match &self.endpoint {
            TransportConfig::Tcp { host, port } => {
                connect_tcp(host, *port, self.connection_timeout).await
            }
            TransportConfig::Rtu { .. } => self.connect_rtu(),
        };

        match result {
            Ok(ctx) => {
                self.client = Some(ctx);
                if self.failed_connects > 0 {
                    self.logger.info(&format!(
                        "Link restored after {} failed attempts",
                        self.failed_connects
                    ));
                } else {
                    self.logger.info("Link opened");
                }
                self.failed_connects = 0;
                Ok(())
            }
            Err(e) => {
                self.failed_connects += 1;
                // Only the first failure of a streak is logged loudly
                if self.failed_connects == 1 {
                    self.logger.error(&format!("Cannot open link: {}", e));
                } else {
                    self.logger.debug(&format!(
                        "Cannot open link (attempt {}): {}",
                        self.failed_connects, e
                    ));
                }
                Err(e)
            }
        }
    }

    fn connect_rtu(&self) -> Result<Context> {
        let TransportConfig::Rtu {
            path,
            baud_rate,
            parity,
            data_bits,
            stop_bits,
        } = &self.endpoint
        else {
            return Err(FieldgateError::config("Not a serial endpoint"));
        };

        let builder = tokio_serial::new(path.as_str(), *baud_rate)
            .parity(match parity {
                SerialParity::None => tokio_serial::Parity::None,
                SerialParity::Even => tokio_serial::Parity::Even,
                SerialParity::Odd => tokio_serial::Parity::Odd,
            })
            .data_bits(match data_bits {
                5 => tokio_serial::DataBits::Five,
                6 => tokio_serial::DataBits::Six,
                7 => tokio_serial::DataBits::Seven,
                _ => tokio_serial::DataBits::Eight,
            })
            .stop_bits(if *stop_bits == 2 {
                tokio_serial::StopBits::Two
            } else {
                tokio_serial::StopBits::One
            })
            .timeout(self.operation_timeout);

        let stream = tokio_serial::SerialStream::open(&builder).map_err(|e| {
            FieldgateError::transport(format!("Connection to serial port {} failed: {}", path, e))
        })?;
        Ok(rtu::attach_slave(stream, Slave(1)))
    }

    /// Drop the link so the next request reconnects
    pub fn disconnect(&mut self) {
        if self.client.take().is_some() {
            self.logger.info("Link closed");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// Connected context, opening the link first if needed
    async fn context(&mut self, slave_id: u8) -> Result<&mut Context> {
        if self.client.is_none() {
            self.connect().await?;
        }
        let ctx = self
            .client
            .as_mut()
            .ok_or_else(|| FieldgateError::transport("Not connected"))?;
        ctx.set_slave(Slave(slave_id));
        Ok(ctx)
    }

    /// Serial links survive a silent slave; only I/O failures reopen them
    fn should_reconnect(&self, error: &FieldgateError) -> bool {
        match self.endpoint {
            TransportConfig::Tcp { .. } => error.is_connection_error(),
            TransportConfig::Rtu { .. } => {
                matches!(error, FieldgateError::Transport { .. }) && error.is_connection_error()
            }
        }
    }

    fn settle<T>(&mut self, operation: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.logger.debug(&format!("{} failed: {}", operation, e));
            if self.should_reconnect(e) {
                self.logger
                    .warn(&format!("Dropping link after {}: {}", operation, e));
                self.disconnect();
            }
        }
        result
    }
}

/// Resolve and connect a TCP slave within `limit`
async fn connect_tcp(host: &str, port: u16, limit: Duration) -> Result<Context> {
    let address = format!("{}:{}", host, port);
    let socket_addr = tokio::net::lookup_host(address.as_str())
        .await
        .map_err(|e| FieldgateError::transport(format!("Cannot resolve {}: {}", address, e)))?
        .next()
        .ok_or_else(|| FieldgateError::transport(format!("No address for {}", address)))?;

    match timeout(limit, tcp::connect_slave(socket_addr, Slave(1))).await {
        Ok(Ok(ctx)) => Ok(ctx),
        Ok(Err(e)) => Err(FieldgateError::transport(format!(
            "Connection to {} failed: {}",
            address, e
        ))),
        Err(_) => Err(FieldgateError::timeout(format!(
            "Connection to {} timed out",
            address
        ))),
    }
}

/// Bound a request and flatten the nested tokio-modbus result
async fn bounded<T, F>(limit: Duration, request: F) -> Result<T>
where
    F: Future<Output = tokio_modbus::Result<T>>,
{
    match timeout(limit, request).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(exception))) => Err(FieldgateError::transport(format!(
            "exception response: {:?}",
            exception
        ))),
        Ok(Err(e)) => Err(FieldgateError::from(e)),
        Err(_) => Err(FieldgateError::timeout("request timed out")),
    }
}

fn bits_to_words(bits: Vec<bool>) -> Vec<u16> {
    bits.into_iter().map(u16::from).collect()
}

#[async_trait]
impl Transport for ModbusTransport {
    async fn read_block(
        &mut self,
        slave_id: u8,
        capability: ReadCapability,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        let limit = self.operation_timeout;
        self.logger.trace(&format!(
            "Reading {} words at 0x{:04X} ({}) from slave {}",
            count, start, capability, slave_id
        ));

        let result = match self.context(slave_id).await {
            Ok(ctx) => match capability {
                ReadCapability::Coils => bounded(limit, ctx.read_coils(start, count))
                    .await
                    .map(bits_to_words),
                ReadCapability::DiscreteInputs => {
                    bounded(limit, ctx.read_discrete_inputs(start, count))
                        .await
                        .map(bits_to_words)
                }
                ReadCapability::HoldingRegisters => {
                    bounded(limit, ctx.read_holding_registers(start, count)).await
                }
                ReadCapability::InputRegisters => {
                    bounded(limit, ctx.read_input_registers(start, count)).await
                }
            },
            Err(e) => Err(e),
        };
        self.settle("read", result)
    }

    async fn write_single(&mut self, slave_id: u8, address: u16, word: u16) -> Result<()> {
        let limit = self.operation_timeout;
        self.logger.debug(&format!(
            "Writing 0x{:04X} to register 0x{:04X} on slave {}",
            word, address, slave_id
        ));

        let result = match self.context(slave_id).await {
            Ok(ctx) => bounded(limit, ctx.write_single_register(address, word)).await,
            Err(e) => Err(e),
        };
        self.settle("write single", result)
    }

    async fn write_multiple(&mut self, slave_id: u8, start: u16, words: &[u16]) -> Result<()> {
        let limit = self.operation_timeout;
        self.logger.debug(&format!(
            "Writing {} words at 0x{:04X} on slave {}",
            words.len(),
            start,
            slave_id
        ));

        let result = match self.context(slave_id).await {
            Ok(ctx) => bounded(limit, ctx.write_multiple_registers(start, words)).await,
            Err(e) => Err(e),
        };
        self.settle("write multiple", result)
    }

    fn connection_status(&self) -> Option<bool> {
        Some(self.is_connected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_starts_disconnected() {
        let endpoint = TransportConfig::Tcp {
            host: "127.0.0.1".to_string(),
            port: 502,
        };
        let transport = ModbusTransport::new("test", &endpoint, Duration::from_millis(100));
        assert!(!transport.is_connected());
        assert_eq!(transport.connection_status(), Some(false));
    }

    #[test]
    fn test_reconnect_classification() {
        let tcp = ModbusTransport::new(
            "tcp",
            &TransportConfig::Tcp {
                host: "127.0.0.1".to_string(),
                port: 502,
            },
            Duration::from_millis(100),
        );
        let rtu = ModbusTransport::new(
            "rtu",
            &TransportConfig::Rtu {
                path: "/dev/null".to_string(),
                baud_rate: 9600,
                parity: SerialParity::Even,
                data_bits: 8,
                stop_bits: 1,
            },
            Duration::from_millis(100),
        );
        let timeout = FieldgateError::timeout("request timed out");
        let broken = FieldgateError::transport("connection error: broken pipe");
        let exception = FieldgateError::transport("exception response: IllegalDataAddress");

        assert!(tcp.should_reconnect(&timeout));
        assert!(tcp.should_reconnect(&broken));
        assert!(!tcp.should_reconnect(&exception));
        assert!(!rtu.should_reconnect(&timeout));
        assert!(rtu.should_reconnect(&broken));
    }

    #[tokio::test]
    async fn test_unreachable_tcp_fails_without_panicking() {
        // Port 9 on localhost is almost never listening
        let endpoint = TransportConfig::Tcp {
            host: "127.0.0.1".to_string(),
            port: 9,
        };
        let mut transport = ModbusTransport::new("test", &endpoint, Duration::from_millis(200));
        let res = transport
            .read_block(1, ReadCapability::HoldingRegisters, 0, 2)
            .await;
        assert!(res.is_err());
        assert!(!transport.is_connected());
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_connect_opens_listening_tcp_slave() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = TransportConfig::Tcp {
            host: "127.0.0.1".to_string(),
            port: listener.local_addr().unwrap().port(),
        };
        let mut transport = ModbusTransport::new("test", &endpoint, Duration::from_millis(200));

        let connecting = transport.connect();
        assert_send(&connecting);
        connecting.await.unwrap();
        assert!(transport.is_connected());
    }
}
