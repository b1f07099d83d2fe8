use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::codec::FramedRead;
use tracing::{debug, trace, warn};

use super::frame::AduCodec;
use super::hexdump;
use super::pdu::{parse_response, FunctionCode, Request, ResponseBody};
use crate::error::ClientError;

/// Register access a controller needs from a peer device.
#[async_trait]
pub trait RegisterPeer: Send + Sync {
    /// Human-readable peer name for logs.
    fn name(&self) -> &str;

    async fn read_input_registers(&self, address: u16, count: u16) -> Result<Vec<u16>, ClientError>;

    async fn read_holding_registers(&self, address: u16, count: u16)
        -> Result<Vec<u16>, ClientError>;

    async fn write_single_register(&self, address: u16, value: u16) -> Result<(), ClientError>;
}

/// Bounds on one outbound round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Attempts per request, at least one.
    pub retries: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 1000,
            request_timeout_ms: 1000,
            retries: 2,
        }
    }
}

impl ClientSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

struct Connection {
    frames: FramedRead<OwnedReadHalf, AduCodec>,
    writer: OwnedWriteHalf,
}

/// Modbus TCP client for one unit on one peer.
///
/// Connects lazily, drops the connection after any transport failure and
/// reconnects on the next attempt.
#[derive(Clone)]
pub struct ModbusTcpClient {
    name: String,
    addr: String,
    unit_id: u8,
    settings: ClientSettings,
    connection: Arc<Mutex<Option<Connection>>>,
    next_transaction: Arc<AtomicU16>,
}

impl std::fmt::Debug for ModbusTcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusTcpClient")
            .field("name", &self.name)
            .field("addr", &self.addr)
            .field("unit_id", &self.unit_id)
            .finish()
    }
}

impl ModbusTcpClient {
    pub fn new(
        name: impl Into<String>,
        addr: impl Into<String>,
        unit_id: u8,
        settings: ClientSettings,
    ) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            unit_id,
            settings,
            connection: Arc::new(Mutex::new(None)),
            next_transaction: Arc::new(AtomicU16::new(1)),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    async fn connect(&self) -> Result<Connection, ClientError> {
        debug!(peer = %self.name, addr = %self.addr, "connecting");
        let stream = timeout(self.settings.connect_timeout(), TcpStream::connect(&self.addr))
            .await
            .map_err(|_| ClientError::ConnectTimeout {
                addr: self.addr.clone(),
                timeout: self.settings.connect_timeout(),
            })?
            .map_err(|source| self.io_error(source))?;
        stream.set_nodelay(true).map_err(|source| self.io_error(source))?;
        let (read, writer) = stream.into_split();
        Ok(Connection {
            frames: FramedRead::new(read, AduCodec),
            writer,
        })
    }

    fn io_error(&self, source: std::io::Error) -> ClientError {
        ClientError::Io {
            addr: self.addr.clone(),
            source,
        }
    }

    async fn round_trip(
        &self,
        conn: &mut Connection,
        request: &Request,
    ) -> Result<ResponseBody, ClientError> {
        let bytes = request.to_bytes();
        trace!(peer = %self.name, tx = %hexdump(&bytes), "send");
        conn.writer
            .write_all(&bytes)
            .await
            .map_err(|source| self.io_error(source))?;

        let wait = async {
            loop {
                let frame = match conn.frames.next().await {
                    Some(Ok(frame)) => frame,
                    Some(Err(source)) => return Err(self.io_error(source)),
                    None => {
                        return Err(ClientError::Closed {
                            addr: self.addr.clone(),
                        })
                    }
                };
                trace!(peer = %self.name, rx = %hexdump(&frame), "recv");
                let response = match parse_response(&frame) {
                    Ok(response) => response,
                    Err(e) => return Err(ClientError::Parse(e)),
                };
                if response.transaction_id != request.transaction_id {
                    debug!(
                        peer = %self.name,
                        expected = request.transaction_id,
                        got = response.transaction_id,
                        "discarding stale response"
                    );
                    continue;
                }
                if response.unit_id != request.unit_id {
                    return Err(ClientError::UnexpectedResponse(format!(
                        "unit {} answered for unit {}",
                        response.unit_id, request.unit_id
                    )));
                }
                return Ok(response.body);
            }
        };

        timeout(self.settings.request_timeout(), wait)
            .await
            .map_err(|_| ClientError::Timeout {
                addr: self.addr.clone(),
                timeout: self.settings.request_timeout(),
            })?
    }

    /// Send one request with retry. Transport failures reset the connection;
    /// exception responses are returned immediately.
    async fn execute(
        &self,
        function: FunctionCode,
        address: u16,
        value_or_count: u16,
    ) -> Result<ResponseBody, ClientError> {
        let max_attempts = self.settings.retries.max(1);

        for attempt in 1..=max_attempts {
            let request = Request::new(
                self.next_transaction.fetch_add(1, Ordering::Relaxed),
                self.unit_id,
                function,
                address,
                value_or_count,
            );

            let mut guard = self.connection.lock().await;
            let result = match guard.as_mut() {
                Some(conn) => self.round_trip(conn, &request).await,
                None => match self.connect().await {
                    Ok(conn) => {
                        let conn = guard.insert(conn);
                        self.round_trip(conn, &request).await
                    }
                    Err(e) => Err(e),
                },
            };

            match result {
                Ok(body) => {
                    if attempt > 1 {
                        debug!(peer = %self.name, attempt, "request succeeded after retry");
                    }
                    return Ok(body);
                }
                Err(e) if e.is_transient() => {
                    *guard = None;
                    warn!(peer = %self.name, attempt, error = %e, "modbus request failed");
                    if attempt == max_attempts {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }

            // Release lock before sleeping
            drop(guard);
            tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
        }

        unreachable!("retry loop returns on the last attempt")
    }

    async fn read(
        &self,
        function: FunctionCode,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, ClientError> {
        match self.execute(function, address, count).await? {
            ResponseBody::Registers(values) if values.len() == count as usize => Ok(values),
            ResponseBody::Registers(values) => Err(ClientError::UnexpectedResponse(format!(
                "asked for {count} registers, got {}",
                values.len()
            ))),
            ResponseBody::Exception { function, code } => {
                Err(ClientError::Exception { function, code })
            }
            other => Err(ClientError::UnexpectedResponse(format!("{other:?}"))),
        }
    }
}

#[async_trait]
impl RegisterPeer for ModbusTcpClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_input_registers(&self, address: u16, count: u16) -> Result<Vec<u16>, ClientError> {
        self.read(FunctionCode::ReadInputRegisters, address, count)
            .await
    }

    async fn read_holding_registers(
        &self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, ClientError> {
        self.read(FunctionCode::ReadHoldingRegisters, address, count)
            .await
    }

    async fn write_single_register(&self, address: u16, value: u16) -> Result<(), ClientError> {
        match self
            .execute(FunctionCode::WriteSingleRegister, address, value)
            .await?
        {
            ResponseBody::Written {
                address: echoed_address,
                value: echoed_value,
            } if echoed_address == address && echoed_value == value => Ok(()),
            ResponseBody::Exception { function, code } => {
                Err(ClientError::Exception { function, code })
            }
            other => Err(ClientError::UnexpectedResponse(format!("{other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn fast() -> ClientSettings {
        ClientSettings {
            connect_timeout_ms: 200,
            request_timeout_ms: 200,
            retries: 1,
        }
    }

    #[tokio::test]
    async fn test_unreachable_peer_fails_fast() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = ModbusTcpClient::new("gone", addr.to_string(), 1, fast());
        let err = client.read_input_registers(0, 1).await.unwrap_err();
        assert!(err.is_transient(), "{err}");
    }

    #[tokio::test]
    async fn test_stale_responses_are_skipped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 12];
            stream.read_exact(&mut request).await.unwrap();
            let tid = u16::from_be_bytes([request[0], request[1]]);
            // A late reply to an older transaction, then the real one.
            let stale = tid.wrapping_sub(1).to_be_bytes();
            let fresh = tid.to_be_bytes();
            let mut wire = vec![stale[0], stale[1], 0, 0, 0, 5, 1, 0x04, 0x02, 0x00, 0x01];
            wire.extend_from_slice(&[fresh[0], fresh[1], 0, 0, 0, 5, 1, 0x04, 0x02, 0x00, 0x32]);
            stream.write_all(&wire).await.unwrap();
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest).await;
        });

        let client = ModbusTcpClient::new("peer", addr.to_string(), 1, fast());
        assert_eq!(client.read_input_registers(0, 1).await.unwrap(), vec![50]);
    }

    #[tokio::test]
    async fn test_exception_is_not_retried() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 12];
            while stream.read_exact(&mut request).await.is_ok() {
                let reply = [request[0], request[1], 0, 0, 0, 3, request[6], request[7] | 0x80, 0x02];
                stream.write_all(&reply).await.unwrap();
            }
        });

        let client = ModbusTcpClient::new(
            "peer",
            addr.to_string(),
            1,
            ClientSettings {
                retries: 3,
                ..fast()
            },
        );
        let err = client.write_single_register(99, 1).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Exception {
                function: 0x06,
                code: 0x02
            }
        ));
    }
}
