use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use validator::Validate;

use super::frame::AduCodec;
use super::hexdump;
use super::pdu::{build_exception, build_reply, parse_request, ExceptionCode};
use crate::faults::{FaultInjector, FaultProfile, Outcome};
use crate::registers::ServerContext;

/// Turn one complete frame into the bytes to send back.
///
/// `None` means nothing is sent: the frame did not parse, or it addressed a
/// unit this listener does not host.
pub fn respond(context: &ServerContext, frame: &[u8]) -> Option<Vec<u8>> {
    let request = match parse_request(frame) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, frame = %hexdump(frame), "skipping unparsable frame");
            return None;
        }
    };

    debug!(
        tid = request.transaction_id,
        unit = request.unit_id,
        fc = request.function_code,
        address = request.address,
        value_or_count = request.value_or_count,
        "request"
    );

    let Some(device) = context.unit(request.unit_id) else {
        warn!(unit = request.unit_id, "request for unknown unit ignored");
        return None;
    };

    let response = match device.dispatch(&request) {
        Ok(reply) => build_reply(&request, &reply).unwrap_or_else(|e| {
            warn!(error = %e, "cannot encode reply");
            build_exception(&request, ExceptionCode::ServerDeviceFailure)
        }),
        Err(e) => {
            debug!(error = %e, "request rejected");
            build_exception(&request, e.exception_code())
        }
    };
    Some(response)
}

/// Modbus TCP listener serving a [`ServerContext`].
pub struct ModbusTcpServer {
    listener: TcpListener,
    context: Arc<ServerContext>,
    faults: FaultProfile,
    connections: AtomicU64,
}

impl ModbusTcpServer {
    /// Bind the listening socket. Failure here is fatal for the device.
    ///
    /// An invalid fault profile is rejected with `InvalidInput`.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        context: Arc<ServerContext>,
        faults: FaultProfile,
    ) -> std::io::Result<Self> {
        faults
            .validate()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            context,
            faults,
            connections: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept clients until `shutdown` fires, one task per connection.
    pub async fn run(self, shutdown: CancellationToken) {
        let local = self
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".into());
        info!(addr = %local, faults = !self.faults.is_disabled(), "modbus server listening");

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let id = self.connections.fetch_add(1, Ordering::Relaxed);
                    let injector = FaultInjector::for_connection(self.faults.clone(), id);
                    let context = Arc::clone(&self.context);
                    let shutdown = shutdown.child_token();
                    tokio::spawn(async move {
                        handle_connection(stream, peer, context, injector, shutdown).await;
                    });
                }
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }
        info!(addr = %local, "modbus server stopped");
    }
}

/// Per-connection loop: read, reassemble, dispatch, inject faults, write.
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    context: Arc<ServerContext>,
    mut injector: FaultInjector,
    shutdown: CancellationToken,
) {
    info!(%peer, "client connected");
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, error = %e, "cannot disable nagle");
    }
    let (read, mut write) = stream.into_split();
    let mut frames = FramedRead::new(read, AduCodec);

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = frames.next() => next,
        };
        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                info!(%peer, error = %e, "connection reset");
                break;
            }
            None => {
                info!(%peer, "client closed connection");
                break;
            }
        };
        trace!(%peer, rx = %hexdump(&frame), "recv");

        let Some(response) = respond(&context, &frame) else {
            continue;
        };

        match injector.deliver(&mut write, &response).await {
            Ok(Outcome::Sent) => trace!(%peer, tx = %hexdump(&response), "sent"),
            Ok(Outcome::Dropped) => warn!(%peer, "response dropped by fault injection"),
            Ok(Outcome::SentThenClose) => {
                warn!(%peer, "forcing connection close");
                break;
            }
            Err(e) => {
                info!(%peer, error = %e, "write failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::pdu::{parse_response, FunctionCode, Request, ResponseBody};
    use crate::registers::{DeviceContext, TableSpec};

    fn context() -> ServerContext {
        ServerContext::single(Arc::new(
            DeviceContext::new(1, TableSpec::sized(10), TableSpec::Unsupported).unwrap(),
        ))
    }

    fn body(response: Option<Vec<u8>>) -> ResponseBody {
        parse_response(&response.unwrap()).unwrap().body
    }

    #[test]
    fn test_write_then_read_back() {
        let ctx = context();
        let write = Request::new(1, 1, FunctionCode::WriteSingleRegister, 3, 777);
        assert_eq!(
            body(respond(&ctx, &write.to_bytes())),
            ResponseBody::Written {
                address: 3,
                value: 777
            }
        );
        let read = Request::new(2, 1, FunctionCode::ReadHoldingRegisters, 3, 1);
        assert_eq!(
            body(respond(&ctx, &read.to_bytes())),
            ResponseBody::Registers(vec![777])
        );
    }

    #[test]
    fn test_out_of_range_write_is_exception_2() {
        let ctx = context();
        let write = Request::new(1, 1, FunctionCode::WriteSingleRegister, 10, 1);
        assert_eq!(
            body(respond(&ctx, &write.to_bytes())),
            ResponseBody::Exception {
                function: 0x06,
                code: 2
            }
        );
    }

    #[test]
    fn test_unsupported_table_is_exception_2() {
        let ctx = context();
        let read = Request::new(1, 1, FunctionCode::ReadInputRegisters, 0, 1);
        assert_eq!(
            body(respond(&ctx, &read.to_bytes())),
            ResponseBody::Exception {
                function: 0x04,
                code: 2
            }
        );
    }

    #[test]
    fn test_unknown_function_is_exception_1() {
        let ctx = context();
        let frame = [0x00, 0x05, 0x00, 0x00, 0x00, 0x06, 0x01, 0x10, 0x00, 0x00, 0x00, 0x01];
        assert_eq!(
            body(respond(&ctx, &frame)),
            ResponseBody::Exception {
                function: 0x10,
                code: 1
            }
        );
    }

    #[test]
    fn test_oversized_read_is_device_failure() {
        let ctx = ServerContext::single(Arc::new(
            DeviceContext::new(1, TableSpec::sized(200), TableSpec::Unsupported).unwrap(),
        ));
        let read = Request::new(1, 1, FunctionCode::ReadHoldingRegisters, 0, 126);
        assert_eq!(
            body(respond(&ctx, &read.to_bytes())),
            ResponseBody::Exception {
                function: 0x03,
                code: 4
            }
        );
    }

    #[test]
    fn test_bad_frames_and_unknown_units_get_no_reply() {
        let ctx = context();
        let mut bad = Request::new(1, 1, FunctionCode::ReadHoldingRegisters, 0, 1).to_bytes();
        bad[2] = 0x12;
        assert!(respond(&ctx, &bad).is_none());

        let other_unit = Request::new(1, 9, FunctionCode::ReadHoldingRegisters, 0, 1);
        assert!(respond(&ctx, &other_unit.to_bytes()).is_none());
    }
}
