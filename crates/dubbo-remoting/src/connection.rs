//! A single consumer-side TCP connection.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use dubbo_proto::{Codec, Package, PackageKind, ProtocolError, ResponseStatus};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::RemotingError;
use crate::exchange::PendingResponses;
use crate::session::ClientPackageHandler;

const READ_BUFFER_SIZE: usize = 8192;

struct Writer {
    half: OwnedWriteHalf,
    handler: ClientPackageHandler,
}

/// Connection to one provider.
///
/// A reader task owns the read half and resolves pending responses as
/// frames arrive. Writes are serialised through an async mutex. When the
/// reader stops, every request still pending on the owning client is
/// failed with [`RemotingError::Closed`].
pub struct Connection {
    addr: String,
    writer: Mutex<Writer>,
    closed: CancellationToken,
    last_read: parking_lot::Mutex<Instant>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Connects to `addr` and starts the reader task.
    pub async fn connect(
        addr: &str,
        connect_timeout: Duration,
        max_body_size: usize,
        pending: Arc<PendingResponses>,
    ) -> Result<Arc<Self>, RemotingError> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| RemotingError::ConnectTimeout {
                addr: addr.to_owned(),
                after: connect_timeout,
            })?
            .map_err(|source| RemotingError::Connect {
                addr: addr.to_owned(),
                source,
            })?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();

        let conn = Arc::new(Self {
            addr: addr.to_owned(),
            writer: Mutex::new(Writer {
                half: write,
                handler: ClientPackageHandler::new(
                    Codec::with_capacity(READ_BUFFER_SIZE).with_max_body_size(max_body_size),
                ),
            }),
            closed: CancellationToken::new(),
            last_read: parking_lot::Mutex::new(Instant::now()),
        });

        let handler =
            ClientPackageHandler::new(Codec::new().with_max_body_size(max_body_size));
        tokio::spawn(read_loop(Arc::clone(&conn), read, handler, pending));

        debug!(addr, "connection established");
        Ok(conn)
    }

    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Serialises and writes one package.
    ///
    /// A write failure closes the connection.
    pub async fn write(&self, package: &Package) -> Result<(), RemotingError> {
        if self.is_closed() {
            return Err(RemotingError::Closed(self.addr.clone()));
        }

        let mut writer = self.writer.lock().await;
        let bytes = writer.handler.write(package)?;
        if let Err(e) = writer.half.write_all(&bytes).await {
            warn!(addr = %self.addr, error = %e, "write failed, closing connection");
            self.close();
            return Err(e.into());
        }
        Ok(())
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection has closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Time since the last frame was read.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_read.lock().elapsed()
    }

    fn touch(&self) {
        *self.last_read.lock() = Instant::now();
    }
}

async fn read_loop(
    conn: Arc<Connection>,
    mut read: OwnedReadHalf,
    handler: ClientPackageHandler,
    pending: Arc<PendingResponses>,
) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    'outer: loop {
        let n = tokio::select! {
            () = conn.closed.cancelled() => break,
            n = read.read_buf(&mut buf) => n,
        };
        match n {
            Ok(0) => {
                debug!(addr = %conn.addr, "connection closed by peer");
                break;
            }
            Ok(_) => conn.touch(),
            Err(e) => {
                warn!(addr = %conn.addr, error = %e, "read failed");
                break;
            }
        }

        loop {
            match handler.read(&buf, &pending) {
                Ok(Some((package, used))) => {
                    buf.advance(used);
                    on_package(&conn, &pending, package).await;
                }
                Ok(None) => break,
                Err(ProtocolError::Body {
                    id,
                    frame_len,
                    source,
                }) => {
                    warn!(addr = %conn.addr, id, error = %source, "undecodable response body");
                    pending.complete(
                        id,
                        Err(RemotingError::Decode {
                            id,
                            message: source.to_string(),
                        }),
                    );
                    buf.advance(frame_len);
                }
                Err(e) => {
                    error!(
                        addr = %conn.addr,
                        error = %e,
                        error_type = e.error_type(),
                        "fatal protocol error, closing connection"
                    );
                    break 'outer;
                }
            }
        }
    }

    conn.close();
    let failed = pending.fail_all(|| RemotingError::Closed(conn.addr.clone()));
    if failed > 0 {
        warn!(addr = %conn.addr, failed, "failed pending requests on closed connection");
    }
}

async fn on_package(conn: &Connection, pending: &PendingResponses, mut package: Package) {
    let id = package.id();
    match package.kind() {
        PackageKind::Response => {
            let payload = package.take_response().unwrap_or_default();
            let result = if package.header.is_ok() {
                Ok(payload)
            } else {
                Err(RemotingError::Status {
                    status: package
                        .header
                        .response_status()
                        .unwrap_or(ResponseStatus::BadResponse),
                    message: payload.exception.map(|e| e.message).unwrap_or_default(),
                })
            };
            pending.complete(id, result);
        }
        PackageKind::HeartbeatResponse => {
            debug!(addr = %conn.addr, id, "heartbeat acknowledged");
            pending.complete(id, Ok(dubbo_proto::ResponsePayload::default()));
        }
        PackageKind::HeartbeatRequest => {
            if let Err(e) = conn.write(&Package::heartbeat_response(id)).await {
                warn!(addr = %conn.addr, id, error = %e, "failed to answer heartbeat");
            }
        }
        PackageKind::Request => {
            warn!(addr = %conn.addr, id, "unexpected request on consumer connection");
        }
    }
}
