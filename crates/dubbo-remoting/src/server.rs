//! Provider-side TCP server.
//!
//! Each accepted connection gets a task that frames requests and a task per
//! dispatched request, so slow methods do not hold up the connection.
//! Responses are written back through a shared writer in completion order.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use dubbo_proto::{
    Body, Codec, Package, PackageKind, ProtocolError, RemoteException, ResponsePayload,
    ResponseStatus, Service, ServiceCall, DUBBO_VERSION_KEY,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{DispatchError, RemotingError};
use crate::session::ServerPackageHandler;

/// Dispatches decoded calls to service implementations.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Handles one call.
    ///
    /// Application failures belong in [`ResponsePayload::exception`];
    /// `Err` is for calls that never reached a method (unknown service,
    /// malformed arguments) and becomes an error-status response.
    async fn handle(
        &self,
        service: Service,
        call: ServiceCall,
    ) -> Result<ResponsePayload, DispatchError>;
}

/// Provider server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_body_size: dubbo_proto::DEFAULT_MAX_BODY_SIZE,
        }
    }
}

/// Listening provider endpoint.
pub struct Server {
    listener: TcpListener,
    handler: Arc<dyn RequestHandler>,
    config: ServerConfig,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Server {
    pub async fn bind(
        addr: &str,
        handler: Arc<dyn RequestHandler>,
        config: ServerConfig,
    ) -> Result<Self, RemotingError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            handler,
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RemotingError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until `shutdown` fires.
    ///
    /// Connections already open are closed when `shutdown` fires; requests
    /// already dispatched still get their responses written if the peer is
    /// listening.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), RemotingError> {
        let local = self.local_addr()?;
        info!(address = %local, "provider listening");

        loop {
            let (stream, peer) = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };

            debug!(%peer, "connection accepted");
            let handler = Arc::clone(&self.handler);
            let config = self.config.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, handler, config, shutdown).await {
                    warn!(%peer, error = %e, error_type = e.error_type(), "connection ended with error");
                } else {
                    debug!(%peer, "connection closed");
                }
            });
        }

        info!(address = %local, "provider stopped");
        Ok(())
    }
}

struct ConnectionWriter {
    half: OwnedWriteHalf,
    handler: ServerPackageHandler,
}

impl ConnectionWriter {
    async fn send(&mut self, package: &Package) -> Result<(), RemotingError> {
        let bytes = self.handler.write(package)?;
        self.half.write_all(&bytes).await?;
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    handler: Arc<dyn RequestHandler>,
    config: ServerConfig,
    shutdown: CancellationToken,
) -> Result<(), RemotingError> {
    stream.set_nodelay(true)?;
    let (mut read, write) = stream.into_split();
    let reader = ServerPackageHandler::new(Codec::new().with_max_body_size(config.max_body_size));
    let writer = Arc::new(Mutex::new(ConnectionWriter {
        half: write,
        handler: ServerPackageHandler::new(
            Codec::with_capacity(8192).with_max_body_size(config.max_body_size),
        ),
    }));
    let mut buf = BytesMut::with_capacity(8192);

    loop {
        let n = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            n = read.read_buf(&mut buf) => n?,
        };
        if n == 0 {
            return Ok(());
        }

        loop {
            match reader.read(&buf) {
                Ok(Some((package, used))) => {
                    buf.advance(used);
                    on_package(package, &handler, &writer).await?;
                }
                Ok(None) => break,
                Err(ProtocolError::Body {
                    id,
                    frame_len,
                    source,
                }) => {
                    warn!(id, error = %source, "undecodable request body");
                    buf.advance(frame_len);
                    let reply = Package::error_response(
                        id,
                        ResponseStatus::BadRequest,
                        format!("failed to decode request: {source}"),
                    );
                    writer.lock().await.send(&reply).await?;
                }
                Err(e) => {
                    error!(error = %e, error_type = e.error_type(), "fatal protocol error, closing connection");
                    return Err(e.into());
                }
            }
        }
    }
}

async fn on_package(
    package: Package,
    handler: &Arc<dyn RequestHandler>,
    writer: &Arc<Mutex<ConnectionWriter>>,
) -> Result<(), RemotingError> {
    let id = package.id();
    match package.kind() {
        PackageKind::HeartbeatRequest => {
            debug!(id, "heartbeat received");
            writer
                .lock()
                .await
                .send(&Package::heartbeat_response(id))
                .await
        }
        PackageKind::Request => {
            let two_way = package.header.two_way;
            let Body::Call(call) = package.body else {
                warn!(id, "request without call body ignored");
                return Ok(());
            };
            let service = package.service;
            let handler = Arc::clone(handler);
            let writer = Arc::clone(writer);
            tokio::spawn(async move {
                let reply = dispatch(id, service, call, handler).await;
                if !two_way {
                    return;
                }
                if let Err(e) = writer.lock().await.send(&reply).await {
                    warn!(id, error = %e, "failed to write response");
                }
            });
            Ok(())
        }
        PackageKind::HeartbeatResponse | PackageKind::Response => {
            debug!(id, "ignoring response on provider connection");
            Ok(())
        }
    }
}

async fn dispatch(
    id: u64,
    service: Service,
    call: ServiceCall,
    handler: Arc<dyn RequestHandler>,
) -> Package {
    let dubbo_version = call.dubbo_version.clone();
    let method = service.method.clone();
    let joined = tokio::spawn(async move { handler.handle(service, call).await }).await;

    match joined {
        Ok(Ok(mut payload)) => {
            // The response attachment gate reads the caller's version,
            // whatever the handler put there.
            payload
                .attachments
                .insert(DUBBO_VERSION_KEY.to_owned(), dubbo_version);
            Package::response(id, payload)
        }
        Ok(Err(e)) => {
            debug!(id, %method, status = %e.status, "call rejected");
            Package::error_response(id, e.status, e.message)
        }
        Err(join) => {
            error!(id, %method, error = %join, "handler panicked");
            Package::response(
                id,
                ResponsePayload::exception(RemoteException::new(
                    "java.lang.RuntimeException",
                    format!("method {method} failed: {join}"),
                )),
            )
        }
    }
}
