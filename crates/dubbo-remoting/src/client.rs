//! Exchange client: request/response semantics over a reconnecting
//! connection.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dubbo_proto::{Package, ResponsePayload, ReturnType, DEFAULT_MAX_BODY_SIZE};
use parking_lot::RwLock;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::RemotingError;
use crate::exchange::{PendingResponse, PendingResponses, ResponseCallback, SequenceGenerator};
use crate::reconnect::{Reconnect, ReconnectPolicy, ReconnectSupervisor};

/// Client connection settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    /// Default per-request timeout when the caller gives none.
    pub request_timeout: Duration,
    /// Heartbeat is sent after this much read inactivity. Zero disables it.
    pub heartbeat_period: Duration,
    pub max_body_size: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(3),
            heartbeat_period: Duration::from_secs(60),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Request/response client for one provider address.
///
/// Cloning is cheap and clones share the connection, the id sequence and
/// the pending map. Dropping the last clone closes the connection and stops
/// the background tasks, as [`close`](Self::close) does.
#[derive(Debug, Clone)]
pub struct ExchangeClient {
    inner: Arc<Inner>,
    // `None` for the handles owned by background tasks.
    guard: Option<Arc<DropGuard>>,
}

#[derive(Debug)]
struct Inner {
    addr: String,
    config: ClientConfig,
    sequence: SequenceGenerator,
    pending: Arc<PendingResponses>,
    connection: RwLock<Option<Arc<Connection>>>,
    shutdown: CancellationToken,
}

impl ExchangeClient {
    /// Connects to `addr` and starts the heartbeat and reconnect tasks.
    pub async fn connect(addr: &str, config: ClientConfig) -> Result<Self, RemotingError> {
        let pending = Arc::new(PendingResponses::new());
        let conn = Connection::connect(
            addr,
            config.connect_timeout,
            config.max_body_size,
            Arc::clone(&pending),
        )
        .await?;

        let shutdown = CancellationToken::new();
        let client = Self {
            inner: Arc::new(Inner {
                addr: addr.to_owned(),
                config,
                sequence: SequenceGenerator::new(),
                pending,
                connection: RwLock::new(Some(conn)),
                shutdown: shutdown.clone(),
            }),
            guard: Some(Arc::new(shutdown.drop_guard())),
        };

        if !client.inner.config.heartbeat_period.is_zero() {
            tokio::spawn(heartbeat_loop(client.detached()));
        }
        let supervisor = ReconnectSupervisor::new(client.inner.config.reconnect.clone());
        tokio::spawn(supervisor.run(
            Arc::new(client.detached()),
            client.inner.shutdown.clone(),
        ));
        let inner = Arc::clone(&client.inner);
        tokio::spawn(async move {
            inner.shutdown.cancelled().await;
            inner.close_connection();
        });

        info!(addr, "exchange client connected");
        Ok(client)
    }

    /// A handle that does not keep the client alive.
    fn detached(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            guard: None,
        }
    }

    #[must_use]
    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Whether a live connection is currently held.
    #[must_use]
    pub fn is_available(&self) -> bool {
        !self.inner.shutdown.is_cancelled()
            && self
                .inner
                .connection
                .read()
                .as_ref()
                .is_some_and(|c| !c.is_closed())
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    fn connection(&self) -> Result<Arc<Connection>, RemotingError> {
        self.inner
            .connection
            .read()
            .as_ref()
            .filter(|c| !c.is_closed())
            .cloned()
            .ok_or_else(|| RemotingError::Closed(self.inner.addr.clone()))
    }

    /// Sends a two-way request and waits for its response.
    ///
    /// On timeout the pending entry is removed; a response arriving later is
    /// logged and dropped by the reader.
    pub async fn request(
        &self,
        mut package: Package,
        reply: ReturnType,
        timeout: Duration,
    ) -> Result<ResponsePayload, RemotingError> {
        let conn = self.connection()?;
        let id = self.inner.sequence.next_id();
        package.header.id = id;
        package.header.two_way = true;

        let (entry, mut rx) = PendingResponse::waiter(id, reply);
        self.inner.pending.insert(entry);
        if let Err(e) = conn.write(&package).await {
            self.inner.pending.remove(id);
            return Err(e);
        }
        debug!(id, method = %package.service.method, "request sent");

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RemotingError::Closed(self.inner.addr.clone())),
            Err(_) => {
                if self.inner.pending.remove(id).is_none() {
                    // Completed while the timer fired.
                    if let Ok(result) = rx.try_recv() {
                        return result;
                    }
                }
                warn!(id, ?timeout, "request timed out");
                Err(RemotingError::Timeout { id, after: timeout })
            }
        }
    }

    /// Sends a two-way request whose outcome is delivered to `callback`.
    ///
    /// The callback runs on the connection's reader task, or on a timer task
    /// with [`RemotingError::Timeout`] if no response arrives in time.
    pub async fn request_async(
        &self,
        mut package: Package,
        reply: ReturnType,
        timeout: Duration,
        callback: ResponseCallback,
    ) -> Result<u64, RemotingError> {
        let conn = self.connection()?;
        let id = self.inner.sequence.next_id();
        package.header.id = id;
        package.header.two_way = true;

        self.inner
            .pending
            .insert(PendingResponse::callback(id, reply, callback));
        if let Err(e) = conn.write(&package).await {
            // The callback is dropped uncalled; the caller sees the error.
            self.inner.pending.remove(id);
            return Err(e);
        }

        let pending = Arc::clone(&self.inner.pending);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(entry) = pending.remove(id) {
                warn!(id, ?timeout, "async request timed out");
                entry.complete(Err(RemotingError::Timeout { id, after: timeout }));
            }
        });
        Ok(id)
    }

    /// Sends a one-way request. Returns once the frame is written.
    pub async fn send_oneway(&self, mut package: Package) -> Result<(), RemotingError> {
        let conn = self.connection()?;
        package.header.id = self.inner.sequence.next_id();
        package.header.two_way = false;
        conn.write(&package).await
    }

    /// Sends a heartbeat and waits for the echo. Returns the round trip.
    pub async fn heartbeat(&self) -> Result<Duration, RemotingError> {
        let conn = self.connection()?;
        let id = self.inner.sequence.next_id();
        let start = Instant::now();

        let (entry, rx) = PendingResponse::waiter(id, ReturnType::Any);
        self.inner.pending.insert(entry);
        if let Err(e) = conn.write(&Package::heartbeat_request(id)).await {
            self.inner.pending.remove(id);
            return Err(e);
        }

        let timeout = self.inner.config.request_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result.map(|_| start.elapsed()),
            Ok(Err(_)) => Err(RemotingError::Closed(self.inner.addr.clone())),
            Err(_) => {
                self.inner.pending.remove(id);
                Err(RemotingError::Timeout { id, after: timeout })
            }
        }
    }

    /// Closes the connection and stops the background tasks.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.close_connection();
    }
}

impl Inner {
    fn close_connection(&self) {
        if let Some(conn) = self.connection.write().take() {
            conn.close();
            info!(addr = %self.addr, "exchange client closed");
        }
    }
}

#[async_trait]
impl Reconnect for ExchangeClient {
    fn target(&self) -> &str {
        &self.inner.addr
    }

    async fn closed(&self) {
        let conn = self.inner.connection.read().clone();
        if let Some(conn) = conn {
            conn.closed().await;
        }
    }

    async fn reconnect(&self) -> Result<(), RemotingError> {
        let conn = Connection::connect(
            &self.inner.addr,
            self.inner.config.connect_timeout,
            self.inner.config.max_body_size,
            Arc::clone(&self.inner.pending),
        )
        .await?;
        if self.inner.shutdown.is_cancelled() {
            conn.close();
            return Err(RemotingError::Closed(self.inner.addr.clone()));
        }
        *self.inner.connection.write() = Some(conn);
        Ok(())
    }
}

async fn heartbeat_loop(client: ExchangeClient) {
    let period = client.inner.config.heartbeat_period;
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = client.inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Ok(conn) = client.connection() else {
            continue;
        };
        if conn.idle_for() < period {
            continue;
        }
        match client.heartbeat().await {
            Ok(rtt) => debug!(addr = %client.inner.addr, ?rtt, "heartbeat"),
            Err(e) => {
                warn!(addr = %client.inner.addr, error = %e, "heartbeat failed, closing connection");
                conn.close();
            }
        }
    }
}
