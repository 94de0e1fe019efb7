//! The dubbo protocol: referring remote services and exporting local ones.
//!
//! [`DubboProtocol::refer`] connects an [`ExchangeClient`] to the provider
//! named by a URL and returns a [`DubboInvoker`] wrapped in the URL's
//! `reference.filter` chain. [`DubboProtocol::export`] registers method
//! handlers in a [`ServiceMap`], wraps them in the `service.filter` chain and
//! makes sure a [`Server`] is listening on the URL's address.

mod dubbo_invoker;
mod service_map;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use dubbo_remoting::{ClientConfig, ExchangeClient, RequestHandler, Server, ServerConfig};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::RpcError;
use crate::filter::FilterRegistry;
use crate::invoker::Invoker;
use crate::url::{Url, REFERENCE_FILTER_KEY, SERVICE_FILTER_KEY};

pub use dubbo_invoker::DubboInvoker;
pub use service_map::{
    handler_fn, FnHandler, MethodHandler, ProviderDispatcher, ProviderInvoker, ServiceMap,
};

/// URL key for the idle period after which a heartbeat is sent, in ms.
pub const HEARTBEAT_KEY: &str = "heartbeat";
pub const CONNECT_TIMEOUT_KEY: &str = "connect.timeout";

struct Listener {
    local: SocketAddr,
    shutdown: CancellationToken,
}

/// Consumer and provider side of the dubbo protocol.
pub struct DubboProtocol {
    filters: Arc<FilterRegistry>,
    client_config: ClientConfig,
    server_config: ServerConfig,
    services: Arc<ServiceMap>,
    dispatcher: Arc<ProviderDispatcher>,
    listeners: tokio::sync::Mutex<HashMap<String, Listener>>,
    referred: Mutex<Vec<Arc<dyn Invoker>>>,
}

impl DubboProtocol {
    #[must_use]
    pub fn new(filters: Arc<FilterRegistry>) -> Self {
        Self {
            filters,
            client_config: ClientConfig::default(),
            server_config: ServerConfig::default(),
            services: Arc::new(ServiceMap::new()),
            dispatcher: Arc::new(ProviderDispatcher::new()),
            listeners: tokio::sync::Mutex::new(HashMap::new()),
            referred: Mutex::new(Vec::new()),
        }
    }

    /// Base settings for consumer connections. URL params override the
    /// heartbeat period and connect timeout.
    #[must_use]
    pub fn with_client_config(mut self, config: ClientConfig) -> Self {
        self.client_config = config;
        self
    }

    #[must_use]
    pub fn with_server_config(mut self, config: ServerConfig) -> Self {
        self.server_config = config;
        self
    }

    #[must_use]
    pub fn services(&self) -> &Arc<ServiceMap> {
        &self.services
    }

    fn client_config_for(&self, url: &Url) -> ClientConfig {
        let base = &self.client_config;
        ClientConfig {
            connect_timeout: url.param_duration_ms(CONNECT_TIMEOUT_KEY, base.connect_timeout),
            heartbeat_period: url.param_duration_ms(HEARTBEAT_KEY, base.heartbeat_period),
            ..base.clone()
        }
    }

    /// Connects to the provider at `url` and returns its filtered invoker.
    ///
    /// # Errors
    ///
    /// Fails when the connection cannot be established or the URL names an
    /// unknown filter.
    pub async fn refer(&self, url: Url) -> Result<Arc<dyn Invoker>, RpcError> {
        let client = ExchangeClient::connect(&url.address(), self.client_config_for(&url)).await?;
        let terminal: Arc<dyn Invoker> = Arc::new(DubboInvoker::new(url.clone(), client));

        let chain = match self
            .filters
            .build_chain(Arc::clone(&terminal), url.param_or(REFERENCE_FILTER_KEY, ""))
        {
            Ok(chain) => chain,
            Err(e) => {
                terminal.destroy();
                return Err(e);
            }
        };

        info!(url = %url.key(), service = %url.service_key(), "reference created");
        self.referred.lock().push(Arc::clone(&chain));
        Ok(chain)
    }

    /// Exports `methods` under the service key of `url`.
    ///
    /// A server is started on `url`'s address unless one is already
    /// listening there. The returned exporter's URL carries the bound port.
    ///
    /// # Errors
    ///
    /// Fails when the URL names an unknown filter or the address cannot be
    /// bound.
    pub async fn export(
        &self,
        url: Url,
        methods: impl IntoIterator<Item = (String, Arc<dyn MethodHandler>)>,
    ) -> Result<Exporter, RpcError> {
        let key = url.service_key();
        let terminal: Arc<dyn Invoker> =
            Arc::new(ProviderInvoker::new(url.clone(), Arc::clone(&self.services)));
        let chain = self
            .filters
            .build_chain(terminal, url.param_or(SERVICE_FILTER_KEY, ""))?;

        let local = self.ensure_listener(&url.address()).await?;
        for (method, handler) in methods {
            self.services.register(key.clone(), method, handler);
        }
        self.dispatcher.insert(key.clone(), Arc::clone(&chain));

        let url = url.with_port(local.port());
        info!(service = %key, address = %local, methods = ?self.services.method_names(&key), "service exported");
        Ok(Exporter {
            key,
            url,
            invoker: chain,
            services: Arc::clone(&self.services),
            dispatcher: Arc::clone(&self.dispatcher),
        })
    }

    async fn ensure_listener(&self, address: &str) -> Result<SocketAddr, RpcError> {
        let mut listeners = self.listeners.lock().await;
        if let Some(listener) = listeners.get(address) {
            return Ok(listener.local);
        }

        let handler: Arc<dyn RequestHandler> = self.dispatcher.clone();
        let server = Server::bind(address, handler, self.server_config.clone()).await?;
        let local = server.local_addr()?;
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve(token).await {
                warn!(address = %local, error = %e, "provider server stopped with error");
            }
        });

        listeners.insert(address.to_owned(), Listener { local, shutdown });
        Ok(local)
    }

    /// Stops every server and destroys every referred invoker.
    pub async fn destroy(&self) {
        for (_, listener) in self.listeners.lock().await.drain() {
            listener.shutdown.cancel();
        }
        for invoker in self.referred.lock().drain(..) {
            invoker.destroy();
        }
        info!("dubbo protocol destroyed");
    }
}

/// Handle to an exported service.
pub struct Exporter {
    key: String,
    url: Url,
    invoker: Arc<dyn Invoker>,
    services: Arc<ServiceMap>,
    dispatcher: Arc<ProviderDispatcher>,
}

impl Exporter {
    #[must_use]
    pub fn service_key(&self) -> &str {
        &self.key
    }

    /// The export URL with the port actually bound.
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    #[must_use]
    pub fn invoker(&self) -> &Arc<dyn Invoker> {
        &self.invoker
    }

    /// Stops routing calls to this service. Calls already dispatched finish.
    pub fn unexport(&self) {
        self.dispatcher.remove(&self.key);
        self.services.remove_service(&self.key);
        self.invoker.destroy();
        info!(service = %self.key, "service unexported");
    }
}
