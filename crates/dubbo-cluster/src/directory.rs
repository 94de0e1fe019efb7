//! The invokers of one referenced service.
//!
//! [`StaticDirectory`] holds a fixed list. [`RegistryDirectory`] follows a
//! stream of [`ServiceEvent`]s, referring to providers as they appear and
//! destroying them as they leave.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dubbo_rpc::{DubboProtocol, Invocation, Invoker, RpcError, Url};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::router::Router;

/// Source of the candidate invokers for a call.
pub trait Directory: Send + Sync {
    /// The consumer URL the cluster reads its settings from.
    fn url(&self) -> &Url;

    /// Routed invokers for `invocation`. Empty once destroyed.
    fn list(&self, invocation: &Invocation) -> Vec<Arc<dyn Invoker>>;

    fn is_available(&self) -> bool;

    /// Destroys every invoker and stops listing them.
    fn destroy(&self);
}

fn route(
    routers: &[Arc<dyn Router>],
    invokers: Vec<Arc<dyn Invoker>>,
    url: &Url,
    invocation: &Invocation,
) -> Vec<Arc<dyn Invoker>> {
    routers
        .iter()
        .fold(invokers, |invokers, router| router.route(invokers, url, invocation))
}

/// A fixed set of invokers.
pub struct StaticDirectory {
    url: Url,
    invokers: Vec<Arc<dyn Invoker>>,
    routers: Vec<Arc<dyn Router>>,
    destroyed: AtomicBool,
}

impl StaticDirectory {
    #[must_use]
    pub fn new(url: Url, invokers: Vec<Arc<dyn Invoker>>) -> Self {
        Self {
            url,
            invokers,
            routers: Vec::new(),
            destroyed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_routers(mut self, routers: Vec<Arc<dyn Router>>) -> Self {
        self.routers = routers;
        self
    }
}

impl Directory for StaticDirectory {
    fn url(&self) -> &Url {
        &self.url
    }

    fn list(&self, invocation: &Invocation) -> Vec<Arc<dyn Invoker>> {
        if self.destroyed.load(Ordering::Acquire) {
            return Vec::new();
        }
        route(&self.routers, self.invokers.clone(), &self.url, invocation)
    }

    fn is_available(&self) -> bool {
        !self.destroyed.load(Ordering::Acquire) && self.invokers.iter().any(|i| i.is_available())
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        for invoker in &self.invokers {
            invoker.destroy();
        }
    }
}

/// Kind of a registry notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Add,
    Delete,
}

/// A provider appearing or leaving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEvent {
    pub kind: EventType,
    pub url: Url,
}

impl ServiceEvent {
    #[must_use]
    pub const fn add(url: Url) -> Self {
        Self {
            kind: EventType::Add,
            url,
        }
    }

    #[must_use]
    pub const fn delete(url: Url) -> Self {
        Self {
            kind: EventType::Delete,
            url,
        }
    }
}

/// Turns a provider URL into an invoker.
#[async_trait]
pub trait InvokerFactory: Send + Sync {
    async fn create(&self, url: Url) -> Result<Arc<dyn Invoker>, RpcError>;
}

#[async_trait]
impl InvokerFactory for DubboProtocol {
    async fn create(&self, url: Url) -> Result<Arc<dyn Invoker>, RpcError> {
        self.refer(url).await
    }
}

/// Invokers kept in step with registry notifications.
///
/// Provider URLs are merged with the consumer URL's parameters before an
/// invoker is created, so consumer settings such as `timeout` and
/// `reference.filter` win over what the provider advertises.
pub struct RegistryDirectory {
    url: Url,
    factory: Arc<dyn InvokerFactory>,
    routers: Vec<Arc<dyn Router>>,
    invokers: RwLock<BTreeMap<String, Arc<dyn Invoker>>>,
    destroyed: AtomicBool,
}

impl RegistryDirectory {
    #[must_use]
    pub fn new(url: Url, factory: Arc<dyn InvokerFactory>) -> Self {
        Self {
            url,
            factory,
            routers: Vec::new(),
            invokers: RwLock::new(BTreeMap::new()),
            destroyed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_routers(mut self, routers: Vec<Arc<dyn Router>>) -> Self {
        self.routers = routers;
        self
    }

    /// Number of providers currently known, before routing.
    #[must_use]
    pub fn len(&self) -> usize {
        self.invokers.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.invokers.read().is_empty()
    }

    fn merge(&self, provider: &Url) -> Url {
        let mut url = provider.clone();
        for (key, value) in self.url.params() {
            url.set_param(key.clone(), value);
        }
        url
    }

    /// Applies one notification.
    ///
    /// # Errors
    ///
    /// Fails when the factory cannot create an invoker for an added
    /// provider. The directory is left unchanged.
    pub async fn notify(&self, event: ServiceEvent) -> Result<(), RpcError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Ok(());
        }
        let key = event.url.key();
        match event.kind {
            EventType::Add => {
                if self.invokers.read().contains_key(&key) {
                    debug!(provider = %key, "provider already known");
                    return Ok(());
                }
                let invoker = self.factory.create(self.merge(&event.url)).await?;
                let replaced = self.invokers.write().insert(key.clone(), invoker);
                if let Some(old) = replaced {
                    old.destroy();
                }
                info!(service = %self.url.service_key(), provider = %key, "provider added");
            }
            EventType::Delete => {
                let removed = self.invokers.write().remove(&key);
                if let Some(invoker) = removed {
                    invoker.destroy();
                    info!(service = %self.url.service_key(), provider = %key, "provider removed");
                }
            }
        }
        Ok(())
    }

    /// Applies events from `events` until the sender is dropped or
    /// `shutdown` fires.
    pub fn spawn(
        self: Arc<Self>,
        mut events: mpsc::Receiver<ServiceEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        let provider = event.url.key();
                        if let Err(e) = self.notify(event).await {
                            warn!(provider = %provider, error = %e, "failed to apply registry event");
                        }
                    }
                }
            }
            debug!(service = %self.url.service_key(), "registry directory stopped listening");
        })
    }
}

impl Directory for RegistryDirectory {
    fn url(&self) -> &Url {
        &self.url
    }

    fn list(&self, invocation: &Invocation) -> Vec<Arc<dyn Invoker>> {
        if self.destroyed.load(Ordering::Acquire) {
            return Vec::new();
        }
        let invokers = self.invokers.read().values().cloned().collect();
        route(&self.routers, invokers, &self.url, invocation)
    }

    fn is_available(&self) -> bool {
        !self.destroyed.load(Ordering::Acquire)
            && self.invokers.read().values().any(|i| i.is_available())
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let invokers = std::mem::take(&mut *self.invokers.write());
        for invoker in invokers.values() {
            invoker.destroy();
        }
    }
}
