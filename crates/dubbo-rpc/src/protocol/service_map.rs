//! Provider-side method lookup and dispatch.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dubbo_proto::{RemoteException, ResponsePayload, Service, ServiceCall, Value};
use dubbo_remoting::{DispatchError, RequestHandler};
use tracing::debug;

use crate::error::RpcError;
use crate::invocation::Invocation;
use crate::invoker::{BaseInvoker, Invoker};
use crate::result::RpcResult;
use crate::url::Url;

/// Implementation of one exported method.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn call(
        &self,
        args: Vec<Value>,
        attachments: HashMap<String, String>,
    ) -> Result<Value, RemoteException>;
}

/// Adapts an async closure into a [`MethodHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> MethodHandler for FnHandler<F>
where
    F: Fn(Vec<Value>, HashMap<String, String>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, RemoteException>> + Send,
{
    async fn call(
        &self,
        args: Vec<Value>,
        attachments: HashMap<String, String>,
    ) -> Result<Value, RemoteException> {
        (self.0)(args, attachments).await
    }
}

/// Wraps `f` as a shareable method handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MethodHandler>
where
    F: Fn(Vec<Value>, HashMap<String, String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RemoteException>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// `(service key, method)` to handler.
#[derive(Default)]
pub struct ServiceMap {
    methods: DashMap<(String, String), Arc<dyn MethodHandler>>,
}

impl ServiceMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        service_key: impl Into<String>,
        method: impl Into<String>,
        handler: Arc<dyn MethodHandler>,
    ) {
        self.methods
            .insert((service_key.into(), method.into()), handler);
    }

    #[must_use]
    pub fn get(&self, service_key: &str, method: &str) -> Option<Arc<dyn MethodHandler>> {
        self.methods
            .get(&(service_key.to_owned(), method.to_owned()))
            .map(|h| Arc::clone(h.value()))
    }

    /// Removes every method of `service_key`.
    pub fn remove_service(&self, service_key: &str) {
        self.methods.retain(|(key, _), _| key != service_key);
    }

    #[must_use]
    pub fn method_names(&self, service_key: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .methods
            .iter()
            .filter(|e| e.key().0 == service_key)
            .map(|e| e.key().1.clone())
            .collect();
        names.sort();
        names
    }
}

/// Terminal provider invoker: calls the registered method handler.
pub struct ProviderInvoker {
    base: BaseInvoker,
    service_key: String,
    services: Arc<ServiceMap>,
}

impl ProviderInvoker {
    #[must_use]
    pub fn new(url: Url, services: Arc<ServiceMap>) -> Self {
        Self {
            service_key: url.service_key(),
            base: BaseInvoker::new(url),
            services,
        }
    }
}

#[async_trait]
impl Invoker for ProviderInvoker {
    fn url(&self) -> &Url {
        self.base.url()
    }

    fn is_available(&self) -> bool {
        self.base.is_available()
    }

    async fn invoke(&self, invocation: &mut Invocation) -> RpcResult {
        let Some(handler) = self.services.get(&self.service_key, invocation.method()) else {
            return RpcResult::err(RpcError::Remote {
                class: "java.lang.NoSuchMethodException".into(),
                message: format!(
                    "method {} not found in service {}",
                    invocation.method(),
                    self.service_key
                ),
            });
        };
        let args = invocation.args().to_vec();
        let attachments = invocation.attachments().clone();
        match handler.call(args, attachments).await {
            Ok(value) => RpcResult::ok(value),
            Err(exception) => RpcResult::err(RpcError::remote(exception)),
        }
    }

    fn destroy(&self) {
        self.base.destroy();
    }
}

/// Routes decoded calls to exported invoker chains by service key.
#[derive(Default)]
pub struct ProviderDispatcher {
    exported: DashMap<String, Arc<dyn Invoker>>,
}

impl ProviderDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, service_key: String, invoker: Arc<dyn Invoker>) {
        self.exported.insert(service_key, invoker);
    }

    pub fn remove(&self, service_key: &str) -> Option<Arc<dyn Invoker>> {
        self.exported.remove(service_key).map(|(_, invoker)| invoker)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exported.is_empty()
    }
}

#[async_trait]
impl RequestHandler for ProviderDispatcher {
    async fn handle(
        &self,
        service: Service,
        call: ServiceCall,
    ) -> Result<ResponsePayload, DispatchError> {
        let key = dubbo_proto::service_key(&service.group, &service.interface, &service.version);
        let invoker = self
            .exported
            .get(&key)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| DispatchError::service_not_found(&key))?;

        let mut invocation = Invocation::new(service.method, call.args).with_arg_types(call.arg_types);
        for (k, v) in call.attachments {
            invocation.set_attachment(k, v);
        }

        let result = invoker.invoke(&mut invocation).await;
        let attachments = result.attachments().clone();
        let mut payload = match result.into_result() {
            Ok(Value::Null) => ResponsePayload::default(),
            Ok(value) => ResponsePayload::value(value),
            Err(e) => {
                if !matches!(e, RpcError::Remote { .. }) {
                    debug!(service = %key, error = %e, error_type = e.error_type(), "call failed in provider chain");
                }
                ResponsePayload::exception(e.to_exception())
            }
        };
        payload.attachments = attachments;
        Ok(payload)
    }
}
