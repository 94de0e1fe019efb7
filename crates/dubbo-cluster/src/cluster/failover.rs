use std::sync::Arc;

use async_trait::async_trait;
use dubbo_rpc::url::RETRIES_KEY;
use dubbo_rpc::{Invocation, Invoker, RpcError, RpcResult, Url};
use tracing::{debug, warn};

use super::{Cluster, ClusterContext};
use crate::directory::Directory;
use crate::loadbalance::LoadBalanceRegistry;

pub const FAILOVER_CLUSTER: &str = "failover";
pub const DEFAULT_RETRIES: i64 = 2;

/// Retries failed calls on other providers.
pub struct FailoverCluster {
    loadbalances: Arc<LoadBalanceRegistry>,
}

impl FailoverCluster {
    #[must_use]
    pub const fn new(loadbalances: Arc<LoadBalanceRegistry>) -> Self {
        Self { loadbalances }
    }
}

impl Cluster for FailoverCluster {
    fn join(&self, directory: Arc<dyn Directory>) -> Arc<dyn Invoker> {
        Arc::new(FailoverClusterInvoker::new(
            directory,
            Arc::clone(&self.loadbalances),
        ))
    }

    fn name(&self) -> &'static str {
        FAILOVER_CLUSTER
    }
}

/// Makes up to `retries + 1` attempts, never picking a provider that already
/// failed this call while an untried one is available.
///
/// `methods.<m>.retries` overrides `retries`; negative values mean no
/// retries. Application exceptions and authentication failures are returned
/// at once since another provider would answer the same. A provider that
/// rejects the call while shutting down is failed over like any other.
pub struct FailoverClusterInvoker {
    context: ClusterContext,
}

impl FailoverClusterInvoker {
    #[must_use]
    pub fn new(directory: Arc<dyn Directory>, loadbalances: Arc<LoadBalanceRegistry>) -> Self {
        Self {
            context: ClusterContext::new(directory, loadbalances),
        }
    }

    fn attempts(&self, method: &str) -> usize {
        let retries = self
            .context
            .url()
            .method_param_i64(method, RETRIES_KEY, DEFAULT_RETRIES)
            .max(0);
        usize::try_from(retries).unwrap_or(usize::MAX).saturating_add(1)
    }
}

#[async_trait]
impl Invoker for FailoverClusterInvoker {
    fn url(&self) -> &Url {
        self.context.url()
    }

    fn is_available(&self) -> bool {
        self.context.directory().is_available()
    }

    async fn invoke(&self, invocation: &mut Invocation) -> RpcResult {
        let mut invokers = match self.context.list(invocation) {
            Ok(invokers) => invokers,
            Err(e) => return RpcResult::err(e),
        };
        let loadbalance = match self.context.loadbalance(invocation) {
            Ok(lb) => lb,
            Err(e) => return RpcResult::err(e),
        };

        let attempts = self.attempts(invocation.method());
        let mut invoked: Vec<Arc<dyn Invoker>> = Vec::with_capacity(attempts.min(8));
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                // Providers may have come or gone since the last attempt.
                invokers = self.context.directory().list(invocation);
                if invokers.is_empty() {
                    break;
                }
            }
            let Some(invoker) =
                self.context
                    .select(loadbalance.as_ref(), invocation, &invokers, &invoked)
            else {
                break;
            };
            invoked.push(Arc::clone(&invoker));

            let result = invoker.invoke(invocation).await;
            if result.is_ok() {
                if attempt > 0 {
                    warn!(
                        service = %self.url().service_key(),
                        method = %invocation.method(),
                        provider = %invoker.url().address(),
                        attempt = attempt + 1,
                        "call succeeded after failover"
                    );
                }
                return result;
            }
            if matches!(
                result.error(),
                Some(RpcError::Remote { .. } | RpcError::AuthFailed)
            ) {
                return result;
            }
            if let Some(e) = result.error() {
                debug!(
                    service = %self.url().service_key(),
                    method = %invocation.method(),
                    provider = %invoker.url().address(),
                    attempt = attempt + 1,
                    error = %e,
                    "attempt failed"
                );
                last_error = Some(e.clone());
            }
        }

        let Some(last) = last_error else {
            return RpcResult::err(self.context.no_provider(invocation));
        };
        warn!(
            service = %self.url().service_key(),
            method = %invocation.method(),
            attempts = invoked.len(),
            error = %last,
            "all failover attempts failed"
        );
        RpcResult::err(RpcError::ClusterExhausted {
            attempts: invoked.len(),
            last: Box::new(last),
        })
    }

    fn destroy(&self) {
        self.context.directory().destroy();
    }
}
