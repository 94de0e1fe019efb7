use std::sync::Arc;

use async_trait::async_trait;
use dubbo_rpc::{Invocation, Invoker, RpcResult, Url};
use tracing::debug;

use super::{Cluster, ClusterContext};
use crate::directory::Directory;
use crate::loadbalance::LoadBalanceRegistry;

pub const FAILFAST_CLUSTER: &str = "failfast";

/// One attempt; failures surface immediately.
pub struct FailfastCluster {
    loadbalances: Arc<LoadBalanceRegistry>,
}

impl FailfastCluster {
    #[must_use]
    pub const fn new(loadbalances: Arc<LoadBalanceRegistry>) -> Self {
        Self { loadbalances }
    }
}

impl Cluster for FailfastCluster {
    fn join(&self, directory: Arc<dyn Directory>) -> Arc<dyn Invoker> {
        Arc::new(FailfastClusterInvoker {
            context: ClusterContext::new(directory, Arc::clone(&self.loadbalances)),
        })
    }

    fn name(&self) -> &'static str {
        FAILFAST_CLUSTER
    }
}

pub struct FailfastClusterInvoker {
    context: ClusterContext,
}

#[async_trait]
impl Invoker for FailfastClusterInvoker {
    fn url(&self) -> &Url {
        self.context.url()
    }

    fn is_available(&self) -> bool {
        self.context.directory().is_available()
    }

    async fn invoke(&self, invocation: &mut Invocation) -> RpcResult {
        let invokers = match self.context.list(invocation) {
            Ok(invokers) => invokers,
            Err(e) => return RpcResult::err(e),
        };
        let loadbalance = match self.context.loadbalance(invocation) {
            Ok(lb) => lb,
            Err(e) => return RpcResult::err(e),
        };
        let Some(invoker) = self
            .context
            .select(loadbalance.as_ref(), invocation, &invokers, &[])
        else {
            return RpcResult::err(self.context.no_provider(invocation));
        };

        let result = invoker.invoke(invocation).await;
        if let Some(e) = result.error() {
            debug!(
                service = %self.url().service_key(),
                method = %invocation.method(),
                provider = %invoker.url().address(),
                error = %e,
                "failfast call failed"
            );
        }
        result
    }

    fn destroy(&self) {
        self.context.directory().destroy();
    }
}
