//! Cluster invokers: one logical call over many providers.

mod failfast;
mod failover;
mod forking;

use std::collections::HashMap;
use std::sync::Arc;

use dubbo_rpc::url::{CLUSTER_KEY, LOADBALANCE_KEY};
use dubbo_rpc::{Invocation, Invoker, RpcError, Url};

use crate::directory::Directory;
use crate::loadbalance::{LoadBalance, LoadBalanceRegistry, RANDOM_LOADBALANCE};

pub use failfast::{FailfastCluster, FailfastClusterInvoker, FAILFAST_CLUSTER};
pub use failover::{FailoverCluster, FailoverClusterInvoker, DEFAULT_RETRIES, FAILOVER_CLUSTER};
pub use forking::{ForkingCluster, ForkingClusterInvoker, DEFAULT_FORKS, FORKING_CLUSTER};

/// A fault-tolerance policy.
pub trait Cluster: Send + Sync {
    /// Wraps `directory` in an invoker applying this policy.
    fn join(&self, directory: Arc<dyn Directory>) -> Arc<dyn Invoker>;

    fn name(&self) -> &'static str;
}

/// State shared by every cluster invoker: where invokers come from and how
/// one is chosen.
pub(crate) struct ClusterContext {
    directory: Arc<dyn Directory>,
    loadbalances: Arc<LoadBalanceRegistry>,
}

impl ClusterContext {
    pub(crate) fn new(
        directory: Arc<dyn Directory>,
        loadbalances: Arc<LoadBalanceRegistry>,
    ) -> Self {
        Self {
            directory,
            loadbalances,
        }
    }

    pub(crate) fn url(&self) -> &Url {
        self.directory.url()
    }

    pub(crate) fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    /// Routed invokers, or [`RpcError::NoProvider`] when there are none.
    pub(crate) fn list(&self, invocation: &Invocation) -> Result<Vec<Arc<dyn Invoker>>, RpcError> {
        let invokers = self.directory.list(invocation);
        if invokers.is_empty() {
            return Err(self.no_provider(invocation));
        }
        Ok(invokers)
    }

    pub(crate) fn no_provider(&self, invocation: &Invocation) -> RpcError {
        RpcError::NoProvider(format!(
            "no provider available for {}#{}",
            self.url().service_key(),
            invocation.method()
        ))
    }

    /// The balancer named by `methods.<m>.loadbalance` or `loadbalance`.
    pub(crate) fn loadbalance(
        &self,
        invocation: &Invocation,
    ) -> Result<Arc<dyn LoadBalance>, RpcError> {
        let name = self
            .url()
            .method_param(invocation.method(), LOADBALANCE_KEY)
            .filter(|n| !n.is_empty())
            .unwrap_or(RANDOM_LOADBALANCE);
        self.loadbalances.get(name)
    }

    /// Picks an available invoker outside `excluded`. When every available
    /// invoker has been excluded, picks among all available ones.
    pub(crate) fn select(
        &self,
        loadbalance: &dyn LoadBalance,
        invocation: &Invocation,
        invokers: &[Arc<dyn Invoker>],
        excluded: &[Arc<dyn Invoker>],
    ) -> Option<Arc<dyn Invoker>> {
        let available: Vec<Arc<dyn Invoker>> = invokers
            .iter()
            .filter(|i| i.is_available())
            .cloned()
            .collect();
        let fresh: Vec<Arc<dyn Invoker>> = available
            .iter()
            .filter(|i| !excluded.iter().any(|e| same_invoker(e, i)))
            .cloned()
            .collect();

        let candidates = if fresh.is_empty() { &available } else { &fresh };
        loadbalance.select(candidates, self.url(), invocation)
    }
}

/// Identity comparison that ignores vtable pointers.
pub(crate) fn same_invoker(a: &Arc<dyn Invoker>, b: &Arc<dyn Invoker>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a).cast::<()>(),
        Arc::as_ptr(b).cast::<()>(),
    )
}

/// Clusters by name.
#[derive(Clone)]
pub struct ClusterRegistry {
    clusters: HashMap<String, Arc<dyn Cluster>>,
}

impl ClusterRegistry {
    /// A registry holding `failover`, `failfast` and `forking`, all
    /// balancing with `loadbalances`.
    #[must_use]
    pub fn with_defaults(loadbalances: Arc<LoadBalanceRegistry>) -> Self {
        let mut registry = Self {
            clusters: HashMap::new(),
        };
        registry.register(Arc::new(FailoverCluster::new(Arc::clone(&loadbalances))));
        registry.register(Arc::new(FailfastCluster::new(Arc::clone(&loadbalances))));
        registry.register(Arc::new(ForkingCluster::new(loadbalances)));
        registry
    }

    pub fn register(&mut self, cluster: Arc<dyn Cluster>) {
        self.clusters.insert(cluster.name().to_owned(), cluster);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Cluster>> {
        self.clusters.get(name).cloned()
    }

    /// Joins `directory` with the cluster named by its URL's `cluster`
    /// param, `failover` by default.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::UnknownExtension`] for an unregistered name.
    pub fn join(&self, directory: Arc<dyn Directory>) -> Result<Arc<dyn Invoker>, RpcError> {
        let name = directory.url().param_or(CLUSTER_KEY, FAILOVER_CLUSTER).to_owned();
        let cluster = self.get(&name).ok_or(RpcError::UnknownExtension {
            kind: "cluster",
            name,
        })?;
        Ok(cluster.join(directory))
    }
}

#[cfg(test)]
mod tests {
    use dubbo_rpc::StatusRegistry;

    use super::*;
    use crate::directory::StaticDirectory;
    use crate::loadbalance::ROUND_ROBIN_LOADBALANCE;
    use crate::testing::{as_dyn, MockInvoker};

    fn registry() -> Arc<LoadBalanceRegistry> {
        Arc::new(LoadBalanceRegistry::with_defaults(Arc::new(
            StatusRegistry::new(),
        )))
    }

    #[test]
    fn select_skips_excluded_until_nothing_else_is_left() {
        let mocks = [
            MockInvoker::answering("dubbo://a:1/svc", "a"),
            MockInvoker::answering("dubbo://b:1/svc", "b"),
        ];
        let invokers = as_dyn(&mocks);
        let url = Url::parse("consumer://127.0.0.1/svc").unwrap();
        let context = ClusterContext::new(
            Arc::new(StaticDirectory::new(url, invokers.clone())),
            registry(),
        );
        let invocation = Invocation::new("m", vec![]);
        let balancer = registry().get(ROUND_ROBIN_LOADBALANCE).unwrap();

        for _ in 0..4 {
            let chosen = context
                .select(balancer.as_ref(), &invocation, &invokers, &invokers[..1])
                .unwrap();
            assert!(same_invoker(&chosen, &invokers[1]));
        }

        let chosen = context
            .select(balancer.as_ref(), &invocation, &invokers, &invokers)
            .unwrap();
        assert!(invokers.iter().any(|i| same_invoker(i, &chosen)));

        mocks[0].base.set_available(false);
        for _ in 0..4 {
            let chosen = context
                .select(balancer.as_ref(), &invocation, &invokers, &invokers[1..])
                .unwrap();
            assert!(same_invoker(&chosen, &invokers[1]));
        }
    }

    #[test]
    fn join_uses_the_cluster_param() {
        let clusters = ClusterRegistry::with_defaults(registry());
        let directory = |cluster: &str| -> Arc<dyn Directory> {
            let url = Url::parse(&format!("consumer://127.0.0.1/svc?cluster={cluster}")).unwrap();
            Arc::new(StaticDirectory::new(url, Vec::new()))
        };

        assert!(clusters.join(directory("forking")).is_ok());
        assert!(clusters.join(directory("")).is_ok());
        assert!(matches!(
            clusters.join(directory("broadcast")).err(),
            Some(RpcError::UnknownExtension { kind: "cluster", .. })
        ));
    }
}
