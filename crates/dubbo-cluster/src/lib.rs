//! Fault tolerance across a set of providers.
//!
//! A [`Directory`] holds the invokers of one referenced service and runs
//! them through its [`Router`]s on every call. A cluster invoker asks the
//! directory for candidates, picks one with a [`LoadBalance`] and applies
//! its policy when the call fails: [failover](cluster::FailoverClusterInvoker)
//! retries on another provider, [failfast](cluster::FailfastClusterInvoker)
//! gives up, and [forking](cluster::ForkingClusterInvoker) races several
//! providers at once.
//!
//! A [`ConditionRouter`] narrows providers by a `when => then` rule. The
//! [`HealthCheckRouter`] drops providers whose circuit is tripped
//! according to a [`HealthChecker`] fed by the `active` filter's statistics.

pub mod cluster;
pub mod directory;
pub mod health;
pub mod loadbalance;
pub mod router;

pub use cluster::{Cluster, ClusterRegistry};
pub use directory::{
    Directory, EventType, InvokerFactory, RegistryDirectory, ServiceEvent, StaticDirectory,
};
pub use health::{DefaultHealthChecker, HealthChecker};
pub use loadbalance::{LoadBalance, LoadBalanceRegistry};
pub use router::{default_routers, ConditionRouter, HealthCheckRouter, Router};

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use dubbo_proto::Value;
    use dubbo_rpc::{BaseInvoker, CallMode, Invocation, Invoker, RpcError, RpcResult, Url};
    use parking_lot::Mutex;

    /// Invoker that replays scripted results, then repeats a fallback.
    pub struct MockInvoker {
        pub base: BaseInvoker,
        script: Mutex<VecDeque<RpcResult>>,
        fallback: RpcResult,
        delay: Duration,
        calls: AtomicUsize,
        modes: Mutex<Vec<CallMode>>,
    }

    impl MockInvoker {
        pub fn answering(url: &str, value: impl Into<Value>) -> Arc<Self> {
            Self::build(url, RpcResult::ok(value.into()), Duration::ZERO)
        }

        pub fn failing(url: &str) -> Arc<Self> {
            Self::build(
                url,
                RpcResult::err(RpcError::Transport(format!("{url} refused"))),
                Duration::ZERO,
            )
        }

        /// Rejects every call the way a draining provider does.
        pub fn rejecting(url: &str) -> Arc<Self> {
            Self::build(
                url,
                RpcResult::err(RpcError::Rejected(format!("{url} is shutting down"))),
                Duration::ZERO,
            )
        }

        pub fn slow(url: &str, value: impl Into<Value>, delay: Duration) -> Arc<Self> {
            Self::build(url, RpcResult::ok(value.into()), delay)
        }

        fn build(url: &str, fallback: RpcResult, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                base: BaseInvoker::new(Url::parse(url).unwrap()),
                script: Mutex::new(VecDeque::new()),
                fallback,
                delay,
                calls: AtomicUsize::new(0),
                modes: Mutex::new(Vec::new()),
            })
        }

        /// Queues results returned before the fallback.
        pub fn then(self: Arc<Self>, result: RpcResult) -> Arc<Self> {
            self.script.lock().push_back(result);
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        /// Call modes of the invocations received so far.
        pub fn modes(&self) -> Vec<CallMode> {
            self.modes.lock().clone()
        }
    }

    #[async_trait]
    impl Invoker for MockInvoker {
        fn url(&self) -> &Url {
            self.base.url()
        }

        fn is_available(&self) -> bool {
            self.base.is_available()
        }

        async fn invoke(&self, invocation: &mut Invocation) -> RpcResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.modes.lock().push(invocation.mode().clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let scripted = self.script.lock().pop_front();
            scripted.unwrap_or_else(|| self.fallback.clone())
        }

        fn destroy(&self) {
            self.base.destroy();
        }
    }

    pub fn as_dyn(invokers: &[Arc<MockInvoker>]) -> Vec<Arc<dyn Invoker>> {
        invokers
            .iter()
            .map(|i| Arc::clone(i) as Arc<dyn Invoker>)
            .collect()
    }
}
