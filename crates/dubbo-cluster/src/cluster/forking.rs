use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dubbo_proto::Value;
use dubbo_rpc::url::FORKS_KEY;
use dubbo_rpc::{CallMode, Invocation, Invoker, RpcError, RpcResult, Url};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{same_invoker, Cluster, ClusterContext};
use crate::directory::Directory;
use crate::loadbalance::{LoadBalance, LoadBalanceRegistry};

pub const FORKING_CLUSTER: &str = "forking";
pub const DEFAULT_FORKS: i64 = 2;

/// Races several providers and keeps the first success.
pub struct ForkingCluster {
    loadbalances: Arc<LoadBalanceRegistry>,
}

impl ForkingCluster {
    #[must_use]
    pub const fn new(loadbalances: Arc<LoadBalanceRegistry>) -> Self {
        Self { loadbalances }
    }
}

impl Cluster for ForkingCluster {
    fn join(&self, directory: Arc<dyn Directory>) -> Arc<dyn Invoker> {
        Arc::new(ForkingClusterInvoker::new(
            directory,
            Arc::clone(&self.loadbalances),
        ))
    }

    fn name(&self) -> &'static str {
        FORKING_CLUSTER
    }
}

/// Sends the call to `forks` distinct providers at once.
///
/// The first success is returned. When every fork fails the last error is
/// returned with the number of forks; when `timeout` elapses first, a
/// timeout error.
///
/// In async mode every fork runs synchronously inside one background task
/// and the caller's callback receives only the outcome of the race.
///
/// Forks that lose the race are not cancelled. Each runs as its own task
/// until its provider answers or the exchange times it out, and its result
/// is discarded.
pub struct ForkingClusterInvoker {
    context: ClusterContext,
}

impl ForkingClusterInvoker {
    #[must_use]
    pub fn new(directory: Arc<dyn Directory>, loadbalances: Arc<LoadBalanceRegistry>) -> Self {
        Self {
            context: ClusterContext::new(directory, loadbalances),
        }
    }

    fn pick(
        &self,
        loadbalance: &dyn LoadBalance,
        invocation: &Invocation,
        invokers: Vec<Arc<dyn Invoker>>,
    ) -> Vec<Arc<dyn Invoker>> {
        let forks = self
            .context
            .url()
            .method_param_i64(invocation.method(), FORKS_KEY, DEFAULT_FORKS);
        let forks = usize::try_from(forks).unwrap_or(0);
        if forks == 0 || forks >= invokers.len() {
            return invokers.into_iter().filter(|i| i.is_available()).collect();
        }

        let mut selected: Vec<Arc<dyn Invoker>> = Vec::with_capacity(forks);
        while selected.len() < forks {
            let Some(invoker) = self
                .context
                .select(loadbalance, invocation, &invokers, &selected)
            else {
                break;
            };
            if selected.iter().any(|s| same_invoker(s, &invoker)) {
                break;
            }
            selected.push(invoker);
        }
        selected
    }
}

#[async_trait]
impl Invoker for ForkingClusterInvoker {
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
        let selected = self.pick(loadbalance.as_ref(), invocation, invokers);
        if selected.is_empty() {
            return RpcResult::err(self.context.no_provider(invocation));
        }

        let timeout = self.context.url().method_timeout(invocation.method());
        let call = Race {
            service: self.url().service_key(),
            method: invocation.method().to_owned(),
            timeout,
            no_provider: self.context.no_provider(invocation),
        };
        match invocation.mode().clone() {
            CallMode::Async(callback) => {
                let fork = invocation.clone().with_mode(CallMode::Sync);
                tokio::spawn(async move { callback(call.run(selected, fork).await) });
                RpcResult::ok(Value::Null)
            }
            _ => call.run(selected, invocation.clone()).await,
        }
    }

    fn destroy(&self) {
        self.context.directory().destroy();
    }
}

/// One forked call, owned so it can outlive the caller in async mode.
struct Race {
    service: String,
    method: String,
    timeout: Duration,
    no_provider: RpcError,
}

impl Race {
    async fn run(self, selected: Vec<Arc<dyn Invoker>>, invocation: Invocation) -> RpcResult {
        let forked = selected.len();
        let (tx, mut rx) = mpsc::channel(forked);
        for invoker in selected {
            let tx = tx.clone();
            let mut invocation = invocation.clone();
            tokio::spawn(async move {
                let result = invoker.invoke(&mut invocation).await;
                // The receiver is gone once the race has been decided.
                let _ = tx.send(result).await;
            });
        }
        drop(tx);

        let Self {
            service,
            method,
            timeout,
            no_provider,
        } = self;
        let race = async {
            let mut failures = 0;
            let mut last = None;
            while let Some(result) = rx.recv().await {
                if result.is_ok() {
                    return result;
                }
                failures += 1;
                last = result.error().cloned();
                if failures == forked {
                    break;
                }
            }
            RpcResult::err(RpcError::ClusterExhausted {
                attempts: failures,
                last: Box::new(last.unwrap_or(no_provider)),
            })
        };

        if let Ok(result) = tokio::time::timeout(timeout, race).await {
            if let Some(e) = result.error() {
                debug!(
                    service = %service,
                    method = %method,
                    forks = forked,
                    error = %e,
                    "every fork failed"
                );
            }
            result
        } else {
            warn!(
                service = %service,
                method = %method,
                forks = forked,
                ?timeout,
                "forking call timed out"
            );
            RpcResult::err(RpcError::Timeout(format!(
                "forking call to {service}#{method} timed out after {timeout:?}"
            )))
        }
    }
}
