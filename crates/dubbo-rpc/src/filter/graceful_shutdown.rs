//! Draining in-flight calls before shutdown.
//!
//! The filter counts calls that are in progress. Once [`reject`] has been
//! called, new calls are turned away through a [`RejectedExecutionHandler`]
//! while the ones already counted finish. Shutdown code then waits with
//! [`wait_for_drain`].
//!
//! [`reject`]: GracefulShutdownFilter::reject
//! [`wait_for_drain`]: GracefulShutdownFilter::wait_for_drain

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{info, warn};

use super::{Filter, Next};
use crate::error::RpcError;
use crate::invocation::Invocation;
use crate::result::RpcResult;
use crate::url::Url;

pub const CONSUMER_SHUTDOWN_FILTER: &str = "consumer_shutdown";
pub const PROVIDER_SHUTDOWN_FILTER: &str = "provider_shutdown";

/// Decides what a call receives when it arrives during shutdown.
pub trait RejectedExecutionHandler: Send + Sync {
    fn rejected_execution(&self, url: &Url, invocation: &Invocation) -> RpcResult;
}

/// Logs the rejection and fails the call.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRejectedHandler;

impl RejectedExecutionHandler for LogRejectedHandler {
    fn rejected_execution(&self, url: &Url, invocation: &Invocation) -> RpcResult {
        warn!(
            service = %url.service_key(),
            method = %invocation.method(),
            "request rejected during shutdown"
        );
        RpcResult::err(RpcError::Rejected(format!(
            "{}#{} is shutting down",
            url.service_key(),
            invocation.method()
        )))
    }
}

/// Counts in-flight calls and rejects new ones once shutdown starts.
pub struct GracefulShutdownFilter {
    side: &'static str,
    in_flight: Mutex<u64>,
    rejecting: AtomicBool,
    drained: Notify,
    handler: Arc<dyn RejectedExecutionHandler>,
}

impl GracefulShutdownFilter {
    #[must_use]
    pub fn consumer() -> Self {
        Self::new(CONSUMER_SHUTDOWN_FILTER, Arc::new(LogRejectedHandler))
    }

    #[must_use]
    pub fn provider() -> Self {
        Self::new(PROVIDER_SHUTDOWN_FILTER, Arc::new(LogRejectedHandler))
    }

    #[must_use]
    pub fn new(side: &'static str, handler: Arc<dyn RejectedExecutionHandler>) -> Self {
        Self {
            side,
            in_flight: Mutex::new(0),
            rejecting: AtomicBool::new(false),
            drained: Notify::new(),
            handler,
        }
    }

    /// Starts rejecting new calls.
    pub fn reject(&self) {
        if !self.rejecting.swap(true, Ordering::AcqRel) {
            info!(side = self.side, in_flight = self.in_flight(), "rejecting new requests");
        }
    }

    #[must_use]
    pub fn is_rejecting(&self) -> bool {
        self.rejecting.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn in_flight(&self) -> u64 {
        *self.in_flight.lock()
    }

    #[must_use]
    pub fn requests_finished(&self) -> bool {
        self.in_flight() == 0
    }

    /// Waits until no calls are in flight. Returns `false` on timeout.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.drained.notified();
                if self.requests_finished() {
                    return;
                }
                notified.await;
            }
        };
        let drained = tokio::time::timeout(timeout, wait).await.is_ok();
        if !drained {
            warn!(
                side = self.side,
                in_flight = self.in_flight(),
                ?timeout,
                "requests still in flight after drain timeout"
            );
        }
        drained
    }

    fn enter(&self) -> InFlight<'_> {
        *self.in_flight.lock() += 1;
        InFlight { filter: self }
    }
}

/// Decrements the in-flight count when the call finishes or is dropped.
struct InFlight<'a> {
    filter: &'a GracefulShutdownFilter,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut count = self.filter.in_flight.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.filter.drained.notify_waiters();
        }
    }
}

#[async_trait]
impl Filter for GracefulShutdownFilter {
    async fn invoke(&self, next: Next<'_>, invocation: &mut Invocation) -> RpcResult {
        if self.is_rejecting() {
            return self.handler.rejected_execution(next.url(), invocation);
        }
        let _guard = self.enter();
        next.run(invocation).await
    }
}

#[cfg(test)]
mod tests {
    use dubbo_proto::Value;

    use super::*;
    use crate::filter::testing::StubInvoker;
    use crate::filter::FilterChain;
    use crate::invoker::{BaseInvoker, Invoker};

    /// Holds every call until released.
    struct Gate {
        base: BaseInvoker,
        open: Notify,
        entered: Notify,
    }

    #[async_trait]
    impl Invoker for Gate {
        fn url(&self) -> &Url {
            self.base.url()
        }

        fn is_available(&self) -> bool {
            true
        }

        async fn invoke(&self, _invocation: &mut Invocation) -> RpcResult {
            self.entered.notify_one();
            self.open.notified().await;
            RpcResult::ok(Value::Null)
        }

        fn destroy(&self) {}
    }

    #[tokio::test]
    async fn rejects_after_shutdown_starts() {
        let filter = Arc::new(GracefulShutdownFilter::provider());
        let terminal = StubInvoker::ok("dubbo://h:1/svc", Value::Int(1));
        let chain = FilterChain::new(
            terminal.clone(),
            vec![(PROVIDER_SHUTDOWN_FILTER.into(), filter.clone() as Arc<dyn Filter>)],
        );

        assert!(chain.invoke(&mut Invocation::new("m", vec![])).await.is_ok());
        filter.reject();
        let result = chain.invoke(&mut Invocation::new("m", vec![])).await;

        assert!(matches!(result.error(), Some(RpcError::Rejected(_))));
        assert_eq!(terminal.calls(), 1);
        assert_eq!(filter.in_flight(), 0, "rejected calls are never counted");
        assert!(filter.requests_finished());
    }

    #[tokio::test]
    async fn drain_waits_for_in_flight_calls() {
        let filter = Arc::new(GracefulShutdownFilter::consumer());
        let gate = Arc::new(Gate {
            base: BaseInvoker::new(Url::new("dubbo", "h", 1)),
            open: Notify::new(),
            entered: Notify::new(),
        });
        let chain = Arc::new(FilterChain::new(
            gate.clone(),
            vec![(CONSUMER_SHUTDOWN_FILTER.into(), filter.clone() as Arc<dyn Filter>)],
        ));

        let call = {
            let chain = Arc::clone(&chain);
            tokio::spawn(async move { chain.invoke(&mut Invocation::new("m", vec![])).await })
        };
        gate.entered.notified().await;
        assert_eq!(filter.in_flight(), 1);

        filter.reject();
        assert!(!filter.wait_for_drain(Duration::from_millis(20)).await);

        gate.open.notify_one();
        assert!(filter.wait_for_drain(Duration::from_secs(1)).await);
        assert!(call.await.unwrap().is_ok());
    }
}
