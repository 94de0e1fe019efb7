//! Filters and filter chains.
//!
//! A [`FilterChain`] is an ordered list of named filters in front of a
//! terminal invoker. The first filter is the outermost layer: with filters
//! `[a, b]`, pre-processing runs `a` then `b`, and `on_response` runs `b`
//! then `a`. A filter short-circuits by returning without calling
//! [`Next::run`].

mod active;
mod auth;
mod generic;
mod graceful_shutdown;
mod registry;
mod tps;

use std::sync::Arc;

use async_trait::async_trait;

use crate::invocation::Invocation;
use crate::invoker::Invoker;
use crate::result::RpcResult;
use crate::url::Url;

pub use active::{ActiveFilter, ACTIVE_FILTER};
pub use auth::{
    AccessKeyPair, AccessKeyStorage, AuthFilter, SignFilter, UrlAccessKeyStorage,
    ACCESS_KEY_ID_KEY, AK_KEY, AUTH_FILTER, AUTH_KEY, CONSUMER_KEY, PARAMETER_SIGNATURE_KEY,
    REQUEST_SIGNATURE_KEY, REQUEST_TIMESTAMP_KEY, SECRET_ACCESS_KEY_KEY, SIGN_FILTER,
};
pub use generic::{GenericServiceFilter, GENERIC_INVOKE, GENERIC_SERVICE_FILTER};
pub use graceful_shutdown::{
    GracefulShutdownFilter, LogRejectedHandler, RejectedExecutionHandler,
    CONSUMER_SHUTDOWN_FILTER, PROVIDER_SHUTDOWN_FILTER,
};
pub use registry::{Builtins, FilterRegistry};
pub use tps::{TpsLimitFilter, DEFAULT_TPS_LIMIT_INTERVAL, TPS_LIMIT_FILTER};

/// A named interceptor around an invocation.
#[async_trait]
pub trait Filter: Send + Sync {
    /// Pre-processes the invocation and usually hands it to `next`.
    async fn invoke(&self, next: Next<'_>, invocation: &mut Invocation) -> RpcResult;

    /// Post-processes the result returned by [`Filter::invoke`].
    async fn on_response(
        &self,
        result: RpcResult,
        _invoker: &dyn Invoker,
        _invocation: &mut Invocation,
    ) -> RpcResult {
        result
    }
}

/// The remainder of a chain, handed to each filter.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    filters: &'a [(String, Arc<dyn Filter>)],
    terminal: &'a dyn Invoker,
}

impl<'a> Next<'a> {
    /// The invoker at the end of the chain.
    #[must_use]
    pub fn invoker(&self) -> &'a dyn Invoker {
        self.terminal
    }

    #[must_use]
    pub fn url(&self) -> &'a Url {
        self.terminal.url()
    }

    /// Runs the remaining filters and then the terminal invoker.
    pub async fn run(self, invocation: &mut Invocation) -> RpcResult {
        match self.filters.split_first() {
            Some(((_, filter), rest)) => {
                let next = Next {
                    filters: rest,
                    terminal: self.terminal,
                };
                let result = filter.invoke(next, invocation).await;
                filter.on_response(result, self.terminal, invocation).await
            }
            None => self.terminal.invoke(invocation).await,
        }
    }
}

/// Filters in declared order in front of a terminal invoker.
pub struct FilterChain {
    filters: Vec<(String, Arc<dyn Filter>)>,
    terminal: Arc<dyn Invoker>,
}

impl FilterChain {
    #[must_use]
    pub fn new(terminal: Arc<dyn Invoker>, filters: Vec<(String, Arc<dyn Filter>)>) -> Self {
        Self { filters, terminal }
    }

    pub fn filter_names(&self) -> impl Iterator<Item = &str> {
        self.filters.iter().map(|(name, _)| name.as_str())
    }

    #[must_use]
    pub fn terminal(&self) -> &Arc<dyn Invoker> {
        &self.terminal
    }
}

#[async_trait]
impl Invoker for FilterChain {
    fn url(&self) -> &Url {
        self.terminal.url()
    }

    fn is_available(&self) -> bool {
        self.terminal.is_available()
    }

    async fn invoke(&self, invocation: &mut Invocation) -> RpcResult {
        Next {
            filters: &self.filters,
            terminal: self.terminal.as_ref(),
        }
        .run(invocation)
        .await
    }

    fn destroy(&self) {
        self.terminal.destroy();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Invokers for filter and cluster tests.

    use std::sync::atomic::{AtomicUsize, Ordering};

    use dubbo_proto::Value;
    use parking_lot::Mutex;

    use super::*;
    use crate::error::RpcError;
    use crate::invoker::BaseInvoker;

    /// Records calls and answers with a fixed result.
    pub struct StubInvoker {
        pub base: BaseInvoker,
        pub calls: AtomicUsize,
        pub result: Mutex<RpcResult>,
    }

    impl StubInvoker {
        pub fn ok(url: &str, value: Value) -> Arc<Self> {
            Self::with(url, RpcResult::ok(value))
        }

        pub fn failing(url: &str, error: RpcError) -> Arc<Self> {
            Self::with(url, RpcResult::err(error))
        }

        pub fn with(url: &str, result: RpcResult) -> Arc<Self> {
            Arc::new(Self {
                base: BaseInvoker::new(Url::parse(url).unwrap()),
                calls: AtomicUsize::new(0),
                result: Mutex::new(result),
            })
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Invoker for StubInvoker {
        fn url(&self) -> &Url {
            self.base.url()
        }

        fn is_available(&self) -> bool {
            self.base.is_available()
        }

        async fn invoke(&self, _invocation: &mut Invocation) -> RpcResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.lock().clone()
        }

        fn destroy(&self) {
            self.base.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use dubbo_proto::Value;
    use parking_lot::Mutex;

    use super::testing::StubInvoker;
    use super::*;
    use crate::error::RpcError;

    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        short_circuit: bool,
    }

    #[async_trait]
    impl Filter for Recording {
        async fn invoke(&self, next: Next<'_>, invocation: &mut Invocation) -> RpcResult {
            self.log.lock().push(format!("pre {}", self.name));
            if self.short_circuit {
                return RpcResult::err(RpcError::Rejected(self.name.into()));
            }
            next.run(invocation).await
        }

        async fn on_response(
            &self,
            result: RpcResult,
            _invoker: &dyn Invoker,
            _invocation: &mut Invocation,
        ) -> RpcResult {
            self.log.lock().push(format!("post {}", self.name));
            result
        }
    }

    fn chain(log: &Arc<Mutex<Vec<String>>>, short_b: bool) -> (FilterChain, Arc<StubInvoker>) {
        let terminal = StubInvoker::ok("dubbo://h:1/svc", Value::Int(7));
        let filter = |name: &'static str, short_circuit: bool| -> (String, Arc<dyn Filter>) {
            (
                String::from(name),
                Arc::new(Recording {
                    name,
                    log: Arc::clone(log),
                    short_circuit,
                }),
            )
        };
        let chain = FilterChain::new(
            terminal.clone(),
            vec![filter("a", false), filter("b", short_b)],
        );
        (chain, terminal)
    }

    #[tokio::test]
    async fn hooks_run_in_declared_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (chain, terminal) = chain(&log, false);

        let result = chain.invoke(&mut Invocation::new("m", vec![])).await;

        assert_eq!(result.value(), Some(&Value::Int(7)));
        assert_eq!(terminal.calls(), 1);
        assert_eq!(*log.lock(), ["pre a", "pre b", "post b", "post a"]);
        assert_eq!(chain.filter_names().collect::<Vec<_>>(), ["a", "b"]);
    }

    #[tokio::test]
    async fn short_circuit_skips_terminal() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (chain, terminal) = chain(&log, true);

        let result = chain.invoke(&mut Invocation::new("m", vec![])).await;

        assert_eq!(result.error(), Some(&RpcError::Rejected("b".into())));
        assert_eq!(terminal.calls(), 0);
        assert_eq!(*log.lock(), ["pre a", "pre b", "post b", "post a"]);
    }

    #[tokio::test]
    async fn empty_chain_is_terminal() {
        let terminal = StubInvoker::ok("dubbo://h:1/svc", Value::Null);
        let chain = FilterChain::new(terminal.clone(), Vec::new());
        chain.invoke(&mut Invocation::new("m", vec![])).await;
        assert_eq!(terminal.calls(), 1);

        chain.destroy();
        assert!(!chain.is_available());
    }
}
