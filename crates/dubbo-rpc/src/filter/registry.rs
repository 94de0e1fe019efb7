//! Named filters and the shared state behind the built-in ones.

use std::collections::HashMap;
use std::sync::Arc;

use super::{
    AccessKeyStorage, ActiveFilter, AuthFilter, Filter, FilterChain, GenericServiceFilter,
    GracefulShutdownFilter, SignFilter, TpsLimitFilter, UrlAccessKeyStorage, ACTIVE_FILTER,
    AUTH_FILTER, CONSUMER_SHUTDOWN_FILTER, GENERIC_SERVICE_FILTER, PROVIDER_SHUTDOWN_FILTER,
    SIGN_FILTER, TPS_LIMIT_FILTER,
};
use crate::error::RpcError;
use crate::invoker::Invoker;
use crate::status::StatusRegistry;

/// Shared state behind the built-in filters.
///
/// The application keeps this around to drive shutdown and to read call
/// statistics.
#[derive(Clone)]
pub struct Builtins {
    pub status: Arc<StatusRegistry>,
    pub consumer_shutdown: Arc<GracefulShutdownFilter>,
    pub provider_shutdown: Arc<GracefulShutdownFilter>,
    pub access_keys: Arc<dyn AccessKeyStorage>,
}

impl Default for Builtins {
    fn default() -> Self {
        Self {
            status: Arc::new(StatusRegistry::new()),
            consumer_shutdown: Arc::new(GracefulShutdownFilter::consumer()),
            provider_shutdown: Arc::new(GracefulShutdownFilter::provider()),
            access_keys: Arc::new(UrlAccessKeyStorage),
        }
    }
}

/// Filters by name.
#[derive(Default, Clone)]
pub struct FilterRegistry {
    filters: HashMap<String, Arc<dyn Filter>>,
}

impl FilterRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding `active`, `consumer_shutdown`, `provider_shutdown`,
    /// `sign`, `auth`, `tps` and `generic_service`.
    #[must_use]
    pub fn with_builtins(builtins: &Builtins) -> Self {
        let mut registry = Self::new();
        registry.register(
            ACTIVE_FILTER,
            Arc::new(ActiveFilter::new(Arc::clone(&builtins.status))),
        );
        registry.register(
            CONSUMER_SHUTDOWN_FILTER,
            builtins.consumer_shutdown.clone(),
        );
        registry.register(
            PROVIDER_SHUTDOWN_FILTER,
            builtins.provider_shutdown.clone(),
        );
        registry.register(
            SIGN_FILTER,
            Arc::new(SignFilter::new(Arc::clone(&builtins.access_keys))),
        );
        registry.register(
            AUTH_FILTER,
            Arc::new(AuthFilter::new(Arc::clone(&builtins.access_keys))),
        );
        registry.register(TPS_LIMIT_FILTER, Arc::new(TpsLimitFilter::new()));
        registry.register(GENERIC_SERVICE_FILTER, Arc::new(GenericServiceFilter::new()));
        registry
    }

    /// Registers `filter` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, filter: Arc<dyn Filter>) {
        self.filters.insert(name.into(), filter);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Filter>> {
        self.filters.get(name).cloned()
    }

    /// Wraps `terminal` in the comma-separated filters of `names`.
    ///
    /// The first name becomes the outermost filter. Blank names are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::UnknownFilter`] for a name that is not registered.
    pub fn build_chain(
        &self,
        terminal: Arc<dyn Invoker>,
        names: &str,
    ) -> Result<Arc<dyn Invoker>, RpcError> {
        let filters = names
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| {
                self.get(name)
                    .map(|filter| (name.to_owned(), filter))
                    .ok_or_else(|| RpcError::UnknownFilter(name.to_owned()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if filters.is_empty() {
            return Ok(terminal);
        }
        Ok(Arc::new(FilterChain::new(terminal, filters)))
    }
}

#[cfg(test)]
mod tests {
    use dubbo_proto::Value;
    use rstest::rstest;

    use super::*;
    use crate::filter::testing::StubInvoker;
    use crate::invocation::Invocation;

    #[rstest]
    #[case::empty("")]
    #[case::blanks(" , ,")]
    #[case::builtins("active,consumer_shutdown")]
    #[case::gaps("active,,sign")]
    #[case::tps("provider_shutdown,tps")]
    #[case::generic("auth,generic_service")]
    fn builds_known_chains(#[case] names: &str) {
        let registry = FilterRegistry::with_builtins(&Builtins::default());
        let terminal = StubInvoker::ok("dubbo://h:1/svc", Value::Null);
        assert!(registry.build_chain(terminal, names).is_ok());
    }

    #[test]
    fn unknown_filter_is_an_error() {
        let registry = FilterRegistry::with_builtins(&Builtins::default());
        let terminal = StubInvoker::ok("dubbo://h:1/svc", Value::Null);
        let err = registry
            .build_chain(terminal, "active, tracing")
            .err()
            .unwrap();
        assert_eq!(err, RpcError::UnknownFilter("tracing".into()));
    }

    #[tokio::test]
    async fn builtin_shutdown_filter_is_shared() {
        let builtins = Builtins::default();
        let registry = FilterRegistry::with_builtins(&builtins);
        let terminal = StubInvoker::ok("dubbo://h:1/svc", Value::Null);
        let chain = registry
            .build_chain(terminal.clone(), "provider_shutdown")
            .unwrap();

        builtins.provider_shutdown.reject();
        let result = chain.invoke(&mut Invocation::new("m", vec![])).await;
        assert!(matches!(result.error(), Some(RpcError::Rejected(_))));
        assert_eq!(terminal.calls(), 0);
    }
}
