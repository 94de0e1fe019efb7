//! Narrowing the candidate providers of a call.

mod condition;

use std::sync::Arc;

use dubbo_rpc::url::HEALTH_ROUTE_ENABLED_KEY;
use dubbo_rpc::{Invocation, Invoker, StatusRegistry, Url};
use tracing::{debug, warn};

use crate::health::{DefaultHealthChecker, HealthChecker};

pub use condition::ConditionRouter;

/// Filters the invokers a directory offers for one invocation.
pub trait Router: Send + Sync {
    fn route(
        &self,
        invokers: Vec<Arc<dyn Invoker>>,
        url: &Url,
        invocation: &Invocation,
    ) -> Vec<Arc<dyn Invoker>>;
}

/// Keeps only healthy providers, or all of them when none is healthy.
///
/// Disabled unless the consumer URL sets `health.route.enabled=true`.
pub struct HealthCheckRouter {
    enabled: bool,
    checker: Arc<dyn HealthChecker>,
}

impl HealthCheckRouter {
    #[must_use]
    pub fn new(url: &Url, checker: Arc<dyn HealthChecker>) -> Self {
        Self {
            enabled: url.param_bool(HEALTH_ROUTE_ENABLED_KEY, false),
            checker,
        }
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl Router for HealthCheckRouter {
    fn route(
        &self,
        invokers: Vec<Arc<dyn Invoker>>,
        url: &Url,
        invocation: &Invocation,
    ) -> Vec<Arc<dyn Invoker>> {
        if !self.enabled || invokers.is_empty() {
            return invokers;
        }

        let healthy: Vec<_> = invokers
            .iter()
            .filter(|invoker| self.checker.is_healthy(invoker.as_ref()))
            .cloned()
            .collect();

        if healthy.is_empty() {
            warn!(
                service = %url.service_key(),
                method = %invocation.method(),
                providers = invokers.len(),
                "no healthy provider, routing to all"
            );
            return invokers;
        }
        if healthy.len() < invokers.len() {
            debug!(
                service = %url.service_key(),
                excluded = invokers.len() - healthy.len(),
                "unhealthy providers excluded"
            );
        }
        healthy
    }
}

/// Routers for a consumer URL, in the order they run: the condition router
/// when `condition.rule` is set, then the health check router when enabled.
///
/// A rule that does not parse is logged and skipped.
#[must_use]
pub fn default_routers(url: &Url, status: &Arc<StatusRegistry>) -> Vec<Arc<dyn Router>> {
    let mut routers: Vec<Arc<dyn Router>> = Vec::new();
    match ConditionRouter::from_url(url) {
        Ok(Some(router)) => routers.push(Arc::new(router)),
        Ok(None) => {}
        Err(e) => warn!(service = %url.service_key(), error = %e, "route rule ignored"),
    }

    let checker = Arc::new(DefaultHealthChecker::from_url(url, Arc::clone(status)));
    let router = HealthCheckRouter::new(url, checker);
    if router.is_enabled() {
        routers.push(Arc::new(router));
    }
    routers
}
