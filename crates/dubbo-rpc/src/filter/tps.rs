//! Capping the call rate of a service.
//!
//! `tps.limit.rate` allows that many calls per `tps.limit.interval`
//! milliseconds (60000 by default) in a fixed window per service. A
//! `methods.<m>.tps.limit.rate` override gives that method its own window.
//! A missing or negative rate disables the limit. Calls over the limit fail
//! with [`RpcError::Rejected`], which a failover consumer retries elsewhere.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::warn;

use super::{Filter, Next};
use crate::error::RpcError;
use crate::invocation::Invocation;
use crate::result::RpcResult;
use crate::url::{Url, TPS_LIMIT_INTERVAL_KEY, TPS_LIMIT_RATE_KEY};

pub const TPS_LIMIT_FILTER: &str = "tps";

pub const DEFAULT_TPS_LIMIT_INTERVAL: Duration = Duration::from_secs(60);

/// Calls admitted in the current window.
#[derive(Debug)]
struct Window {
    rate: u64,
    interval: Duration,
    state: Mutex<(Instant, u64)>,
}

impl Window {
    fn new(rate: u64, interval: Duration) -> Self {
        Self {
            rate,
            interval,
            state: Mutex::new((Instant::now(), 0)),
        }
    }

    fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        let (started, count) = &mut *state;
        if started.elapsed() >= self.interval {
            *started = Instant::now();
            *count = 0;
        }
        if *count >= self.rate {
            return false;
        }
        *count += 1;
        true
    }
}

/// Rejects calls beyond the configured rate.
#[derive(Debug, Default)]
pub struct TpsLimitFilter {
    windows: DashMap<String, Window>,
}

impl TpsLimitFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether one more call to `method` fits the current window.
    #[must_use]
    pub fn is_allowable(&self, url: &Url, method: &str) -> bool {
        let Some(rate) = url
            .method_param(method, TPS_LIMIT_RATE_KEY)
            .and_then(|v| v.trim().parse::<i64>().ok())
        else {
            return true;
        };
        let Ok(rate) = u64::try_from(rate) else {
            return true;
        };
        let interval = url.param_duration_ms(TPS_LIMIT_INTERVAL_KEY, DEFAULT_TPS_LIMIT_INTERVAL);

        let key = if url
            .param(&format!("methods.{method}.{TPS_LIMIT_RATE_KEY}"))
            .is_some()
        {
            format!("{}#{method}", url.service_key())
        } else {
            url.service_key()
        };

        let mut window = self
            .windows
            .entry(key)
            .or_insert_with(|| Window::new(rate, interval));
        if window.rate != rate || window.interval != interval {
            *window = Window::new(rate, interval);
        }
        window.try_acquire()
    }
}

#[async_trait]
impl Filter for TpsLimitFilter {
    async fn invoke(&self, next: Next<'_>, invocation: &mut Invocation) -> RpcResult {
        let url = next.url();
        if self.is_allowable(url, invocation.method()) {
            return next.run(invocation).await;
        }
        warn!(
            service = %url.service_key(),
            method = %invocation.method(),
            "tps limit exceeded"
        );
        RpcResult::err(RpcError::Rejected(format!(
            "{}#{} exceeded its tps limit",
            url.service_key(),
            invocation.method()
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use dubbo_proto::Value;

    use super::*;
    use crate::filter::testing::StubInvoker;
    use crate::filter::FilterChain;
    use crate::invoker::Invoker;

    fn service_url(params: &str) -> Url {
        Url::parse(&format!("dubbo://h:1/svc?{params}")).unwrap()
    }

    #[test]
    fn unlimited_without_a_rate() {
        let filter = TpsLimitFilter::new();
        for params in ["", "tps.limit.rate=-1", "tps.limit.rate=lots"] {
            let url = service_url(params);
            assert!((0..100).all(|_| filter.is_allowable(&url, "m")), "{params}");
        }
    }

    #[test]
    fn rate_caps_each_window() {
        let filter = TpsLimitFilter::new();
        let url = service_url("tps.limit.rate=3");
        let admitted = (0..10).filter(|_| filter.is_allowable(&url, "m")).count();
        assert_eq!(admitted, 3);

        let zero = service_url("tps.limit.rate=0");
        assert!(!TpsLimitFilter::new().is_allowable(&zero, "m"));
    }

    #[tokio::test]
    async fn window_resets_after_the_interval() {
        let filter = TpsLimitFilter::new();
        let url = service_url("tps.limit.rate=2&tps.limit.interval=50");
        assert!(filter.is_allowable(&url, "m"));
        assert!(filter.is_allowable(&url, "m"));
        assert!(!filter.is_allowable(&url, "m"));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(filter.is_allowable(&url, "m"));
    }

    #[test]
    fn methods_share_the_service_window_unless_overridden() {
        let filter = TpsLimitFilter::new();
        let url = service_url("tps.limit.rate=2&methods.hot.tps.limit.rate=1");
        assert!(filter.is_allowable(&url, "a"));
        assert!(filter.is_allowable(&url, "b"));
        assert!(!filter.is_allowable(&url, "a"));

        assert!(filter.is_allowable(&url, "hot"));
        assert!(!filter.is_allowable(&url, "hot"));
    }

    #[tokio::test]
    async fn over_limit_calls_are_rejected_before_the_invoker() {
        let terminal = StubInvoker::ok("dubbo://h:1/svc?tps.limit.rate=1", Value::Int(1));
        let filter: Arc<dyn Filter> = Arc::new(TpsLimitFilter::new());
        let chain = FilterChain::new(terminal.clone(), vec![(TPS_LIMIT_FILTER.into(), filter)]);

        assert!(chain.invoke(&mut Invocation::new("m", vec![])).await.is_ok());
        let second = chain.invoke(&mut Invocation::new("m", vec![])).await;
        assert!(matches!(second.error(), Some(RpcError::Rejected(_))));
        assert_eq!(terminal.calls(), 1);
    }
}
