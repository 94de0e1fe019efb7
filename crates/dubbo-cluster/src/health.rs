//! Provider health derived from call statistics.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dubbo_rpc::url::{
    CIRCUIT_TRIPPED_TIMEOUT_FACTOR_KEY, OUTSTANDING_REQUEST_LIMIT_KEY,
    SUCCESSIVE_FAILED_THRESHOLD_KEY,
};
use dubbo_rpc::{Invoker, StatusRegistry, Url};

pub const DEFAULT_SUCCESSIVE_FAILED_THRESHOLD: u64 = 5;
pub const DEFAULT_CIRCUIT_TRIPPED_TIMEOUT_FACTOR: Duration = Duration::from_millis(1000);
pub const DEFAULT_OUTSTANDING_REQUEST_LIMIT: i64 = i32::MAX as i64;

/// Longest a tripped circuit stays open.
pub const MAX_CIRCUIT_TRIPPED_TIMEOUT: Duration = Duration::from_millis(30_000);

/// The trip length doubles per failure past the threshold up to this many times.
const MAX_BACKOFF_EXPONENT: u64 = 5;

/// Decides whether a provider should receive traffic.
pub trait HealthChecker: Send + Sync {
    fn is_healthy(&self, invoker: &dyn Invoker) -> bool;
}

/// Circuit breaker over the statistics recorded by the `active` filter.
///
/// A provider is unhealthy while it has more than `outstanding.request.limit`
/// calls in flight, or while its circuit is tripped. The circuit trips once
/// `successive.failed.threshold` calls in a row have failed and stays open
/// for `circuit.tripped.timeout.factor` doubled for every failure past the
/// threshold (at most 32 times), capped at 30 seconds. The next success
/// closes it.
#[derive(Debug)]
pub struct DefaultHealthChecker {
    status: Arc<StatusRegistry>,
    successive_failed_threshold: u64,
    circuit_tripped_timeout_factor: Duration,
    outstanding_request_limit: i64,
}

impl DefaultHealthChecker {
    /// Reads the thresholds from the consumer URL.
    #[must_use]
    pub fn from_url(url: &Url, status: Arc<StatusRegistry>) -> Self {
        let threshold = url
            .param(SUCCESSIVE_FAILED_THRESHOLD_KEY)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_SUCCESSIVE_FAILED_THRESHOLD);
        Self {
            status,
            successive_failed_threshold: threshold,
            circuit_tripped_timeout_factor: url.param_duration_ms(
                CIRCUIT_TRIPPED_TIMEOUT_FACTOR_KEY,
                DEFAULT_CIRCUIT_TRIPPED_TIMEOUT_FACTOR,
            ),
            outstanding_request_limit: url.param_i64(
                OUTSTANDING_REQUEST_LIMIT_KEY,
                DEFAULT_OUTSTANDING_REQUEST_LIMIT,
            ),
        }
    }

    #[must_use]
    pub const fn successive_failed_threshold(&self) -> u64 {
        self.successive_failed_threshold
    }

    /// How long the circuit stays open after `successive_failures` failures
    /// in a row. Zero below the threshold.
    #[must_use]
    pub fn circuit_tripped_timeout(&self, successive_failures: u64) -> Duration {
        if successive_failures < self.successive_failed_threshold {
            return Duration::ZERO;
        }
        let exponent = (successive_failures - self.successive_failed_threshold)
            .min(MAX_BACKOFF_EXPONENT);
        let multiplier = 1_u32 << exponent;
        self.circuit_tripped_timeout_factor
            .saturating_mul(multiplier)
            .min(MAX_CIRCUIT_TRIPPED_TIMEOUT)
    }

    fn is_circuit_tripped(&self, url: &Url) -> bool {
        let status = self.status.url_status(url);
        let failures = status.successive_failures();
        if failures < self.successive_failed_threshold {
            return false;
        }
        status.last_failure().is_some_and(|last| {
            Instant::now().saturating_duration_since(last) < self.circuit_tripped_timeout(failures)
        })
    }

    fn is_overloaded(&self, url: &Url) -> bool {
        self.status.url_status(url).active() > self.outstanding_request_limit
    }
}

impl HealthChecker for DefaultHealthChecker {
    fn is_healthy(&self, invoker: &dyn Invoker) -> bool {
        let url = invoker.url();
        !self.is_overloaded(url) && !self.is_circuit_tripped(url)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::testing::MockInvoker;

    fn checker(params: &str) -> DefaultHealthChecker {
        let url = Url::parse(&format!("consumer://127.0.0.1/svc?{params}")).unwrap();
        DefaultHealthChecker::from_url(&url, Arc::new(StatusRegistry::new()))
    }

    #[rstest]
    #[case(4, 0)]
    #[case(5, 1000)]
    #[case(6, 2000)]
    #[case(7, 4000)]
    #[case(9, 16_000)]
    #[case(10, 30_000)]
    #[case(50, 30_000)]
    fn trip_length_doubles_and_caps(#[case] failures: u64, #[case] expected_ms: u64) {
        assert_eq!(
            checker("").circuit_tripped_timeout(failures),
            Duration::from_millis(expected_ms)
        );
    }

    #[test]
    fn thresholds_come_from_the_url() {
        let checker = checker(
            "successive.failed.threshold=2&circuit.tripped.timeout.factor=10&outstanding.request.limit=1",
        );
        assert_eq!(checker.successive_failed_threshold(), 2);
        assert_eq!(checker.circuit_tripped_timeout(3), Duration::from_millis(20));
        assert_eq!(checker.outstanding_request_limit, 1);
    }

    #[tokio::test]
    async fn circuit_closes_after_trip_length() {
        let status = Arc::new(StatusRegistry::new());
        let url = Url::parse(
            "consumer://127.0.0.1/svc?successive.failed.threshold=2&circuit.tripped.timeout.factor=30",
        )
        .unwrap();
        let checker = DefaultHealthChecker::from_url(&url, Arc::clone(&status));
        let provider = MockInvoker::failing("dubbo://10.0.0.1:20880/svc");

        for _ in 0..2 {
            status.begin(provider.url(), "m");
            status.end(provider.url(), "m", Duration::from_millis(1), false);
        }
        assert!(!checker.is_healthy(&*provider));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(checker.is_healthy(&*provider));
    }

    #[test]
    fn outstanding_limit_excludes_busy_providers() {
        let status = Arc::new(StatusRegistry::new());
        let url = Url::parse("consumer://127.0.0.1/svc?outstanding.request.limit=1").unwrap();
        let checker = DefaultHealthChecker::from_url(&url, Arc::clone(&status));
        let provider = MockInvoker::answering("dubbo://10.0.0.1:20880/svc", "ok");

        status.begin(provider.url(), "m");
        assert!(checker.is_healthy(&*provider));
        status.begin(provider.url(), "m");
        assert!(!checker.is_healthy(&*provider));
    }
}
