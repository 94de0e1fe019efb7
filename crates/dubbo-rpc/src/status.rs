//! Per-provider call statistics.
//!
//! Counters are kept per provider URL and per URL plus method. The active
//! filter writes them; the health checker and the least-active load
//! balancer read them. Readers tolerate slightly stale values.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::url::Url;

/// Rolling counters for one provider or one provider method.
#[derive(Debug, Default)]
pub struct RpcStatus {
    active: AtomicI64,
    total: AtomicU64,
    failed: AtomicU64,
    successive_failures: AtomicU64,
    total_elapsed_ms: AtomicU64,
    failed_elapsed_ms: AtomicU64,
    max_elapsed_ms: AtomicU64,
    last_failure: Mutex<Option<Instant>>,
}

impl RpcStatus {
    /// Calls started but not finished.
    pub fn active(&self) -> i64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Failures since the last success.
    pub fn successive_failures(&self) -> u64 {
        self.successive_failures.load(Ordering::Relaxed)
    }

    pub fn last_failure(&self) -> Option<Instant> {
        *self.last_failure.lock()
    }

    pub fn total_elapsed(&self) -> Duration {
        Duration::from_millis(self.total_elapsed_ms.load(Ordering::Relaxed))
    }

    pub fn failed_elapsed(&self) -> Duration {
        Duration::from_millis(self.failed_elapsed_ms.load(Ordering::Relaxed))
    }

    pub fn max_elapsed(&self) -> Duration {
        Duration::from_millis(self.max_elapsed_ms.load(Ordering::Relaxed))
    }

    /// Mean elapsed time of finished calls.
    pub fn average_elapsed(&self) -> Duration {
        match self.total() {
            0 => Duration::ZERO,
            n => self.total_elapsed() / u32::try_from(n).unwrap_or(u32::MAX),
        }
    }

    fn begin(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    fn end(&self, elapsed: Duration, succeeded: bool) {
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
        self.total_elapsed_ms.fetch_add(ms, Ordering::Relaxed);
        self.max_elapsed_ms.fetch_max(ms, Ordering::Relaxed);
        if succeeded {
            self.successive_failures.store(0, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
            self.failed_elapsed_ms.fetch_add(ms, Ordering::Relaxed);
            self.successive_failures.fetch_add(1, Ordering::Relaxed);
            *self.last_failure.lock() = Some(Instant::now());
        }
    }
}

/// Statistics for every provider seen by this process.
#[derive(Debug, Default)]
pub struct StatusRegistry {
    services: DashMap<String, Arc<RpcStatus>>,
    methods: DashMap<String, Arc<RpcStatus>>,
}

impl StatusRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Status of a provider across all methods.
    pub fn url_status(&self, url: &Url) -> Arc<RpcStatus> {
        Arc::clone(self.services.entry(url.key()).or_default().value())
    }

    pub fn method_status(&self, url: &Url, method: &str) -> Arc<RpcStatus> {
        let key = format!("{}#{method}", url.key());
        Arc::clone(self.methods.entry(key).or_default().value())
    }

    /// Records the start of a call.
    pub fn begin(&self, url: &Url, method: &str) {
        self.url_status(url).begin();
        self.method_status(url, method).begin();
    }

    /// Records the end of a call started with [`StatusRegistry::begin`].
    pub fn end(&self, url: &Url, method: &str, elapsed: Duration, succeeded: bool) {
        self.url_status(url).end(elapsed, succeeded);
        self.method_status(url, method).end(elapsed, succeeded);
    }

    /// Drops the counters of a provider that left.
    pub fn remove(&self, url: &Url) {
        let key = url.key();
        self.services.remove(&key);
        let prefix = format!("{key}#");
        self.methods.retain(|k, _| !k.starts_with(&prefix));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("dubbo://10.0.0.1:20880/org.example.Echo").unwrap()
    }

    #[test]
    fn begin_end_updates_both_levels() {
        let registry = StatusRegistry::new();
        let url = url();

        registry.begin(&url, "echo");
        registry.begin(&url, "ping");
        assert_eq!(registry.url_status(&url).active(), 2);
        assert_eq!(registry.method_status(&url, "echo").active(), 1);

        registry.end(&url, "echo", Duration::from_millis(40), false);
        registry.end(&url, "ping", Duration::from_millis(10), true);

        let service = registry.url_status(&url);
        assert_eq!(service.active(), 0);
        assert_eq!(service.total(), 2);
        assert_eq!(service.failed(), 1);
        assert_eq!(service.max_elapsed(), Duration::from_millis(40));
        assert_eq!(service.average_elapsed(), Duration::from_millis(25));

        let echo = registry.method_status(&url, "echo");
        assert_eq!(echo.successive_failures(), 1);
        assert!(echo.last_failure().is_some());
        assert_eq!(echo.failed_elapsed(), Duration::from_millis(40));
    }

    #[test]
    fn success_resets_successive_failures() {
        let registry = StatusRegistry::new();
        let url = url();
        for _ in 0..3 {
            registry.begin(&url, "m");
            registry.end(&url, "m", Duration::ZERO, false);
        }
        assert_eq!(registry.url_status(&url).successive_failures(), 3);

        registry.begin(&url, "m");
        registry.end(&url, "m", Duration::ZERO, true);
        let status = registry.url_status(&url);
        assert_eq!(status.successive_failures(), 0);
        assert_eq!(status.failed(), 3);
    }

    #[test]
    fn remove_forgets_provider() {
        let registry = StatusRegistry::new();
        let url = url();
        registry.begin(&url, "m");
        registry.remove(&url);
        assert_eq!(registry.url_status(&url).active(), 0);
        assert_eq!(registry.method_status(&url, "m").active(), 0);
    }
}
