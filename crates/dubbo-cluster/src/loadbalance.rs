//! Load balancing across candidate providers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use dubbo_rpc::{Invocation, Invoker, RpcError, StatusRegistry, Url};
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

pub const RANDOM_LOADBALANCE: &str = "random";
pub const ROUND_ROBIN_LOADBALANCE: &str = "roundrobin";
pub const LEAST_ACTIVE_LOADBALANCE: &str = "leastactive";

/// Picks one invoker out of a non-empty candidate list.
pub trait LoadBalance: Send + Sync {
    /// Returns `None` only when `invokers` is empty.
    fn select(
        &self,
        invokers: &[Arc<dyn Invoker>],
        url: &Url,
        invocation: &Invocation,
    ) -> Option<Arc<dyn Invoker>>;

    fn name(&self) -> &'static str;
}

/// Uniformly random choice.
pub struct RandomLoadBalance {
    rng: Mutex<SmallRng>,
}

impl RandomLoadBalance {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(SmallRng::from_entropy()),
        }
    }
}

impl Default for RandomLoadBalance {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RandomLoadBalance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RandomLoadBalance").finish()
    }
}

impl LoadBalance for RandomLoadBalance {
    fn select(
        &self,
        invokers: &[Arc<dyn Invoker>],
        _url: &Url,
        _invocation: &Invocation,
    ) -> Option<Arc<dyn Invoker>> {
        match invokers.len() {
            0 => None,
            1 => Some(Arc::clone(&invokers[0])),
            len => {
                let index = self.rng.lock().gen_range(0..len);
                Some(Arc::clone(&invokers[index]))
            }
        }
    }

    fn name(&self) -> &'static str {
        RANDOM_LOADBALANCE
    }
}

/// Takes turns per service method.
#[derive(Debug, Default)]
pub struct RoundRobinLoadBalance {
    counters: DashMap<String, AtomicU64>,
}

impl RoundRobinLoadBalance {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalance for RoundRobinLoadBalance {
    fn select(
        &self,
        invokers: &[Arc<dyn Invoker>],
        url: &Url,
        invocation: &Invocation,
    ) -> Option<Arc<dyn Invoker>> {
        if invokers.is_empty() {
            return None;
        }

        let key = format!("{}#{}", url.service_key(), invocation.method());
        let counter = self.counters.entry(key).or_insert_with(|| AtomicU64::new(0));
        let turn = counter.fetch_add(1, Ordering::Relaxed);
        let index = usize::try_from(turn % invokers.len() as u64).unwrap_or(0);
        Some(Arc::clone(&invokers[index]))
    }

    fn name(&self) -> &'static str {
        ROUND_ROBIN_LOADBALANCE
    }
}

/// Prefers the provider with the fewest calls in flight for this method.
/// Ties are broken at random.
pub struct LeastActiveLoadBalance {
    status: Arc<StatusRegistry>,
    rng: Mutex<SmallRng>,
}

impl LeastActiveLoadBalance {
    #[must_use]
    pub fn new(status: Arc<StatusRegistry>) -> Self {
        Self {
            status,
            rng: Mutex::new(SmallRng::from_entropy()),
        }
    }
}

impl std::fmt::Debug for LeastActiveLoadBalance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeastActiveLoadBalance").finish()
    }
}

impl LoadBalance for LeastActiveLoadBalance {
    fn select(
        &self,
        invokers: &[Arc<dyn Invoker>],
        _url: &Url,
        invocation: &Invocation,
    ) -> Option<Arc<dyn Invoker>> {
        let mut least = i64::MAX;
        let mut candidates: Vec<&Arc<dyn Invoker>> = Vec::new();
        for invoker in invokers {
            let active = self
                .status
                .method_status(invoker.url(), invocation.method())
                .active();
            if active < least {
                least = active;
                candidates.clear();
            }
            if active == least {
                candidates.push(invoker);
            }
        }

        match candidates.len() {
            0 => None,
            1 => Some(Arc::clone(candidates[0])),
            len => {
                let index = self.rng.lock().gen_range(0..len);
                Some(Arc::clone(candidates[index]))
            }
        }
    }

    fn name(&self) -> &'static str {
        LEAST_ACTIVE_LOADBALANCE
    }
}

/// Load balances by name.
#[derive(Clone)]
pub struct LoadBalanceRegistry {
    balancers: HashMap<String, Arc<dyn LoadBalance>>,
}

impl LoadBalanceRegistry {
    /// A registry holding `random`, `roundrobin` and `leastactive`.
    #[must_use]
    pub fn with_defaults(status: Arc<StatusRegistry>) -> Self {
        let mut registry = Self {
            balancers: HashMap::new(),
        };
        registry.register(Arc::new(RandomLoadBalance::new()));
        registry.register(Arc::new(RoundRobinLoadBalance::new()));
        registry.register(Arc::new(LeastActiveLoadBalance::new(status)));
        registry
    }

    pub fn register(&mut self, balancer: Arc<dyn LoadBalance>) {
        self.balancers.insert(balancer.name().to_owned(), balancer);
    }

    /// Looks up `name`.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::UnknownExtension`] when nothing is registered
    /// under `name`.
    pub fn get(&self, name: &str) -> Result<Arc<dyn LoadBalance>, RpcError> {
        self.balancers
            .get(name)
            .cloned()
            .ok_or_else(|| RpcError::UnknownExtension {
                kind: "loadbalance",
                name: name.to_owned(),
            })
    }
}
