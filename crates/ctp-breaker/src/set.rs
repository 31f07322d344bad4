use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use ctp_errors::{CtpError, Result};
use tokio::sync::RwLock;

use crate::engine::CircuitBreaker;
use crate::types::{BreakerConfig, BreakerState, HealthStatus, ServiceHealth};

/// Notified when a breaker opens, so dependent worker kinds can shed load
/// before the queue backs up behind a dead dependency. Kept narrow on
/// purpose: `ctp-breaker` has no knowledge of `ctp-worker`'s pool types.
pub trait CascadeSink: Send + Sync {
    fn on_cascade(&self, service: &str, affected_worker_kinds: &[String]);
}

struct NoopCascadeSink;
impl CascadeSink for NoopCascadeSink {
    fn on_cascade(&self, _service: &str, _affected_worker_kinds: &[String]) {}
}

/// One breaker per external dependency plus the dependency graph needed to
/// warn worker kinds when a breaker they rely on trips open.
pub struct CircuitBreakerSet {
    breakers: HashMap<String, Arc<CircuitBreaker>>,
    dependents: RwLock<HashMap<String, Vec<String>>>,
    cascade_sink: Arc<dyn CascadeSink>,
}

impl CircuitBreakerSet {
    pub fn new() -> Self {
        Self {
            breakers: HashMap::new(),
            dependents: RwLock::new(HashMap::new()),
            cascade_sink: Arc::new(NoopCascadeSink),
        }
    }

    pub fn with_cascade_sink(mut self, sink: Arc<dyn CascadeSink>) -> Self {
        self.cascade_sink = sink;
        self
    }

    pub fn register(mut self, breaker: CircuitBreaker) -> Self {
        self.breakers
            .insert(breaker.name().to_string(), Arc::new(breaker));
        self
    }

    pub fn get(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(service).cloned()
    }

    /// Declares that `worker_kind` issues calls through `service`'s breaker,
    /// so a future cascade notification knows who to warn.
    pub async fn register_dependency(&self, service: &str, worker_kind: &str) {
        let mut deps = self.dependents.write().await;
        deps.entry(service.to_string())
            .or_default()
            .push(worker_kind.to_string());
    }

    /// Call after every breaker interaction that might have changed its
    /// state; fires the cascade notification exactly once per OPEN
    /// transition that has dependents registered.
    pub async fn check_cascade(&self, service: &str) {
        let Some(breaker) = self.breakers.get(service) else {
            return;
        };
        if breaker.state().await != BreakerState::Open {
            return;
        }
        let deps = self.dependents.read().await;
        if let Some(kinds) = deps.get(service) {
            if !kinds.is_empty() {
                self.cascade_sink.on_cascade(service, kinds);
            }
        }
    }

    /// Runs `call` through `service`'s breaker and checks for a cascade
    /// immediately after, so any real state transition this call causes
    /// reaches dependent worker kinds without a separate polling loop.
    pub async fn execute<T, F, Fut>(&self, service: &str, max_retries: u32, call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = self
            .get(service)
            .ok_or_else(|| CtpError::InternalBug(format!("no breaker registered for service '{service}'")))?;
        let result = breaker.execute(max_retries, call).await;
        self.check_cascade(service).await;
        result
    }

    pub async fn health(&self) -> HealthStatus {
        let mut services = Vec::new();
        let mut recommendations = Vec::new();
        let mut any_open = false;
        let mut any_half_open = false;

        for (name, breaker) in &self.breakers {
            let state = breaker.state().await;
            let failure_count = breaker.failure_count().await;
            match state {
                BreakerState::Open => {
                    any_open = true;
                    recommendations.push(format!(
                        "service '{name}' circuit is open; shed load on dependents"
                    ));
                }
                BreakerState::HalfOpen => any_half_open = true,
                BreakerState::Closed => {}
            }
            services.push(ServiceHealth {
                service: name.clone(),
                state,
                failure_count,
            });
        }

        let overall = if any_open {
            "degraded"
        } else if any_half_open {
            "recovering"
        } else {
            "healthy"
        };

        HealthStatus {
            overall,
            services,
            recommendations,
        }
    }
}

impl Default for CircuitBreakerSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience constructor wiring the three dependencies this pipeline
/// always has: the LLM, the graph store, and the cache/queue bus.
pub fn default_breaker_set(
    llm_cfg: BreakerConfig,
    graph_cfg: BreakerConfig,
    cache_cfg: BreakerConfig,
) -> CircuitBreakerSet {
    CircuitBreakerSet::new()
        .register(CircuitBreaker::new(
            "llm",
            llm_cfg,
            Box::new(crate::types::LlmClassifier),
        ))
        .register(CircuitBreaker::new(
            "graph-store",
            graph_cfg,
            Box::new(crate::types::GraphStoreClassifier),
        ))
        .register(CircuitBreaker::new(
            "cache",
            cache_cfg,
            Box::new(crate::types::CacheClassifier),
        ))
}
