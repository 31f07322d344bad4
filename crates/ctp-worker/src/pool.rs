use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ctp_breaker::CascadeSink;
use ctp_concurrency::{AcquireOptions, GlobalConcurrencyManager};
use ctp_errors::Result;
use tokio::sync::{Notify, RwLock};
use tokio::time::sleep;

use crate::types::{WorkerLimits, CASCADE_REDUCTION_FACTOR};

struct KindState {
    limits: WorkerLimits,
    in_flight: AtomicUsize,
    notify: Notify,
    /// Multiplier applied to `limits.max_concurrency`; `1.0` unless a
    /// dependent breaker is currently cascading or a resource-pressure
    /// step has been recorded.
    factor: RwLock<f64>,
    cooloff_until: RwLock<Option<Instant>>,
}

impl KindState {
    fn new(limits: WorkerLimits) -> Self {
        Self {
            limits,
            in_flight: AtomicUsize::new(0),
            notify: Notify::new(),
            factor: RwLock::new(1.0),
            cooloff_until: RwLock::new(None),
        }
    }
}

/// Per-worker-kind concurrency nested inside the one global cap, with
/// adaptive reduction when a dependency the kind relies on degrades.
///
/// `ExecuteManaged` acquires a global permit first (the hard ceiling the
/// whole pipeline never exceeds), then waits for the kind's own in-flight
/// count to have room under its live adjusted cap.
pub struct WorkerPoolManager {
    global: Arc<GlobalConcurrencyManager>,
    kinds: RwLock<HashMap<String, Arc<KindState>>>,
    cooloff: Duration,
}

impl WorkerPoolManager {
    pub fn new(global: Arc<GlobalConcurrencyManager>) -> Self {
        Self {
            global,
            kinds: RwLock::new(HashMap::new()),
            cooloff: Duration::from_secs(60),
        }
    }

    pub fn with_cooloff(mut self, cooloff: Duration) -> Self {
        self.cooloff = cooloff;
        self
    }

    pub async fn register_worker(&self, kind: &str, limits: WorkerLimits) {
        self.global.set_priority(kind, limits.priority).await;
        self.kinds
            .write()
            .await
            .insert(kind.to_string(), Arc::new(KindState::new(limits)));
    }

    async fn state(&self, kind: &str) -> Option<Arc<KindState>> {
        self.kinds.read().await.get(kind).cloned()
    }

    /// Live per-kind cap after health adjustment. Any recorded cascade or
    /// resource-pressure reduction that has passed its cool-off window is
    /// lazily cleared back to full strength here.
    pub async fn get_adjusted_concurrency(&self, kind: &str) -> usize {
        let Some(st) = self.state(kind).await else {
            return 0;
        };
        self.maybe_clear_cooloff(&st).await;
        let factor = *st.factor.read().await;
        ((st.limits.max_concurrency as f64) * factor).floor().max(1.0) as usize
    }

    async fn maybe_clear_cooloff(&self, st: &KindState) {
        let expired = {
            let until = st.cooloff_until.read().await;
            matches!(*until, Some(deadline) if Instant::now() >= deadline)
        };
        if expired {
            *st.factor.write().await = 1.0;
            *st.cooloff_until.write().await = None;
        }
    }

    /// True when any registered kind is currently running under a reduced
    /// cap — i.e. the pool is shedding load for at least one dependency.
    pub async fn is_in_protective_mode(&self) -> bool {
        for st in self.kinds.read().await.values() {
            self.maybe_clear_cooloff(st).await;
            if *st.factor.read().await < 1.0 {
                return true;
            }
        }
        false
    }

    /// Multiplies `kind`'s cap by another step (e.g. on sustained CPU or
    /// memory pressure observed by the caller). Stacks with any active
    /// cascade reduction; the cool-off timer resets to the full window.
    pub async fn record_resource_pressure(&self, kind: &str, step: f64) {
        if let Some(st) = self.state(kind).await {
            let mut factor = st.factor.write().await;
            *factor = (*factor * step).max(0.05);
            *st.cooloff_until.write().await = Some(Instant::now() + self.cooloff);
        }
    }

    /// Waits until every registered kind has no in-flight work. Intended for
    /// shutdown: callers wrap this in their own timeout since it otherwise
    /// waits forever for a wedged job.
    pub async fn drain(&self) {
        loop {
            let kinds: Vec<_> = self.kinds.read().await.values().cloned().collect();
            if kinds.iter().all(|st| st.in_flight.load(Ordering::SeqCst) == 0) {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    }

    /// Runs `f` under both the global and the kind's own concurrency caps,
    /// recording success/failure for the pool's own health bookkeeping.
    pub async fn execute_managed<T, F, Fut>(&self, kind: &str, opts: AcquireOptions, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let st = self
            .state(kind)
            .await
            .ok_or_else(|| ctp_errors::CtpError::InternalBug(format!("worker kind '{kind}' not registered")))?;

        let permit = self.global.acquire(kind, opts).await?;

        loop {
            let cap = self.get_adjusted_concurrency(kind).await;
            let current = st.in_flight.load(Ordering::SeqCst);
            if current < cap {
                if st
                    .in_flight
                    .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    break;
                }
                continue;
            }
            let notified = st.notify.notified();
            tokio::select! {
                _ = notified => {}
                _ = sleep(Duration::from_millis(50)) => {}
            }
        }

        let result = f().await;

        st.in_flight.fetch_sub(1, Ordering::SeqCst);
        st.notify.notify_waiters();
        if let Err(e) = self.global.release(permit.id).await {
            tracing::warn!(kind, error = %e, "releasing global permit failed");
        }

        result
    }
}

/// Wires `CircuitBreakerSet`'s cascade notifications into this pool:
/// dependents of an open breaker get their concurrency reduced until the
/// pool's cool-off window elapses.
pub struct PoolCascadeSink {
    pool: Arc<WorkerPoolManager>,
}

impl PoolCascadeSink {
    pub fn new(pool: Arc<WorkerPoolManager>) -> Self {
        Self { pool }
    }
}

impl CascadeSink for PoolCascadeSink {
    fn on_cascade(&self, service: &str, affected_worker_kinds: &[String]) {
        let pool = Arc::clone(&self.pool);
        let kinds = affected_worker_kinds.to_vec();
        let service = service.to_string();
        tokio::spawn(async move {
            for kind in kinds {
                tracing::warn!(service, worker_kind = kind, "reducing concurrency, dependency breaker open");
                pool.record_resource_pressure(&kind, CASCADE_REDUCTION_FACTOR).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctp_errors::CtpError;
    use std::sync::atomic::AtomicU32;

    #[tokio::test(flavor = "multi_thread")]
    async fn kind_concurrency_is_capped_independently_of_the_global_ceiling() {
        let global = Arc::new(GlobalConcurrencyManager::new(10));
        let pool = Arc::new(WorkerPoolManager::new(Arc::clone(&global)));
        pool.register_worker(
            "file-analysis",
            WorkerLimits {
                max_concurrency: 2,
                priority: 0,
            },
        )
        .await;

        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let pool = Arc::clone(&pool);
            let peak = Arc::clone(&peak);
            let current = Arc::clone(&current);
            handles.push(tokio::spawn(async move {
                pool.execute_managed("file-analysis", AcquireOptions::default(), || async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(30)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, CtpError>(())
                })
                .await
            }));
        }

        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2, "peak in-flight must respect the per-kind cap");
    }

    #[tokio::test]
    async fn cascade_notification_halves_adjusted_concurrency() {
        let global = Arc::new(GlobalConcurrencyManager::new(10));
        let pool = Arc::new(WorkerPoolManager::new(Arc::clone(&global)));
        pool.register_worker(
            "relationship-resolution",
            WorkerLimits {
                max_concurrency: 8,
                priority: 0,
            },
        )
        .await;

        let sink = PoolCascadeSink::new(Arc::clone(&pool));
        sink.on_cascade("llm", &["relationship-resolution".to_string()]);

        // give the spawned reduction task a chance to run
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(pool.get_adjusted_concurrency("relationship-resolution").await, 4);
        assert!(pool.is_in_protective_mode().await);
    }

    #[tokio::test]
    async fn unregistered_kind_is_rejected() {
        let global = Arc::new(GlobalConcurrencyManager::new(4));
        let pool = WorkerPoolManager::new(global);
        let counter = AtomicU32::new(0);
        let result = pool
            .execute_managed("unknown", AcquireOptions::default(), || async {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CtpError>(())
            })
            .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
