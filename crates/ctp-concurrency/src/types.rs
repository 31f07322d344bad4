use std::collections::HashMap;
use std::time::Duration;

/// Opaque handle identifying one granted unit of concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PermitId(pub u64);

#[derive(Debug, Clone)]
pub struct AcquireOptions {
    pub timeout: Duration,
    /// `None` means "use the worker kind's default priority", set via
    /// `GlobalConcurrencyManager::set_priority`.
    pub priority: Option<i32>,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            priority: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Permit {
    pub id: PermitId,
    pub worker_kind: String,
}

#[derive(Debug, Clone, Default)]
pub struct ConcurrencyMetrics {
    pub current_concurrency: usize,
    pub max_concurrency: usize,
    pub queue_length: usize,
    pub utilization_pct: f64,
    pub total_acquired: u64,
    pub total_released: u64,
    pub total_queued: u64,
    pub total_timed_out: u64,
    pub total_expired: u64,
    pub per_kind_in_flight: HashMap<String, usize>,
}

/// Narrow observer interface: the manager emits typed events, the
/// orchestrator decides what sink (tracing, a metrics registry, nothing) to
/// wire up. Replaces ad-hoc event-emitter callbacks.
pub trait ConcurrencyObserver: Send + Sync {
    fn on_permit_acquired(&self, _kind: &str, _id: PermitId) {}
    fn on_permit_released(&self, _kind: &str, _id: PermitId) {}
    fn on_permit_queued(&self, _kind: &str) {}
    fn on_permit_expired(&self, _kind: &str, _id: PermitId, _reason: &str) {}
}

/// Default observer: forwards every event to `tracing`.
pub struct TracingObserver;

impl ConcurrencyObserver for TracingObserver {
    fn on_permit_acquired(&self, kind: &str, id: PermitId) {
        tracing::debug!(worker_kind = kind, permit_id = id.0, "permit acquired");
    }

    fn on_permit_released(&self, kind: &str, id: PermitId) {
        tracing::debug!(worker_kind = kind, permit_id = id.0, "permit released");
    }

    fn on_permit_queued(&self, kind: &str) {
        tracing::debug!(worker_kind = kind, "permit queued");
    }

    fn on_permit_expired(&self, kind: &str, id: PermitId, reason: &str) {
        tracing::warn!(
            worker_kind = kind,
            permit_id = id.0,
            reason,
            "permit force-expired"
        );
    }
}
