use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ctp_errors::{CtpError, Result};
use tokio::sync::{oneshot, Mutex};

use crate::types::{
    AcquireOptions, ConcurrencyMetrics, ConcurrencyObserver, Permit, PermitId, TracingObserver,
};

struct InFlight {
    kind: String,
    granted_at: Instant,
}

struct Waiter {
    seq: u64,
    kind: String,
    priority: i32,
    tx: oneshot::Sender<Result<Permit>>,
}

struct Inner {
    capacity: usize,
    queue_size_limit: usize,
    permit_timeout: Option<Duration>,
    fair_scheduling: bool,
    shut_down: bool,

    in_use: HashMap<PermitId, InFlight>,
    waiters: VecDeque<Waiter>,
    default_priorities: HashMap<String, i32>,
    last_granted: HashMap<String, Instant>,

    next_permit_id: u64,
    next_waiter_seq: u64,

    total_acquired: u64,
    total_released: u64,
    total_queued: u64,
    total_timed_out: u64,
    total_expired: u64,
}

impl Inner {
    fn grant_next_waiter(&mut self) {
        if self.waiters.is_empty() {
            return;
        }
        let idx = if self.fair_scheduling {
            self.pick_fair_index()
        } else {
            self.pick_priority_index()
        };
        let Some(idx) = idx else { return };
        let waiter = self.waiters.remove(idx).expect("index came from this deque");

        let id = PermitId(self.next_permit_id);
        self.next_permit_id += 1;
        self.in_use.insert(
            id,
            InFlight {
                kind: waiter.kind.clone(),
                granted_at: Instant::now(),
            },
        );
        self.total_acquired += 1;
        self.last_granted.insert(waiter.kind.clone(), Instant::now());

        let _ = waiter.tx.send(Ok(Permit {
            id,
            worker_kind: waiter.kind,
        }));
    }

    /// Highest priority first; FIFO among equal priorities.
    fn pick_priority_index(&self) -> Option<usize> {
        self.waiters
            .iter()
            .enumerate()
            .max_by_key(|(i, w)| (w.priority, std::cmp::Reverse(*i)))
            .map(|(i, _)| i)
    }

    /// Among worker kinds present in the queue, the kind that has gone
    /// longest without a grant goes first; FIFO within that kind.
    fn pick_fair_index(&self) -> Option<usize> {
        let epoch = Instant::now() - Duration::from_secs(365 * 24 * 3600);
        let starved_kind = self
            .waiters
            .iter()
            .map(|w| w.kind.as_str())
            .collect::<std::collections::HashSet<_>>()
            .into_iter()
            .min_by_key(|k| *self.last_granted.get(*k).unwrap_or(&epoch))?
            .to_string();

        self.waiters.iter().position(|w| w.kind == starved_kind)
    }

    fn force_expire_locked(&mut self, id: PermitId) -> Option<String> {
        let rec = self.in_use.remove(&id)?;
        self.total_expired += 1;
        self.grant_next_waiter();
        Some(rec.kind)
    }

    fn release_locked(&mut self, id: PermitId) -> Option<String> {
        let rec = self.in_use.remove(&id)?;
        self.total_released += 1;
        self.grant_next_waiter();
        Some(rec.kind)
    }

    fn metrics(&self) -> ConcurrencyMetrics {
        let mut per_kind = HashMap::new();
        for rec in self.in_use.values() {
            *per_kind.entry(rec.kind.clone()).or_insert(0) += 1;
        }
        ConcurrencyMetrics {
            current_concurrency: self.in_use.len(),
            max_concurrency: self.capacity,
            queue_length: self.waiters.len(),
            utilization_pct: if self.capacity == 0 {
                0.0
            } else {
                self.in_use.len() as f64 / self.capacity as f64 * 100.0
            },
            total_acquired: self.total_acquired,
            total_released: self.total_released,
            total_queued: self.total_queued,
            total_timed_out: self.total_timed_out,
            total_expired: self.total_expired,
            per_kind_in_flight: per_kind,
        }
    }
}

/// System-wide cap on concurrently executing work units, with priority and
/// fair scheduling of waiters. This is the single source of truth for "how
/// much is in flight right now" across every worker kind.
pub struct GlobalConcurrencyManager {
    inner: Mutex<Inner>,
    observer: Arc<dyn ConcurrencyObserver>,
}

impl GlobalConcurrencyManager {
    pub fn new(max_concurrency: usize) -> Self {
        Self::with_observer(max_concurrency, Arc::new(TracingObserver))
    }

    pub fn with_observer(max_concurrency: usize, observer: Arc<dyn ConcurrencyObserver>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                capacity: max_concurrency,
                queue_size_limit: 10_000,
                permit_timeout: None,
                fair_scheduling: false,
                shut_down: false,
                in_use: HashMap::new(),
                waiters: VecDeque::new(),
                default_priorities: HashMap::new(),
                last_granted: HashMap::new(),
                next_permit_id: 0,
                next_waiter_seq: 0,
                total_acquired: 0,
                total_released: 0,
                total_queued: 0,
                total_timed_out: 0,
                total_expired: 0,
            }),
            observer,
        }
    }

    pub fn set_queue_size_limit(&self, limit: usize) {
        // best-effort synchronous set via blocking_lock would deadlock in async
        // contexts; callers configure this before the manager is shared.
        if let Ok(mut g) = self.inner.try_lock() {
            g.queue_size_limit = limit;
        }
    }

    pub fn set_permit_timeout(&self, timeout: Option<Duration>) {
        if let Ok(mut g) = self.inner.try_lock() {
            g.permit_timeout = timeout;
        }
    }

    pub async fn set_priority(&self, worker_kind: &str, priority: i32) {
        let mut g = self.inner.lock().await;
        g.default_priorities.insert(worker_kind.to_string(), priority);
    }

    pub async fn enable_fair_scheduling(&self, enabled: bool) {
        let mut g = self.inner.lock().await;
        g.fair_scheduling = enabled;
    }

    pub async fn acquire(&self, worker_kind: &str, mut opts: AcquireOptions) -> Result<Permit> {
        let seq;
        let rx = {
            let mut g = self.inner.lock().await;
            if g.shut_down {
                return Err(CtpError::ShutDown);
            }

            if opts.priority.is_none() {
                opts.priority = g.default_priorities.get(worker_kind).copied();
            }

            if g.in_use.len() < g.capacity {
                let id = PermitId(g.next_permit_id);
                g.next_permit_id += 1;
                g.in_use.insert(
                    id,
                    InFlight {
                        kind: worker_kind.to_string(),
                        granted_at: Instant::now(),
                    },
                );
                g.total_acquired += 1;
                g.last_granted.insert(worker_kind.to_string(), Instant::now());
                drop(g);
                self.observer.on_permit_acquired(worker_kind, id);
                return Ok(Permit {
                    id,
                    worker_kind: worker_kind.to_string(),
                });
            }

            if g.waiters.len() >= g.queue_size_limit {
                return Err(CtpError::QueueFull {
                    queue: worker_kind.to_string(),
                    limit: g.queue_size_limit,
                });
            }

            seq = g.next_waiter_seq;
            g.next_waiter_seq += 1;
            let (tx, rx) = oneshot::channel();
            g.waiters.push_back(Waiter {
                seq,
                kind: worker_kind.to_string(),
                priority: opts.priority.unwrap_or(0),
                tx,
            });
            g.total_queued += 1;
            rx
        };

        self.observer.on_permit_queued(worker_kind);

        match tokio::time::timeout(opts.timeout, rx).await {
            Ok(Ok(result)) => {
                if let Ok(permit) = &result {
                    self.observer.on_permit_acquired(worker_kind, permit.id);
                }
                result
            }
            Ok(Err(_)) => Err(CtpError::InternalBug(
                "waiter channel dropped before grant".to_string(),
            )),
            Err(_elapsed) => {
                let mut g = self.inner.lock().await;
                let before = g.waiters.len();
                g.waiters.retain(|w| w.seq != seq);
                if g.waiters.len() < before {
                    g.total_timed_out += 1;
                    Err(CtpError::Timeout(opts.timeout))
                } else {
                    // Lost the race: the waiter was popped and granted right
                    // as the deadline fired. Treat it as a (very late) grant
                    // rather than leaking the permit.
                    Err(CtpError::InternalBug(
                        "permit race on timeout expiry".to_string(),
                    ))
                }
            }
        }
    }

    /// Releases `id`. Idempotency-guarded: releasing the same permit twice
    /// is a caller bug (double-free of a concurrency slot), not a no-op, so
    /// the second call returns `Err(CtpError::AlreadyReleased)` instead of
    /// silently succeeding.
    pub async fn release(&self, id: PermitId) -> Result<()> {
        let kind = {
            let mut g = self.inner.lock().await;
            g.release_locked(id)
        };
        match kind {
            Some(kind) => {
                self.observer.on_permit_released(&kind, id);
                Ok(())
            }
            None => Err(CtpError::AlreadyReleased { permit_id: id.0 }),
        }
    }

    /// Used for crash/stall recovery: treated as a release but tallied and
    /// logged separately. Same idempotency guard as `release`.
    pub async fn force_expire(&self, id: PermitId, reason: &str) -> Result<()> {
        let kind = {
            let mut g = self.inner.lock().await;
            g.force_expire_locked(id)
        };
        match kind {
            Some(kind) => {
                self.observer.on_permit_expired(&kind, id, reason);
                Ok(())
            }
            None => Err(CtpError::AlreadyReleased { permit_id: id.0 }),
        }
    }

    pub async fn metrics(&self) -> ConcurrencyMetrics {
        self.inner.lock().await.metrics()
    }

    /// No separate rolling window is kept; cumulative counters double as the
    /// historical view.
    pub async fn historical_metrics(&self) -> ConcurrencyMetrics {
        self.metrics().await
    }

    pub async fn shutdown(&self) {
        let mut g = self.inner.lock().await;
        g.shut_down = true;
        for waiter in g.waiters.drain(..) {
            let _ = waiter.tx.send(Err(CtpError::ShutDown));
        }
    }

    /// Background sweep that force-expires permits held longer than the
    /// configured `permit_timeout`. No-op if none is set.
    pub async fn sweep_expired(&self) {
        let timeout = {
            let g = self.inner.lock().await;
            g.permit_timeout
        };
        let Some(timeout) = timeout else { return };

        let stale: Vec<PermitId> = {
            let g = self.inner.lock().await;
            let now = Instant::now();
            g.in_use
                .iter()
                .filter(|(_, rec)| now.duration_since(rec.granted_at) > timeout)
                .map(|(id, _)| *id)
                .collect()
        };

        for id in stale {
            let _ = self.force_expire(id, "permit_timeout exceeded").await;
        }
    }
}

/// Spawns a background task that periodically calls `sweep_expired`. Owns
/// its own timer; cancel by dropping the returned JoinHandle's abort.
pub fn spawn_permit_sweeper(
    manager: Arc<GlobalConcurrencyManager>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            manager.sweep_expired().await;
        }
    })
}
