use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The fixed set of queues this pipeline is allowed to talk to. Anything
/// else is rejected at `QueueManager::add` — no queue is created
/// implicitly by name.
pub const ALLOWED_QUEUES: &[&str] = &[
    "file-analysis",
    "directory-aggregation",
    "directory-resolution",
    "relationship-resolution",
    "reconciliation",
    "analysis-findings",
    "global-resolution",
    "relationship-validated",
    "llm-analysis",
    "graph-ingestion",
    "triangulated-analysis",
    "relationship-confidence-escalation",
    "failed-jobs",
];

pub const DEAD_LETTER_QUEUE: &str = "failed-jobs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPolicy {
    Exponential { base: Duration },
    Fixed(Duration),
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            BackoffPolicy::Fixed(d) => *d,
            BackoffPolicy::Exponential { base } => *base * 2u32.saturating_pow(attempt),
        }
    }

    /// Splits into the `(kind, base_ms)` pair the durable queue table
    /// stores; `queue_fail_or_retry` recomputes the per-attempt delay from
    /// these rather than from a `Duration` the row can't hold directly.
    pub(crate) fn as_db_parts(&self) -> (&'static str, i64) {
        match self {
            BackoffPolicy::Fixed(d) => ("fixed", d.as_millis() as i64),
            BackoffPolicy::Exponential { base } => ("exponential", base.as_millis() as i64),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobOptions {
    pub attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: BackoffPolicy::Exponential {
                base: Duration::from_secs(1),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(pub i64);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id_raw: i64,
    pub queue: String,
    pub data: Value,
    pub attempts_made: u32,
}

impl Job {
    pub fn id(&self) -> JobId {
        JobId(self.id_raw)
    }
}

impl Job {
    pub(crate) fn from_row(row: ctp_db::queue::QueueJobRow) -> Self {
        Job {
            id_raw: row.id,
            queue: row.queue,
            data: row.payload,
            attempts_made: row.attempts_made.max(0) as u32,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobCounts {
    pub active: usize,
    pub waiting: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
}

impl std::ops::Add for JobCounts {
    type Output = JobCounts;
    fn add(self, rhs: JobCounts) -> JobCounts {
        JobCounts {
            active: self.active + rhs.active,
            waiting: self.waiting + rhs.waiting,
            completed: self.completed + rhs.completed,
            failed: self.failed + rhs.failed,
            delayed: self.delayed + rhs.delayed,
        }
    }
}

impl From<ctp_db::queue::QueueCounts> for JobCounts {
    fn from(c: ctp_db::queue::QueueCounts) -> Self {
        JobCounts {
            active: c.active.max(0) as usize,
            waiting: c.waiting.max(0) as usize,
            completed: c.completed.max(0) as usize,
            failed: c.failed.max(0) as usize,
            delayed: c.delayed.max(0) as usize,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub concurrency: usize,
    pub stalled_interval: Duration,
    pub lock_duration: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            stalled_interval: Duration::from_secs(30),
            lock_duration: Duration::from_secs(30),
        }
    }
}
