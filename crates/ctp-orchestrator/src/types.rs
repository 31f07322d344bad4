use std::time::Duration;

use chrono::{DateTime, Utc};
use ctp_worker::MonitorOutcome;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Init,
    Run,
    Drain,
    GraphBuild,
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct ShutdownTimeouts {
    pub publisher: Duration,
    pub workers: Duration,
    pub pool_manager: Duration,
    pub queues: Duration,
    pub graph_driver: Duration,
    pub relational_store: Duration,
}

impl Default for ShutdownTimeouts {
    fn default() -> Self {
        Self {
            publisher: Duration::from_secs(10),
            workers: Duration::from_secs(10),
            pool_manager: Duration::from_secs(5),
            queues: Duration::from_secs(5),
            graph_driver: Duration::from_secs(5),
            relational_store: Duration::from_secs(5),
        }
    }
}

/// Final report handed back to the caller once `SHUTDOWN` completes.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub completion_outcome: MonitorOutcome,
    pub pois_discovered: i64,
    pub relationships_pending: i64,
    pub graph_nodes_projected: usize,
    pub graph_edges_projected: usize,
    pub job_counts: ctp_queue::JobCounts,
}

impl RunReport {
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}
