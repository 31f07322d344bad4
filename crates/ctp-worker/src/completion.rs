use std::sync::Arc;
use std::time::Instant;

use ctp_queue::QueueManager;
use tokio::time::sleep;

use crate::types::{MonitorConfig, MonitorOutcome};

/// Decides when a run is done without a global barrier: polls job counts
/// until the queue system has been idle for `required_idle_checks`
/// consecutive polls, subject to a wall-clock timeout and a failure-rate
/// guard.
pub struct CompletionMonitor {
    queues: Arc<QueueManager>,
    cfg: MonitorConfig,
}

impl CompletionMonitor {
    pub fn new(queues: Arc<QueueManager>, cfg: MonitorConfig) -> Self {
        Self { queues, cfg }
    }

    /// `triangulated_active` is supplied by the caller (it isn't tracked by
    /// `QueueManager`'s own job counts, since triangulation sessions aren't
    /// queue jobs).
    pub async fn wait_for_completion(&self, triangulated_active: impl Fn() -> usize) -> MonitorOutcome {
        let started = Instant::now();
        let mut consecutive_idle = 0u32;

        loop {
            if started.elapsed() >= self.cfg.max_wait_time {
                return MonitorOutcome::Timeout;
            }

            let counts = self.queues.get_job_counts().await;
            let total = counts.completed + counts.failed;
            if total as u64 >= 10 {
                let rate = counts.failed as f64 / total as f64;
                if rate > self.cfg.max_failure_rate {
                    return MonitorOutcome::ExcessiveFailures;
                }
            }

            let active = counts.active + counts.waiting + counts.delayed + triangulated_active();
            if active == 0 {
                consecutive_idle += 1;
                if consecutive_idle >= self.cfg.required_idle_checks {
                    return MonitorOutcome::Idle;
                }
            } else {
                consecutive_idle = 0;
            }

            sleep(self.cfg.check_interval).await;
        }
    }
}

// `QueueManager` now wraps a real Postgres pool, so the scenarios that used
// to live here as in-memory unit tests are in
// `tests/scenario_completion_monitor_resolves_against_durable_queue.rs`,
// gated behind `CTP_DATABASE_URL` like the rest of the pipeline's
// DB-backed tests.
