use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ctp_errors::{CtpError, Result};
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::{watch, Semaphore};

use crate::types::{Job, JobCounts, JobId, JobOptions, WorkerOptions, ALLOWED_QUEUES, DEAD_LETTER_QUEUE};

/// Named, durable job queues with retries, exponential backoff, and
/// dead-letter routing. Every queue name must be one of [`ALLOWED_QUEUES`];
/// there is no implicit queue creation. Backed by Postgres (`queue_jobs`)
/// rather than an in-process structure, so a restarted daemon resumes
/// in-flight work instead of dropping it.
pub struct QueueManager {
    pool: PgPool,
}

impl QueueManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn validate(&self, queue: &str) -> Result<()> {
        if ALLOWED_QUEUES.contains(&queue) {
            Ok(())
        } else {
            Err(CtpError::InternalBug(format!(
                "queue '{queue}' is not in the allow-list"
            )))
        }
    }

    pub async fn add(&self, queue: &str, data: Value, opts: JobOptions) -> Result<JobId> {
        self.validate(queue)?;
        let (kind, base_ms) = opts.backoff.as_db_parts();
        let id = ctp_db::queue::queue_enqueue(&self.pool, queue, data, opts.attempts as i32, kind, base_ms).await?;
        Ok(JobId(id))
    }

    /// Moves delayed jobs whose backoff has elapsed back onto the waiting
    /// list. Must be called periodically by whoever drives the queue
    /// (a worker loop or a dedicated sweeper task) for retries to surface.
    pub async fn promote_delayed(&self) {
        if let Err(e) = ctp_db::queue::queue_promote_delayed(&self.pool).await {
            tracing::warn!(error = %e, "promote_delayed failed");
        }
    }

    /// Sweeps active jobs whose lock has expired without a heartbeat back
    /// to waiting, so a crashed worker doesn't strand a job forever.
    pub async fn sweep_stalled(&self) {
        if let Err(e) = ctp_db::queue::queue_sweep_stalled(&self.pool).await {
            tracing::warn!(error = %e, "sweep_stalled failed");
        }
    }

    /// Retains at most `retention_count` completed/failed jobs per queue.
    pub async fn cleanup(&self, retention_count: usize) {
        for queue in ALLOWED_QUEUES {
            for status in ["completed", "failed"] {
                if let Err(e) =
                    ctp_db::queue::queue_retain_recent(&self.pool, queue, status, retention_count as i64).await
                {
                    tracing::warn!(queue, status, error = %e, "queue cleanup failed");
                }
            }
        }
    }

    pub async fn get_job_counts(&self) -> JobCounts {
        match ctp_db::queue::queue_counts_all(&self.pool).await {
            Ok(counts) => counts.into(),
            Err(e) => {
                tracing::warn!(error = %e, "get_job_counts failed");
                JobCounts::default()
            }
        }
    }

    /// Wipes every queued job. Test-only — never called from the
    /// orchestrator's run or shutdown paths, since that would discard
    /// durable work a crash-recovered daemon still needs to finish.
    pub async fn clear_all_queues(&self) {
        if let Err(e) = ctp_db::queue::queue_clear_all(&self.pool).await {
            tracing::warn!(error = %e, "clear_all_queues failed");
        }
    }

    async fn pop_waiting(&self, queue: &str, lock_duration: Duration) -> Option<Job> {
        match ctp_db::queue::queue_claim_one(&self.pool, queue, lock_duration.as_millis() as i64).await {
            Ok(row) => row.map(Job::from_row),
            Err(e) => {
                tracing::warn!(queue, error = %e, "pop_waiting failed");
                None
            }
        }
    }

    async fn complete(&self, id: i64) {
        if let Err(e) = ctp_db::queue::queue_complete(&self.pool, id).await {
            tracing::warn!(job_id = id, error = %e, "complete failed");
        }
    }

    async fn fail_or_retry(&self, id: i64, error: &CtpError) {
        if let Err(e) =
            ctp_db::queue::queue_fail_or_retry(&self.pool, id, &error.to_string(), DEAD_LETTER_QUEUE).await
        {
            tracing::warn!(job_id = id, error = %e, "fail_or_retry failed");
        }
    }

    /// Runs a consumer against `queue` with up to `opts.concurrency`
    /// concurrently in-flight jobs, until `shutdown` fires. `handler`
    /// receives the job; its `Err` return drives the retry/DLQ policy
    /// above.
    pub async fn run_worker<F, Fut>(
        self: &Arc<Self>,
        queue: &'static str,
        opts: WorkerOptions,
        handler: F,
        mut shutdown: watch::Receiver<bool>,
    ) where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let semaphore = Arc::new(Semaphore::new(opts.concurrency));
        let poll_interval = Duration::from_millis(50);

        loop {
            if *shutdown.borrow() {
                return;
            }

            self.promote_delayed().await;
            self.sweep_stalled().await;

            match self.pop_waiting(queue, opts.lock_duration).await {
                Some(job) => {
                    let permit = Arc::clone(&semaphore).acquire_owned().await.expect("not closed");
                    let this = Arc::clone(self);
                    let handler = Arc::clone(&handler);
                    let job_id = job.id_raw;
                    tokio::spawn(async move {
                        let _permit = permit;
                        let result = handler(job).await;
                        match result {
                            Ok(()) => this.complete(job_id).await,
                            Err(e) => this.fail_or_retry(job_id, &e).await,
                        }
                    });
                }
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }
}
