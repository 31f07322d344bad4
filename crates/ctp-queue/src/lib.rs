//! Named job queues with retries, exponential backoff, and dead-letter
//! routing, plus the completion bookkeeping the rest of the pipeline polls
//! to decide when a run is done. Backed by the `queue_jobs` table in
//! `ctp-db` so queued work survives a daemon restart instead of living only
//! in process memory.

mod engine;
mod types;

pub use engine::QueueManager;
pub use types::{
    BackoffPolicy, Job, JobCounts, JobId, JobOptions, WorkerOptions, ALLOWED_QUEUES,
    DEAD_LETTER_QUEUE,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlisted_queue_is_rejected() {
        // Rejected by the allow-list check before the pool is touched, so a
        // lazily-connected pool (never actually dialed) is enough here.
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy("postgres://localhost/does-not-need-to-exist")
            .unwrap();
        let qm = QueueManager::new(pool);
        let result = qm
            .add("not-a-real-queue", serde_json::json!({}), JobOptions::default())
            .await;
        assert!(result.is_err());
    }
}
