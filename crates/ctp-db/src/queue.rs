//! Durable job queue backing `ctp-queue`: every job, its retry state, and
//! its lock lives in Postgres so a restarted daemon resumes exactly where
//! the crashed one left off instead of losing whatever was in memory.
//!
//! `queue_claim_one` is the only query that takes a row lock; everything
//! else is a plain status-guarded update, the same pattern the outbox uses.

use chrono::{DateTime, Utc};
use ctp_errors::{CtpError, ErrorKind, Result};
use serde_json::Value;
use sqlx::{PgPool, Row};

fn wrap(e: sqlx::Error, context: &'static str) -> CtpError {
    CtpError::wrap(ErrorKind::TransientIo, anyhow::Error::new(e).context(context))
}

const QUEUE_JOB_COLUMNS: &str = "id, queue, status, payload, attempts_made, max_attempts, \
     backoff_kind, backoff_base_ms, last_error, available_at, lock_expires_at, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct QueueJobRow {
    pub id: i64,
    pub queue: String,
    pub status: String,
    pub payload: Value,
    pub attempts_made: i32,
    pub max_attempts: i32,
    pub backoff_kind: String,
    pub backoff_base_ms: i64,
    pub last_error: Option<String>,
    pub available_at: DateTime<Utc>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct QueueCounts {
    pub waiting: i64,
    pub active: i64,
    pub delayed: i64,
    pub completed: i64,
    pub failed: i64,
}

fn row_to_job(row: sqlx::postgres::PgRow) -> Result<QueueJobRow> {
    Ok(QueueJobRow {
        id: row.try_get("id").map_err(|e| wrap(e, "queue job row: id"))?,
        queue: row.try_get("queue").map_err(|e| wrap(e, "queue job row: queue"))?,
        status: row.try_get("status").map_err(|e| wrap(e, "queue job row: status"))?,
        payload: row.try_get("payload").map_err(|e| wrap(e, "queue job row: payload"))?,
        attempts_made: row
            .try_get("attempts_made")
            .map_err(|e| wrap(e, "queue job row: attempts_made"))?,
        max_attempts: row
            .try_get("max_attempts")
            .map_err(|e| wrap(e, "queue job row: max_attempts"))?,
        backoff_kind: row
            .try_get("backoff_kind")
            .map_err(|e| wrap(e, "queue job row: backoff_kind"))?,
        backoff_base_ms: row
            .try_get("backoff_base_ms")
            .map_err(|e| wrap(e, "queue job row: backoff_base_ms"))?,
        last_error: row
            .try_get("last_error")
            .map_err(|e| wrap(e, "queue job row: last_error"))?,
        available_at: row
            .try_get("available_at")
            .map_err(|e| wrap(e, "queue job row: available_at"))?,
        lock_expires_at: row
            .try_get("lock_expires_at")
            .map_err(|e| wrap(e, "queue job row: lock_expires_at"))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| wrap(e, "queue job row: created_at"))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| wrap(e, "queue job row: updated_at"))?,
    })
}

/// Enqueues a job in `waiting` state, claimable immediately.
pub async fn queue_enqueue(
    pool: &PgPool,
    queue: &str,
    payload: Value,
    max_attempts: i32,
    backoff_kind: &str,
    backoff_base_ms: i64,
) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        insert into queue_jobs (queue, status, payload, max_attempts, backoff_kind, backoff_base_ms)
        values ($1, 'waiting', $2, $3, $4, $5)
        returning id
        "#,
    )
    .bind(queue)
    .bind(payload)
    .bind(max_attempts)
    .bind(backoff_kind)
    .bind(backoff_base_ms)
    .fetch_one(pool)
    .await
    .map_err(|e| wrap(e, "queue_enqueue failed"))?;

    Ok(id)
}

/// Claims the oldest waiting job on `queue` using `FOR UPDATE SKIP LOCKED`,
/// so two dispatchers polling the same queue concurrently never grab the
/// same row. Sets `lock_expires_at` so `queue_sweep_stalled` can reclaim it
/// if the worker that claimed it never reports back.
pub async fn queue_claim_one(
    pool: &PgPool,
    queue: &str,
    lock_duration_ms: i64,
) -> Result<Option<QueueJobRow>> {
    let row = sqlx::query(&format!(
        r#"
        with to_claim as (
            select id
            from queue_jobs
            where queue = $1 and status = 'waiting' and available_at <= now()
            order by id asc
            limit 1
            for update skip locked
        )
        update queue_jobs
           set status = 'active',
               lock_expires_at = now() + ($2 || ' milliseconds')::interval,
               updated_at = now()
         where id in (select id from to_claim)
        returning {QUEUE_JOB_COLUMNS}
        "#
    ))
    .bind(queue)
    .bind(lock_duration_ms.to_string())
    .fetch_optional(pool)
    .await
    .map_err(|e| wrap(e, "queue_claim_one failed"))?;

    row.map(row_to_job).transpose()
}

pub async fn queue_complete(pool: &PgPool, id: i64) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        update queue_jobs
           set status = 'completed', updated_at = now()
         where id = $1 and status = 'active'
        returning id
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .map_err(|e| wrap(e, "queue_complete failed"))?;

    Ok(row.is_some())
}

fn backoff_delay_ms(kind: &str, base_ms: i64, attempt: i32) -> i64 {
    match kind {
        "fixed" => base_ms,
        _ => base_ms.saturating_mul(1i64 << attempt.clamp(0, 32) as u32),
    }
}

/// Records a failed attempt. If the job still has attempts left it goes
/// back to `delayed` with the backoff applied; otherwise it is marked
/// `failed` and a fresh copy is enqueued onto `dead_letter_queue` (unless
/// the job was already running on that queue, which would loop forever).
pub async fn queue_fail_or_retry(
    pool: &PgPool,
    id: i64,
    error: &str,
    dead_letter_queue: &str,
) -> Result<()> {
    let mut tx = pool.begin().await.map_err(|e| wrap(e, "fail_or_retry: begin tx"))?;

    let row = sqlx::query(&format!(
        "select {QUEUE_JOB_COLUMNS} from queue_jobs where id = $1 for update"
    ))
    .bind(id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(|e| wrap(e, "fail_or_retry: select"))?;

    let Some(row) = row else {
        tx.commit().await.map_err(|e| wrap(e, "fail_or_retry: commit (missing row)"))?;
        return Ok(());
    };
    let job = row_to_job(row)?;
    let attempts_made = job.attempts_made + 1;

    if attempts_made < job.max_attempts {
        let delay_ms = backoff_delay_ms(&job.backoff_kind, job.backoff_base_ms, attempts_made);
        sqlx::query(
            r#"
            update queue_jobs
               set status = 'delayed',
                   attempts_made = $2,
                   last_error = $3,
                   available_at = now() + ($4 || ' milliseconds')::interval,
                   lock_expires_at = null,
                   updated_at = now()
             where id = $1
            "#,
        )
        .bind(id)
        .bind(attempts_made)
        .bind(error)
        .bind(delay_ms.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|e| wrap(e, "fail_or_retry: requeue as delayed"))?;
    } else {
        sqlx::query(
            r#"
            update queue_jobs
               set status = 'failed', attempts_made = $2, last_error = $3, updated_at = now()
             where id = $1
            "#,
        )
        .bind(id)
        .bind(attempts_made)
        .bind(error)
        .execute(&mut *tx)
        .await
        .map_err(|e| wrap(e, "fail_or_retry: mark failed"))?;

        if job.queue != dead_letter_queue {
            sqlx::query(
                r#"
                insert into queue_jobs (queue, status, payload, max_attempts, backoff_kind, backoff_base_ms)
                values ($1, 'waiting', $2, $3, $4, $5)
                "#,
            )
            .bind(dead_letter_queue)
            .bind(&job.payload)
            .bind(job.max_attempts)
            .bind(&job.backoff_kind)
            .bind(job.backoff_base_ms)
            .execute(&mut *tx)
            .await
            .map_err(|e| wrap(e, "fail_or_retry: forward to dead-letter queue"))?;
        }
    }

    tx.commit().await.map_err(|e| wrap(e, "fail_or_retry: commit"))?;
    Ok(())
}

/// Moves delayed jobs whose backoff has elapsed back to `waiting`. Returns
/// the number promoted.
pub async fn queue_promote_delayed(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query(
        r#"
        update queue_jobs
           set status = 'waiting', updated_at = now()
         where status = 'delayed' and available_at <= now()
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| wrap(e, "queue_promote_delayed failed"))?;

    Ok(result.rows_affected())
}

/// Reclaims jobs whose lock expired without a heartbeat — the worker that
/// claimed them crashed or hung — back to `waiting`.
pub async fn queue_sweep_stalled(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query(
        r#"
        update queue_jobs
           set status = 'waiting', lock_expires_at = null, updated_at = now()
         where status = 'active' and lock_expires_at <= now()
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| wrap(e, "queue_sweep_stalled failed"))?;

    Ok(result.rows_affected())
}

/// Job counts across every queue, summed, for the completion monitor.
pub async fn queue_counts_all(pool: &PgPool) -> Result<QueueCounts> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("select status, count(*)::bigint from queue_jobs group by status")
            .fetch_all(pool)
            .await
            .map_err(|e| wrap(e, "queue_counts_all failed"))?;

    let mut counts = QueueCounts::default();
    for (status, n) in rows {
        match status.as_str() {
            "waiting" => counts.waiting = n,
            "active" => counts.active = n,
            "delayed" => counts.delayed = n,
            "completed" => counts.completed = n,
            "failed" => counts.failed = n,
            _ => {}
        }
    }
    Ok(counts)
}

/// Deletes every queue job. Test-only — never call this from production
/// code, it would wipe work that hasn't been dispatched yet.
pub async fn queue_clear_all(pool: &PgPool) -> Result<()> {
    sqlx::query("delete from queue_jobs")
        .execute(pool)
        .await
        .map_err(|e| wrap(e, "queue_clear_all failed"))?;
    Ok(())
}

/// Retains at most `retention_count` terminal (`completed`/`failed`) rows
/// per queue, oldest first. Mirrors `ctp_db::retention`'s run-level sweep
/// but at job granularity.
pub async fn queue_retain_recent(pool: &PgPool, queue: &str, status: &str, retention_count: i64) -> Result<u64> {
    let result = sqlx::query(
        r#"
        delete from queue_jobs
         where id in (
            select id from queue_jobs
             where queue = $1 and status = $2
             order by id desc
             offset $3
         )
        "#,
    )
    .bind(queue)
    .bind(status)
    .bind(retention_count)
    .execute(pool)
    .await
    .map_err(|e| wrap(e, "queue_retain_recent failed"))?;

    Ok(result.rows_affected())
}
