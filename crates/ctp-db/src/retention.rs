//! Retention sweep for completed/failed runs older than the configured
//! horizon. Deletes in dependency order (children before parents) to avoid
//! tripping the foreign keys that tie pois/relationships/evidence back to
//! the owning run.

use chrono::{DateTime, Utc};
use ctp_errors::{CtpError, ErrorKind, Result};
use sqlx::PgPool;

fn wrap(e: sqlx::Error, context: &'static str) -> CtpError {
    CtpError::wrap(ErrorKind::TransientIo, anyhow::Error::new(e).context(context))
}

/// Deletes all data for terminal (COMPLETED/FAILED) runs that finished
/// before `older_than`. Returns the number of runs removed.
pub async fn sweep_runs_older_than(pool: &PgPool, older_than: DateTime<Utc>) -> Result<u64> {
    let mut tx = pool.begin().await.map_err(|e| wrap(e, "sweep: begin tx"))?;

    let run_ids: Vec<(uuid::Uuid,)> = sqlx::query_as(
        r#"
        select run_id from runs
        where status in ('COMPLETED', 'FAILED') and finished_at < $1
        "#,
    )
    .bind(older_than)
    .fetch_all(&mut *tx)
    .await
    .map_err(|e| wrap(e, "sweep: select candidate runs"))?;

    if run_ids.is_empty() {
        tx.commit().await.map_err(|e| wrap(e, "sweep: commit (empty)"))?;
        return Ok(0);
    }

    let ids: Vec<uuid::Uuid> = run_ids.into_iter().map(|(id,)| id).collect();

    sqlx::query("delete from relationship_evidence where run_id = any($1)")
        .bind(&ids)
        .execute(&mut *tx)
        .await
        .map_err(|e| wrap(e, "sweep: delete evidence"))?;

    sqlx::query("delete from relationship_evidence_tracking where run_id = any($1)")
        .bind(&ids)
        .execute(&mut *tx)
        .await
        .map_err(|e| wrap(e, "sweep: delete tracking"))?;

    sqlx::query("delete from triangulated_analysis_sessions where run_id = any($1)")
        .bind(&ids)
        .execute(&mut *tx)
        .await
        .map_err(|e| wrap(e, "sweep: delete sessions"))?;

    sqlx::query("delete from outbox where run_id = any($1)")
        .bind(&ids)
        .execute(&mut *tx)
        .await
        .map_err(|e| wrap(e, "sweep: delete outbox"))?;

    sqlx::query("delete from relationships where run_id = any($1)")
        .bind(&ids)
        .execute(&mut *tx)
        .await
        .map_err(|e| wrap(e, "sweep: delete relationships"))?;

    sqlx::query("delete from pois where run_id = any($1)")
        .bind(&ids)
        .execute(&mut *tx)
        .await
        .map_err(|e| wrap(e, "sweep: delete pois"))?;

    sqlx::query("delete from files where run_id = any($1)")
        .bind(&ids)
        .execute(&mut *tx)
        .await
        .map_err(|e| wrap(e, "sweep: delete files"))?;

    let result = sqlx::query("delete from runs where run_id = any($1)")
        .bind(&ids)
        .execute(&mut *tx)
        .await
        .map_err(|e| wrap(e, "sweep: delete runs"))?;

    tx.commit().await.map_err(|e| wrap(e, "sweep: commit"))?;

    Ok(result.rows_affected())
}
