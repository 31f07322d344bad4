//! Run lifecycle: a run is created RUNNING and terminates into either
//! COMPLETED or FAILED. There is no resume-from-armed state here — unlike a
//! trading engine a pipeline run is not something an operator arms ahead of
//! time, it starts the moment triangulation begins.

use chrono::Utc;
use ctp_errors::{CtpError, ErrorKind, Result};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::types::{RunRow, RunStatus};

fn wrap(e: sqlx::Error, context: &'static str) -> CtpError {
    CtpError::wrap(ErrorKind::TransientIo, anyhow::Error::new(e).context(context))
}

pub async fn insert_run(pool: &PgPool, run_id: Uuid, config_hash: &str) -> Result<()> {
    sqlx::query(
        r#"
        insert into runs (run_id, status, started_at, config_hash)
        values ($1, 'RUNNING', now(), $2)
        "#,
    )
    .bind(run_id)
    .bind(config_hash)
    .execute(pool)
    .await
    .map_err(|e| wrap(e, "insert_run failed"))?;

    Ok(())
}

pub async fn fetch_run(pool: &PgPool, run_id: Uuid) -> Result<RunRow> {
    let row = sqlx::query(
        r#"
        select run_id, status, started_at, finished_at, config_hash, error_message
        from runs
        where run_id = $1
        "#,
    )
    .bind(run_id)
    .fetch_one(pool)
    .await
    .map_err(|e| wrap(e, "fetch_run failed"))?;

    let status: String = row.try_get("status").map_err(|e| wrap(e, "fetch_run: status column"))?;

    Ok(RunRow {
        run_id: row.try_get("run_id").map_err(|e| wrap(e, "fetch_run: run_id column"))?,
        status: RunStatus::parse(&status)?,
        started_at: row
            .try_get("started_at")
            .map_err(|e| wrap(e, "fetch_run: started_at column"))?,
        finished_at: row
            .try_get("finished_at")
            .map_err(|e| wrap(e, "fetch_run: finished_at column"))?,
        config_hash: row
            .try_get("config_hash")
            .map_err(|e| wrap(e, "fetch_run: config_hash column"))?,
        error_message: row
            .try_get("error_message")
            .map_err(|e| wrap(e, "fetch_run: error_message column"))?,
    })
}

pub async fn complete_run(pool: &PgPool, run_id: Uuid) -> Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update runs
           set status = 'COMPLETED', finished_at = $2
         where run_id = $1 and status = 'RUNNING'
        returning run_id
        "#,
    )
    .bind(run_id)
    .bind(Utc::now())
    .fetch_optional(pool)
    .await
    .map_err(|e| wrap(e, "complete_run failed"))?;

    Ok(row.is_some())
}

pub async fn fail_run(pool: &PgPool, run_id: Uuid, error_message: &str) -> Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update runs
           set status = 'FAILED', finished_at = $2, error_message = $3
         where run_id = $1 and status = 'RUNNING'
        returning run_id
        "#,
    )
    .bind(run_id)
    .bind(Utc::now())
    .bind(error_message)
    .fetch_optional(pool)
    .await
    .map_err(|e| wrap(e, "fail_run failed"))?;

    Ok(row.is_some())
}
