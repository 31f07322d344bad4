use ctp_errors::{CtpError, ErrorKind, Result};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::types::FileRow;

fn wrap(e: sqlx::Error, context: &'static str) -> CtpError {
    CtpError::wrap(ErrorKind::TransientIo, anyhow::Error::new(e).context(context))
}

/// Idempotent insert: re-discovering the same file in the same run is a
/// no-op, it returns the existing row id.
pub async fn upsert_file(pool: &PgPool, run_id: Uuid, file_path: &str) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        r#"
        insert into files (run_id, file_path, status)
        values ($1, $2, 'pending')
        on conflict (run_id, file_path) do update set file_path = excluded.file_path
        returning id
        "#,
    )
    .bind(run_id)
    .bind(file_path)
    .fetch_one(pool)
    .await
    .map_err(|e| wrap(e, "upsert_file failed"))?;

    Ok(row.0)
}

pub async fn mark_processed(pool: &PgPool, file_id: i64, hash: &str) -> Result<()> {
    sqlx::query(
        r#"
        update files
           set status = 'processed', hash = $2, last_processed = now()
         where id = $1
        "#,
    )
    .bind(file_id)
    .bind(hash)
    .execute(pool)
    .await
    .map_err(|e| wrap(e, "mark_processed failed"))?;

    Ok(())
}

pub async fn fetch_file(pool: &PgPool, file_id: i64) -> Result<FileRow> {
    let row = sqlx::query(
        r#"
        select id, run_id, file_path, status, hash, last_processed
        from files
        where id = $1
        "#,
    )
    .bind(file_id)
    .fetch_one(pool)
    .await
    .map_err(|e| wrap(e, "fetch_file failed"))?;

    Ok(FileRow {
        id: row.try_get("id").map_err(|e| wrap(e, "fetch_file: id"))?,
        run_id: row.try_get("run_id").map_err(|e| wrap(e, "fetch_file: run_id"))?,
        file_path: row
            .try_get("file_path")
            .map_err(|e| wrap(e, "fetch_file: file_path"))?,
        status: row.try_get("status").map_err(|e| wrap(e, "fetch_file: status"))?,
        hash: row.try_get("hash").map_err(|e| wrap(e, "fetch_file: hash"))?,
        last_processed: row
            .try_get("last_processed")
            .map_err(|e| wrap(e, "fetch_file: last_processed"))?,
    })
}

pub async fn count_files_for_run(pool: &PgPool, run_id: Uuid) -> Result<(i64, i64)> {
    let (total,): (i64,) = sqlx::query_as("select count(*)::bigint from files where run_id = $1")
        .bind(run_id)
        .fetch_one(pool)
        .await
        .map_err(|e| wrap(e, "count_files_for_run: total"))?;

    let (processed,): (i64,) = sqlx::query_as(
        "select count(*)::bigint from files where run_id = $1 and status = 'processed'",
    )
    .bind(run_id)
    .fetch_one(pool)
    .await
    .map_err(|e| wrap(e, "count_files_for_run: processed"))?;

    Ok((processed, total))
}
