//! Points of interest. A POI's `hash` is a content-derived key (computed by
//! the caller from file_path + name + type + line range) so the same POI
//! discovered twice — by a retried worker, or by two overlapping file
//! analyses — collapses to one row instead of duplicating downstream
//! relationship evidence.

use ctp_errors::{CtpError, ErrorKind, Result};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::types::{NewPoi, PoiRow};

fn wrap(e: sqlx::Error, context: &'static str) -> CtpError {
    CtpError::wrap(ErrorKind::TransientIo, anyhow::Error::new(e).context(context))
}

fn row_to_poi(row: sqlx::postgres::PgRow) -> Result<PoiRow> {
    Ok(PoiRow {
        id: row.try_get("id").map_err(|e| wrap(e, "poi row: id"))?,
        run_id: row.try_get("run_id").map_err(|e| wrap(e, "poi row: run_id"))?,
        file_id: row.try_get("file_id").map_err(|e| wrap(e, "poi row: file_id"))?,
        file_path: row
            .try_get("file_path")
            .map_err(|e| wrap(e, "poi row: file_path"))?,
        name: row.try_get("name").map_err(|e| wrap(e, "poi row: name"))?,
        poi_type: row.try_get("type").map_err(|e| wrap(e, "poi row: type"))?,
        start_line: row
            .try_get("start_line")
            .map_err(|e| wrap(e, "poi row: start_line"))?,
        end_line: row
            .try_get("end_line")
            .map_err(|e| wrap(e, "poi row: end_line"))?,
        description: row
            .try_get("description")
            .map_err(|e| wrap(e, "poi row: description"))?,
        is_exported: row
            .try_get("is_exported")
            .map_err(|e| wrap(e, "poi row: is_exported"))?,
        semantic_id: row
            .try_get("semantic_id")
            .map_err(|e| wrap(e, "poi row: semantic_id"))?,
        hash: row.try_get("hash").map_err(|e| wrap(e, "poi row: hash"))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| wrap(e, "poi row: created_at"))?,
    })
}

const POI_COLUMNS: &str = "id, run_id, file_id, file_path, name, type, start_line, end_line, \
     description, is_exported, semantic_id, hash, created_at";

/// Idempotent insert keyed on the content hash. Returns the row whether it
/// was just inserted or already existed — callers never need to branch on
/// which happened.
pub async fn insert_poi(pool: &PgPool, poi: &NewPoi) -> Result<PoiRow> {
    let inserted = sqlx::query(&format!(
        r#"
        insert into pois (run_id, file_id, file_path, name, type, start_line, end_line,
                           description, is_exported, semantic_id, hash)
        values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        on conflict (hash) do nothing
        returning {POI_COLUMNS}
        "#
    ))
    .bind(poi.run_id)
    .bind(poi.file_id)
    .bind(&poi.file_path)
    .bind(&poi.name)
    .bind(&poi.poi_type)
    .bind(poi.start_line)
    .bind(poi.end_line)
    .bind(&poi.description)
    .bind(poi.is_exported)
    .bind(&poi.semantic_id)
    .bind(&poi.hash)
    .fetch_optional(pool)
    .await
    .map_err(|e| wrap(e, "insert_poi failed"))?;

    if let Some(row) = inserted {
        return row_to_poi(row);
    }

    fetch_by_hash(pool, &poi.hash)
        .await?
        .ok_or_else(|| CtpError::InternalBug("poi insert conflicted but no row found by hash".into()))
}

/// Batched counterpart to `insert_poi`, meant to sit behind a
/// [`crate::BatchedWriter`]: every row in `batch` is inserted (or resolved
/// by conflict) inside one transaction instead of one round trip per POI.
pub async fn insert_pois_batch(pool: &PgPool, batch: &[NewPoi]) -> Result<Vec<PoiRow>> {
    let mut tx = pool.begin().await.map_err(|e| wrap(e, "insert_pois_batch: begin tx"))?;
    let mut rows = Vec::with_capacity(batch.len());

    for poi in batch {
        let inserted = sqlx::query(&format!(
            r#"
            insert into pois (run_id, file_id, file_path, name, type, start_line, end_line,
                               description, is_exported, semantic_id, hash)
            values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            on conflict (hash) do nothing
            returning {POI_COLUMNS}
            "#
        ))
        .bind(poi.run_id)
        .bind(poi.file_id)
        .bind(&poi.file_path)
        .bind(&poi.name)
        .bind(&poi.poi_type)
        .bind(poi.start_line)
        .bind(poi.end_line)
        .bind(&poi.description)
        .bind(poi.is_exported)
        .bind(&poi.semantic_id)
        .bind(&poi.hash)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| wrap(e, "insert_pois_batch: insert"))?;

        let row = match inserted {
            Some(row) => row_to_poi(row)?,
            None => {
                let existing = sqlx::query(&format!("select {POI_COLUMNS} from pois where hash = $1"))
                    .bind(&poi.hash)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| wrap(e, "insert_pois_batch: fetch conflicting row by hash"))?;
                row_to_poi(existing)?
            }
        };
        rows.push(row);
    }

    tx.commit().await.map_err(|e| wrap(e, "insert_pois_batch: commit"))?;
    Ok(rows)
}

pub async fn fetch_by_hash(pool: &PgPool, hash: &str) -> Result<Option<PoiRow>> {
    let row = sqlx::query(&format!("select {POI_COLUMNS} from pois where hash = $1"))
        .bind(hash)
        .fetch_optional(pool)
        .await
        .map_err(|e| wrap(e, "fetch_by_hash failed"))?;

    row.map(row_to_poi).transpose()
}

pub async fn fetch_by_id(pool: &PgPool, id: i64) -> Result<PoiRow> {
    let row = sqlx::query(&format!("select {POI_COLUMNS} from pois where id = $1"))
        .bind(id)
        .fetch_one(pool)
        .await
        .map_err(|e| wrap(e, "fetch_by_id failed"))?;

    row_to_poi(row)
}

/// Looks up POIs by semantic id within a run — the primary resolution path
/// a relationship worker uses to turn a textual reference ("calls
/// `parse_config`") into a concrete POI id.
pub async fn find_by_semantic_id(
    pool: &PgPool,
    run_id: Uuid,
    semantic_id: &str,
) -> Result<Vec<PoiRow>> {
    let rows = sqlx::query(&format!(
        "select {POI_COLUMNS} from pois where run_id = $1 and semantic_id = $2"
    ))
    .bind(run_id)
    .bind(semantic_id)
    .fetch_all(pool)
    .await
    .map_err(|e| wrap(e, "find_by_semantic_id failed"))?;

    rows.into_iter().map(row_to_poi).collect()
}

pub async fn find_by_name(pool: &PgPool, run_id: Uuid, name: &str) -> Result<Vec<PoiRow>> {
    let rows = sqlx::query(&format!(
        "select {POI_COLUMNS} from pois where run_id = $1 and name = $2"
    ))
    .bind(run_id)
    .bind(name)
    .fetch_all(pool)
    .await
    .map_err(|e| wrap(e, "find_by_name failed"))?;

    rows.into_iter().map(row_to_poi).collect()
}

/// All POIs discovered in a run, for the graph projection pass. Ordered by
/// `id` so callers that page through it (none currently do) get a stable
/// cursor.
pub async fn list_for_run(pool: &PgPool, run_id: Uuid) -> Result<Vec<PoiRow>> {
    let rows = sqlx::query(&format!(
        "select {POI_COLUMNS} from pois where run_id = $1 order by id"
    ))
    .bind(run_id)
    .fetch_all(pool)
    .await
    .map_err(|e| wrap(e, "list_for_run failed"))?;

    rows.into_iter().map(row_to_poi).collect()
}

pub async fn count_for_run(pool: &PgPool, run_id: Uuid) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as("select count(*)::bigint from pois where run_id = $1")
        .bind(run_id)
        .fetch_one(pool)
        .await
        .map_err(|e| wrap(e, "count_for_run failed"))?;
    Ok(n)
}
