//! Relationship edges between two POIs. Inserted PENDING by a relationship
//! worker, then moved to VALIDATED/DISCARDED/ESCALATED once triangulation
//! (one or more rounds of evidence) has resolved it.

use ctp_errors::{CtpError, ErrorKind, Result};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::types::{NewRelationship, RelationshipRow, RelationshipStatus};

fn wrap(e: sqlx::Error, context: &'static str) -> CtpError {
    CtpError::wrap(ErrorKind::TransientIo, anyhow::Error::new(e).context(context))
}

const REL_COLUMNS: &str = "id, run_id, source_poi_id, target_poi_id, type, file_path, status, \
     confidence, evidence, reason, relationship_hash, created_at, updated_at";

fn row_to_relationship(row: sqlx::postgres::PgRow) -> Result<RelationshipRow> {
    let status: String = row.try_get("status").map_err(|e| wrap(e, "relationship row: status"))?;
    Ok(RelationshipRow {
        id: row.try_get("id").map_err(|e| wrap(e, "relationship row: id"))?,
        run_id: row.try_get("run_id").map_err(|e| wrap(e, "relationship row: run_id"))?,
        source_poi_id: row
            .try_get("source_poi_id")
            .map_err(|e| wrap(e, "relationship row: source_poi_id"))?,
        target_poi_id: row
            .try_get("target_poi_id")
            .map_err(|e| wrap(e, "relationship row: target_poi_id"))?,
        relationship_type: row.try_get("type").map_err(|e| wrap(e, "relationship row: type"))?,
        file_path: row
            .try_get("file_path")
            .map_err(|e| wrap(e, "relationship row: file_path"))?,
        status: RelationshipStatus::parse(&status)?,
        confidence: row
            .try_get("confidence")
            .map_err(|e| wrap(e, "relationship row: confidence"))?,
        evidence: row
            .try_get("evidence")
            .map_err(|e| wrap(e, "relationship row: evidence"))?,
        reason: row.try_get("reason").map_err(|e| wrap(e, "relationship row: reason"))?,
        relationship_hash: row
            .try_get("relationship_hash")
            .map_err(|e| wrap(e, "relationship row: relationship_hash"))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| wrap(e, "relationship row: created_at"))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| wrap(e, "relationship row: updated_at"))?,
    })
}

/// Insert a PENDING relationship. Idempotent on `relationship_hash` within a
/// run: a re-discovered edge returns the existing row rather than
/// duplicating it.
pub async fn insert_pending(pool: &PgPool, rel: &NewRelationship) -> Result<RelationshipRow> {
    let inserted = sqlx::query(&format!(
        r#"
        insert into relationships (run_id, source_poi_id, target_poi_id, type, file_path,
                                    confidence, evidence, reason, relationship_hash)
        values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        on conflict (relationship_hash) do nothing
        returning {REL_COLUMNS}
        "#
    ))
    .bind(rel.run_id)
    .bind(rel.source_poi_id)
    .bind(rel.target_poi_id)
    .bind(&rel.relationship_type)
    .bind(&rel.file_path)
    .bind(rel.confidence)
    .bind(&rel.evidence)
    .bind(&rel.reason)
    .bind(&rel.relationship_hash)
    .fetch_optional(pool)
    .await
    .map_err(|e| wrap(e, "insert_pending failed"))?;

    if let Some(row) = inserted {
        return row_to_relationship(row);
    }

    fetch_by_hash(pool, &rel.relationship_hash)
        .await?
        .ok_or_else(|| {
            CtpError::InternalBug("relationship insert conflicted but no row found by hash".into())
        })
}

pub async fn fetch_by_hash(pool: &PgPool, hash: &str) -> Result<Option<RelationshipRow>> {
    let row = sqlx::query(&format!(
        "select {REL_COLUMNS} from relationships where relationship_hash = $1"
    ))
    .bind(hash)
    .fetch_optional(pool)
    .await
    .map_err(|e| wrap(e, "fetch_by_hash failed"))?;

    row.map(row_to_relationship).transpose()
}

pub async fn fetch_by_id(pool: &PgPool, id: i64) -> Result<RelationshipRow> {
    let row = sqlx::query(&format!("select {REL_COLUMNS} from relationships where id = $1"))
        .bind(id)
        .fetch_one(pool)
        .await
        .map_err(|e| wrap(e, "fetch_by_id failed"))?;

    row_to_relationship(row)
}

async fn transition(
    pool: &PgPool,
    id: i64,
    new_status: RelationshipStatus,
    confidence: Option<f64>,
) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        update relationships
           set status = $2,
               confidence = coalesce($3, confidence),
               updated_at = now()
         where id = $1 and status = 'PENDING'
        returning id
        "#,
    )
    .bind(id)
    .bind(new_status.as_str())
    .bind(confidence)
    .fetch_optional(pool)
    .await
    .map_err(|e| wrap(e, "relationship transition failed"))?;

    Ok(row.is_some())
}

pub async fn mark_validated(pool: &PgPool, id: i64, final_confidence: f64) -> Result<bool> {
    transition(pool, id, RelationshipStatus::Validated, Some(final_confidence)).await
}

pub async fn mark_discarded(pool: &PgPool, id: i64) -> Result<bool> {
    transition(pool, id, RelationshipStatus::Discarded, None).await
}

pub async fn mark_escalated(pool: &PgPool, id: i64) -> Result<bool> {
    transition(pool, id, RelationshipStatus::Escalated, None).await
}

/// All VALIDATED relationships for a run, in the order graph projection
/// consumes them.
pub async fn list_validated_for_run(pool: &PgPool, run_id: Uuid) -> Result<Vec<RelationshipRow>> {
    let rows = sqlx::query(&format!(
        "select {REL_COLUMNS} from relationships where run_id = $1 and status = 'VALIDATED' order by id asc"
    ))
    .bind(run_id)
    .fetch_all(pool)
    .await
    .map_err(|e| wrap(e, "list_validated_for_run failed"))?;

    rows.into_iter().map(row_to_relationship).collect()
}

pub async fn count_pending_for_run(pool: &PgPool, run_id: Uuid) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as(
        "select count(*)::bigint from relationships where run_id = $1 and status = 'PENDING'",
    )
    .bind(run_id)
    .fetch_one(pool)
    .await
    .map_err(|e| wrap(e, "count_pending_for_run failed"))?;
    Ok(n)
}
