//! Raw evidence rows plus the running aggregate (`relationship_evidence_tracking`)
//! the triangulation worker consults to decide when enough evidence has
//! arrived to resolve a relationship one way or the other.

use ctp_errors::{CtpError, ErrorKind, Result};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::types::{EvidenceTrackingRow, NewEvidence};

fn wrap(e: sqlx::Error, context: &'static str) -> CtpError {
    CtpError::wrap(ErrorKind::TransientIo, anyhow::Error::new(e).context(context))
}

pub async fn insert_evidence(pool: &PgPool, ev: &NewEvidence) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        insert into relationship_evidence (run_id, relationship_hash, relationship_id, payload, confidence)
        values ($1, $2, $3, $4, $5)
        returning id
        "#,
    )
    .bind(ev.run_id)
    .bind(&ev.relationship_hash)
    .bind(ev.relationship_id)
    .bind(&ev.payload)
    .bind(ev.confidence)
    .fetch_one(pool)
    .await
    .map_err(|e| wrap(e, "insert_evidence failed"))?;

    Ok(id)
}

/// Upserts the tracking aggregate for one relationship hash, folding a new
/// evidence sample in. `expected_count` is set on first insert and never
/// lowered afterward — it's how many analysis rounds the orchestrator told
/// the worker pool to expect for this relationship.
pub async fn record_evidence_and_bump_tracking(
    pool: &PgPool,
    run_id: Uuid,
    relationship_hash: &str,
    relationship_id: Option<i64>,
    confidence: f64,
    expected_count: i32,
) -> Result<EvidenceTrackingRow> {
    let row = sqlx::query(
        r#"
        insert into relationship_evidence_tracking
            (run_id, relationship_hash, relationship_id, evidence_count, expected_count,
             total_confidence, avg_confidence, status, updated_at)
        values ($1, $2, $3, 1, $4, $5, $5, 'PENDING', now())
        on conflict (run_id, relationship_hash) do update
            set evidence_count   = relationship_evidence_tracking.evidence_count + 1,
                total_confidence = relationship_evidence_tracking.total_confidence + excluded.total_confidence,
                avg_confidence   = (relationship_evidence_tracking.total_confidence + excluded.total_confidence)
                                    / (relationship_evidence_tracking.evidence_count + 1),
                expected_count   = greatest(relationship_evidence_tracking.expected_count, excluded.expected_count),
                updated_at       = now()
        returning id, run_id, relationship_hash, relationship_id, evidence_count,
                  expected_count, total_confidence, avg_confidence, status
        "#,
    )
    .bind(run_id)
    .bind(relationship_hash)
    .bind(relationship_id)
    .bind(expected_count)
    .bind(confidence)
    .fetch_one(pool)
    .await
    .map_err(|e| wrap(e, "record_evidence_and_bump_tracking failed"))?;

    Ok(EvidenceTrackingRow {
        id: row.try_get("id").map_err(|e| wrap(e, "tracking row: id"))?,
        run_id: row.try_get("run_id").map_err(|e| wrap(e, "tracking row: run_id"))?,
        relationship_hash: row
            .try_get("relationship_hash")
            .map_err(|e| wrap(e, "tracking row: relationship_hash"))?,
        relationship_id: row
            .try_get("relationship_id")
            .map_err(|e| wrap(e, "tracking row: relationship_id"))?,
        evidence_count: row
            .try_get("evidence_count")
            .map_err(|e| wrap(e, "tracking row: evidence_count"))?,
        expected_count: row
            .try_get("expected_count")
            .map_err(|e| wrap(e, "tracking row: expected_count"))?,
        total_confidence: row
            .try_get("total_confidence")
            .map_err(|e| wrap(e, "tracking row: total_confidence"))?,
        avg_confidence: row
            .try_get("avg_confidence")
            .map_err(|e| wrap(e, "tracking row: avg_confidence"))?,
        status: row.try_get("status").map_err(|e| wrap(e, "tracking row: status"))?,
    })
}

pub async fn mark_tracking_processed(
    pool: &PgPool,
    run_id: Uuid,
    relationship_hash: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        update relationship_evidence_tracking
           set status = 'PROCESSED', processed_at = now()
         where run_id = $1 and relationship_hash = $2
        "#,
    )
    .bind(run_id)
    .bind(relationship_hash)
    .execute(pool)
    .await
    .map_err(|e| wrap(e, "mark_tracking_processed failed"))?;

    Ok(())
}

pub async fn mark_tracking_errored(
    pool: &PgPool,
    run_id: Uuid,
    relationship_hash: &str,
    error_message: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        update relationship_evidence_tracking
           set status = 'ERROR', error_message = $3
         where run_id = $1 and relationship_hash = $2
        "#,
    )
    .bind(run_id)
    .bind(relationship_hash)
    .bind(error_message)
    .execute(pool)
    .await
    .map_err(|e| wrap(e, "mark_tracking_errored failed"))?;

    Ok(())
}

/// Tracking rows that have accumulated all expected evidence but are still
/// PENDING — the triangulation worker's poll query.
pub async fn list_ready_for_triangulation(
    pool: &PgPool,
    run_id: Uuid,
) -> Result<Vec<EvidenceTrackingRow>> {
    let rows = sqlx::query(
        r#"
        select id, run_id, relationship_hash, relationship_id, evidence_count,
               expected_count, total_confidence, avg_confidence, status
        from relationship_evidence_tracking
        where run_id = $1 and status = 'PENDING' and evidence_count >= expected_count
        order by id asc
        "#,
    )
    .bind(run_id)
    .fetch_all(pool)
    .await
    .map_err(|e| wrap(e, "list_ready_for_triangulation failed"))?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(EvidenceTrackingRow {
            id: row.try_get("id").map_err(|e| wrap(e, "tracking row: id"))?,
            run_id: row.try_get("run_id").map_err(|e| wrap(e, "tracking row: run_id"))?,
            relationship_hash: row
                .try_get("relationship_hash")
                .map_err(|e| wrap(e, "tracking row: relationship_hash"))?,
            relationship_id: row
                .try_get("relationship_id")
                .map_err(|e| wrap(e, "tracking row: relationship_id"))?,
            evidence_count: row
                .try_get("evidence_count")
                .map_err(|e| wrap(e, "tracking row: evidence_count"))?,
            expected_count: row
                .try_get("expected_count")
                .map_err(|e| wrap(e, "tracking row: expected_count"))?,
            total_confidence: row
                .try_get("total_confidence")
                .map_err(|e| wrap(e, "tracking row: total_confidence"))?,
            avg_confidence: row
                .try_get("avg_confidence")
                .map_err(|e| wrap(e, "tracking row: avg_confidence"))?,
            status: row.try_get("status").map_err(|e| wrap(e, "tracking row: status"))?,
        });
    }
    Ok(out)
}
