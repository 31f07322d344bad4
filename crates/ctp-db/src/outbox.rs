//! Transactional outbox. A worker writes its finding into `outbox` in the
//! same transaction as the rest of its write (so a crash between the two
//! never loses an event); a single dispatcher elsewhere polls, claims, and
//! publishes.
//!
//! `outbox_claim_batch` is gated behind the `runtime-claim` feature so only
//! the dispatcher crate can compile it in — every other consumer of
//! `ctp-db` depends on this crate without that feature, which keeps the
//! single-dispatcher invariant a compile error instead of a code review
//! note.

use ctp_errors::{CtpError, ErrorKind, Result};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::types::OutboxRow;

fn wrap(e: sqlx::Error, context: &'static str) -> CtpError {
    CtpError::wrap(ErrorKind::TransientIo, anyhow::Error::new(e).context(context))
}

const OUTBOX_COLUMNS: &str =
    "id, run_id, event_type, payload, status, created_at, published_at, claimed_at, claimed_by";

fn row_to_outbox(row: sqlx::postgres::PgRow) -> Result<OutboxRow> {
    Ok(OutboxRow {
        id: row.try_get("id").map_err(|e| wrap(e, "outbox row: id"))?,
        run_id: row.try_get("run_id").map_err(|e| wrap(e, "outbox row: run_id"))?,
        event_type: row
            .try_get("event_type")
            .map_err(|e| wrap(e, "outbox row: event_type"))?,
        payload: row.try_get("payload").map_err(|e| wrap(e, "outbox row: payload"))?,
        status: row.try_get("status").map_err(|e| wrap(e, "outbox row: status"))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| wrap(e, "outbox row: created_at"))?,
        published_at: row
            .try_get("published_at")
            .map_err(|e| wrap(e, "outbox row: published_at"))?,
        claimed_at: row
            .try_get("claimed_at")
            .map_err(|e| wrap(e, "outbox row: claimed_at"))?,
        claimed_by: row
            .try_get("claimed_by")
            .map_err(|e| wrap(e, "outbox row: claimed_by"))?,
    })
}

/// Enqueue an outbox event. Not idempotency-keyed at the SQL layer (unlike
/// the order outbox this was modeled on) because findings are append-only
/// facts, not commands — two identical findings from two retried workers
/// are both legitimate evidence, not a double-submit.
pub async fn outbox_enqueue(
    pool: &PgPool,
    run_id: Uuid,
    event_type: &str,
    payload: Value,
) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        insert into outbox (run_id, event_type, payload, status)
        values ($1, $2, $3, 'PENDING')
        returning id
        "#,
    )
    .bind(run_id)
    .bind(event_type)
    .bind(payload)
    .fetch_one(pool)
    .await
    .map_err(|e| wrap(e, "outbox_enqueue failed"))?;

    Ok(id)
}

/// Atomically claims up to `batch_size` PENDING rows using
/// `FOR UPDATE SKIP LOCKED`, ordered so POI-producing event types are
/// claimed ahead of relationship-producing ones within the same batch.
#[cfg(feature = "runtime-claim")]
pub async fn outbox_claim_batch(
    pool: &PgPool,
    batch_size: i64,
    dispatcher_id: &str,
) -> Result<Vec<OutboxRow>> {
    let rows = sqlx::query(&format!(
        r#"
        with to_claim as (
            select id
            from outbox
            where status = 'PENDING'
            order by
                case event_type
                    when 'file-analysis-finding' then 0
                    else 1
                end,
                id asc
            limit $1
            for update skip locked
        )
        update outbox
           set status = 'CLAIMED', claimed_at = now(), claimed_by = $2
         where id in (select id from to_claim)
        returning {OUTBOX_COLUMNS}
        "#
    ))
    .bind(batch_size)
    .bind(dispatcher_id)
    .fetch_all(pool)
    .await
    .map_err(|e| wrap(e, "outbox_claim_batch failed"))?;

    rows.into_iter().map(row_to_outbox).collect()
}

pub async fn outbox_release_claim(pool: &PgPool, id: i64) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        update outbox
           set status = 'PENDING', claimed_at = null, claimed_by = null
         where id = $1 and status = 'CLAIMED'
        returning id
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .map_err(|e| wrap(e, "outbox_release_claim failed"))?;

    Ok(row.is_some())
}

/// Marks a CLAIMED row PUBLISHED. Only CLAIMED rows can transition, so a
/// dispatcher that never claimed a row cannot mark it published.
pub async fn outbox_mark_published(pool: &PgPool, id: i64) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        update outbox
           set status = 'PUBLISHED', published_at = now()
         where id = $1 and status = 'CLAIMED'
        returning id
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .map_err(|e| wrap(e, "outbox_mark_published failed"))?;

    Ok(row.is_some())
}

pub async fn outbox_mark_failed(pool: &PgPool, id: i64) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        update outbox
           set status = 'FAILED'
         where id = $1 and status = 'CLAIMED'
        returning id
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .map_err(|e| wrap(e, "outbox_mark_failed failed"))?;

    Ok(row.is_some())
}

/// Recovery query: everything not yet PUBLISHED for a run, so a restarted
/// dispatcher can resume without re-reading the whole table.
pub async fn outbox_list_unpublished_for_run(pool: &PgPool, run_id: Uuid) -> Result<Vec<OutboxRow>> {
    let rows = sqlx::query(&format!(
        "select {OUTBOX_COLUMNS} from outbox where run_id = $1 and status in ('PENDING','CLAIMED','FAILED') order by id asc"
    ))
    .bind(run_id)
    .fetch_all(pool)
    .await
    .map_err(|e| wrap(e, "outbox_list_unpublished_for_run failed"))?;

    rows.into_iter().map(row_to_outbox).collect()
}
