use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ctp_db::{BatchedWriter, NewPoi, NewRelationship};
use ctp_errors::{CtpError, ErrorKind, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tokio::sync::{watch, Mutex as AsyncMutex};
use uuid::Uuid;

use crate::sinks::DownstreamSink;

/// Event types with no finding-specific handling just get routed straight
/// to the matching queue. Anything not in this map is marked PUBLISHED with
/// no downstream fan-out (a terminal, informational event).
pub(crate) fn static_queue_for(event_type: &str) -> Option<&'static str> {
    match event_type {
        "relationship-confidence-escalation" => Some("relationship-confidence-escalation"),
        "graph-ingestion" => Some("graph-ingestion"),
        "triangulated-analysis" => Some("triangulated-analysis"),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub poll_interval: Duration,
    pub batch_limit: i64,
    pub dispatcher_id: String,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_limit: 100,
            dispatcher_id: "outbox-publisher".into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublisherStats {
    pub published: u64,
    pub failed: u64,
    pub skipped_unresolved: u64,
}

impl std::ops::AddAssign for PublisherStats {
    fn add_assign(&mut self, rhs: PublisherStats) {
        self.published += rhs.published;
        self.failed += rhs.failed;
        self.skipped_unresolved += rhs.skipped_unresolved;
    }
}

#[derive(Deserialize)]
struct FileAnalysisFindingPayload {
    #[allow(dead_code)]
    #[serde(rename = "runId")]
    run_id: Uuid,
    #[serde(rename = "filePath")]
    file_path: String,
    pois: Vec<PoiFinding>,
}

#[derive(Deserialize, Clone)]
struct PoiFinding {
    name: String,
    #[serde(rename = "type")]
    poi_type: String,
    start_line: i32,
    end_line: i32,
    description: Option<String>,
    is_exported: bool,
}

#[derive(Deserialize)]
struct RelationshipAnalysisFindingPayload {
    #[allow(dead_code)]
    #[serde(rename = "runId")]
    run_id: Uuid,
    relationships: Vec<RawRelationship>,
}

#[derive(Deserialize)]
struct RawRelationship {
    from: String,
    to: String,
    #[serde(rename = "type")]
    rel_type: String,
    #[serde(rename = "filePath")]
    file_path: Option<String>,
    confidence: f64,
    reason: Option<String>,
    evidence: Option<Value>,
}

pub(crate) fn poi_hash(file_path: &str, name: &str, poi_type: &str, start_line: i32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file_path.as_bytes());
    hasher.update(b"\0");
    hasher.update(name.as_bytes());
    hasher.update(b"\0");
    hasher.update(poi_type.as_bytes());
    hasher.update(b"\0");
    hasher.update(start_line.to_le_bytes());
    hex::encode(hasher.finalize())
}

pub(crate) fn relationship_hash(from: &str, to: &str, rel_type: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(from.as_bytes());
    hasher.update(b"->");
    hasher.update(to.as_bytes());
    hasher.update(b"\0");
    hasher.update(rel_type.as_bytes());
    hex::encode(hasher.finalize())
}

/// Polls the outbox, claims a batch, and fans it out. Exactly one instance
/// in the whole deployment should run this — enforced at compile time by
/// `ctp-db`'s `runtime-claim` feature being listed only here.
pub struct OutboxPublisher {
    pool: PgPool,
    sink: Arc<dyn DownstreamSink>,
    cfg: PublisherConfig,
    in_flight: AtomicBool,
}

impl OutboxPublisher {
    pub fn new(pool: PgPool, sink: Arc<dyn DownstreamSink>, cfg: PublisherConfig) -> Self {
        Self {
            pool,
            sink,
            cfg,
            in_flight: AtomicBool::new(false),
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            if let Err(e) = self.poll_once().await {
                tracing::error!(error = %e, "outbox poll failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.cfg.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// One pass: claim a batch, process POI-producing events first (flushing
    /// before moving on), then relationship-producing events, then anything
    /// else. Returns without claiming anything if a previous poll is still
    /// in flight — the single-flight reentrancy guard.
    pub async fn poll_once(&self) -> Result<PublisherStats> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("outbox poll already in flight, skipping this tick");
            return Ok(PublisherStats::default());
        }
        let result = self.poll_once_inner().await;
        self.in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn poll_once_inner(&self) -> Result<PublisherStats> {
        let batch = ctp_db::outbox::outbox_claim_batch(
            &self.pool,
            self.cfg.batch_limit,
            &self.cfg.dispatcher_id,
        )
        .await?;

        if batch.is_empty() {
            return Ok(PublisherStats::default());
        }

        let mut stats = PublisherStats::default();

        let (file_events, rest): (Vec<_>, Vec<_>) = batch
            .into_iter()
            .partition(|row| row.event_type == "file-analysis-finding");
        let (relationship_events, other_events): (Vec<_>, Vec<_>) = rest
            .into_iter()
            .partition(|row| row.event_type == "relationship-analysis-finding");

        for row in file_events {
            match self.handle_file_analysis_finding(row.run_id, &row.payload).await {
                Ok(()) => {
                    ctp_db::outbox::outbox_mark_published(&self.pool, row.id).await?;
                    stats.published += 1;
                }
                Err(e) => {
                    tracing::warn!(outbox_id = row.id, error = %e, "file-analysis-finding event failed");
                    ctp_db::outbox::outbox_mark_failed(&self.pool, row.id).await?;
                    stats.failed += 1;
                }
            }
        }

        let mut validated_batch: Vec<Value> = Vec::new();
        let relationship_run_id = relationship_events.first().map(|r| r.run_id);
        for row in relationship_events {
            match self
                .handle_relationship_analysis_finding(row.run_id, &row.payload, &mut validated_batch, &mut stats)
                .await
            {
                Ok(()) => {
                    ctp_db::outbox::outbox_mark_published(&self.pool, row.id).await?;
                    stats.published += 1;
                }
                Err(e) => {
                    tracing::warn!(outbox_id = row.id, error = %e, "relationship-analysis-finding event failed");
                    ctp_db::outbox::outbox_mark_failed(&self.pool, row.id).await?;
                    stats.failed += 1;
                }
            }
        }

        if !validated_batch.is_empty() {
            let run_id = relationship_run_id.unwrap_or_else(Uuid::nil);
            self.sink
                .enqueue(
                    "analysis-findings",
                    json!({"runId": run_id, "relationships": validated_batch}),
                )
                .await?;
        }

        for row in other_events {
            if let Some(queue) = static_queue_for(&row.event_type) {
                self.sink.enqueue(queue, row.payload.clone()).await?;
            }
            ctp_db::outbox::outbox_mark_published(&self.pool, row.id).await?;
            stats.published += 1;
        }

        Ok(stats)
    }

    async fn handle_file_analysis_finding(&self, run_id: Uuid, payload: &Value) -> Result<()> {
        let parsed: FileAnalysisFindingPayload = serde_json::from_value(payload.clone())
            .map_err(|e| CtpError::wrap(ErrorKind::SchemaInvariant, anyhow::Error::new(e)))?;

        let file_id = ctp_db::files::upsert_file(&self.pool, run_id, &parsed.file_path).await?;

        // Every POI in this finding goes through the batched writer as one
        // buffered group rather than one insert per POI — the writer flushes
        // the whole file's worth in a single transaction.
        let collected: Arc<AsyncMutex<Vec<ctp_db::PoiRow>>> = Arc::new(AsyncMutex::new(Vec::new()));
        let pool = self.pool.clone();
        let collected_for_flush = Arc::clone(&collected);
        let writer = Arc::new(BatchedWriter::new(
            parsed.pois.len().max(1),
            Duration::from_secs(3600),
            move |batch: Vec<NewPoi>| {
                let pool = pool.clone();
                let collected = Arc::clone(&collected_for_flush);
                async move {
                    let rows = ctp_db::pois::insert_pois_batch(&pool, &batch).await?;
                    collected.lock().await.extend(rows);
                    Ok(())
                }
            },
        ));

        for poi in &parsed.pois {
            let hash = poi_hash(&parsed.file_path, &poi.name, &poi.poi_type, poi.start_line);
            let semantic_id = format!("{}::{}", parsed.file_path, poi.name);
            let new_poi = NewPoi {
                run_id,
                file_id,
                file_path: parsed.file_path.clone(),
                name: poi.name.clone(),
                poi_type: poi.poi_type.clone(),
                start_line: poi.start_line,
                end_line: poi.end_line,
                description: poi.description.clone(),
                is_exported: poi.is_exported,
                semantic_id,
                hash,
            };
            writer.push(new_poi).await?;
        }
        writer.flush().await?;
        let inserted = std::mem::take(&mut *collected.lock().await);

        let mut file_hasher = Sha256::new();
        for poi in &inserted {
            file_hasher.update(poi.hash.as_bytes());
        }
        ctp_db::files::mark_processed(&self.pool, file_id, &hex::encode(file_hasher.finalize())).await?;

        // One relationship-resolution job per POI, each carrying the other
        // POIs discovered in the same file as resolution context.
        for (i, row) in inserted.iter().enumerate() {
            let context: Vec<Value> = inserted
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, p)| json!({"name": p.name, "semanticId": p.semantic_id, "type": p.poi_type}))
                .collect();

            self.sink
                .enqueue(
                    "relationship-resolution",
                    json!({
                        "runId": run_id,
                        "poiId": row.id,
                        "semanticId": row.semantic_id,
                        "filePath": row.file_path,
                        "context": context,
                    }),
                )
                .await?;
        }

        Ok(())
    }

    async fn handle_relationship_analysis_finding(
        &self,
        run_id: Uuid,
        payload: &Value,
        validated_batch: &mut Vec<Value>,
        stats: &mut PublisherStats,
    ) -> Result<()> {
        let parsed: RelationshipAnalysisFindingPayload = serde_json::from_value(payload.clone())
            .map_err(|e| CtpError::wrap(ErrorKind::SchemaInvariant, anyhow::Error::new(e)))?;

        for raw in &parsed.relationships {
            let source = match self.resolve_poi(run_id, &raw.from).await? {
                Some(p) => p,
                None => {
                    tracing::warn!(identifier = %raw.from, "unresolved relationship endpoint, skipping edge");
                    stats.skipped_unresolved += 1;
                    continue;
                }
            };
            let target = match self.resolve_poi(run_id, &raw.to).await? {
                Some(p) => p,
                None => {
                    tracing::warn!(identifier = %raw.to, "unresolved relationship endpoint, skipping edge");
                    stats.skipped_unresolved += 1;
                    continue;
                }
            };

            let hash = relationship_hash(&raw.from, &raw.to, &raw.rel_type);
            let new_rel = NewRelationship {
                run_id,
                source_poi_id: source.id,
                target_poi_id: target.id,
                relationship_type: raw.rel_type.clone(),
                file_path: raw.file_path.clone(),
                confidence: raw.confidence,
                evidence: raw.evidence.clone(),
                reason: raw.reason.clone(),
                relationship_hash: hash.clone(),
            };
            ctp_db::relationships::insert_pending(&self.pool, &new_rel).await?;

            validated_batch.push(json!({
                "relationshipHash": hash,
                "evidencePayload": raw.evidence.clone().unwrap_or(Value::Null),
            }));
        }

        Ok(())
    }

    /// Resolves a textual reference to a POI: try the bare name first (the
    /// form a worker emits most often), falling back to semantic id lookup
    /// for the fully-qualified references.
    async fn resolve_poi(&self, run_id: Uuid, identifier: &str) -> Result<Option<ctp_db::PoiRow>> {
        let by_name = ctp_db::pois::find_by_name(&self.pool, run_id, identifier).await?;
        if let Some(p) = by_name.into_iter().next() {
            return Ok(Some(p));
        }
        let by_semantic = ctp_db::pois::find_by_semantic_id(&self.pool, run_id, identifier).await?;
        Ok(by_semantic.into_iter().next())
    }
}

#[cfg(test)]
mod hash_tests {
    use super::*;

    #[test]
    fn poi_hash_is_deterministic_and_position_sensitive() {
        let a = poi_hash("src/lib.rs", "parse_config", "function", 10);
        let b = poi_hash("src/lib.rs", "parse_config", "function", 10);
        let c = poi_hash("src/lib.rs", "parse_config", "function", 11);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn relationship_hash_is_direction_sensitive() {
        let forward = relationship_hash("a", "b", "CALLS");
        let backward = relationship_hash("b", "a", "CALLS");
        assert_ne!(forward, backward);
    }

    #[test]
    fn static_queue_for_routes_known_types_only() {
        assert_eq!(
            static_queue_for("relationship-confidence-escalation"),
            Some("relationship-confidence-escalation")
        );
        assert_eq!(static_queue_for("some-unknown-event"), None);
    }
}
