use std::sync::Arc;

use ctp_breaker::CircuitBreakerSet;
use ctp_errors::Result;
use sqlx::PgPool;
use uuid::Uuid;

use crate::sink::{GraphEdge, GraphNode, GraphSink};

/// Service name the "graph-store" breaker is registered under in the shared
/// `CircuitBreakerSet` — every graph write goes through it, same as every
/// LLM call goes through the "llm" breaker.
pub const GRAPH_STORE_SERVICE: &str = "graph-store";

const GRAPH_WRITE_MAX_RETRIES: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphBuildReport {
    pub nodes_projected: usize,
    pub edges_projected: usize,
    pub edges_skipped_unresolved_endpoint: usize,
}

/// Projects one run's POIs and `VALIDATED` relationships onto a property
/// graph. Nodes go first, entirely, before any edge — an edge's endpoints
/// must already exist as nodes (see [`GraphSink::upsert_edge`]). Every write
/// is a suspension point shaped by the same breaker+pool nesting every other
/// external dependency call goes through: the "graph-store" breaker first,
/// so a degraded graph backend sheds load the same way a degraded LLM does.
pub struct GraphBuilder {
    pool: PgPool,
    sink: Arc<dyn GraphSink>,
    breakers: Arc<CircuitBreakerSet>,
}

impl GraphBuilder {
    pub fn new(pool: PgPool, sink: Arc<dyn GraphSink>, breakers: Arc<CircuitBreakerSet>) -> Self {
        Self { pool, sink, breakers }
    }

    pub async fn build_for_run(&self, run_id: Uuid) -> Result<GraphBuildReport> {
        self.breakers
            .execute(GRAPH_STORE_SERVICE, GRAPH_WRITE_MAX_RETRIES, || {
                self.sink.ensure_constraints()
            })
            .await?;

        let pois = ctp_db::pois::list_for_run(&self.pool, run_id).await?;
        let mut report = GraphBuildReport::default();

        for poi in &pois {
            let node = GraphNode {
                run_id,
                semantic_id: poi.semantic_id.clone(),
                name: poi.name.clone(),
                poi_type: poi.poi_type.clone(),
                file_path: poi.file_path.clone(),
                is_exported: poi.is_exported,
            };
            self.breakers
                .execute(GRAPH_STORE_SERVICE, GRAPH_WRITE_MAX_RETRIES, || {
                    self.sink.upsert_node(&node)
                })
                .await?;
            report.nodes_projected += 1;
        }

        let relationships = ctp_db::relationships::list_validated_for_run(&self.pool, run_id).await?;
        for rel in &relationships {
            let (Ok(from), Ok(to)) = (
                ctp_db::pois::fetch_by_id(&self.pool, rel.source_poi_id).await,
                ctp_db::pois::fetch_by_id(&self.pool, rel.target_poi_id).await,
            ) else {
                tracing::warn!(
                    run_id = %run_id,
                    relationship_id = rel.id,
                    "skipping graph edge, endpoint POI no longer resolves"
                );
                report.edges_skipped_unresolved_endpoint += 1;
                continue;
            };

            let edge = GraphEdge {
                run_id,
                from_semantic_id: from.semantic_id,
                to_semantic_id: to.semantic_id,
                relationship_type: rel.relationship_type.clone(),
                confidence: rel.confidence,
            };
            self.breakers
                .execute(GRAPH_STORE_SERVICE, GRAPH_WRITE_MAX_RETRIES, || {
                    self.sink.upsert_edge(&edge)
                })
                .await?;
            report.edges_projected += 1;
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_report_default_is_all_zero() {
        let report = GraphBuildReport::default();
        assert_eq!(report.nodes_projected, 0);
        assert_eq!(report.edges_projected, 0);
        assert_eq!(report.edges_skipped_unresolved_endpoint, 0);
    }
}
