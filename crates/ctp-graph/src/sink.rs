use async_trait::async_trait;
use ctp_errors::{CtpError, ErrorKind, Result};
use uuid::Uuid;

/// A node to project: one POI, keyed by `(run_id, semantic_id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    pub run_id: Uuid,
    pub semantic_id: String,
    pub name: String,
    pub poi_type: String,
    pub file_path: String,
    pub is_exported: bool,
}

/// An edge to project: one `VALIDATED` relationship between two POI nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphEdge {
    pub run_id: Uuid,
    pub from_semantic_id: String,
    pub to_semantic_id: String,
    pub relationship_type: String,
    pub confidence: f64,
}

/// Abstracts the property-graph store the same way `dashflow-neo4j`'s
/// `GraphStore` abstracts Cypher backends — `GraphBuilder` never depends on
/// a concrete driver, so it can run against an in-memory double in tests.
#[async_trait]
pub trait GraphSink: Send + Sync {
    /// Must be idempotent: re-projecting the same node twice is a no-op
    /// beyond updating its properties (the uniqueness constraint is on
    /// `(run_id, semantic_id)`).
    async fn upsert_node(&self, node: &GraphNode) -> Result<()>;

    /// Upserts the edge's endpoints are assumed to already exist as nodes;
    /// callers project all nodes before any edge.
    async fn upsert_edge(&self, edge: &GraphEdge) -> Result<()>;

    /// Creates the uniqueness constraint on `(run_id, semantic_id)` if the
    /// backend supports one and it isn't already present. Safe to call on
    /// every startup.
    async fn ensure_constraints(&self) -> Result<()>;
}

/// Neo4j-backed [`GraphSink`], grounded on the Cypher `MERGE` idiom: a
/// `MERGE` on the node key plus a `SET` of the remaining properties is both
/// the create and the update path, so no existence check is needed before
/// every write.
pub struct Neo4jGraphSink {
    graph: neo4rs::Graph,
}

impl Neo4jGraphSink {
    pub async fn connect(uri: &str, user: &str, password: &str) -> Result<Self> {
        let graph = neo4rs::Graph::new(uri, user, password)
            .await
            .map_err(|e| CtpError::wrap(ErrorKind::TransientIo, anyhow::anyhow!(e).context("connect to neo4j")))?;
        Ok(Self { graph })
    }

    async fn run(&self, query: neo4rs::Query) -> Result<()> {
        self.graph
            .run(query)
            .await
            .map_err(|e| CtpError::wrap(ErrorKind::TransientIo, anyhow::anyhow!(e).context("neo4j query failed")))
    }
}

#[async_trait]
impl GraphSink for Neo4jGraphSink {
    async fn upsert_node(&self, node: &GraphNode) -> Result<()> {
        let query = neo4rs::Query::new(
            "MERGE (p:Poi {run_id: $run_id, semantic_id: $semantic_id}) \
             SET p.name = $name, p.type = $poi_type, p.file_path = $file_path, p.is_exported = $is_exported",
        )
        .param("run_id", node.run_id.to_string())
        .param("semantic_id", node.semantic_id.clone())
        .param("name", node.name.clone())
        .param("poi_type", node.poi_type.clone())
        .param("file_path", node.file_path.clone())
        .param("is_exported", node.is_exported);

        self.run(query).await
    }

    async fn upsert_edge(&self, edge: &GraphEdge) -> Result<()> {
        let query = neo4rs::Query::new(
            "MATCH (a:Poi {run_id: $run_id, semantic_id: $from_id}) \
             MATCH (b:Poi {run_id: $run_id, semantic_id: $to_id}) \
             MERGE (a)-[r:RELATES {type: $rel_type}]->(b) \
             SET r.confidence = $confidence, r.run_id = $run_id",
        )
        .param("run_id", edge.run_id.to_string())
        .param("from_id", edge.from_semantic_id.clone())
        .param("to_id", edge.to_semantic_id.clone())
        .param("rel_type", edge.relationship_type.clone())
        .param("confidence", edge.confidence);

        self.run(query).await
    }

    async fn ensure_constraints(&self) -> Result<()> {
        let query = neo4rs::Query::new(
            "CREATE CONSTRAINT poi_run_semantic_id IF NOT EXISTS \
             FOR (p:Poi) REQUIRE (p.run_id, p.semantic_id) IS UNIQUE",
        );
        self.run(query).await
    }
}
