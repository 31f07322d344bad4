//! In-memory collaborator doubles shared across scenario tests that don't
//! want a live queue backend or a live graph database.

use std::sync::Mutex;

use async_trait::async_trait;
use ctp_errors::Result;
use ctp_graph::{GraphEdge, GraphNode, GraphSink};
use ctp_outbox::{DownstreamSink, QueuedJob};
use serde_json::Value;

/// Records everything the outbox publisher would have enqueued, instead of
/// actually enqueueing it onto a `QueueManager`.
#[derive(Default)]
pub struct RecordingDownstreamSink {
    pub jobs: Mutex<Vec<QueuedJob>>,
}

#[async_trait]
impl DownstreamSink for RecordingDownstreamSink {
    async fn enqueue(&self, queue: &'static str, data: Value) -> Result<()> {
        self.jobs.lock().unwrap().push(QueuedJob { queue, data });
        Ok(())
    }
}

/// Records every node/edge a `GraphBuilder` would have written, instead of
/// opening a Neo4j connection.
#[derive(Default)]
pub struct RecordingGraphSink {
    pub nodes: Mutex<Vec<GraphNode>>,
    pub edges: Mutex<Vec<GraphEdge>>,
    pub constraints_ensured: Mutex<bool>,
}

#[async_trait]
impl GraphSink for RecordingGraphSink {
    async fn upsert_node(&self, node: &GraphNode) -> Result<()> {
        self.nodes.lock().unwrap().push(node.clone());
        Ok(())
    }

    async fn upsert_edge(&self, edge: &GraphEdge) -> Result<()> {
        self.edges.lock().unwrap().push(edge.clone());
        Ok(())
    }

    async fn ensure_constraints(&self) -> Result<()> {
        *self.constraints_ensured.lock().unwrap() = true;
        Ok(())
    }
}
