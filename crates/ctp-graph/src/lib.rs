//! Projects the validated subset of one run's POIs/relationships onto a
//! property graph. This is the only consumer that reads `VALIDATED`
//! relationships for graph purposes; everything upstream of it talks
//! through queues or the outbox, never directly.

mod builder;
mod sink;

pub use builder::{GraphBuildReport, GraphBuilder};
pub use sink::{GraphEdge, GraphNode, GraphSink, Neo4jGraphSink};
