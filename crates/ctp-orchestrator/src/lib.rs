//! Wires concurrency, breakers, queues, the outbox publisher, the
//! completion monitor, and the graph builder into one run lifecycle:
//! `INIT → RUN → DRAIN → GRAPH_BUILD → SHUTDOWN`.

mod orchestrator;
mod types;

pub use orchestrator::PipelineOrchestrator;
pub use types::{LifecycleState, RunReport, ShutdownTimeouts};
