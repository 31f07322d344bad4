//! Per-kind worker pools nested inside the global concurrency cap, plus
//! the completion monitor that tells the orchestrator when a run is done.

mod completion;
mod pool;
mod types;
mod worker_trait;

pub use completion::CompletionMonitor;
pub use pool::{PoolCascadeSink, WorkerPoolManager};
pub use types::{MonitorConfig, MonitorOutcome, WorkerLimits, CASCADE_REDUCTION_FACTOR};
pub use worker_trait::{
    FileAnalysisJobHandler, FileAnalysisWorker, JobHandler, RelationshipJobHandler, RelationshipWorker,
};
