use std::sync::Arc;

use async_trait::async_trait;
use ctp_errors::Result;
use ctp_queue::{JobOptions, QueueManager};
use serde_json::Value;

/// A job the publisher wants fanned out onto a named queue. Kept as a plain
/// struct (rather than calling `QueueManager` directly everywhere) so unit
/// tests can assert on what *would* have been enqueued without spinning up
/// a real queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    pub queue: &'static str,
    pub data: Value,
}

/// Where the publisher sends fanned-out work. The production implementation
/// wraps a `ctp_queue::QueueManager`; tests use an in-memory recorder.
#[async_trait]
pub trait DownstreamSink: Send + Sync {
    async fn enqueue(&self, queue: &'static str, data: Value) -> Result<()>;
}

pub struct QueueManagerSink {
    queues: Arc<QueueManager>,
}

impl QueueManagerSink {
    pub fn new(queues: Arc<QueueManager>) -> Self {
        Self { queues }
    }
}

#[async_trait]
impl DownstreamSink for QueueManagerSink {
    async fn enqueue(&self, queue: &'static str, data: Value) -> Result<()> {
        self.queues.add(queue, data, JobOptions::default()).await?;
        Ok(())
    }
}
