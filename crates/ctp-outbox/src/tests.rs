use crate::sinks::{DownstreamSink, QueuedJob};
use async_trait::async_trait;
use ctp_errors::Result;
use serde_json::Value;
use std::sync::Mutex;

pub struct RecordingSink {
    pub jobs: Mutex<Vec<QueuedJob>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl DownstreamSink for RecordingSink {
    async fn enqueue(&self, queue: &'static str, data: Value) -> Result<()> {
        self.jobs.lock().unwrap().push(QueuedJob { queue, data });
        Ok(())
    }
}

#[tokio::test]
async fn recording_sink_records_every_enqueue() {
    let sink = RecordingSink::new();
    sink.enqueue("relationship-resolution", serde_json::json!({"a": 1}))
        .await
        .unwrap();
    sink.enqueue("analysis-findings", serde_json::json!({"b": 2}))
        .await
        .unwrap();

    let jobs = sink.jobs.lock().unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].queue, "relationship-resolution");
}

#[test]
fn publisher_stats_add_assign_accumulates() {
    use crate::publisher::PublisherStats;
    let mut total = PublisherStats::default();
    total += PublisherStats {
        published: 2,
        failed: 1,
        skipped_unresolved: 0,
    };
    total += PublisherStats {
        published: 3,
        failed: 0,
        skipped_unresolved: 1,
    };
    assert_eq!(total.published, 5);
    assert_eq!(total.failed, 1);
    assert_eq!(total.skipped_unresolved, 1);
}
