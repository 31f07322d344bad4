use async_trait::async_trait;
use ctp_errors::Result;
use serde_json::Value;

/// External-collaborator boundary for a job handler: the actual LLM call
/// (or graph write, or whatever the kind does) lives behind this trait so
/// `WorkerPoolManager`/`QueueManager` wiring never depends on a concrete
/// LLM client or graph driver.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, data: Value) -> Result<Value>;
}

/// Analyzes one source file and reports discovered POIs. Payload/response
/// shapes match the `file-analysis-finding` outbox event.
#[async_trait]
pub trait FileAnalysisWorker: Send + Sync {
    async fn analyze_file(&self, run_id: uuid::Uuid, file_path: &str, contents: &str) -> Result<Value>;
}

/// Resolves and scores a relationship between two POIs. Payload/response
/// shapes match the `relationship-analysis-finding` outbox event.
#[async_trait]
pub trait RelationshipWorker: Send + Sync {
    async fn analyze_relationship(&self, run_id: uuid::Uuid, context: Value) -> Result<Value>;
}

/// Adapts a [`FileAnalysisWorker`] to the generic [`JobHandler`] shape the
/// queue consumer expects; pulls `{runId, filePath, contents}` out of the
/// job payload.
pub struct FileAnalysisJobHandler<W: FileAnalysisWorker> {
    worker: W,
}

impl<W: FileAnalysisWorker> FileAnalysisJobHandler<W> {
    pub fn new(worker: W) -> Self {
        Self { worker }
    }
}

#[async_trait]
impl<W: FileAnalysisWorker> JobHandler for FileAnalysisJobHandler<W> {
    async fn handle(&self, data: Value) -> Result<Value> {
        let run_id = data
            .get("runId")
            .and_then(|v| v.as_str())
            .and_then(|s| uuid::Uuid::parse_str(s).ok())
            .ok_or_else(|| ctp_errors::CtpError::InternalBug("job payload missing runId".into()))?;
        let file_path = data
            .get("filePath")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ctp_errors::CtpError::InternalBug("job payload missing filePath".into()))?;
        let contents = data.get("contents").and_then(|v| v.as_str()).unwrap_or_default();
        self.worker.analyze_file(run_id, file_path, contents).await
    }
}

/// Adapts a [`RelationshipWorker`] to the generic [`JobHandler`] shape.
pub struct RelationshipJobHandler<W: RelationshipWorker> {
    worker: W,
}

impl<W: RelationshipWorker> RelationshipJobHandler<W> {
    pub fn new(worker: W) -> Self {
        Self { worker }
    }
}

#[async_trait]
impl<W: RelationshipWorker> JobHandler for RelationshipJobHandler<W> {
    async fn handle(&self, data: Value) -> Result<Value> {
        let run_id = data
            .get("runId")
            .and_then(|v| v.as_str())
            .and_then(|s| uuid::Uuid::parse_str(s).ok())
            .ok_or_else(|| ctp_errors::CtpError::InternalBug("job payload missing runId".into()))?;
        self.worker.analyze_relationship(run_id, data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoFileWorker;

    #[async_trait]
    impl FileAnalysisWorker for EchoFileWorker {
        async fn analyze_file(&self, run_id: uuid::Uuid, file_path: &str, _contents: &str) -> Result<Value> {
            Ok(json!({"runId": run_id.to_string(), "filePath": file_path, "pois": []}))
        }
    }

    #[tokio::test]
    async fn file_analysis_handler_extracts_run_id_and_file_path() {
        let handler = FileAnalysisJobHandler::new(EchoFileWorker);
        let run_id = uuid::Uuid::new_v4();
        let out = handler
            .handle(json!({"runId": run_id.to_string(), "filePath": "src/lib.rs", "contents": "fn main() {}"}))
            .await
            .unwrap();
        assert_eq!(out["filePath"], "src/lib.rs");
    }

    #[tokio::test]
    async fn file_analysis_handler_rejects_missing_run_id() {
        let handler = FileAnalysisJobHandler::new(EchoFileWorker);
        let result = handler.handle(json!({"filePath": "src/lib.rs"})).await;
        assert!(result.is_err());
    }
}
