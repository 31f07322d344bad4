use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> ctp_errors::Result<Self> {
        match s {
            "RUNNING" => Ok(RunStatus::Running),
            "COMPLETED" => Ok(RunStatus::Completed),
            "FAILED" => Ok(RunStatus::Failed),
            other => Err(ctp_errors::CtpError::InternalBug(format!(
                "unknown run status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoiStatus {
    Pending,
    Processed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipStatus {
    Pending,
    Validated,
    Discarded,
    Escalated,
}

impl RelationshipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipStatus::Pending => "PENDING",
            RelationshipStatus::Validated => "VALIDATED",
            RelationshipStatus::Discarded => "DISCARDED",
            RelationshipStatus::Escalated => "ESCALATED",
        }
    }

    pub fn parse(s: &str) -> ctp_errors::Result<Self> {
        match s {
            "PENDING" => Ok(RelationshipStatus::Pending),
            "VALIDATED" => Ok(RelationshipStatus::Validated),
            "DISCARDED" => Ok(RelationshipStatus::Discarded),
            "ESCALATED" => Ok(RelationshipStatus::Escalated),
            other => Err(ctp_errors::CtpError::InternalBug(format!(
                "unknown relationship status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Claimed,
    Published,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Claimed => "CLAIMED",
            OutboxStatus::Published => "PUBLISHED",
            OutboxStatus::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunRow {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub config_hash: String,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FileRow {
    pub id: i64,
    pub run_id: Uuid,
    pub file_path: String,
    pub status: String,
    pub hash: Option<String>,
    pub last_processed: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewPoi {
    pub run_id: Uuid,
    pub file_id: i64,
    pub file_path: String,
    pub name: String,
    pub poi_type: String,
    pub start_line: i32,
    pub end_line: i32,
    pub description: Option<String>,
    pub is_exported: bool,
    pub semantic_id: String,
    pub hash: String,
}

#[derive(Debug, Clone)]
pub struct PoiRow {
    pub id: i64,
    pub run_id: Uuid,
    pub file_id: i64,
    pub file_path: String,
    pub name: String,
    pub poi_type: String,
    pub start_line: i32,
    pub end_line: i32,
    pub description: Option<String>,
    pub is_exported: bool,
    pub semantic_id: String,
    pub hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewRelationship {
    pub run_id: Uuid,
    pub source_poi_id: i64,
    pub target_poi_id: i64,
    pub relationship_type: String,
    pub file_path: Option<String>,
    pub confidence: f64,
    pub evidence: Option<Value>,
    pub reason: Option<String>,
    pub relationship_hash: String,
}

#[derive(Debug, Clone)]
pub struct RelationshipRow {
    pub id: i64,
    pub run_id: Uuid,
    pub source_poi_id: i64,
    pub target_poi_id: i64,
    pub relationship_type: String,
    pub file_path: Option<String>,
    pub status: RelationshipStatus,
    pub confidence: f64,
    pub evidence: Option<Value>,
    pub reason: Option<String>,
    pub relationship_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewEvidence {
    pub run_id: Uuid,
    pub relationship_hash: String,
    pub relationship_id: Option<i64>,
    pub payload: Value,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct EvidenceTrackingRow {
    pub id: i64,
    pub run_id: Uuid,
    pub relationship_hash: String,
    pub relationship_id: Option<i64>,
    pub evidence_count: i32,
    pub expected_count: i32,
    pub total_confidence: f64,
    pub avg_confidence: f64,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct OutboxRow {
    pub id: i64,
    pub run_id: Uuid,
    pub event_type: String,
    pub payload: Value,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SchemaMigrationRow {
    pub version: i64,
    pub description: String,
    pub applied_at: DateTime<Utc>,
}
