//! Request and response types for all ctp-daemon HTTP endpoints.
//!
//! These types are `Serialize + Deserialize` so they can be JSON-encoded by
//! Axum and decoded by tests. No business logic lives here.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

/// Summary of the most recently finished run, surfaced on `/v1/status` once
/// at least one run has completed this process's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReportView {
    pub run_id: Uuid,
    pub duration_ms: i64,
    pub pois_discovered: i64,
    pub relationships_pending: i64,
    pub graph_nodes_projected: usize,
    pub graph_edges_projected: usize,
    /// "idle" | "timeout" | "excessive_failures" — mirrors `MonitorOutcome`.
    pub completion_outcome: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStartResponse {
    pub run_id: Uuid,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateRefusedResponse {
    pub error: String,
    /// Which gate failed: only "run_already_active" exists today.
    pub gate: String,
}
