//! Scenario: basic daemon HTTP surface.
//!
//! Pure in-process; no DB or graph-store network required since the
//! orchestrator is only constructed (never `.run()`), and construction
//! does not touch either.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{Request, StatusCode};
use ctp_config::{Environment, PipelineConfig};
use ctp_daemon::{routes, state};
use ctp_errors::Result;
use ctp_graph::{GraphEdge, GraphNode, GraphSink};
use ctp_orchestrator::PipelineOrchestrator;
use http_body_util::BodyExt;
use tower::ServiceExt;

struct NoopGraphSink;

#[async_trait]
impl GraphSink for NoopGraphSink {
    async fn upsert_node(&self, _node: &GraphNode) -> Result<()> {
        Ok(())
    }
    async fn upsert_edge(&self, _edge: &GraphEdge) -> Result<()> {
        Ok(())
    }
    async fn ensure_constraints(&self) -> Result<()> {
        Ok(())
    }
}

async fn test_state() -> Arc<state::AppState> {
    let config = PipelineConfig::defaults_for(Environment::Test);
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(1)
        .connect_lazy("postgres://localhost/does-not-need-to-exist")
        .unwrap();

    let orchestrator = Arc::new(PipelineOrchestrator::new(pool, config, Arc::new(NoopGraphSink)).await);
    Arc::new(state::AppState::new(orchestrator, "test-hash".to_string()))
}

async fn call(router: axum::Router, req: Request<axum::body::Body>) -> (StatusCode, bytes::Bytes) {
    let resp = router.oneshot(req).await.expect("oneshot failed");
    let status = resp.status();
    let body = resp.into_body().collect().await.expect("body collect failed").to_bytes();
    (status, body)
}

fn parse_json(b: bytes::Bytes) -> serde_json::Value {
    serde_json::from_slice(&b).expect("body is not valid JSON")
}

#[tokio::test]
async fn healthz_reports_ok() {
    let st = test_state().await;
    let req = Request::builder().method("GET").uri("/healthz").body(axum::body::Body::empty()).unwrap();
    let (status, body) = call(routes::build_router(st), req).await;

    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["ok"], true);
    assert_eq!(json["service"], "ctp-daemon");
}

#[tokio::test]
async fn status_reports_idle_on_a_fresh_daemon() {
    let st = test_state().await;
    let req = Request::builder().method("GET").uri("/v1/status").body(axum::body::Body::empty()).unwrap();
    let (status, body) = call(routes::build_router(st), req).await;

    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["state"], "idle");
    assert!(json["active_run_id"].is_null());
}

#[tokio::test]
async fn run_start_is_refused_while_a_run_is_already_active() {
    let st = test_state().await;
    {
        let mut s = st.status.write().await;
        s.state = "running".to_string();
        s.active_run_id = Some(uuid::Uuid::new_v4());
    }

    let req = Request::builder().method("POST").uri("/v1/run/start").body(axum::body::Body::empty()).unwrap();
    let (status, body) = call(routes::build_router(st), req).await;

    assert_eq!(status, StatusCode::CONFLICT);
    let json = parse_json(body);
    assert_eq!(json["gate"], "run_already_active");
}
