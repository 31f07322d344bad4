//! Axum router and all HTTP handlers for ctp-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. All handlers are `pub(crate)` so scenario tests can
//! compose the router directly.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;
use uuid::Uuid;

use crate::{
    api_types::{GateRefusedResponse, HealthResponse, RunStartResponse},
    state::{uptime_secs, AppState, BusMsg},
};

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/v1/status", get(status_handler))
        .route("/v1/stream", get(stream))
        .route("/v1/run/start", post(run_start))
        .with_state(state)
}

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

pub(crate) async fn status_handler(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let mut snap = st.status.read().await.clone();
    snap.daemon_uptime_secs = uptime_secs();

    let _ = st.bus.send(BusMsg::Status(snap.clone()));
    (StatusCode::OK, Json(snap))
}

/// Start one pipeline run in the background. Refuses with `409 Conflict` if
/// a run is already active — the orchestrator only supports one run at a
/// time per process.
pub(crate) async fn run_start(State(st): State<Arc<AppState>>) -> Response {
    {
        let status = st.status.read().await;
        if status.state == "running" {
            return (
                StatusCode::CONFLICT,
                Json(GateRefusedResponse {
                    error: "a run is already active on this daemon".to_string(),
                    gate: "run_already_active".to_string(),
                }),
            )
                .into_response();
        }
    }

    let run_id = Uuid::new_v4();
    {
        let mut status = st.status.write().await;
        status.active_run_id = Some(run_id);
        status.state = "running".to_string();
        status.daemon_uptime_secs = uptime_secs();
    }

    info!(%run_id, "run/start");
    let snap = st.status.read().await.clone();
    let _ = st.bus.send(BusMsg::Status(snap));

    let st_bg = Arc::clone(&st);
    let config_hash = st.config_hash.clone();
    tokio::spawn(async move {
        let result = st_bg.orchestrator.run(run_id, &config_hash).await;

        let mut status = st_bg.status.write().await;
        status.state = "idle".to_string();
        status.daemon_uptime_secs = uptime_secs();
        match result {
            Ok(report) => {
                status.last_report = Some(crate::api_types::RunReportView {
                    run_id: report.run_id,
                    duration_ms: report.duration().num_milliseconds(),
                    pois_discovered: report.pois_discovered,
                    relationships_pending: report.relationships_pending,
                    graph_nodes_projected: report.graph_nodes_projected,
                    graph_edges_projected: report.graph_edges_projected,
                    completion_outcome: format!("{:?}", report.completion_outcome),
                });
                let _ = st_bg.bus.send(BusMsg::LogLine {
                    level: "INFO".to_string(),
                    msg: format!("run {run_id} finished"),
                });
            }
            Err(e) => {
                let _ = st_bg.bus.send(BusMsg::LogLine {
                    level: "ERROR".to_string(),
                    msg: format!("run {run_id} failed: {e}"),
                });
            }
        }
        let snap = status.clone();
        drop(status);
        let _ = st_bg.bus.send(BusMsg::Status(snap));
    });

    (
        StatusCode::ACCEPTED,
        Json(RunStartResponse {
            run_id,
            state: "running".to_string(),
        }),
    )
        .into_response()
}

pub(crate) async fn stream(State(st): State<Arc<AppState>>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let rx = st.bus.subscribe();
    let events = broadcast_to_sse(rx);

    (headers, Sse::new(events).keep_alive(KeepAlive::new())).into_response()
}

fn broadcast_to_sse(rx: broadcast::Receiver<BusMsg>) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(m) => {
                let event_name = match &m {
                    BusMsg::Heartbeat { .. } => "heartbeat",
                    BusMsg::Status(_) => "status",
                    BusMsg::LogLine { .. } => "log",
                };
                let data = serde_json::to_string(&m).ok()?;
                Some(Ok(Event::default().event(event_name).data(data)))
            }
            Err(_) => None,
        }
    })
}
