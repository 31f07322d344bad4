//! ctp-daemon entry point.
//!
//! This file is intentionally thin: it sets up tracing, loads config,
//! connects to the relational store and graph store, builds the
//! orchestrator and shared state, wires middleware, and starts the HTTP
//! server. All route handlers live in `routes.rs`; all shared state types
//! live in `state.rs`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use ctp_config::Environment;
use ctp_daemon::{routes, state};
use ctp_orchestrator::PipelineOrchestrator;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file does
    // not exist — production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let env = environment_from_env();
    let loaded = ctp_config::load_layered_yaml(env, &["config/base.yaml", "config/local.yaml"])
        .context("load layered pipeline config")?;

    let db_url = std::env::var(ctp_db::ENV_DB_URL).context("CTP_DATABASE_URL must be set")?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(ctp_config::queue_pool_size(loaded.config.max_concurrency))
        .connect(&db_url)
        .await
        .context("connect to relational store")?;

    let graph_sink = build_graph_sink().await?;

    let orchestrator = Arc::new(PipelineOrchestrator::new(pool, loaded.config, graph_sink).await);

    let shared = Arc::new(state::AppState::new(orchestrator, loaded.config_hash));

    state::spawn_heartbeat(shared.bus.clone(), Duration::from_secs(1));
    state::spawn_retention_sweep(
        shared.orchestrator.relational_pool(),
        loaded.config.cleanup.stale_age_secs,
        Duration::from_secs(loaded.config.cleanup.stale_age_secs.max(60)),
    );

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8900)));
    info!("ctp-daemon listening on http://{}", addr);

    let orchestrator_for_shutdown = shared.orchestrator.clone();
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("ctrl-c received, shutting down");
            orchestrator_for_shutdown.shutdown().await;
        })
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

fn environment_from_env() -> Environment {
    match std::env::var("CTP_ENV").as_deref() {
        Ok("production") => Environment::Production,
        Ok("debug") => Environment::Debug,
        Ok("test") => Environment::Test,
        _ => Environment::Development,
    }
}

async fn build_graph_sink() -> anyhow::Result<Arc<dyn ctp_graph::GraphSink>> {
    let uri = std::env::var("CTP_NEO4J_URI").unwrap_or_else(|_| "bolt://127.0.0.1:7687".to_string());
    let user = std::env::var("CTP_NEO4J_USER").unwrap_or_else(|_| "neo4j".to_string());
    let password = std::env::var("CTP_NEO4J_PASSWORD").unwrap_or_default();

    let sink = ctp_graph::Neo4jGraphSink::connect(&uri, &user, &password)
        .await
        .context("connect to graph store")?;
    sink.ensure_constraints().await.context("ensure graph constraints")?;
    Ok(Arc::new(sink))
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("CTP_DAEMON_ADDR").ok()?.parse().ok()
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
    ];

    let origins: Vec<HeaderValue> = allowed_origins.iter().filter_map(|o| HeaderValue::from_str(o).ok()).collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
