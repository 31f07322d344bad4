use std::sync::Arc;
use std::time::Duration;

use ctp_breaker::{default_breaker_set, BreakerConfig, CircuitBreakerSet};
use ctp_concurrency::GlobalConcurrencyManager;
use ctp_config::PipelineConfig;
use ctp_errors::Result;
use ctp_graph::GraphBuilder;
use ctp_outbox::{OutboxPublisher, PublisherConfig, QueueManagerSink};
use ctp_queue::QueueManager;
use ctp_worker::{CompletionMonitor, MonitorConfig, PoolCascadeSink, WorkerLimits, WorkerPoolManager};
use sqlx::PgPool;
use tokio::sync::watch;
use uuid::Uuid;

use crate::types::{LifecycleState, RunReport, ShutdownTimeouts};

/// Wires every component in the core per §4.9: global concurrency, breaker
/// set (with cascade wired to the pool manager), queues, outbox publisher,
/// completion monitor, graph builder. Components never hold references to
/// each other — everything is composed here and shared only through `Arc`
/// capability objects, so the cyclic orchestrator/worker/manager
/// relationship in the design stays message-passing, not back-references.
pub struct PipelineOrchestrator {
    pool: PgPool,
    config: PipelineConfig,
    global: Arc<GlobalConcurrencyManager>,
    breakers: Arc<CircuitBreakerSet>,
    queues: Arc<QueueManager>,
    pool_manager: Arc<WorkerPoolManager>,
    publisher: Arc<OutboxPublisher>,
    graph_builder: GraphBuilder,
    shutdown_timeouts: ShutdownTimeouts,
}

impl PipelineOrchestrator {
    /// `graph_sink` is the only externally supplied collaborator: it owns a
    /// live connection (Neo4j) that has to be established outside this
    /// constructor. The outbox's downstream sink is not accepted as a
    /// parameter — it always wraps this orchestrator's own `QueueManager`,
    /// so job counts the completion monitor polls can never drift from the
    /// queue the publisher actually enqueues onto.
    pub async fn new(
        pool: PgPool,
        config: PipelineConfig,
        graph_sink: Arc<dyn ctp_graph::GraphSink>,
    ) -> Self {
        let global = Arc::new(GlobalConcurrencyManager::new(config.max_concurrency as usize));

        let breaker_cfg = |name: &str| -> BreakerConfig {
            config
                .breakers
                .get(name)
                .map(|b| BreakerConfig {
                    failure_threshold: b.failure_threshold,
                    reset_timeout: Duration::from_millis(b.reset_timeout_ms),
                    max_reset_timeout: Duration::from_millis(b.reset_timeout_ms * 8),
                    probe_count: b.probe_count,
                })
                .unwrap_or_default()
        };

        let pool_manager = Arc::new(WorkerPoolManager::new(Arc::clone(&global)));
        for (kind, limit) in &config.worker_limits {
            let priority = config.worker_priorities.get(kind).copied().unwrap_or(0);
            pool_manager
                .register_worker(
                    kind,
                    WorkerLimits {
                        max_concurrency: *limit as usize,
                        priority,
                    },
                )
                .await;
        }

        let cascade_sink = Arc::new(PoolCascadeSink::new(Arc::clone(&pool_manager)));
        let breakers = Arc::new(
            default_breaker_set(breaker_cfg("llm"), breaker_cfg("graph-store"), breaker_cfg("cache"))
                .with_cascade_sink(cascade_sink),
        );
        for kind in config.worker_limits.keys() {
            breakers.register_dependency("llm", kind).await;
            if kind == "graph-ingestion" {
                breakers.register_dependency("graph-store", kind).await;
            }
        }

        let queues = Arc::new(QueueManager::new(pool.clone()));
        let downstream = Arc::new(QueueManagerSink::new(Arc::clone(&queues)));

        let publisher = Arc::new(OutboxPublisher::new(
            pool.clone(),
            downstream,
            PublisherConfig {
                poll_interval: Duration::from_millis(config.polling_interval_ms),
                batch_limit: config.batch_size as i64,
                dispatcher_id: "ctp-orchestrator".to_string(),
            },
        ));

        let graph_builder = GraphBuilder::new(pool.clone(), graph_sink, Arc::clone(&breakers));

        Self {
            pool,
            config,
            global,
            breakers,
            queues,
            pool_manager,
            publisher,
            graph_builder,
            shutdown_timeouts: ShutdownTimeouts::default(),
        }
    }

    pub fn global_concurrency(&self) -> Arc<GlobalConcurrencyManager> {
        Arc::clone(&self.global)
    }

    /// The relational pool backing this orchestrator, for callers (like the
    /// daemon's retention sweep) that need to run their own queries against
    /// the same store without poking a hole in the orchestrator's API for
    /// every such query.
    pub fn relational_pool(&self) -> PgPool {
        self.pool.clone()
    }

    pub fn breakers(&self) -> Arc<CircuitBreakerSet> {
        Arc::clone(&self.breakers)
    }

    pub fn queues(&self) -> Arc<QueueManager> {
        Arc::clone(&self.queues)
    }

    pub fn pool_manager(&self) -> Arc<WorkerPoolManager> {
        Arc::clone(&self.pool_manager)
    }

    /// Runs one full `INIT → RUN → DRAIN → GRAPH_BUILD → SHUTDOWN` cycle for
    /// `run_id`. A failure in any stage is captured and the per-run drain
    /// still runs before the error (if any) is returned. This orchestrator
    /// is reused across many `run()` calls against the same daemon process
    /// (one per `/v1/run/start`), so this stage must only settle this run's
    /// own in-flight work — never tear down process-wide capability objects
    /// (the global concurrency manager, the relational pool). That teardown
    /// is `shutdown()`, called exactly once when the process itself exits.
    pub async fn run(&self, run_id: Uuid, config_hash: &str) -> Result<RunReport> {
        let started_at = chrono::Utc::now();
        let mut state = LifecycleState::Init;
        tracing::info!(run_id = %run_id, ?state, "pipeline run starting");

        let outcome = self.run_inner(run_id, config_hash, &mut state).await;

        tracing::info!(run_id = %run_id, "draining run-scoped work");
        state = LifecycleState::Shutdown;
        self.drain_run().await;
        tracing::info!(run_id = %run_id, ?state, "run drain complete");

        let (completion_outcome, graph_report) = outcome?;

        let pois_discovered = ctp_db::pois::count_for_run(&self.pool, run_id).await.unwrap_or(0);
        let relationships_pending = ctp_db::relationships::count_pending_for_run(&self.pool, run_id)
            .await
            .unwrap_or(0);
        let job_counts = self.queues.get_job_counts().await;

        match completion_outcome {
            ctp_worker::MonitorOutcome::Idle => {
                let _ = ctp_db::runs::complete_run(&self.pool, run_id).await;
            }
            ctp_worker::MonitorOutcome::Timeout => {
                let _ = ctp_db::runs::fail_run(&self.pool, run_id, "completion monitor timed out").await;
            }
            ctp_worker::MonitorOutcome::ExcessiveFailures => {
                // Per the propagation policy this is not fatal to the run;
                // the graph still builds on partial data. The run is still
                // marked completed, not failed.
                let _ = ctp_db::runs::complete_run(&self.pool, run_id).await;
            }
        }

        Ok(RunReport {
            run_id,
            started_at,
            finished_at: chrono::Utc::now(),
            completion_outcome,
            pois_discovered,
            relationships_pending,
            graph_nodes_projected: graph_report.nodes_projected,
            graph_edges_projected: graph_report.edges_projected,
            job_counts,
        })
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        config_hash: &str,
        state: &mut LifecycleState,
    ) -> Result<(ctp_worker::MonitorOutcome, ctp_graph::GraphBuildReport)> {
        ctp_db::migrate(&self.pool).await?;
        ctp_db::runs::insert_run(&self.pool, run_id, config_hash).await?;

        *state = LifecycleState::Run;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let publisher = Arc::clone(&self.publisher);
        let publisher_task = tokio::spawn(async move { publisher.run(shutdown_rx).await });

        let monitor = CompletionMonitor::new(
            Arc::clone(&self.queues),
            MonitorConfig {
                check_interval: Duration::from_millis(self.config.monitoring.check_interval_ms),
                max_wait_time: Duration::from_secs(self.config.monitoring.max_wait_time_secs),
                max_failure_rate: self.config.monitoring.max_failure_rate,
                required_idle_checks: self.config.monitoring.required_idle_checks,
            },
        );
        let completion_outcome = monitor.wait_for_completion(|| 0).await;
        tracing::info!(run_id = %run_id, ?completion_outcome, "completion monitor resolved");

        *state = LifecycleState::Drain;
        let _ = shutdown_tx.send(true);
        let _ = tokio::time::timeout(self.shutdown_timeouts.publisher, publisher_task).await;

        *state = LifecycleState::GraphBuild;
        let graph_report = self.graph_builder.build_for_run(run_id).await?;

        Ok((completion_outcome, graph_report))
    }

    /// Per-run drain, called at the end of every `run()`: waits for this
    /// run's workers to reach zero in-flight. Touches nothing shared with
    /// other runs — the durable queue keeps its jobs, the global concurrency
    /// manager stays open for the next run to acquire against.
    async fn drain_run(&self) {
        if tokio::time::timeout(self.shutdown_timeouts.workers, self.pool_manager.drain())
            .await
            .is_err()
        {
            tracing::warn!("worker pool did not drain within its shutdown timeout");
        }
    }

    /// Process-terminal teardown: the daemon binary calls this exactly once,
    /// on `ctrl_c`, after the last run has finished. Shuts down in the order
    /// the design mandates: pool manager (already drained per-run) → global
    /// concurrency manager → graph driver → relational store. Each stage
    /// gets its own timeout so a stuck component can't block the ones behind
    /// it indefinitely. Never call this between runs — `global.shutdown()`
    /// has no reset path, so every `acquire()` after it returns
    /// `CtpError::ShutDown` for the rest of the process's life.
    pub async fn shutdown(&self) {
        if tokio::time::timeout(self.shutdown_timeouts.pool_manager, self.global.shutdown())
            .await
            .is_err()
        {
            tracing::warn!("global concurrency manager did not shut down within its timeout");
        }

        // Graph driver has no standalone handle here; `GraphBuilder` opens
        // and releases connections per call, so there is nothing to close.
        let _ = self.shutdown_timeouts.graph_driver;
        let _ = self.shutdown_timeouts.queues;

        if tokio::time::timeout(self.shutdown_timeouts.relational_store, self.pool.close())
            .await
            .is_err()
        {
            tracing::warn!("relational store did not close within its shutdown timeout");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ctp_config::Environment;
    use ctp_graph::{GraphEdge, GraphNode, GraphSink};
    use ctp_outbox::QueuedJob;

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

    #[test]
    fn queued_job_type_is_reachable_from_this_crate() {
        // Compile-time check that ctp-outbox's public surface is usable
        // from the orchestrator without a concrete QueueManager wiring.
        let _ = std::marker::PhantomData::<QueuedJob>;
    }

    #[tokio::test]
    async fn constructs_without_a_database_connection() {
        // Building the orchestrator itself (registering worker kinds,
        // wiring the breaker set) must not touch the database; only
        // `run()` does.
        let config = ctp_config::PipelineConfig::defaults_for(Environment::Test);
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy("postgres://localhost/does-not-need-to-exist")
            .unwrap();

        let orchestrator = PipelineOrchestrator::new(pool, config, Arc::new(NoopGraphSink)).await;

        assert!(!orchestrator.pool_manager().is_in_protective_mode().await);
    }
}
