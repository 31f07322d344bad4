//! Per-dependency circuit breakers with error classification and
//! cascade-prevention coordination.
//!
//! Each external dependency (LLM, graph store, cache) gets its own
//! [`CircuitBreaker`]; [`CircuitBreakerSet`] owns all of them plus the
//! dependency graph used to warn worker pools before a dead breaker backs
//! the whole queue up.

mod engine;
mod set;
mod types;

pub use engine::CircuitBreaker;
pub use set::{default_breaker_set, CascadeSink, CircuitBreakerSet};
pub use types::{
    BreakerConfig, BreakerMetrics, BreakerState, CacheClassifier, ErrorClassifier, FailureClass,
    GraphStoreClassifier, HealthStatus, LlmClassifier, ServiceHealth,
};

#[cfg(test)]
mod tests {
    use super::*;
    use ctp_errors::CtpError;
    use std::time::Duration;

    fn llm_breaker(failure_threshold: u32, reset_timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "llm",
            BreakerConfig {
                failure_threshold,
                reset_timeout,
                max_reset_timeout: reset_timeout * 8,
                probe_count: 1,
            },
            Box::new(LlmClassifier),
        )
    }

    #[tokio::test]
    async fn trips_open_after_consecutive_failures_then_recovers() {
        let breaker = llm_breaker(5, Duration::from_millis(50));

        for _ in 0..5 {
            let result: ctp_errors::Result<()> = breaker
                .execute(0, || async { Err(CtpError::TransientIo("boom".into())) })
                .await;
            assert!(result.is_err());
        }

        assert_eq!(breaker.state().await, BreakerState::Open);

        let sixth: ctp_errors::Result<()> = breaker.execute(0, || async { Ok(()) }).await;
        assert!(matches!(sixth, Err(CtpError::CircuitOpen { .. })));

        tokio::time::sleep(Duration::from_millis(60)).await;

        let probe: ctp_errors::Result<()> = breaker.execute(0, || async { Ok(()) }).await;
        assert!(probe.is_ok());
        assert_eq!(breaker.state().await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn rate_limit_does_not_open_the_circuit() {
        let breaker = llm_breaker(5, Duration::from_millis(50));

        for _ in 0..10 {
            let result: ctp_errors::Result<()> = breaker
                .execute(0, || async {
                    Err(CtpError::RateLimit {
                        retry_after: Duration::from_millis(200),
                    })
                })
                .await;
            assert!(result.is_err());
        }

        assert_eq!(breaker.state().await, BreakerState::Closed);
        assert_eq!(breaker.failure_count().await, 0);
    }

    #[tokio::test]
    async fn execute_retries_transient_failures_up_to_budget() {
        let breaker = llm_breaker(5, Duration::from_millis(50));
        let attempts = std::sync::atomic::AtomicU32::new(0);

        let result: ctp_errors::Result<&'static str> = breaker
            .execute(2, || {
                let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(CtpError::TransientIo("flaky".into()))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fallback_runs_once_the_circuit_is_open() {
        let breaker = llm_breaker(1, Duration::from_secs(3600));

        let _: ctp_errors::Result<()> = breaker
            .execute(0, || async { Err(CtpError::TransientIo("boom".into())) })
            .await;
        assert_eq!(breaker.state().await, BreakerState::Open);

        let result = breaker
            .execute_with_fallback(
                0,
                || async { Err(CtpError::TransientIo("still down".into())) },
                || async { Ok::<_, CtpError>("cached-value") },
            )
            .await;

        assert_eq!(result.unwrap(), "cached-value");
    }

    #[tokio::test]
    async fn degraded_path_is_not_used_for_permanent_failures() {
        let breaker = llm_breaker(5, Duration::from_millis(50));

        let result = breaker
            .execute_with_degraded(
                0,
                || async { Err(CtpError::AuthPermanent("bad key".into())) },
                || async { Ok::<_, CtpError>("degraded-result") },
            )
            .await;

        assert!(
            matches!(result, Err(CtpError::AuthPermanent(_))),
            "degraded path is only for CIRCUIT_OPEN, not permanent auth failures"
        );
    }
}
