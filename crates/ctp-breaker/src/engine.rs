use std::future::Future;
use std::time::{Duration, Instant};

use ctp_errors::{CtpError, Result};
use tokio::sync::Mutex;

use crate::types::{BreakerConfig, BreakerMetrics, BreakerState, ErrorClassifier, FailureClass};

/// Mutable breaker state. Kept separate from the config and from the async
/// wrapper so the transition logic below is a plain, synchronous,
/// unit-testable function — same shape as the sticky-state evaluators used
/// elsewhere in this codebase for integrity checks.
struct RuntimeState {
    state: BreakerState,
    failure_count: u32,
    success_count: u64,
    transient_error_count: u64,
    rejected_count: u64,
    probes_in_flight: u32,
    current_reset_timeout: Duration,
    next_retry_at: Option<Instant>,
    /// When the dependency itself last asked us to back off (distinct from
    /// `next_retry_at`, which tracks the breaker's own OPEN→HALF_OPEN timer).
    backoff_until: Option<Instant>,
}

impl RuntimeState {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            success_count: 0,
            transient_error_count: 0,
            rejected_count: 0,
            probes_in_flight: 0,
            current_reset_timeout: Duration::ZERO,
            next_retry_at: None,
            backoff_until: None,
        }
    }
}

/// Sticky-state-first admission check, run before every call attempt.
fn check_before_call(cfg: &BreakerConfig, st: &mut RuntimeState, now: Instant) -> Result<()> {
    match st.state {
        BreakerState::Closed => Ok(()),
        BreakerState::Open => {
            let retry_at = st.next_retry_at.unwrap_or(now);
            if now < retry_at {
                st.rejected_count += 1;
                return Err(CtpError::CircuitOpen {
                    service: String::new(),
                    retry_in_ms: 0,
                });
            }
            st.state = BreakerState::HalfOpen;
            st.probes_in_flight = 0;
            check_before_call(cfg, st, now)
        }
        BreakerState::HalfOpen => {
            if st.probes_in_flight >= cfg.probe_count {
                st.rejected_count += 1;
                return Err(CtpError::CircuitOpen {
                    service: String::new(),
                    retry_in_ms: 0,
                });
            }
            st.probes_in_flight += 1;
            Ok(())
        }
    }
}

/// Applies one call's outcome to the state machine. Pure aside from the
/// `now` parameter, which is threaded in rather than read from the clock so
/// the transition logic itself stays deterministic and testable.
fn record_outcome(cfg: &BreakerConfig, st: &mut RuntimeState, class: FailureClass, now: Instant) {
    match class {
        FailureClass::Success => {
            st.success_count += 1;
            match st.state {
                BreakerState::HalfOpen => {
                    st.state = BreakerState::Closed;
                    st.failure_count = 0;
                    st.current_reset_timeout = Duration::ZERO;
                    st.next_retry_at = None;
                }
                BreakerState::Closed => {
                    st.failure_count = 0;
                }
                BreakerState::Open => {}
            }
        }
        FailureClass::Transient => {
            st.transient_error_count += 1;
        }
        FailureClass::Permanent => {
            // Cannot self-heal by retrying; does not open the breaker, which
            // would imply "try again later".
        }
        FailureClass::RateLimited { retry_after } => {
            // Does not count against the failure threshold.
            st.backoff_until = Some(now + retry_after);
        }
        FailureClass::Failure => {
            match st.state {
                BreakerState::HalfOpen => {
                    trip_open(cfg, st, now);
                }
                BreakerState::Closed => {
                    st.failure_count += 1;
                    if st.failure_count >= cfg.failure_threshold {
                        trip_open(cfg, st, now);
                    }
                }
                BreakerState::Open => {}
            }
        }
    }
}

fn trip_open(cfg: &BreakerConfig, st: &mut RuntimeState, now: Instant) {
    let next_timeout = if st.current_reset_timeout.is_zero() {
        cfg.reset_timeout
    } else {
        (st.current_reset_timeout * 2).min(cfg.max_reset_timeout)
    };
    st.state = BreakerState::Open;
    st.current_reset_timeout = next_timeout;
    st.next_retry_at = Some(now + next_timeout);
    st.probes_in_flight = 0;
}

/// One breaker per external dependency (LLM, graph store, cache, ...).
pub struct CircuitBreaker {
    name: String,
    cfg: BreakerConfig,
    classifier: Box<dyn ErrorClassifier>,
    state: Mutex<RuntimeState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, cfg: BreakerConfig, classifier: Box<dyn ErrorClassifier>) -> Self {
        Self {
            name: name.into(),
            cfg,
            classifier,
            state: Mutex::new(RuntimeState::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `call`, retrying up to `max_retries` times when the failure
    /// class is retryable. Returns immediately (no retry) on `CIRCUIT_OPEN`,
    /// rate limiting, or a permanent failure.
    pub async fn execute<T, F, Fut>(&self, max_retries: u32, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            {
                let mut st = self.state.lock().await;
                check_before_call(&self.cfg, &mut st, Instant::now()).map_err(|_| {
                    CtpError::CircuitOpen {
                        service: self.name.clone(),
                        retry_in_ms: st
                            .next_retry_at
                            .map(|t| t.saturating_duration_since(Instant::now()).as_millis() as i64)
                            .unwrap_or(0),
                    }
                })?;
            }

            let outcome = call().await;

            let class = match &outcome {
                Ok(_) => FailureClass::Success,
                Err(e) => self.classifier.classify(e),
            };

            {
                let mut st = self.state.lock().await;
                if st.state == BreakerState::HalfOpen {
                    st.probes_in_flight = st.probes_in_flight.saturating_sub(1);
                }
                record_outcome(&self.cfg, &mut st, class, Instant::now());
            }

            match (outcome, class) {
                (Ok(v), _) => return Ok(v),
                (Err(e), FailureClass::RateLimited { .. }) => return Err(e),
                (Err(e), FailureClass::Permanent) => return Err(e),
                (Err(e), FailureClass::Transient) | (Err(e), FailureClass::Failure) => {
                    if attempt >= max_retries {
                        return Err(e);
                    }
                    attempt += 1;
                }
                (Err(e), FailureClass::Success) => unreachable!("{e}"),
            }
        }
    }

    /// Like `execute`, but calls `fallback` instead of propagating the
    /// error when the circuit is open or the call itself runs out of
    /// retries. `fallback` does not count toward the breaker's own
    /// statistics — it's the caller's cache/default path, not a dependency.
    pub async fn execute_with_fallback<T, F, Fut, Fb, FbFut>(
        &self,
        max_retries: u32,
        call: F,
        fallback: Fb,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        Fb: FnOnce() -> FbFut,
        FbFut: Future<Output = Result<T>>,
    {
        match self.execute(max_retries, call).await {
            Ok(v) => Ok(v),
            Err(_) => fallback().await,
        }
    }

    /// Like `execute`, but on a primary-call failure runs `degraded` instead
    /// of propagating — for dependencies where a cheaper, lower-fidelity
    /// path exists (e.g. a smaller LLM, a cached heuristic) rather than a
    /// static fallback value.
    pub async fn execute_with_degraded<T, F, Fut, D, DFut>(
        &self,
        max_retries: u32,
        call: F,
        degraded: D,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        D: FnOnce() -> DFut,
        DFut: Future<Output = Result<T>>,
    {
        match self.execute(max_retries, call).await {
            Ok(v) => Ok(v),
            Err(e) if e.kind() == ctp_errors::ErrorKind::CircuitOpen => degraded().await,
            Err(e) => Err(e),
        }
    }

    pub async fn state(&self) -> BreakerState {
        self.state.lock().await.state
    }

    pub async fn failure_count(&self) -> u32 {
        self.state.lock().await.failure_count
    }

    pub async fn next_retry_time(&self) -> Option<Instant> {
        self.state.lock().await.next_retry_at
    }

    /// When the dependency last asked us to back off via a rate-limit
    /// response, independent of whether the breaker itself ever opened.
    pub async fn backoff_until(&self) -> Option<Instant> {
        self.state.lock().await.backoff_until
    }

    pub async fn metrics(&self) -> BreakerMetrics {
        let st = self.state.lock().await;
        BreakerMetrics {
            state: Some(st.state),
            failure_count: st.failure_count,
            transient_error_count: st.transient_error_count,
            success_count: st.success_count,
            rejected_count: st.rejected_count,
            next_retry_at: st.next_retry_at,
            backoff_until: st.backoff_until,
        }
    }
}
