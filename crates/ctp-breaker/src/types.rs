use std::time::{Duration, Instant};

use ctp_errors::{CtpError, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub max_reset_timeout: Duration,
    pub probe_count: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            max_reset_timeout: Duration::from_secs(5 * 60),
            probe_count: 1,
        }
    }
}

/// How a single call outcome should count against the breaker, per the
/// per-service error classification rules (rate limits and transient
/// infrastructure errors must not trip the circuit themselves).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Success,
    /// Counts toward `failure_threshold`.
    Failure,
    /// Logged, does not move the breaker toward OPEN.
    Transient,
    /// Cannot self-heal by retrying; the caller should stop depending on
    /// retries (breaker does not open, since opening implies "retry later").
    Permanent,
    /// Caller should back off until `retry_after` elapses; not a failure.
    RateLimited { retry_after: Duration },
}

pub trait ErrorClassifier: Send + Sync {
    /// Takes the full error, not just its `kind()`, so a classifier can pull
    /// payload data (e.g. `CtpError::RateLimit`'s `retry_after`) out of the
    /// real failure instead of guessing a fixed backoff.
    fn classify(&self, error: &CtpError) -> FailureClass;
}

/// Classification used for the LLM dependency: rate limiting and auth
/// failures are excluded from the failure count (see module docs on why).
pub struct LlmClassifier;
impl ErrorClassifier for LlmClassifier {
    fn classify(&self, error: &CtpError) -> FailureClass {
        match error {
            CtpError::RateLimit { retry_after } => FailureClass::RateLimited {
                retry_after: *retry_after,
            },
            CtpError::AuthPermanent(_) => FailureClass::Permanent,
            _ => FailureClass::Failure,
        }
    }
}

/// Classification used for the graph-store dependency: connection-pool
/// exhaustion and transaction deadlocks are transient, not failures.
pub struct GraphStoreClassifier;
impl ErrorClassifier for GraphStoreClassifier {
    fn classify(&self, error: &CtpError) -> FailureClass {
        match error.kind() {
            ErrorKind::TransientIo => FailureClass::Transient,
            ErrorKind::Timeout => FailureClass::Failure,
            _ => FailureClass::Failure,
        }
    }
}

/// Classification used for the cache dependency.
pub struct CacheClassifier;
impl ErrorClassifier for CacheClassifier {
    fn classify(&self, error: &CtpError) -> FailureClass {
        match error.kind() {
            ErrorKind::TransientIo | ErrorKind::Timeout => FailureClass::Failure,
            _ => FailureClass::Failure,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BreakerMetrics {
    pub state: Option<BreakerState>,
    pub failure_count: u32,
    pub transient_error_count: u64,
    pub success_count: u64,
    pub rejected_count: u64,
    pub next_retry_at: Option<Instant>,
    pub backoff_until: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub overall: &'static str,
    pub services: Vec<ServiceHealth>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ServiceHealth {
    pub service: String,
    pub state: BreakerState,
    pub failure_count: u32,
}
