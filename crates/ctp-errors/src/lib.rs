//! Error taxonomy shared across the pipeline core.
//!
//! Every fallible crate in this workspace returns `Result<T, CtpError>` (or
//! wraps one via `anyhow::Context` at the binary/orchestrator layer). The
//! taxonomy exists so the queue layer and the orchestrator can decide
//! retry / dead-letter / fatal-abort without string-matching error messages.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Coarse classification used for retry and propagation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    TransientIo,
    Timeout,
    RateLimit,
    AuthPermanent,
    CircuitOpen,
    QueueFull,
    ShutDown,
    SchemaInvariant,
    UnresolvedReference,
    ExcessiveFailures,
    InternalBug,
    AlreadyReleased,
}

impl ErrorKind {
    /// Whether a queue consumer should count this failure against the job's
    /// `attempts` budget and retry with backoff.
    pub fn retryable(self) -> bool {
        matches!(self, ErrorKind::TransientIo | ErrorKind::Timeout)
    }

    /// Whether this should abort the run rather than be handled locally.
    pub fn fatal(self) -> bool {
        matches!(
            self,
            ErrorKind::AuthPermanent | ErrorKind::SchemaInvariant | ErrorKind::InternalBug
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CtpError {
    #[error("transient i/o error: {0}")]
    TransientIo(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimit { retry_after: Duration },

    #[error("permanent auth failure: {0}")]
    AuthPermanent(String),

    #[error("circuit open for service '{service}', retry in {retry_in_ms}ms")]
    CircuitOpen { service: String, retry_in_ms: i64 },

    #[error("queue '{queue}' is full (limit {limit})")]
    QueueFull { queue: String, limit: usize },

    #[error("component shut down")]
    ShutDown,

    #[error("schema invariant violated: {0}")]
    SchemaInvariant(String),

    #[error("unresolved reference: {0}")]
    UnresolvedReference(String),

    #[error("excessive failure rate: {failed}/{total} jobs failed")]
    ExcessiveFailures { failed: u64, total: u64 },

    #[error("internal bug: {0}")]
    InternalBug(String),

    #[error("permit {permit_id} was already released")]
    AlreadyReleased { permit_id: u64 },

    /// Escape hatch for errors surfaced from a dependency (sqlx, reqwest,
    /// serde_json, ...) that do not map cleanly onto a taxonomy kind at the
    /// call site. Still carries a kind so downstream policy code has
    /// something to match on.
    #[error("{kind:?}: {source}")]
    Wrapped {
        kind: ErrorKind,
        #[source]
        source: anyhow::Error,
    },
}

impl CtpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CtpError::TransientIo(_) => ErrorKind::TransientIo,
            CtpError::Timeout(_) => ErrorKind::Timeout,
            CtpError::RateLimit { .. } => ErrorKind::RateLimit,
            CtpError::AuthPermanent(_) => ErrorKind::AuthPermanent,
            CtpError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            CtpError::QueueFull { .. } => ErrorKind::QueueFull,
            CtpError::ShutDown => ErrorKind::ShutDown,
            CtpError::SchemaInvariant(_) => ErrorKind::SchemaInvariant,
            CtpError::UnresolvedReference(_) => ErrorKind::UnresolvedReference,
            CtpError::ExcessiveFailures { .. } => ErrorKind::ExcessiveFailures,
            CtpError::InternalBug(_) => ErrorKind::InternalBug,
            CtpError::AlreadyReleased { .. } => ErrorKind::AlreadyReleased,
            CtpError::Wrapped { kind, .. } => *kind,
        }
    }

    pub fn retryable(&self) -> bool {
        self.kind().retryable()
    }

    pub fn fatal(&self) -> bool {
        self.kind().fatal()
    }

    pub fn wrap(kind: ErrorKind, source: anyhow::Error) -> Self {
        CtpError::Wrapped { kind, source }
    }
}

pub type Result<T> = std::result::Result<T, CtpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_io_is_retryable_not_fatal() {
        let e = CtpError::TransientIo("connection reset".into());
        assert!(e.retryable());
        assert!(!e.fatal());
    }

    #[test]
    fn auth_permanent_is_fatal_not_retryable() {
        let e = CtpError::AuthPermanent("bad api key".into());
        assert!(!e.retryable());
        assert!(e.fatal());
    }

    #[test]
    fn rate_limit_is_neither_retryable_nor_fatal() {
        let e = CtpError::RateLimit {
            retry_after: Duration::from_millis(200),
        };
        assert!(!e.retryable());
        assert!(!e.fatal());
    }
}
