// =============================================================================
// Behavior-scoped error kinds
// =============================================================================
//
// Each subsystem exposes one error enum whose variants map directly onto a
// handling policy: retry, skip-the-item, fail-the-job, or fatal-at-startup.
// Job code matches on the variant, never on message text.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the broker REST client.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// 401/403 — the token is wrong or expired. Never retried within a run.
    #[error("broker rejected credentials (status {status})")]
    Auth { status: u16 },

    /// 429 — retried with backoff, honouring the server's hint when present.
    #[error("broker rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// 5xx, timeout, or connection failure — retried with backoff.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// Any other 4xx — a malformed request on our side; not retried.
    #[error("broker rejected request: {0}")]
    BadRequest(String),

    /// The response body did not match the documented contract.
    #[error("broker response malformed: {0}")]
    Parse(String),
}

impl BrokerError {
    /// Whether the per-call backoff loop should try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Unavailable(_))
    }
}

/// Errors surfaced by the durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connectivity or statement failure. The enclosing job fails and the
    /// next scheduled tick re-runs it; idempotent keying makes that safe.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A row violated an entry-boundary invariant (e.g. unordered pair).
    /// Signals a bug in the caller, not a transient condition.
    #[error("store invariant violated: {0}")]
    Invariant(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Unavailable(e.to_string())
    }
}

/// Errors surfaced by the cache and its event bus.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The bus channel set has shut down. Non-fatal for jobs (cache writes
    /// are best-effort); fatal for the fan-out relay, which cannot run
    /// without a bus.
    #[error("cache bus closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(BrokerError::Unavailable("boom".into()).is_retryable());
        assert!(BrokerError::RateLimited { retry_after: None }.is_retryable());
        assert!(!BrokerError::Auth { status: 401 }.is_retryable());
        assert!(!BrokerError::BadRequest("count too large".into()).is_retryable());
        assert!(!BrokerError::Parse("bad json".into()).is_retryable());
    }

    #[test]
    fn sqlx_errors_map_to_unavailable() {
        let e: StoreError = sqlx::Error::PoolClosed.into();
        assert!(matches!(e, StoreError::Unavailable(_)));
    }
}
