//! Typed error taxonomy shared by every control-plane component.
//!
//! Components return [`OrchestratorError`] rather than bubbling raw `sqlx::Error`
//! so that callers (dispatcher loop, HTTP handlers, recovery monitor) can make
//! retry/log/surface decisions without re-deriving what kind of failure occurred.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("precondition failed: job {job_id} expected status {expected}, row did not match")]
    PreconditionFailed { job_id: Uuid, expected: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient store error: {0}")]
    Transient(String),

    #[error("operation timed out")]
    Timeout,

    #[error("permanent error: {0}")]
    Permanent(String),

    #[error("capacity exceeded for robot {robot_id}")]
    CapacityExceeded { robot_id: Uuid },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl OrchestratorError {
    /// Classify a raw `sqlx::Error` into the taxonomy above.
    ///
    /// Row-not-found becomes [`OrchestratorError::NotFound`]; everything else that
    /// sqlx itself flags as a connectivity/pool problem becomes [`OrchestratorError::Transient`]
    /// so callers know it is safe to retry. Anything left over is wrapped verbatim.
    pub fn classify(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => OrchestratorError::NotFound("row not found".into()),
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                OrchestratorError::Transient(err.to_string())
            }
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                OrchestratorError::Conflict(db_err.message().to_string())
            }
            other => OrchestratorError::Database(other),
        }
    }

    /// True for errors a caller may retry without changing anything about the request.
    pub fn is_retriable(&self) -> bool {
        matches!(self, OrchestratorError::Transient(_) | OrchestratorError::Timeout)
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_a_transient_error_until_it_succeeds() {
        let attempts = AtomicU32::new(0);
        let result = with_retry(|| async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(OrchestratorError::Transient("connection reset".into()))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = with_retry(|| async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(OrchestratorError::Timeout)
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_a_permanent_error() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = with_retry(|| async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(OrchestratorError::Permanent("bad workflow definition".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}

/// Retries a store operation up to 3 attempts total with a short linear
/// backoff, per §7's "store-level transient errors are retried inside the
/// component." Only `is_retriable()` errors are retried; everything else
/// (precondition, not found, permanent, ...) returns on the first failure.
pub async fn with_retry<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    const MAX_ATTEMPTS: u32 = 3;
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retriable() && attempt + 1 < MAX_ATTEMPTS => {
                attempt += 1;
                tokio::time::sleep(std::time::Duration::from_millis(50 * attempt as u64)).await;
            }
            Err(err) => return Err(err),
        }
    }
}
