//! Error types for the hosting provider client

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by hosting provider calls.
///
/// The retryable/non-retryable split drives the scheduler's backoff:
/// retryable errors are retried up to the attempt ceiling, non-retryable
/// errors terminate the job immediately.
#[derive(Error, Debug)]
pub enum HostingError {
    /// The provider throttled us; retry, honoring the suggested delay when
    /// one was sent.
    #[error("provider rate limit hit")]
    RateLimited { retry_after: Option<Duration> },

    /// Provider-side failure (5xx).
    #[error("provider unavailable (status {status})")]
    Unavailable { status: u16 },

    /// The request timed out in flight.
    #[error("provider request timed out")]
    Timeout,

    /// The credential lacks permission for the target repository.
    #[error("permission denied by provider")]
    PermissionDenied,

    /// Target repository does not exist (or is invisible to the credential).
    #[error("repository not found at provider")]
    RepoNotFound,

    /// Unexpected payload or protocol violation.
    #[error("provider protocol error: {0}")]
    Protocol(String),

    /// Transport-level failure below HTTP semantics.
    #[error("transport error: {0}")]
    Transport(String),
}

impl HostingError {
    /// Whether the scheduler may retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HostingError::RateLimited { .. }
                | HostingError::Unavailable { .. }
                | HostingError::Timeout
                | HostingError::Transport(_)
        )
    }

    /// Provider-suggested delay before the next attempt, when present.
    pub fn suggested_delay(&self) -> Option<Duration> {
        match self {
            HostingError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for HostingError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            HostingError::Timeout
        } else {
            HostingError::Transport(err.to_string())
        }
    }
}
