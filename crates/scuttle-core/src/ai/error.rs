//! Typed transport errors
//!
//! Everything the streaming client can fail with before or during a turn.

use std::time::Duration;

/// Errors surfaced by the transport client.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Credential rejected, including after the single silent refresh retry.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// HTTP 429. `retry_after` is taken from the `retry-after` header when
    /// present.
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// The provider reported overload (HTTP 529).
    #[error("service overloaded")]
    Overloaded,

    /// Wall-clock timeout elapsed before the response arrived.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Any other transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ApiError {
    /// Map a non-success HTTP status to the taxonomy.
    pub fn from_status(status: u16, body: String, retry_after: Option<Duration>) -> Self {
        match status {
            401 | 403 => ApiError::Authentication(body),
            429 => ApiError::RateLimited { retry_after },
            529 => ApiError::Overloaded,
            _ => ApiError::Transport(format!("HTTP {}: {}", status, body)),
        }
    }
}
