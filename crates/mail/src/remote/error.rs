//! Remote API error taxonomy

use std::time::Duration;

/// Failure of a single call against the remote mailbox API
///
/// The variant decides the retry policy: see [`ApiError::is_transient`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// HTTP 429 or a Gmail quota error
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// HTTP 5xx
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    /// The call exceeded its own timeout
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Connection refused/reset, DNS failure and other transport errors
    #[error("network error: {0}")]
    Network(String),

    /// HTTP 401/403 or a token that could not be obtained
    #[error("authentication failed: {0}")]
    Auth(String),

    /// HTTP 404
    #[error("not found: {0}")]
    NotFound(String),

    /// HTTP 400 and other 4xx the server will never accept
    #[error("bad request ({status}): {message}")]
    BadRequest { status: u16, message: String },

    /// The server answered but the body could not be decoded
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ApiError::RateLimited { .. }
                | ApiError::Server { .. }
                | ApiError::Timeout(_)
                | ApiError::Network(_)
        )
    }

    /// Server-provided minimum wait before the next attempt
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        ApiError::RateLimited {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Classify an HTTP error status and its response body
    ///
    /// Gmail reports per-user quota exhaustion as 403 with a
    /// `rateLimitExceeded` reason, which is retried like a 429.
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        let message = summarize_body(body);
        match status {
            429 => ApiError::RateLimited {
                message,
                retry_after,
            },
            403 if body.contains("rateLimitExceeded") || body.contains("userRateLimitExceeded") => {
                ApiError::RateLimited {
                    message,
                    retry_after,
                }
            }
            401 | 403 => ApiError::Auth(message),
            404 => ApiError::NotFound(message),
            408 => ApiError::Timeout(message),
            500..=599 => ApiError::Server { status, message },
            _ => ApiError::BadRequest { status, message },
        }
    }
}

/// Trim an error body down to something that fits in a log line
fn summarize_body(body: &str) -> String {
    const MAX: usize = 200;
    let trimmed = body.trim();
    if trimmed.chars().count() <= MAX {
        trimmed.to_string()
    } else {
        let mut s: String = trimmed.chars().take(MAX).collect();
        s.push('…');
        s
    }
}
