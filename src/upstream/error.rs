//! Upstream error types with retry classification.
//!
//! Distinguishes between transient errors (the engine may retry) and permanent
//! errors (the task goes straight to `error`).

use std::time::Duration;

/// Error from a single upstream call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamError {
    /// The kind of error
    pub kind: UpstreamErrorKind,
    /// HTTP status code, if applicable
    pub status_code: Option<u16>,
    /// Error message
    pub message: String,
}

impl UpstreamError {
    pub fn timeout(elapsed: Duration) -> Self {
        Self {
            kind: UpstreamErrorKind::Timeout,
            status_code: None,
            message: format!("no response within {} ms", elapsed.as_millis()),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: UpstreamErrorKind::Network,
            status_code: None,
            message: message.into(),
        }
    }

    /// Classify a non-success HTTP status.
    pub fn http(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            kind: classify_http_status(status_code),
            status_code: Some(status_code),
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self {
            kind: UpstreamErrorKind::Malformed,
            status_code: None,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    /// Exponential backoff for retry `attempt` (0-based), capped at `max`.
    pub fn suggested_delay(&self, attempt: u32, base: Duration, max: Duration) -> Duration {
        let base = match self.kind {
            // Start higher for rate limits
            UpstreamErrorKind::RateLimited => base.saturating_mul(4),
            _ => base,
        };
        let multiplier = 2u32.saturating_pow(attempt);
        base.saturating_mul(multiplier).min(max)
    }
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (HTTP {}): {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for UpstreamError {}

/// Classification of upstream errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    /// No answer within the configured bound - transient
    Timeout,
    /// Connection failed - transient
    Network,
    /// Rate limited (429) - transient, longer backoff
    RateLimited,
    /// 5xx - transient
    ServerError,
    /// Other 4xx - permanent
    ClientError,
    /// Response did not match the expected shape - permanent
    Malformed,
}

impl UpstreamErrorKind {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            UpstreamErrorKind::Timeout
                | UpstreamErrorKind::Network
                | UpstreamErrorKind::RateLimited
                | UpstreamErrorKind::ServerError
        )
    }
}

impl std::fmt::Display for UpstreamErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamErrorKind::Timeout => write!(f, "Upstream timeout"),
            UpstreamErrorKind::Network => write!(f, "Network error"),
            UpstreamErrorKind::RateLimited => write!(f, "Rate limited"),
            UpstreamErrorKind::ServerError => write!(f, "Upstream server error"),
            UpstreamErrorKind::ClientError => write!(f, "Upstream rejected request"),
            UpstreamErrorKind::Malformed => write!(f, "Malformed upstream response"),
        }
    }
}

/// Parse HTTP status code into error kind.
pub fn classify_http_status(status: u16) -> UpstreamErrorKind {
    match status {
        429 => UpstreamErrorKind::RateLimited,
        400..=499 => UpstreamErrorKind::ClientError,
        _ => UpstreamErrorKind::ServerError,
    }
}
