//! Tagged error taxonomy for calls to external integrations

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{ErrorClassification, ErrorSeverity};

/// Discriminant describing why an upstream call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection reset/refused, DNS failure, unreachable network
    Transient,
    /// The call exceeded its deadline
    Timeout,
    /// HTTP 429
    RateLimited,
    /// HTTP 5xx or 408
    ServerFault,
    /// HTTP 4xx other than 408 and 429
    ClientFault,
    /// Anything that could not be classified
    Internal,
}

const TIMEOUT_PATTERNS: &[&str] = &["timeout", "timed out", "deadline exceeded"];

const TRANSIENT_PATTERNS: &[&str] = &[
    "connection refused",
    "connection reset",
    "broken pipe",
    "no route to host",
    "network is unreachable",
    "temporary failure",
    "dns",
    "name resolution",
];

const RATE_LIMIT_PATTERNS: &[&str] = &["rate limit", "too many requests"];

impl ErrorKind {
    /// Classify an HTTP status code
    ///
    /// Success and informational codes have no failure kind and map to
    /// `Internal`; callers only classify statuses they already treat as
    /// failures.
    pub const fn from_status(status: u16) -> Self {
        match status {
            429 => Self::RateLimited,
            408 => Self::ServerFault,
            400..=499 => Self::ClientFault,
            500..=599 => Self::ServerFault,
            _ => Self::Internal,
        }
    }

    /// Classify a transport error by its message text
    ///
    /// Used at the boundary where a client library only hands back a string.
    pub fn from_message(message: &str) -> Self {
        let lowered = message.to_ascii_lowercase();
        let matches_any = |patterns: &[&str]| patterns.iter().any(|p| lowered.contains(p));

        if matches_any(TIMEOUT_PATTERNS) {
            Self::Timeout
        } else if matches_any(TRANSIENT_PATTERNS) {
            Self::Transient
        } else if matches_any(RATE_LIMIT_PATTERNS) {
            Self::RateLimited
        } else {
            Self::Internal
        }
    }

    /// Whether a failure of this kind may succeed on a later attempt
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::Timeout | Self::RateLimited | Self::ServerFault)
    }

    /// Whether a failure of this kind signals an unhealthy upstream
    ///
    /// Rate limiting and client faults say nothing about upstream health and
    /// must not open a breaker.
    pub const fn trips_breaker(self) -> bool {
        matches!(self, Self::Transient | Self::Timeout | Self::ServerFault)
    }

    /// Stable snake_case label
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::ServerFault => "server_fault",
            Self::ClientFault => "client_fault",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by integration clients for a failed upstream call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error from upstream{}: {message}", status_suffix(.status))]
pub struct UpstreamError {
    /// Failure discriminant
    pub kind: ErrorKind,
    /// Human-readable detail
    pub message: String,
    /// HTTP status, when the failure came from a response
    pub status: Option<u16>,
    /// Server-suggested delay (`Retry-After`), already parsed by the caller
    pub retry_after: Option<Duration>,
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

impl UpstreamError {
    /// Build an error of an explicit kind
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), status: None, retry_after: None }
    }

    /// Build an error from an HTTP status code
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::from_status(status),
            message: message.into(),
            status: Some(status),
            retry_after: None,
        }
    }

    /// Build an error from a transport failure message
    pub fn from_transport(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(ErrorKind::from_message(&message), message)
    }

    /// Transient network failure
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    /// Deadline exceeded
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// HTTP 429 with an optional server-suggested delay
    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self {
            kind: ErrorKind::RateLimited,
            message: "too many requests".to_string(),
            status: Some(429),
            retry_after,
        }
    }

    /// Attach a server-suggested delay
    #[must_use]
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }
}

impl ErrorClassification for UpstreamError {
    fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    fn severity(&self) -> ErrorSeverity {
        match self.kind {
            ErrorKind::RateLimited | ErrorKind::Timeout | ErrorKind::Transient => {
                ErrorSeverity::Warning
            }
            ErrorKind::ServerFault | ErrorKind::ClientFault => ErrorSeverity::Error,
            ErrorKind::Internal => ErrorSeverity::Critical,
        }
    }

    fn is_critical(&self) -> bool {
        self.kind == ErrorKind::Internal
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

/// Default retry predicate for integration clients
///
/// Network and timeout failures plus HTTP 429/5xx/408 are retried; every other
/// 4xx surfaces immediately.
pub fn is_retryable_default(err: &UpstreamError) -> bool {
    err.kind.is_retryable()
}
