//! Upstream completion error classification.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// A single failed completion attempt.
///
/// Produced by [`CompletionService`](super::CompletionService)
/// implementations. Retry decisions are made on the variant, never on the
/// message text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompletionError {
    /// The request did not complete within the transport timeout.
    #[error("upstream request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// Connection could not be established or broke mid-request.
    #[error("upstream transport failure: {reason}")]
    Transport { reason: String },

    /// Upstream answered with a 5xx status.
    #[error("upstream server error: HTTP {status}")]
    Server { status: u16 },

    /// Upstream is rate limiting or overloaded (HTTP 429).
    #[error("upstream rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// The account's quota is used up; retrying will not help.
    #[error("upstream quota exhausted")]
    QuotaExhausted,

    /// Upstream rejected the request shape (HTTP 400/404/422).
    #[error("upstream rejected request: HTTP {status}: {message}")]
    MalformedRequest { status: u16, message: String },

    /// Upstream rejected the credentials (HTTP 401/403).
    #[error("upstream authentication failed: HTTP {status}")]
    Auth { status: u16 },

    /// A 2xx response whose body could not be understood.
    #[error("invalid upstream response: {reason}")]
    InvalidResponse { reason: String },
}

impl CompletionError {
    /// Whether another attempt may succeed.
    ///
    /// Timeouts, transport failures, 5xx and rate limiting are transient.
    /// Everything else fails the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CompletionError::Timeout { .. }
                | CompletionError::Transport { .. }
                | CompletionError::Server { .. }
                | CompletionError::RateLimited { .. }
        )
    }

    /// Failure class reported to the orchestrator once retries stop.
    pub fn kind(&self) -> FailureKind {
        match self {
            CompletionError::RateLimited { .. } | CompletionError::QuotaExhausted => {
                FailureKind::QuotaOrOverload
            }
            CompletionError::Timeout { .. } | CompletionError::Transport { .. } => {
                FailureKind::NetworkOrTimeout
            }
            CompletionError::Server { .. } => FailureKind::ServiceUnavailable,
            CompletionError::MalformedRequest { .. }
            | CompletionError::Auth { .. }
            | CompletionError::InvalidResponse { .. } => FailureKind::Unknown,
        }
    }
}

/// Classified reason an upstream call ultimately failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    QuotaOrOverload,
    NetworkOrTimeout,
    ServiceUnavailable,
    Unknown,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::QuotaOrOverload => "quota_or_overload",
            FailureKind::NetworkOrTimeout => "network_or_timeout",
            FailureKind::ServiceUnavailable => "service_unavailable",
            FailureKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of an upstream call after retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("upstream call failed ({kind}) after {attempts} attempt(s)")]
pub struct UpstreamFailure {
    pub kind: FailureKind,
    /// Attempts actually made (0 when the budget expired before the first).
    pub attempts: u32,
    /// Error of the last attempt, `None` when the total budget expired.
    pub last_error: Option<CompletionError>,
}

/// Classify a non-success HTTP status.
///
/// `body` is inspected only to tell quota exhaustion apart from transient
/// rate limiting on 429.
pub(crate) fn classify_http_status(
    status: reqwest::StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> CompletionError {
    match status.as_u16() {
        401 | 403 => CompletionError::Auth {
            status: status.as_u16(),
        },
        402 => CompletionError::QuotaExhausted,
        429 if body.contains("insufficient_quota") => CompletionError::QuotaExhausted,
        429 => CompletionError::RateLimited { retry_after },
        400..=499 => CompletionError::MalformedRequest {
            status: status.as_u16(),
            message: truncate(body, 200),
        },
        _ => CompletionError::Server {
            status: status.as_u16(),
        },
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_retryable_classes() {
        assert!(CompletionError::Timeout { timeout_secs: 30 }.is_retryable());
        assert!(CompletionError::Transport { reason: "reset".into() }.is_retryable());
        assert!(CompletionError::Server { status: 502 }.is_retryable());
        assert!(CompletionError::RateLimited { retry_after: None }.is_retryable());

        assert!(!CompletionError::QuotaExhausted.is_retryable());
        assert!(!CompletionError::Auth { status: 401 }.is_retryable());
        assert!(
            !CompletionError::MalformedRequest {
                status: 400,
                message: String::new()
            }
            .is_retryable()
        );
        assert!(!CompletionError::InvalidResponse { reason: "no choices".into() }.is_retryable());
    }

    #[test]
    fn test_failure_kinds() {
        assert_eq!(CompletionError::QuotaExhausted.kind(), FailureKind::QuotaOrOverload);
        assert_eq!(
            CompletionError::Timeout { timeout_secs: 1 }.kind(),
            FailureKind::NetworkOrTimeout
        );
        assert_eq!(
            CompletionError::Server { status: 503 }.kind(),
            FailureKind::ServiceUnavailable
        );
        assert_eq!(CompletionError::Auth { status: 403 }.kind(), FailureKind::Unknown);
    }

    #[test]
    fn test_classify_http_status() {
        assert_eq!(
            classify_http_status(StatusCode::UNAUTHORIZED, None, ""),
            CompletionError::Auth { status: 401 }
        );
        assert_eq!(
            classify_http_status(StatusCode::TOO_MANY_REQUESTS, None, "slow down"),
            CompletionError::RateLimited { retry_after: None }
        );
        assert_eq!(
            classify_http_status(
                StatusCode::TOO_MANY_REQUESTS,
                None,
                r#"{"error":{"code":"insufficient_quota"}}"#
            ),
            CompletionError::QuotaExhausted
        );
        assert!(matches!(
            classify_http_status(StatusCode::UNPROCESSABLE_ENTITY, None, "bad"),
            CompletionError::MalformedRequest { status: 422, .. }
        ));
        assert_eq!(
            classify_http_status(StatusCode::SERVICE_UNAVAILABLE, None, ""),
            CompletionError::Server { status: 503 }
        );
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("chào", 10), "chào");
        assert_eq!(truncate("chàooo", 3), "chà…");
    }
}
