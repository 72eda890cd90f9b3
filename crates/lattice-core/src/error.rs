use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ConnectionStatus;

/// Broad error category used for user-facing handling and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid input, unsupported state, or other configuration issue.
    Config,
    /// Authentication/authorization failure.
    Auth,
    /// Transient network or transport failure.
    Network,
    /// Rate-limited by homeserver.
    RateLimited,
    /// Payload could not be parsed or bound.
    Serialization,
    /// Client bug or invariant break.
    Internal,
}

/// Stable client error payload emitted across the command/event boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct ClientError {
    /// High-level error category.
    pub category: ErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl ClientError {
    pub fn new(category: ErrorCategory, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: ConnectionStatus, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            ErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while connection is {current:?}"),
        )
    }
}

/// Map HTTP status codes to error categories.
pub fn classify_http_status(status: u16) -> ErrorCategory {
    match status {
        401 | 403 => ErrorCategory::Auth,
        408 | 429 => ErrorCategory::RateLimited,
        400..=499 => ErrorCategory::Config,
        500..=599 => ErrorCategory::Network,
        _ => ErrorCategory::Internal,
    }
}

/// Terminal failure of one job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
pub enum JobError {
    /// Transport failure or non-success HTTP status.
    #[error("network failure{}: {message}", status_suffix(.status))]
    Network {
        status: Option<u16>,
        message: String,
        retry_after_ms: Option<u64>,
    },
    /// No response arrived before the job timeout elapsed.
    #[error("no response within {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
    /// The response body is not JSON.
    #[error("response payload is not valid JSON: {0}")]
    PayloadParse(String),
    /// The response parsed but required fields failed to bind.
    #[error("response failed validation on fields: {}", .0.join(", "))]
    ResultValidation(Vec<String>),
    /// The operation needs a session token and none is available.
    #[error("operation requires an access token")]
    Unauthenticated,
    /// The job was killed before it finished.
    #[error("job was cancelled")]
    Cancelled,
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

impl JobError {
    /// Stable machine-readable code for this failure.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network_error",
            Self::Timeout { .. } => "job_timeout",
            Self::PayloadParse(_) => "payload_parse_error",
            Self::ResultValidation(_) => "result_validation_error",
            Self::Unauthenticated => "unauthenticated",
            Self::Cancelled => "job_cancelled",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Network {
                status: Some(status),
                ..
            } => classify_http_status(*status),
            Self::Network { status: None, .. } | Self::Timeout { .. } => ErrorCategory::Network,
            Self::PayloadParse(_) | Self::ResultValidation(_) => ErrorCategory::Serialization,
            Self::Unauthenticated => ErrorCategory::Auth,
            Self::Cancelled => ErrorCategory::Internal,
        }
    }

    /// Whether the failure means the session token is unusable.
    pub fn is_auth_failure(&self) -> bool {
        match self {
            Self::Unauthenticated => true,
            Self::Network {
                status: Some(status),
                ..
            } => matches!(status, 401 | 403),
            _ => false,
        }
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::Network { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }
}

impl From<&JobError> for ClientError {
    fn from(error: &JobError) -> Self {
        Self {
            category: error.category(),
            code: error.code().to_owned(),
            message: error.to_string(),
            retry_after_ms: error.retry_after_ms(),
        }
    }
}

impl From<JobError> for ClientError {
    fn from(error: JobError) -> Self {
        Self::from(&error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_http_status_categories() {
        assert_eq!(classify_http_status(401), ErrorCategory::Auth);
        assert_eq!(classify_http_status(429), ErrorCategory::RateLimited);
        assert_eq!(classify_http_status(404), ErrorCategory::Config);
        assert_eq!(classify_http_status(503), ErrorCategory::Network);
        assert_eq!(classify_http_status(700), ErrorCategory::Internal);
    }

    #[test]
    fn keeps_invalid_state_error_code_stable() {
        let err = ClientError::invalid_state(ConnectionStatus::Connected, "connect");
        assert_eq!(err.code, "invalid_state_transition");
        assert_eq!(err.category, ErrorCategory::Internal);
        assert!(err.message.contains("connect"));
    }

    #[test]
    fn persists_retry_after_in_millis() {
        let err = ClientError::new(ErrorCategory::RateLimited, "rate_limited", "wait")
            .with_retry_after(Duration::from_secs(3));
        assert_eq!(err.retry_after_ms, Some(3000));
    }

    #[test]
    fn maps_job_errors_to_stable_codes() {
        let err = ClientError::from(JobError::Timeout { timeout_ms: 120_000 });
        assert_eq!(err.code, "job_timeout");
        assert_eq!(err.category, ErrorCategory::Network);

        let err = ClientError::from(JobError::ResultValidation(vec!["access_token".into()]));
        assert_eq!(err.code, "result_validation_error");
        assert_eq!(err.category, ErrorCategory::Serialization);
        assert!(err.message.contains("access_token"));
    }

    #[test]
    fn carries_rate_limit_hint_from_network_failures() {
        let job_err = JobError::Network {
            status: Some(429),
            message: "M_LIMIT_EXCEEDED: Too many requests".into(),
            retry_after_ms: Some(2_000),
        };
        let err = ClientError::from(&job_err);
        assert_eq!(err.category, ErrorCategory::RateLimited);
        assert_eq!(err.retry_after_ms, Some(2_000));
        assert!(err.message.contains("HTTP 429"));
    }

    #[test]
    fn detects_auth_class_failures() {
        assert!(JobError::Unauthenticated.is_auth_failure());
        assert!(
            JobError::Network {
                status: Some(401),
                message: "M_UNKNOWN_TOKEN".into(),
                retry_after_ms: None,
            }
            .is_auth_failure()
        );
        assert!(
            !JobError::Network {
                status: None,
                message: "connection refused".into(),
                retry_after_ms: None,
            }
            .is_auth_failure()
        );
        assert!(!JobError::Timeout { timeout_ms: 1 }.is_auth_failure());
    }
}
