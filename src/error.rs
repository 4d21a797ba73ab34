use thiserror::Error;

use crate::client::SubmitError;
use crate::events::StreamError;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid generation parameters: {0}")]
    Validation(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job id already in use: {0}")]
    JobIdConflict(String),

    #[error("Submission error: {0}")]
    Submit(#[from] SubmitError),

    #[error("Event stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Classifies a job failure. Everything except `RateLimited` ends up on the
/// job record; a rate limit pauses the whole pipeline instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed parameters. Rejected at enqueue or by the engine (400/422).
    Validation,
    /// Missing or rejected API key.
    Auth,
    /// The engine asked us to back off.
    RateLimited,
    /// Engine overloaded or model not loaded (502/503/504).
    ServiceUnavailable,
    /// Request ceiling elapsed before the engine answered.
    Timeout,
    /// Transport failure (DNS, refused connection, reset).
    Network,
    Unknown,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::Validation | ErrorKind::Auth)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::Auth => write!(f, "auth"),
            ErrorKind::RateLimited => write!(f, "rate_limited"),
            ErrorKind::ServiceUnavailable => write!(f, "service_unavailable"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Network => write!(f, "network"),
            ErrorKind::Unknown => write!(f, "unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_display_matches_wire_name() {
        for kind in [
            ErrorKind::Validation,
            ErrorKind::Auth,
            ErrorKind::RateLimited,
            ErrorKind::ServiceUnavailable,
            ErrorKind::Timeout,
            ErrorKind::Network,
            ErrorKind::Unknown,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{kind}\""));
        }
    }

    #[test]
    fn validation_and_auth_are_not_retryable() {
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::Auth.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::Network.is_retryable());
    }

    #[test]
    fn orchestrator_error_display() {
        let err = OrchestratorError::JobNotFound("abc".into());
        assert_eq!(err.to_string(), "Job not found: abc");
    }
}
