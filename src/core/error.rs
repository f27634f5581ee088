//! Error taxonomy for collaborator calls, stages, and runs.
//!
//! Every collaborator error classifies as `Transient` (worth retrying) or
//! `Permanent` (retrying cannot help). Stage failures and run failures are
//! built on top of that classification.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::Stage;

/// Retryability of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Permanent,
}

/// Failure reported by an external collaborator
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CollaboratorError {
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("quota exceeded: {message}")]
    QuotaExceeded {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generative backend not configured or not reachable at all
    #[error("backend not available: {0}")]
    BackendMissing(String),

    #[error("{message}")]
    Other { kind: ErrorKind, message: String },
}

impl CollaboratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CollaboratorError::Timeout(_)
            | CollaboratorError::RateLimited { .. }
            | CollaboratorError::Unavailable(_)
            | CollaboratorError::QuotaExceeded { .. } => ErrorKind::Transient,

            CollaboratorError::QuotaExhausted(_)
            | CollaboratorError::Extraction(_)
            | CollaboratorError::Model(_)
            | CollaboratorError::Auth(_)
            | CollaboratorError::InvalidInput(_)
            | CollaboratorError::BackendMissing(_) => ErrorKind::Permanent,

            CollaboratorError::Other { kind, .. } => *kind,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Delay requested by the collaborator itself (e.g. HTTP Retry-After)
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CollaboratorError::RateLimited { retry_after, .. }
            | CollaboratorError::QuotaExceeded { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Short machine-friendly name for logs and summaries
    pub fn code(&self) -> &'static str {
        match self {
            CollaboratorError::Timeout(_) => "timeout",
            CollaboratorError::RateLimited { .. } => "rate_limited",
            CollaboratorError::Unavailable(_) => "unavailable",
            CollaboratorError::QuotaExceeded { .. } => "quota_exceeded",
            CollaboratorError::QuotaExhausted(_) => "quota_exhausted",
            CollaboratorError::Extraction(_) => "extraction_error",
            CollaboratorError::Model(_) => "model_error",
            CollaboratorError::Auth(_) => "auth_error",
            CollaboratorError::InvalidInput(_) => "invalid_input",
            CollaboratorError::BackendMissing(_) => "backend_missing",
            CollaboratorError::Other { .. } => "other",
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        CollaboratorError::Other {
            kind: ErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        CollaboratorError::Other {
            kind: ErrorKind::Permanent,
            message: message.into(),
        }
    }
}

/// Terminal failure of one stage for one job
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StageFailure {
    #[error("stage '{stage}' gave up after {attempts} attempts: {last_error}")]
    TransientExhausted {
        stage: Stage,
        attempts: u32,
        last_error: CollaboratorError,
    },

    #[error("stage '{stage}' failed permanently on attempt {attempt}: {error}")]
    Permanent {
        stage: Stage,
        attempt: u32,
        error: CollaboratorError,
    },
}

impl StageFailure {
    pub fn stage(&self) -> Stage {
        match self {
            StageFailure::TransientExhausted { stage, .. } | StageFailure::Permanent { stage, .. } => {
                *stage
            }
        }
    }

    pub fn error(&self) -> &CollaboratorError {
        match self {
            StageFailure::TransientExhausted { last_error, .. } => last_error,
            StageFailure::Permanent { error, .. } => error,
        }
    }
}

/// Failure of a whole run (no jobs were admitted)
#[derive(Debug, Error)]
pub enum RunError {
    #[error("candidate source unreachable after {attempts} attempts: {error}")]
    CandidateSource {
        attempts: u32,
        #[source]
        error: CollaboratorError,
    },

    #[error("run log unavailable: {0:#}")]
    EventStore(anyhow::Error),

    #[error("invalid configuration: {0:#}")]
    Config(anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(
            CollaboratorError::Timeout(Duration::from_secs(1)).kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            CollaboratorError::QuotaExceeded {
                message: "slow down".into(),
                retry_after: None
            }
            .kind(),
            ErrorKind::Transient
        );
        assert_eq!(CollaboratorError::Auth("bad token".into()).kind(), ErrorKind::Permanent);
        assert_eq!(CollaboratorError::Model("refused".into()).kind(), ErrorKind::Permanent);
        assert_eq!(
            CollaboratorError::QuotaExhausted("daily cap".into()).kind(),
            ErrorKind::Permanent
        );
        assert!(CollaboratorError::transient("flaky").is_transient());
        assert!(!CollaboratorError::permanent("broken").is_transient());
    }

    #[test]
    fn test_retry_after_hint() {
        let err = CollaboratorError::RateLimited {
            message: "429".into(),
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(CollaboratorError::Unavailable("down".into()).retry_after(), None);
    }

    #[test]
    fn test_stage_failure_accessors() {
        let failure = StageFailure::Permanent {
            stage: Stage::Upload,
            attempt: 1,
            error: CollaboratorError::Auth("expired".into()),
        };
        assert_eq!(failure.stage(), Stage::Upload);
        assert_eq!(failure.error().code(), "auth_error");
        assert!(failure.to_string().contains("upload"));
    }
}
