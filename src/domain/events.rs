//! Event types for the per-run append-only log.
//!
//! Every admission, stage attempt and terminal outcome is recorded as an
//! immutable event. A run's summary can be rebuilt by replaying them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::error::ErrorKind;

use super::job::JobStatus;

/// A single event in the append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Paper the event concerns (None for run-level events)
    pub paper_id: Option<String>,

    /// Stage name (if applicable)
    pub stage: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Idempotency key format: "{run_id}:{paper_id}:{stage}:{input_hash}"
    pub idempotency_key: String,

    /// Human-readable summary (NO secrets)
    pub payload_summary: String,

    /// Job status after this event (run-level events carry Running/Succeeded/Failed)
    pub status: JobStatus,

    /// Attempt number for stage events
    pub attempt: Option<u32>,

    /// Time taken in milliseconds (for completed attempts)
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,

    /// Classification of the error (stage events only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,

    /// Short error code, e.g. "timeout"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(
        run_id: Uuid,
        paper_id: Option<String>,
        event_type: EventType,
        idempotency_key: String,
        payload_summary: String,
        status: JobStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            paper_id,
            stage: None,
            event_type,
            idempotency_key,
            payload_summary,
            status,
            attempt: None,
            duration_ms: None,
            error: None,
            error_kind: None,
            error_code: None,
        }
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    /// Create an event with duration information
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Create an event with error information
    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_error_kind(mut self, kind: ErrorKind) -> Self {
        self.error_kind = Some(kind);
        self
    }

    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload_summary = payload.into();
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }
}

/// Types of events that can occur during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A new run has started
    RunStarted,

    /// The candidate list was fetched
    CandidatesFetched,

    /// A paper was already published and will not run
    JobSkipped,

    /// A job got a worker slot
    JobAdmitted,

    /// A stage attempt has started
    StageStarted,

    /// A stage completed successfully
    StageCompleted,

    /// A stage attempt failed and will be retried
    StageRetrying,

    /// A stage failed for good
    StageFailed,

    /// Every stage of a job completed
    JobSucceeded,

    /// A job ended in failure
    JobFailed,

    /// All jobs reached a terminal state
    RunCompleted,

    /// The run could not start (candidate source unreachable)
    RunFailed,
}
