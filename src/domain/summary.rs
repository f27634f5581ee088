//! Run-level outcome report.
//!
//! Assembled by the orchestrator after every worker has returned, or
//! rebuilt later from a run's event log.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::error::ErrorKind;

use super::events::{Event, EventType};
use super::job::{ErrorRecord, JobStatus, PaperJob};
use super::paper::PublishedRef;
use super::stage::Stage;

/// Final state of one paper within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperOutcome {
    pub paper_id: String,

    pub title: String,

    pub status: JobStatus,

    /// Terminal error summary for failed jobs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Stage the job failed on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<String>,

    #[serde(default)]
    pub error_history: Vec<ErrorRecord>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<PublishedRef>,

    /// Archived copy of the video in object storage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_url: Option<String>,
}

impl PaperOutcome {
    pub fn from_job(job: &PaperJob) -> Self {
        let failed_stage = match job.status() {
            JobStatus::Failed => job.failed_stage().map(str::to_string),
            _ => None,
        };

        let error = match job.status() {
            JobStatus::Failed => job.terminal_cause().map(str::to_string),
            _ => None,
        };

        Self {
            paper_id: job.id().to_string(),
            title: job.paper().title.clone(),
            status: job.status(),
            error,
            failed_stage,
            error_history: job.error_history().to_vec(),
            published: job
                .artifact(Stage::Upload)
                .and_then(|a| a.as_published())
                .cloned(),
            storage_url: job
                .artifact(Stage::RecordPublished)
                .and_then(|a| a.storage_url())
                .map(str::to_string),
        }
    }

    /// Attempts recorded against a stage in the error history
    pub fn failed_attempts(&self, stage: &str) -> usize {
        self.error_history.iter().filter(|r| r.stage == stage).count()
    }
}

/// Aggregate over one orchestrator invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,

    pub started_at: DateTime<Utc>,

    /// Set once every admitted job reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,

    /// Papers returned by the candidate fetch
    pub candidates: usize,

    /// Papers that were not skipped
    pub attempted: usize,

    pub succeeded: usize,

    pub failed: usize,

    pub skipped: usize,

    /// Per-paper results, in completion order (treat as a set keyed by paper id)
    pub outcomes: Vec<PaperOutcome>,

    /// Run-level failure (candidate source unreachable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_error: Option<String>,
}

impl RunSummary {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            finished_at: None,
            candidates: 0,
            attempted: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            outcomes: Vec::new(),
            run_error: None,
        }
    }

    /// Add a terminal outcome and update the counters
    pub fn record(&mut self, outcome: PaperOutcome) {
        match outcome.status {
            JobStatus::Succeeded => self.succeeded += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Skipped => self.skipped += 1,
            // Non-terminal outcomes are never recorded
            _ => return,
        }
        if outcome.status != JobStatus::Skipped {
            self.attempted += 1;
        }
        self.outcomes.push(outcome);
    }

    pub fn finalize(&mut self) {
        if self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.finished_at.is_some()
    }

    /// True unless the run itself failed (job failures do not count)
    pub fn is_success(&self) -> bool {
        self.run_error.is_none()
    }

    pub fn outcome(&self, paper_id: &str) -> Option<&PaperOutcome> {
        self.outcomes.iter().find(|o| o.paper_id == paper_id)
    }

    /// Rebuild a summary by replaying a run's events.
    ///
    /// Job-level terminal events carry the paper title in `payload_summary`.
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first = events.first()?;
        let mut summary = RunSummary::new(first.run_id);
        summary.started_at = first.timestamp;

        let mut histories: HashMap<String, Vec<ErrorRecord>> = HashMap::new();
        let mut seen: Vec<String> = Vec::new();

        for event in events {
            if let Some(ref paper_id) = event.paper_id {
                if !seen.contains(paper_id) {
                    seen.push(paper_id.clone());
                }
            }

            match event.event_type {
                EventType::RunStarted => summary.started_at = event.timestamp,
                EventType::StageRetrying | EventType::StageFailed => {
                    if let (Some(paper_id), Some(stage)) = (&event.paper_id, &event.stage) {
                        histories.entry(paper_id.clone()).or_default().push(ErrorRecord {
                            stage: stage.clone(),
                            attempt: event.attempt.unwrap_or(0),
                            kind: event.error_kind.unwrap_or(ErrorKind::Permanent),
                            code: event.error_code.clone().unwrap_or_default(),
                            message: event.error.clone().unwrap_or_default(),
                            at: event.timestamp,
                        });
                    }
                }
                EventType::JobSkipped | EventType::JobSucceeded | EventType::JobFailed => {
                    let Some(paper_id) = event.paper_id.clone() else {
                        continue;
                    };
                    let status = match event.event_type {
                        EventType::JobSkipped => JobStatus::Skipped,
                        EventType::JobSucceeded => JobStatus::Succeeded,
                        _ => JobStatus::Failed,
                    };
                    let error_history = histories.remove(&paper_id).unwrap_or_default();
                    summary.record(PaperOutcome {
                        failed_stage: if status == JobStatus::Failed {
                            event.stage.clone()
                        } else {
                            None
                        },
                        paper_id,
                        title: event.payload_summary.clone(),
                        status,
                        error: event.error.clone(),
                        error_history,
                        published: None,
                        storage_url: None,
                    });
                }
                EventType::RunCompleted => summary.finished_at = Some(event.timestamp),
                EventType::RunFailed => {
                    summary.finished_at = Some(event.timestamp);
                    summary.run_error = event.error.clone();
                }
                _ => {}
            }
        }

        summary.candidates = seen.len();
        Some(summary)
    }
}
