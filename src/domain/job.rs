//! One paper's traversal of the stage sequence.
//!
//! Status only moves toward a terminal state (`Succeeded`, `Failed`,
//! `Skipped`) and `finished_at` is stamped exactly when it gets there.
//! Artifacts, attempt counters and error history are written by the stage
//! executor; status and stage position are moved by the orchestrator.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::error::ErrorKind;

use super::artifact::StageArtifact;
use super::paper::PaperRecord;
use super::stage::Stage;

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    /// Waiting out a retry delay inside a stage (a sub-state of Running)
    Retrying,
    Succeeded,
    Failed,
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Skipped)
    }

    pub fn is_running(self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Retrying)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Retrying => "retrying",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
        }
    }
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Pending
    }
}

/// One failed attempt, kept for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Stage name (or `check_published` for the pre-admission check)
    pub stage: String,

    pub attempt: u32,

    pub kind: ErrorKind,

    /// Short error code (e.g. "timeout", "auth_error")
    pub code: String,

    pub message: String,

    pub at: DateTime<Utc>,
}

/// Rejected job mutation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("invalid status transition: {from:?} -> {to:?}")]
    InvalidStatus { from: JobStatus, to: JobStatus },

    #[error("stage '{got}' is not the current stage ({expected:?})")]
    WrongStage { expected: Option<Stage>, got: Stage },

    #[error("stage '{0}' has no artifact yet")]
    MissingArtifact(Stage),

    #[error("stage '{0}' already has an artifact")]
    DuplicateArtifact(Stage),
}

/// A paper moving through the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperJob {
    paper: PaperRecord,
    stage_index: usize,
    status: JobStatus,
    artifacts: BTreeMap<Stage, StageArtifact>,
    attempts: BTreeMap<Stage, u32>,
    error_history: Vec<ErrorRecord>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    /// Why the job ended the way it did (failure summary or skip reason)
    terminal_cause: Option<String>,
    /// Stage (or pre-stage check) the job failed in, when known
    #[serde(default)]
    failed_stage: Option<String>,
}

impl PaperJob {
    pub fn new(paper: PaperRecord) -> Self {
        Self {
            paper,
            stage_index: 0,
            status: JobStatus::Pending,
            artifacts: BTreeMap::new(),
            attempts: BTreeMap::new(),
            error_history: Vec::new(),
            started_at: None,
            finished_at: None,
            terminal_cause: None,
            failed_stage: None,
        }
    }

    pub fn paper(&self) -> &PaperRecord {
        &self.paper
    }

    pub fn id(&self) -> &str {
        &self.paper.id
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn stage_index(&self) -> usize {
        self.stage_index
    }

    /// Stage the job is on; `None` once every stage has completed
    pub fn current_stage(&self) -> Option<Stage> {
        if self.status == JobStatus::Succeeded {
            return None;
        }
        Stage::at(self.stage_index)
    }

    pub fn artifacts(&self) -> &BTreeMap<Stage, StageArtifact> {
        &self.artifacts
    }

    pub fn artifact(&self, stage: Stage) -> Option<&StageArtifact> {
        self.artifacts.get(&stage)
    }

    /// Attempts made on a stage (0 if never tried)
    pub fn attempts(&self, stage: Stage) -> u32 {
        self.attempts.get(&stage).copied().unwrap_or(0)
    }

    pub fn attempt_counts(&self) -> &BTreeMap<Stage, u32> {
        &self.attempts
    }

    pub fn error_history(&self) -> &[ErrorRecord] {
        &self.error_history
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn terminal_cause(&self) -> Option<&str> {
        self.terminal_cause.as_deref()
    }

    pub fn failed_stage(&self) -> Option<&str> {
        self.failed_stage.as_deref()
    }

    /// Pending -> Running: the scheduler gave this job a worker slot
    pub fn admit(&mut self) -> Result<(), TransitionError> {
        self.expect_status(&[JobStatus::Pending], JobStatus::Running)?;
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
        if let Some(stage) = Stage::at(self.stage_index) {
            self.attempts.insert(stage, 0);
        }
        Ok(())
    }

    /// Pending -> Skipped: already handled by an earlier run
    pub fn skip(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.expect_status(&[JobStatus::Pending], JobStatus::Skipped)?;
        self.finish(JobStatus::Skipped, Some(reason.into()));
        Ok(())
    }

    /// Running -> Running (next stage) or Running -> Succeeded (last stage).
    ///
    /// The current stage must already have its artifact.
    pub fn advance(&mut self) -> Result<(), TransitionError> {
        self.expect_status(&[JobStatus::Running], JobStatus::Running)?;
        let stage = Stage::at(self.stage_index).ok_or(TransitionError::InvalidStatus {
            from: self.status,
            to: JobStatus::Succeeded,
        })?;

        if !self.artifacts.contains_key(&stage) {
            return Err(TransitionError::MissingArtifact(stage));
        }

        match stage.next() {
            Some(next) => {
                self.stage_index += 1;
                self.attempts.insert(next, 0);
            }
            None => self.finish(JobStatus::Succeeded, None),
        }
        Ok(())
    }

    /// Any non-terminal state -> Failed
    pub fn fail(&mut self, cause: impl Into<String>) -> Result<(), TransitionError> {
        self.expect_status(
            &[JobStatus::Pending, JobStatus::Running, JobStatus::Retrying],
            JobStatus::Failed,
        )?;
        self.finish(JobStatus::Failed, Some(cause.into()));
        Ok(())
    }

    /// Like [`fail`](Self::fail), naming the stage that failed
    pub fn fail_at(&mut self, stage: &str, cause: impl Into<String>) -> Result<(), TransitionError> {
        self.fail(cause)?;
        self.failed_stage = Some(stage.to_string());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stage executor side
    // ------------------------------------------------------------------

    /// Count a new attempt on the current stage, returning its number (1-based)
    pub(crate) fn begin_attempt(&mut self, stage: Stage) -> Result<u32, TransitionError> {
        self.expect_current(stage)?;
        if !self.status.is_running() {
            return Err(TransitionError::InvalidStatus {
                from: self.status,
                to: JobStatus::Running,
            });
        }
        let count = self.attempts.entry(stage).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    pub(crate) fn record_error(&mut self, record: ErrorRecord) {
        self.error_history.push(record);
    }

    /// Store the current stage's artifact; a stage may only write its own key, once
    pub(crate) fn record_artifact(&mut self, artifact: StageArtifact) -> Result<(), TransitionError> {
        let stage = artifact.stage();
        self.expect_current(stage)?;
        if self.artifacts.contains_key(&stage) {
            return Err(TransitionError::DuplicateArtifact(stage));
        }
        self.artifacts.insert(stage, artifact);
        Ok(())
    }

    pub(crate) fn mark_retrying(&mut self) -> Result<(), TransitionError> {
        self.expect_status(&[JobStatus::Running], JobStatus::Retrying)?;
        self.status = JobStatus::Retrying;
        Ok(())
    }

    pub(crate) fn mark_running(&mut self) -> Result<(), TransitionError> {
        self.expect_status(&[JobStatus::Retrying], JobStatus::Running)?;
        self.status = JobStatus::Running;
        Ok(())
    }

    fn expect_current(&self, stage: Stage) -> Result<(), TransitionError> {
        let current = self.current_stage();
        if current != Some(stage) {
            return Err(TransitionError::WrongStage {
                expected: current,
                got: stage,
            });
        }
        Ok(())
    }

    fn expect_status(&self, allowed: &[JobStatus], to: JobStatus) -> Result<(), TransitionError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(TransitionError::InvalidStatus {
                from: self.status,
                to,
            })
        }
    }

    fn finish(&mut self, status: JobStatus, cause: Option<String>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.terminal_cause = cause;
        self.finished_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::artifact::{ExtractedContent, PaperSummary};

    fn job() -> PaperJob {
        PaperJob::new(PaperRecord::new("42", "A paper"))
    }

    fn extracted() -> StageArtifact {
        StageArtifact::Extracted(ExtractedContent {
            text: "text".into(),
            figures: vec![],
            abstract_only: true,
        })
    }

    #[test]
    fn test_new_job_is_pending() {
        let job = job();
        assert_eq!(job.status(), JobStatus::Pending);
        assert_eq!(job.current_stage(), Some(Stage::Extract));
        assert!(job.finished_at().is_none());
        assert!(job.started_at().is_none());
    }

    #[test]
    fn test_admit_then_advance() {
        let mut job = job();
        job.admit().unwrap();
        assert_eq!(job.status(), JobStatus::Running);
        assert!(job.started_at().is_some());

        assert_eq!(job.begin_attempt(Stage::Extract).unwrap(), 1);
        job.record_artifact(extracted()).unwrap();
        job.advance().unwrap();

        assert_eq!(job.stage_index(), 1);
        assert_eq!(job.current_stage(), Some(Stage::Summarize));
        assert_eq!(job.attempts(Stage::Summarize), 0);
        assert_eq!(job.attempts(Stage::Extract), 1);
        assert!(job.finished_at().is_none());
    }

    #[test]
    fn test_advance_requires_artifact() {
        let mut job = job();
        job.admit().unwrap();
        assert_eq!(
            job.advance(),
            Err(TransitionError::MissingArtifact(Stage::Extract))
        );
    }

    #[test]
    fn test_stage_cannot_write_other_stage_artifact() {
        let mut job = job();
        job.admit().unwrap();

        let summary = StageArtifact::Summary(PaperSummary {
            summary_text: "s".into(),
            key_takeaways: vec![],
        });
        assert!(matches!(
            job.record_artifact(summary),
            Err(TransitionError::WrongStage { .. })
        ));

        job.record_artifact(extracted()).unwrap();
        assert_eq!(
            job.record_artifact(extracted()),
            Err(TransitionError::DuplicateArtifact(Stage::Extract))
        );
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut job = job();
        job.skip("already published").unwrap();
        assert_eq!(job.status(), JobStatus::Skipped);
        assert!(job.finished_at().is_some());

        assert!(job.admit().is_err());
        assert!(job.fail("late").is_err());
        assert!(job.skip("again").is_err());
        assert_eq!(job.terminal_cause(), Some("already published"));
    }

    #[test]
    fn test_failed_job_keeps_finished_at() {
        let mut job = job();
        job.admit().unwrap();
        job.fail("boom").unwrap();

        let finished = job.finished_at();
        assert!(finished.is_some());
        assert!(job.fail("again").is_err());
        assert_eq!(job.finished_at(), finished);
    }

    #[test]
    fn test_failed_stage_is_the_stage_that_ended_the_job() {
        let mut job = job();
        job.admit().unwrap();

        // An earlier stage recovered from a transient error
        job.begin_attempt(Stage::Extract).unwrap();
        job.record_error(ErrorRecord {
            stage: Stage::Extract.name().to_string(),
            attempt: 1,
            kind: ErrorKind::Transient,
            code: "unavailable".into(),
            message: "503".into(),
            at: Utc::now(),
        });
        job.begin_attempt(Stage::Extract).unwrap();
        job.record_artifact(extracted()).unwrap();
        job.advance().unwrap();

        job.fail_at(Stage::Summarize.name(), "advance refused").unwrap();
        assert_eq!(job.failed_stage(), Some("summarize"));
        assert_eq!(job.error_history().last().unwrap().stage, "extract");

        let mut aborted = self::job();
        aborted.fail("worker task aborted").unwrap();
        assert_eq!(aborted.failed_stage(), None);
        assert!(aborted.fail_at("extract", "again").is_err());
        assert_eq!(aborted.failed_stage(), None);
    }

    #[test]
    fn test_retrying_is_a_running_substate() {
        let mut job = job();
        job.admit().unwrap();
        job.mark_retrying().unwrap();
        assert!(job.status().is_running());
        assert!(!job.status().is_terminal());

        assert_eq!(job.begin_attempt(Stage::Extract).unwrap(), 1);
        job.mark_running().unwrap();
        assert_eq!(job.status(), JobStatus::Running);
    }

    #[test]
    fn test_begin_attempt_requires_running() {
        let mut job = job();
        assert!(job.begin_attempt(Stage::Extract).is_err());
    }
}
