//! Executes one stage of one job against its collaborator.
//!
//! Each attempt acquires the stage's rate-limit slot, runs under the
//! stage's timeout, and is logged to the run's event store. Failures are
//! classified and handed to the retry policy, which either schedules
//! another attempt or ends the stage.
//!
//! Stages that make several collaborator calls per attempt use
//! [`StageExecutor::execute_paced`]: each call then waits for its own slot
//! and gets its own timeout, so queueing on the gate is never counted
//! against a call.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::domain::{ErrorRecord, Event, EventType, JobStatus, PaperJob, Stage, StageArtifact};

use super::error::{CollaboratorError, StageFailure};
use super::event_store::{generate_idempotency_key, EventStore};
use super::rate_limiter::RateLimiter;
use super::retry::{RetryDecision, RetryPolicy};

/// How an attempt is paced and timed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pacing {
    /// One slot and one timeout for the whole attempt
    PerAttempt,
    /// The attempt paces each of its calls through a [`CallPacer`]
    PerCall,
}

/// Rate-limit slot plus timeout for a single collaborator call
#[derive(Clone, Copy)]
pub struct CallPacer<'a> {
    limiter: &'a RateLimiter,
    service: &'static str,
    timeout: Duration,
}

impl CallPacer<'_> {
    /// Wait for a slot, then run `call` under the stage timeout.
    /// The wait is not part of the timed region.
    pub async fn call<T, Fut>(&self, call: Fut) -> Result<T, CollaboratorError>
    where
        Fut: Future<Output = Result<T, CollaboratorError>>,
    {
        self.limiter.acquire(self.service).await;
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(CollaboratorError::Timeout(self.timeout)),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Runs stage calls with rate limiting, timeouts and retries
pub struct StageExecutor {
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    timeouts: HashMap<Stage, Duration>,
    store: Arc<EventStore>,
}

impl StageExecutor {
    pub fn new(
        limiter: Arc<RateLimiter>,
        policy: RetryPolicy,
        timeouts: HashMap<Stage, Duration>,
        store: Arc<EventStore>,
    ) -> Self {
        Self {
            limiter,
            policy,
            timeouts,
            store,
        }
    }

    /// Get the effective timeout for a stage
    pub fn timeout_for(&self, stage: Stage) -> Duration {
        self.timeouts
            .get(&stage)
            .copied()
            .unwrap_or_else(|| stage.default_timeout())
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `call` as the current stage of `job` until it succeeds or the
    /// retry policy gives up.
    ///
    /// On success the artifact is stored on the job (and on disk) and a
    /// reference to it is returned. Every failed attempt is appended to the
    /// job's error history.
    pub async fn execute<'j, F, Fut>(
        &self,
        stage: Stage,
        job: &'j mut PaperJob,
        call: F,
    ) -> Result<&'j StageArtifact, StageFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<StageArtifact, CollaboratorError>>,
    {
        self.run(stage, job, Pacing::PerAttempt, call).await
    }

    /// Like [`execute`](Self::execute), for attempts that make several
    /// collaborator calls. `call` receives a [`CallPacer`] and must send
    /// every collaborator call through it; the attempt as a whole is
    /// neither rate limited nor timed.
    pub async fn execute_paced<'s, 'j, F, Fut>(
        &'s self,
        stage: Stage,
        job: &'j mut PaperJob,
        mut call: F,
    ) -> Result<&'j StageArtifact, StageFailure>
    where
        F: FnMut(CallPacer<'s>) -> Fut,
        Fut: Future<Output = Result<StageArtifact, CollaboratorError>>,
    {
        let pacer = CallPacer {
            limiter: &self.limiter,
            service: stage.service(),
            timeout: self.timeout_for(stage),
        };
        self.run(stage, job, Pacing::PerCall, move || call(pacer)).await
    }

    async fn run<'j, F, Fut>(
        &self,
        stage: Stage,
        job: &'j mut PaperJob,
        pacing: Pacing,
        mut call: F,
    ) -> Result<&'j StageArtifact, StageFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<StageArtifact, CollaboratorError>>,
    {
        let timeout = self.timeout_for(stage);
        let idem_key = generate_idempotency_key(
            self.store.run_id(),
            job.id(),
            stage.name(),
            &stage_input_fingerprint(job, stage),
        );

        loop {
            let attempt = job
                .begin_attempt(stage)
                .map_err(|e| StageFailure::Permanent {
                    stage,
                    attempt: job.attempts(stage),
                    error: CollaboratorError::permanent(e.to_string()),
                })?;

            if pacing == Pacing::PerAttempt {
                self.limiter.acquire(stage.service()).await;
            }

            self.record(
                self.stage_event(job, stage, EventType::StageStarted, &idem_key)
                    .with_attempt(attempt)
                    .with_payload(format!("Stage '{}' attempt {}", stage, attempt)),
            )
            .await;
            debug!(paper_id = %job.id(), %stage, attempt, "Stage attempt started");

            let started = Instant::now();
            let result = match pacing {
                Pacing::PerAttempt => match tokio::time::timeout(timeout, call()).await {
                    Ok(result) => result,
                    Err(_) => Err(CollaboratorError::Timeout(timeout)),
                },
                Pacing::PerCall => call().await,
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            let error = match result {
                Ok(artifact) if artifact.stage() == stage => {
                    if let Err(e) = self.store.store_artifact(job.id(), &artifact).await {
                        warn!(paper_id = %job.id(), %stage, error = %e, "Failed to persist artifact");
                    }
                    let description = artifact.describe();
                    job.record_artifact(artifact).map_err(|e| StageFailure::Permanent {
                        stage,
                        attempt,
                        error: CollaboratorError::permanent(e.to_string()),
                    })?;

                    self.record(
                        self.stage_event(job, stage, EventType::StageCompleted, &idem_key)
                            .with_attempt(attempt)
                            .with_duration(duration_ms)
                            .with_payload(format!(
                                "Stage '{}' completed in {}ms: {}",
                                stage, duration_ms, description
                            )),
                    )
                    .await;
                    info!(paper_id = %job.id(), %stage, attempt, duration_ms, "Stage completed");

                    return job.artifact(stage).ok_or_else(|| StageFailure::Permanent {
                        stage,
                        attempt,
                        error: CollaboratorError::permanent("artifact vanished after recording"),
                    });
                }
                Ok(artifact) => CollaboratorError::permanent(format!(
                    "collaborator returned a '{}' artifact during stage '{}'",
                    artifact.stage(),
                    stage
                )),
                Err(error) => error,
            };

            job.record_error(ErrorRecord {
                stage: stage.name().to_string(),
                attempt,
                kind: error.kind(),
                code: error.code().to_string(),
                message: error.to_string(),
                at: Utc::now(),
            });

            match self
                .policy
                .decide(stage, attempt, error.kind(), error.retry_after())
            {
                RetryDecision::RetryAfter(delay) => {
                    self.record(
                        self.stage_event(job, stage, EventType::StageRetrying, &idem_key)
                            .with_attempt(attempt)
                            .with_duration(duration_ms)
                            .with_status(JobStatus::Retrying)
                            .with_error_kind(error.kind())
                            .with_error_code(error.code())
                            .with_error(error.to_string())
                            .with_payload(format!(
                                "Stage '{}' failed, retrying in {:?}: {}",
                                stage, delay, error
                            )),
                    )
                    .await;

                    warn!(
                        paper_id = %job.id(),
                        %stage,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Stage failed, retrying"
                    );

                    job.mark_retrying().ok();
                    tokio::time::sleep(delay).await;
                    job.mark_running().ok();
                }
                RetryDecision::GiveUp => {
                    self.record(
                        self.stage_event(job, stage, EventType::StageFailed, &idem_key)
                            .with_attempt(attempt)
                            .with_duration(duration_ms)
                            .with_status(JobStatus::Failed)
                            .with_error_kind(error.kind())
                            .with_error_code(error.code())
                            .with_error(error.to_string())
                            .with_payload(format!(
                                "Stage '{}' failed after {} attempts: {}",
                                stage, attempt, error
                            )),
                    )
                    .await;

                    error!(
                        paper_id = %job.id(),
                        %stage,
                        attempt,
                        error = %error,
                        "Stage failed permanently"
                    );

                    return Err(if error.is_transient() {
                        StageFailure::TransientExhausted {
                            stage,
                            attempts: attempt,
                            last_error: error,
                        }
                    } else {
                        StageFailure::Permanent {
                            stage,
                            attempt,
                            error,
                        }
                    });
                }
            }
        }
    }

    fn stage_event(&self, job: &PaperJob, stage: Stage, event_type: EventType, idem_key: &str) -> Event {
        Event::new(
            self.store.run_id(),
            Some(job.id().to_string()),
            event_type,
            idem_key.to_string(),
            String::new(),
            job.status(),
        )
        .with_stage(stage.name())
    }

    /// The log is diagnostic; a failed append never fails the stage
    async fn record(&self, event: Event) {
        if let Err(e) = self.store.append(&event).await {
            warn!(error = %e, event_type = ?event.event_type, "Failed to append event");
        }
    }
}

/// What a stage consumes: the paper for the first stage, otherwise the
/// previous stage's artifact
fn stage_input_fingerprint(job: &PaperJob, stage: Stage) -> String {
    let previous = stage.index().checked_sub(1).and_then(Stage::at);
    match previous.and_then(|prev| job.artifact(prev)) {
        Some(artifact) => serde_json::to_string(artifact).unwrap_or_default(),
        None => format!("{}:{}", job.id(), job.paper().title),
    }
}
