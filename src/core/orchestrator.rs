//! Run orchestrator.
//!
//! One `run()` fetches the candidate papers, skips those already published,
//! and drives the rest through the fixed stage sequence on a bounded worker
//! pool. Job failures stay inside their job; only an unreachable candidate
//! source fails the run.

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{
    CandidateQuery, Collaborators, RenderRequest, StyleConfig, SummaryConstraints, VideoMetadata,
    VoiceConfig,
};
use crate::config::Config;
use crate::domain::{
    ErrorRecord, Event, EventType, JobStatus, Narration, PaperJob, PaperOutcome, PaperRecord,
    PaperSummary, RunSummary, Stage, StageArtifact,
};

use super::error::{CollaboratorError, RunError, StageFailure};
use super::event_store::EventStore;
use super::executor::StageExecutor;
use super::narration::split_into_chunks;
use super::rate_limiter::RateLimiter;
use super::retry::{RetryDecision, RetryPolicy};

/// Pseudo-stage under which a failed already-published check is recorded
pub const CHECK_PUBLISHED: &str = "check_published";

const SUMMARY_FILE: &str = "summary.json";

/// Everything a run produced: the summary plus the terminal jobs
#[derive(Debug)]
pub struct RunReport {
    pub summary: RunSummary,
    pub jobs: Vec<PaperJob>,
}

/// Main pipeline orchestrator
pub struct Orchestrator {
    config: Arc<Config>,
    collaborators: Collaborators,
    limiter: Arc<RateLimiter>,
}

impl Orchestrator {
    pub fn new(config: Arc<Config>, collaborators: Collaborators, limiter: Arc<RateLimiter>) -> Self {
        Self {
            config,
            collaborators,
            limiter,
        }
    }

    /// Execute one run and return its summary
    pub async fn run(&self) -> Result<RunSummary, RunError> {
        Ok(self.run_report().await?.summary)
    }

    /// Execute one run, keeping the terminal jobs alongside the summary
    #[instrument(skip(self), fields(run_id = tracing::field::Empty))]
    pub async fn run_report(&self) -> Result<RunReport, RunError> {
        let run_id = Uuid::new_v4();
        tracing::Span::current().record("run_id", tracing::field::display(run_id));
        info!(%run_id, "Starting run");

        let pipeline = &self.config.pipeline;
        let policy = pipeline.retry_policy().map_err(RunError::Config)?;
        let timeouts = pipeline.stage_timeouts().map_err(RunError::Config)?;

        let store = Arc::new(
            EventStore::open(&self.config.runs_dir(), run_id)
                .await
                .map_err(RunError::EventStore)?,
        );
        let mut summary = RunSummary::new(run_id);

        record(
            &store,
            run_event(run_id, EventType::RunStarted, JobStatus::Running)
                .with_payload(format!("Run started for {:?}", self.config.pubmed.specialties)),
        )
        .await;

        let candidates = match self.fetch_candidates(&policy).await {
            Ok(candidates) => candidates,
            Err(err) => {
                error!(%run_id, error = %err, "Run failed before admitting any jobs");
                summary.run_error = Some(err.to_string());
                summary.finalize();

                record(
                    &store,
                    run_event(run_id, EventType::RunFailed, JobStatus::Failed)
                        .with_error(err.to_string())
                        .with_payload("Candidate fetch failed"),
                )
                .await;
                write_summary(&store, &summary).await;
                return Err(err);
            }
        };

        summary.candidates = candidates.len();
        record(
            &store,
            run_event(run_id, EventType::CandidatesFetched, JobStatus::Running)
                .with_payload(format!("{} candidate papers", candidates.len())),
        )
        .await;
        info!(%run_id, candidates = candidates.len(), "Fetched candidates");

        let mut finished = Vec::new();
        let mut pending = Vec::new();
        for paper in candidates {
            let job = PaperJob::new(paper);
            match self.check_published(&policy, &job).await {
                Ok(true) => finished.push(skip_job(&store, job).await),
                Ok(false) => pending.push(job),
                Err(exhausted) => finished.push(fail_publish_check(&store, job, exhausted).await),
            }
        }

        let runner = Arc::new(JobRunner {
            config: self.config.clone(),
            collaborators: self.collaborators.clone(),
            executor: StageExecutor::new(self.limiter.clone(), policy, timeouts, store.clone()),
            style: StyleConfig::from_config(&self.config),
            store: store.clone(),
        });

        let expected: Vec<PaperRecord> = pending.iter().map(|job| job.paper().clone()).collect();
        let semaphore = Arc::new(Semaphore::new(pipeline.max_concurrent_papers.max(1)));
        let mut workers = JoinSet::new();

        for job in pending {
            // A slot frees up only when a running job terminates
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!(error = %e, "Worker pool closed");
                    break;
                }
            };
            let runner = runner.clone();
            workers.spawn(async move {
                let _permit = permit;
                runner.drive(job).await
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(job) => finished.push(job),
                Err(e) => error!(error = %e, "Worker task failed"),
            }
        }

        // Every admitted paper needs a terminal outcome
        for paper in expected {
            if finished.iter().any(|job| job.id() == paper.id) {
                continue;
            }
            let mut job = PaperJob::new(paper);
            if job.fail("worker task aborted").is_ok() {
                emit_job_failed(&store, &job, None, "worker task aborted").await;
            }
            finished.push(job);
        }

        for job in &finished {
            summary.record(PaperOutcome::from_job(job));
        }
        summary.finalize();

        record(
            &store,
            run_event(run_id, EventType::RunCompleted, JobStatus::Succeeded).with_payload(format!(
                "{} succeeded, {} failed, {} skipped",
                summary.succeeded, summary.failed, summary.skipped
            )),
        )
        .await;
        write_summary(&store, &summary).await;

        info!(
            %run_id,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            "Run completed"
        );

        Ok(RunReport {
            summary,
            jobs: finished,
        })
    }

    async fn fetch_candidates(&self, policy: &RetryPolicy) -> Result<Vec<PaperRecord>, RunError> {
        let pubmed = &self.config.pubmed;
        let query = CandidateQuery {
            specialties: pubmed.specialties.clone(),
            days: pubmed.time_period_days,
            max_results: pubmed.max_papers_per_run,
        };
        let source = &*self.collaborators.source;
        let query = &query;

        // The source paces and times each of its requests itself
        let papers = call_with_retry(
            policy,
            self.config.pipeline.max_retries,
            None,
            "list_recent_candidates",
            move || async move { source.list_recent_candidates(query).await },
        )
        .await
        .map_err(|exhausted| RunError::CandidateSource {
            attempts: exhausted.attempts(),
            error: exhausted.last,
        })?;

        Ok(dedupe_candidates(papers, pubmed.max_papers_per_run))
    }

    async fn check_published(
        &self,
        policy: &RetryPolicy,
        job: &PaperJob,
    ) -> Result<bool, Exhausted> {
        let source = &*self.collaborators.source;
        let paper_id = job.id();

        call_with_retry(
            policy,
            self.config.pipeline.max_retries,
            Some(self.config.pipeline.fetch_timeout()),
            CHECK_PUBLISHED,
            move || async move { source.is_already_published(paper_id).await },
        )
        .await
    }
}

/// Errors of a call that ran out of attempts, oldest first
struct Exhausted {
    earlier: Vec<CollaboratorError>,
    last: CollaboratorError,
}

impl Exhausted {
    fn attempts(&self) -> u32 {
        self.earlier.len() as u32 + 1
    }
}

/// Retry a call that is not a pipeline stage under the same policy.
/// With `timeout` unset the call must bound itself.
async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    max_attempts: u32,
    timeout: Option<std::time::Duration>,
    operation: &str,
    mut call: F,
) -> Result<T, Exhausted>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CollaboratorError>>,
{
    let mut earlier = Vec::new();
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, call())
                .await
                .unwrap_or(Err(CollaboratorError::Timeout(timeout))),
            None => call().await,
        };
        let error = match result {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        match policy.decide_with_budget(max_attempts, attempt, error.kind(), error.retry_after()) {
            RetryDecision::RetryAfter(delay) => {
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Call failed, retrying"
                );
                earlier.push(error);
                tokio::time::sleep(delay).await;
            }
            RetryDecision::GiveUp => return Err(Exhausted { earlier, last: error }),
        }
    }
}

/// Drop duplicate ids (first wins) and cap the list
fn dedupe_candidates(papers: Vec<PaperRecord>, max: usize) -> Vec<PaperRecord> {
    let mut seen = HashSet::new();
    papers
        .into_iter()
        .filter(|paper| seen.insert(paper.id.clone()))
        .take(max)
        .collect()
}

// ============================================================================
// Per-job driver
// ============================================================================

/// State shared by every worker of one run
struct JobRunner {
    config: Arc<Config>,
    collaborators: Collaborators,
    executor: StageExecutor,
    store: Arc<EventStore>,
    style: StyleConfig,
}

impl JobRunner {
    /// Drive one job to a terminal state
    async fn drive(&self, mut job: PaperJob) -> PaperJob {
        if let Err(e) = job.admit() {
            error!(paper_id = %job.id(), error = %e, "Cannot admit job");
            return job;
        }

        record(
            &self.store,
            job_event(&self.store, &job, EventType::JobAdmitted)
                .with_payload(format!("Admitted '{}'", job.paper().title)),
        )
        .await;
        info!(paper_id = %job.id(), title = %job.paper().title, "Processing paper");

        let paper_dir = match self.store.ensure_paper_dir(job.id()).await {
            Ok(dir) => dir,
            Err(e) => {
                warn!(paper_id = %job.id(), error = %e, "Failed to create paper directory");
                self.store.paper_dir(job.id())
            }
        };
        if let Err(e) = self.store.write_paper_json(job.id(), "paper_data.json", job.paper()).await {
            warn!(paper_id = %job.id(), error = %e, "Failed to write paper data");
        }

        for stage in Stage::SEQUENCE {
            if let Err(failure) = self.run_stage(stage, &mut job, &paper_dir).await {
                self.fail(&mut job, &failure).await;
                return job;
            }

            if let Err(e) = job.advance() {
                let failure = StageFailure::Permanent {
                    stage,
                    attempt: job.attempts(stage),
                    error: CollaboratorError::permanent(e.to_string()),
                };
                self.fail(&mut job, &failure).await;
                return job;
            }
        }

        let outcome = PaperOutcome::from_job(&job);
        if let Err(e) = self.store.write_paper_json(job.id(), "result.json", &outcome).await {
            warn!(paper_id = %job.id(), error = %e, "Failed to write result");
        }

        record(
            &self.store,
            job_event(&self.store, &job, EventType::JobSucceeded).with_payload(job.paper().title.clone()),
        )
        .await;
        info!(paper_id = %job.id(), "Paper published");
        job
    }

    async fn fail(&self, job: &mut PaperJob, failure: &StageFailure) {
        let cause = failure.to_string();
        if let Err(e) = job.fail_at(failure.stage().name(), cause.as_str()) {
            error!(paper_id = %job.id(), error = %e, "Cannot fail job");
            return;
        }

        let error = failure.error();
        let report = json!({
            "paper_id": job.id(),
            "title": job.paper().title,
            "stage": failure.stage().name(),
            "error": cause,
            "error_code": error.code(),
            "error_kind": error.kind(),
            "error_history": job.error_history(),
            "failed_at": job.finished_at(),
        });
        if let Err(e) = self.store.write_paper_json(job.id(), "error.json", &report).await {
            warn!(paper_id = %job.id(), error = %e, "Failed to write error report");
        }

        emit_job_failed(&self.store, job, Some(failure.stage().name()), &cause).await;
        error!(paper_id = %job.id(), stage = %failure.stage(), error = %cause, "Paper failed");
    }

    /// Run one stage through the executor with the inputs its collaborator needs
    async fn run_stage(
        &self,
        stage: Stage,
        job: &mut PaperJob,
        paper_dir: &Path,
    ) -> Result<(), StageFailure> {
        let c = &self.collaborators;
        let config = &self.config;
        let paper_owned = job.paper().clone();
        let paper = &paper_owned;

        match stage {
            Stage::Extract => {
                let extractor = &*c.extractor;
                self.executor
                    .execute(stage, job, move || async move {
                        extractor
                            .extract(paper, paper_dir)
                            .await
                            .map(StageArtifact::Extracted)
                    })
                    .await?;
            }

            Stage::Summarize => {
                let text_owned = input(job, stage, Stage::Extract, |a| {
                    a.as_extracted().map(|content| content.text.clone())
                })?;
                let text = text_owned.as_str();
                let constraints = &SummaryConstraints {
                    min_length: config.summarization.min_length,
                    max_length: config.summarization.max_length,
                    key_takeaways: config.summarization.key_takeaways,
                };
                let summarizer = &*c.summarizer;
                self.executor
                    .execute(stage, job, move || async move {
                        summarizer
                            .summarize(text, constraints)
                            .await
                            .map(StageArtifact::Summary)
                    })
                    .await?;
            }

            Stage::SelectFigures => {
                let figures_owned = input(job, stage, Stage::Extract, |a| {
                    a.as_extracted().map(|content| content.figures.clone())
                })?;
                let figures = figures_owned.as_slice();
                let selection = &config.figure_selection;
                let selector = &*c.figure_selector;
                self.executor
                    .execute(stage, job, move || async move {
                        selector
                            .select_figures(figures, selection.max_figures, selection.min_quality_score)
                            .await
                            .map(StageArtifact::Figures)
                    })
                    .await?;
            }

            Stage::SynthesizeNarration => {
                let script = input(job, stage, Stage::Summarize, |a| {
                    a.as_summary().map(PaperSummary::narration_script)
                })?;
                let chunks_owned = split_into_chunks(&script, c.narrator.max_chunk_length());
                let chunks = chunks_owned.as_slice();
                let script_chars = script.chars().count();
                let voice = &VoiceConfig {
                    voice: config.tts.voice.clone(),
                    rate: config.tts.rate,
                };
                let audio_dir = &paper_dir.join("audio");
                let narrator = &*c.narrator;

                self.executor
                    .execute_paced(stage, job, move |pacer| async move {
                        if chunks.is_empty() {
                            return Err(CollaboratorError::InvalidInput("empty narration script".into()));
                        }
                        let mut segments = Vec::with_capacity(chunks.len());
                        for (i, chunk) in chunks.iter().enumerate() {
                            let output = audio_dir.join(format!("narration_{:03}.wav", i + 1));
                            segments.push(pacer.call(narrator.synthesize(chunk, voice, &output)).await?);
                        }
                        Ok(StageArtifact::Narration(Narration {
                            segments,
                            script_chars,
                        }))
                    })
                    .await?;
            }

            Stage::RenderVideo => {
                let summary_owned = input(job, stage, Stage::Summarize, |a| a.as_summary().cloned())?;
                let figures_owned = input(job, stage, Stage::SelectFigures, |a| {
                    a.as_figures().map(<[_]>::to_vec)
                })?;
                let narration_owned = input(job, stage, Stage::SynthesizeNarration, |a| {
                    a.as_narration().map(|n| n.segments.clone())
                })?;
                let output_owned: PathBuf = paper_dir.join("video.mp4");

                let request = RenderRequest {
                    paper,
                    summary: &summary_owned,
                    figures: &figures_owned,
                    narration: &narration_owned,
                    style: &self.style,
                    output: &output_owned,
                };
                let renderer = &*c.renderer;
                debug!(paper_id = %paper.id, renderer = renderer.name(), "Rendering video");

                self.executor
                    .execute(stage, job, move || async move {
                        renderer.render(&request).await.map(StageArtifact::Video)
                    })
                    .await?;
            }

            Stage::Upload => {
                let video_owned = input(job, stage, Stage::RenderVideo, |a| a.as_video().cloned())?;
                let summary_owned = input(job, stage, Stage::Summarize, |a| a.as_summary().cloned())?;
                let video = &video_owned;
                let metadata = &build_metadata(config, paper, &summary_owned);
                let publisher = &*c.publisher;

                self.executor
                    .execute(stage, job, move || async move {
                        publisher
                            .upload(video, metadata)
                            .await
                            .map(StageArtifact::Published)
                    })
                    .await?;
            }

            Stage::RecordPublished => {
                let published_owned =
                    input(job, stage, Stage::Upload, |a| a.as_published().cloned())?;
                let video_owned = input(job, stage, Stage::RenderVideo, |a| a.as_video().cloned())?;
                let published = &published_owned;
                let video = &video_owned;
                let source = &*c.source;
                let object_store = c.object_store.as_deref();

                self.executor
                    .execute(stage, job, move || async move {
                        // Archive first: the ledger entry marks the paper done
                        let storage_url = match object_store {
                            Some(store) => Some(store.store(paper, video).await?),
                            None => None,
                        };
                        source.mark_published(&paper.id, published).await?;
                        Ok(StageArtifact::Recorded {
                            recorded_at: Utc::now(),
                            storage_url,
                        })
                    })
                    .await?;
            }
        }

        Ok(())
    }
}

/// Pull a stage input out of an earlier stage's artifact
fn input<T>(
    job: &PaperJob,
    stage: Stage,
    from: Stage,
    pick: impl FnOnce(&StageArtifact) -> Option<T>,
) -> Result<T, StageFailure> {
    job.artifact(from).and_then(pick).ok_or_else(|| StageFailure::Permanent {
        stage,
        attempt: job.attempts(stage),
        error: CollaboratorError::permanent(format!(
            "stage '{}' needs the output of '{}'",
            stage, from
        )),
    })
}

/// Upload metadata for a paper: title capped at 100 characters, description
/// from the configured template, configured tags plus the paper's specialty
pub fn build_metadata(config: &Config, paper: &PaperRecord, summary: &PaperSummary) -> VideoMetadata {
    let youtube = &config.youtube;

    let takeaways = summary
        .key_takeaways
        .iter()
        .map(|takeaway| format!("• {}", takeaway))
        .collect::<Vec<_>>()
        .join("\n");

    let description = youtube
        .description_template
        .replace("{title}", &paper.title)
        .replace("{authors}", &paper.author_line())
        .replace("{journal}", &paper.journal)
        .replace("{publication_date}", &paper.publication_date)
        .replace("{doi}", paper.doi.as_deref().unwrap_or("N/A"))
        .replace("{key_takeaways}", &takeaways);

    let mut tags = youtube.tags.clone();
    if !paper.specialty.is_empty() && !tags.contains(&paper.specialty) {
        tags.push(paper.specialty.clone());
    }

    VideoMetadata {
        title: crate::adapters::truncate(&paper.title, 100).to_string(),
        description,
        tags,
        privacy: youtube.privacy_status.clone(),
        category_id: youtube.category_id.clone(),
    }
}

// ============================================================================
// Events and persisted reports
// ============================================================================

fn run_event(run_id: Uuid, event_type: EventType, status: JobStatus) -> Event {
    Event::new(
        run_id,
        None,
        event_type,
        format!("{}:{:?}", run_id, event_type),
        String::new(),
        status,
    )
}

fn job_event(store: &EventStore, job: &PaperJob, event_type: EventType) -> Event {
    Event::new(
        store.run_id(),
        Some(job.id().to_string()),
        event_type,
        format!("{}:{}:{:?}", store.run_id(), job.id(), event_type),
        String::new(),
        job.status(),
    )
}

/// The log is diagnostic; a failed append never fails the run
async fn record(store: &EventStore, event: Event) {
    if let Err(e) = store.append(&event).await {
        warn!(error = %e, event_type = ?event.event_type, "Failed to append event");
    }
}

async fn write_summary(store: &EventStore, summary: &RunSummary) {
    if let Err(e) = store.write_run_json(SUMMARY_FILE, summary).await {
        warn!(error = %e, "Failed to write run summary");
    }
}

async fn emit_job_failed(store: &EventStore, job: &PaperJob, stage: Option<&str>, cause: &str) {
    let mut event = job_event(store, job, EventType::JobFailed)
        .with_error(cause.to_string())
        .with_payload(job.paper().title.clone());
    if let Some(stage) = stage {
        event = event.with_stage(stage);
    }
    record(store, event).await;
}

async fn skip_job(store: &EventStore, mut job: PaperJob) -> PaperJob {
    if let Err(e) = job.skip("already published") {
        warn!(paper_id = %job.id(), error = %e, "Cannot skip job");
        return job;
    }
    record(
        store,
        job_event(store, &job, EventType::JobSkipped).with_payload(job.paper().title.clone()),
    )
    .await;
    info!(paper_id = %job.id(), "Already published, skipping");
    job
}

async fn fail_publish_check(store: &EventStore, mut job: PaperJob, exhausted: Exhausted) -> PaperJob {
    let attempts = exhausted.attempts();
    let Exhausted { earlier, last: err } = exhausted;
    for (i, error) in earlier.iter().chain(std::iter::once(&err)).enumerate() {
        job.record_error(ErrorRecord {
            stage: CHECK_PUBLISHED.to_string(),
            attempt: i as u32 + 1,
            kind: error.kind(),
            code: error.code().to_string(),
            message: error.to_string(),
            at: Utc::now(),
        });
    }

    let cause = format!("publish check failed after {} attempts: {}", attempts, err);
    if let Err(e) = job.fail_at(CHECK_PUBLISHED, cause.as_str()) {
        warn!(paper_id = %job.id(), error = %e, "Cannot fail job");
        return job;
    }

    record(
        store,
        job_event(store, &job, EventType::StageFailed)
            .with_stage(CHECK_PUBLISHED)
            .with_attempt(attempts)
            .with_error_kind(err.kind())
            .with_error_code(err.code())
            .with_error(err.to_string())
            .with_payload(cause.clone()),
    )
    .await;
    emit_job_failed(store, &job, Some(CHECK_PUBLISHED), &cause).await;
    error!(paper_id = %job.id(), error = %err, "Publish check failed");
    job
}

/// Summary of a finished run: the stored `summary.json`, else a replay of its log
pub async fn load_run_summary(runs_dir: &Path, run_id: Uuid) -> Result<Option<RunSummary>> {
    let store = EventStore::open_existing(runs_dir, run_id).await?;
    if let Some(summary) = store.read_run_json::<RunSummary>(SUMMARY_FILE).await? {
        return Ok(Some(summary));
    }
    let events = store.replay().await?;
    Ok(RunSummary::from_events(&events))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> PaperSummary {
        PaperSummary {
            summary_text: "Text.".into(),
            key_takeaways: vec!["First".into(), "Second".into()],
        }
    }

    #[test]
    fn test_metadata() {
        let mut paper = PaperRecord::new("1", "x".repeat(150)).with_specialty("cardiology");
        paper.journal = "Lancet".into();
        let config = Config::default();

        let metadata = build_metadata(&config, &paper, &summary());

        assert_eq!(metadata.title.chars().count(), 100);
        assert!(metadata.description.contains("Journal: Lancet"));
        assert!(metadata.description.contains("DOI: N/A"));
        assert!(metadata.description.contains("• First\n• Second"));
        assert!(metadata.tags.contains(&"cardiology".to_string()));
        assert_eq!(metadata.privacy, "private");
    }

    #[test]
    fn test_dedupe_candidates() {
        let papers = vec![
            PaperRecord::new("1", "a"),
            PaperRecord::new("2", "b"),
            PaperRecord::new("1", "a again"),
            PaperRecord::new("3", "c"),
        ];

        let kept = dedupe_candidates(papers, 2);
        let ids: Vec<&str> = kept.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
    }
}
