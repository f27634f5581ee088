//! Scripted in-memory collaborators for orchestrator tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use uuid::Uuid;

use medibrief::adapters::{
    CandidateQuery, Collaborators, ContentExtractor, FigureSelector, Narrator, ObjectStore,
    PaperSource, Publisher, RenderRequest, SummaryConstraints, Summarizer, VideoMetadata,
    VideoRenderer, VoiceConfig,
};
use medibrief::config::Config;
use medibrief::core::{CollaboratorError, Orchestrator, RateLimiter};
use medibrief::domain::{
    AudioRef, ExtractedContent, Figure, PaperRecord, PaperSummary, PublishedRef, VideoRef,
};

/// Errors to return for a paper before the call starts succeeding
#[derive(Default)]
pub struct FailurePlan {
    plans: Mutex<HashMap<String, (u32, CollaboratorError)>>,
}

impl FailurePlan {
    /// Fail the first `times` calls for `paper_id`
    pub fn fail(&self, paper_id: &str, times: u32, error: CollaboratorError) {
        self.plans
            .lock()
            .unwrap()
            .insert(paper_id.to_string(), (times, error));
    }

    pub fn always(&self, paper_id: &str, error: CollaboratorError) {
        self.fail(paper_id, u32::MAX, error);
    }

    fn next(&self, paper_id: &str) -> Result<(), CollaboratorError> {
        let mut plans = self.plans.lock().unwrap();
        match plans.get_mut(paper_id) {
            Some((remaining, error)) if *remaining > 0 => {
                *remaining -= 1;
                Err(error.clone())
            }
            _ => Ok(()),
        }
    }
}

/// Tracks how many calls are in flight at once
#[derive(Default)]
pub struct ConcurrencyGauge {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl ConcurrencyGauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn max_seen(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

pub fn paper(id: &str) -> PaperRecord {
    PaperRecord::new(id, format!("Paper {}", id))
        .with_abstract(format!("Abstract of paper {}. It has two sentences.", id))
        .with_specialty("cardiology")
}

// ============================================================================
// Collaborators
// ============================================================================

#[derive(Default)]
pub struct ScriptedSource {
    pub papers: Mutex<Vec<PaperRecord>>,
    published: Mutex<HashSet<String>>,
    /// Candidate fetch failures, returned in order before the list
    fetch_failures: Mutex<Vec<CollaboratorError>>,
    pub fetch_calls: AtomicU32,
    pub check_failures: FailurePlan,
    /// Rate-limited requests made by each candidate fetch
    pacing: Mutex<Option<(Arc<RateLimiter>, u32)>>,
}

impl ScriptedSource {
    pub fn new(papers: Vec<PaperRecord>) -> Self {
        Self {
            papers: Mutex::new(papers),
            ..Default::default()
        }
    }

    pub fn mark(&self, paper_id: &str) {
        self.published.lock().unwrap().insert(paper_id.to_string());
    }

    pub fn is_marked(&self, paper_id: &str) -> bool {
        self.published.lock().unwrap().contains(paper_id)
    }

    pub fn fail_fetch(&self, errors: Vec<CollaboratorError>) {
        *self.fetch_failures.lock().unwrap() = errors;
    }

    /// Make each fetch send `requests` calls through the `pubmed` gate
    pub fn pace_requests(&self, limiter: Arc<RateLimiter>, requests: u32) {
        *self.pacing.lock().unwrap() = Some((limiter, requests));
    }
}

#[async_trait]
impl PaperSource for ScriptedSource {
    async fn list_recent_candidates(
        &self,
        query: &CandidateQuery,
    ) -> Result<Vec<PaperRecord>, CollaboratorError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut failures = self.fetch_failures.lock().unwrap();
            if !failures.is_empty() {
                return Err(failures.remove(0));
            }
        }
        let pacing = self.pacing.lock().unwrap().clone();
        if let Some((limiter, requests)) = pacing {
            for _ in 0..requests {
                limiter.acquire("pubmed").await;
            }
        }
        let papers = self.papers.lock().unwrap();
        Ok(papers.iter().take(query.max_results).cloned().collect())
    }

    async fn is_already_published(&self, paper_id: &str) -> Result<bool, CollaboratorError> {
        self.check_failures.next(paper_id)?;
        Ok(self.is_marked(paper_id))
    }

    async fn mark_published(
        &self,
        paper_id: &str,
        published: &PublishedRef,
    ) -> Result<(), CollaboratorError> {
        if !published.dry_run {
            self.mark(paper_id);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct ScriptedExtractor {
    pub gauge: ConcurrencyGauge,
    pub delay: Duration,
    pub failures: FailurePlan,
}

#[async_trait]
impl ContentExtractor for ScriptedExtractor {
    async fn extract(
        &self,
        paper: &PaperRecord,
        work_dir: &Path,
    ) -> Result<ExtractedContent, CollaboratorError> {
        self.gauge.enter();
        tokio::time::sleep(self.delay).await;
        self.gauge.exit();
        self.failures.next(&paper.id)?;

        Ok(ExtractedContent {
            text: paper.abstract_text.clone(),
            figures: vec![Figure {
                id: "p1-img1".into(),
                page: 1,
                caption: "Figure 1. Survival curve".into(),
                image_path: work_dir.join("figures/p1-img1.jpg"),
                width: 800,
                height: 600,
                quality_score: None,
            }],
            abstract_only: true,
        })
    }
}

pub struct ScriptedSummarizer;

#[async_trait]
impl Summarizer for ScriptedSummarizer {
    async fn summarize(
        &self,
        text: &str,
        _constraints: &SummaryConstraints,
    ) -> Result<PaperSummary, CollaboratorError> {
        Ok(PaperSummary {
            summary_text: format!("Summary: {}", text),
            key_takeaways: vec!["It worked".into()],
        })
    }
}

pub struct PassThroughSelector;

#[async_trait]
impl FigureSelector for PassThroughSelector {
    async fn select_figures(
        &self,
        figures: &[Figure],
        max_count: usize,
        _min_quality_score: f64,
    ) -> Result<Vec<Figure>, CollaboratorError> {
        Ok(figures.iter().take(max_count).cloned().collect())
    }
}

pub struct SilentNarrator {
    pub max_chunk: usize,
    pub calls: AtomicU32,
}

#[async_trait]
impl Narrator for SilentNarrator {
    fn max_chunk_length(&self) -> usize {
        self.max_chunk
    }

    async fn synthesize(
        &self,
        text: &str,
        _voice: &VoiceConfig,
        output: &Path,
    ) -> Result<AudioRef, CollaboratorError> {
        assert!(text.chars().count() <= self.max_chunk);
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(AudioRef(output.to_path_buf()))
    }
}

#[derive(Default)]
pub struct ScriptedRenderer {
    pub failures: FailurePlan,
    pub calls: AtomicU32,
}

#[async_trait]
impl VideoRenderer for ScriptedRenderer {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn render(&self, request: &RenderRequest<'_>) -> Result<VideoRef, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.failures.next(&request.paper.id)?;
        Ok(VideoRef(request.output.to_path_buf()))
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    pub uploads: Mutex<Vec<VideoMetadata>>,
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn upload(
        &self,
        _video: &VideoRef,
        metadata: &VideoMetadata,
    ) -> Result<PublishedRef, CollaboratorError> {
        self.uploads.lock().unwrap().push(metadata.clone());
        let id = Uuid::new_v4().to_string();
        Ok(PublishedRef::new(id.clone(), Some(format!("https://youtu.be/{}", id))))
    }
}

/// Object store that remembers what it archived
#[derive(Default)]
pub struct RecordingArchive {
    pub stored: Mutex<Vec<String>>,
    pub failures: FailurePlan,
}

#[async_trait]
impl ObjectStore for RecordingArchive {
    fn name(&self) -> &str {
        "recording"
    }

    async fn store(&self, paper: &PaperRecord, _video: &VideoRef) -> Result<String, CollaboratorError> {
        self.failures.next(&paper.id)?;
        let url = format!("memory://{}/{}", paper.specialty, paper.id);
        self.stored.lock().unwrap().push(paper.id.clone());
        Ok(url)
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub temp: TempDir,
    pub config: Config,
    pub source: Arc<ScriptedSource>,
    pub extractor: Arc<ScriptedExtractor>,
    pub narrator: Arc<SilentNarrator>,
    pub renderer: Arc<ScriptedRenderer>,
    pub publisher: Arc<RecordingPublisher>,
    pub archive: Option<Arc<RecordingArchive>>,
}

impl Harness {
    pub fn new(papers: Vec<PaperRecord>) -> Self {
        let temp = TempDir::new().unwrap();

        let mut config = Config::default();
        config.paths.home = Some(temp.path().to_path_buf());
        config.pubmed.specialties = vec!["cardiology".into()];
        config.pipeline.max_concurrent_papers = 2;
        config.pipeline.max_retries = 3;
        config.pipeline.retry_delay_seconds = 0.0;
        config.rate_limits.0.clear();

        Self {
            temp,
            config,
            source: Arc::new(ScriptedSource::new(papers)),
            extractor: Arc::new(ScriptedExtractor::default()),
            narrator: Arc::new(SilentNarrator {
                max_chunk: 40,
                calls: AtomicU32::new(0),
            }),
            renderer: Arc::new(ScriptedRenderer::default()),
            publisher: Arc::new(RecordingPublisher::default()),
            archive: None,
        }
    }

    /// Archive finished videos into a [`RecordingArchive`]
    pub fn with_archive(mut self) -> Self {
        self.archive = Some(Arc::new(RecordingArchive::default()));
        self
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            source: self.source.clone(),
            extractor: self.extractor.clone(),
            summarizer: Arc::new(ScriptedSummarizer),
            figure_selector: Arc::new(PassThroughSelector),
            narrator: self.narrator.clone(),
            renderer: self.renderer.clone(),
            publisher: self.publisher.clone(),
            object_store: self
                .archive
                .clone()
                .map(|archive| archive as Arc<dyn ObjectStore>),
        }
    }

    pub fn orchestrator(&self) -> Orchestrator {
        self.orchestrator_with(Arc::new(RateLimiter::unlimited()))
    }

    pub fn orchestrator_with(&self, limiter: Arc<RateLimiter>) -> Orchestrator {
        Orchestrator::new(Arc::new(self.config.clone()), self.collaborators(), limiter)
    }
}
