//! Adapter interfaces for external systems.
//!
//! Each pipeline stage calls exactly one collaborator through one of the
//! traits below. Implementations report failures as `CollaboratorError`,
//! already classified as transient or permanent.

pub mod fabric;
pub mod figures;
pub mod ledger;
pub mod narrator;
pub mod pdf;
pub mod process;
pub mod pubmed;
pub mod renderer;
pub mod storage;
pub mod youtube;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;

use crate::config::Config;
use crate::core::error::CollaboratorError;
use crate::core::rate_limiter::RateLimiter;
use crate::domain::{AudioRef, ExtractedContent, Figure, PaperRecord, PaperSummary, PublishedRef, VideoRef};

pub use fabric::FabricSummarizer;
pub use figures::ScoringFigureSelector;
pub use ledger::PublishLedger;
pub use narrator::CommandNarrator;
pub use pdf::PdfExtractor;
pub use pubmed::PubMedSource;
pub use renderer::{renderer_from_config, FallbackRenderer, RunwayRenderer, TemplateRenderer};
pub use storage::{object_store_from_config, GcsObjectStore, LocalObjectStore};
pub use youtube::{DryRunPublisher, YouTubePublisher};

/// What to ask the paper source for
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateQuery {
    pub specialties: Vec<String>,
    /// Look-back window in days
    pub days: u32,
    /// Maximum papers returned overall
    pub max_results: usize,
}

/// Lists candidate papers and remembers which were published
#[async_trait]
pub trait PaperSource: Send + Sync {
    async fn list_recent_candidates(
        &self,
        query: &CandidateQuery,
    ) -> Result<Vec<PaperRecord>, CollaboratorError>;

    async fn is_already_published(&self, paper_id: &str) -> Result<bool, CollaboratorError>;

    async fn mark_published(
        &self,
        paper_id: &str,
        published: &PublishedRef,
    ) -> Result<(), CollaboratorError>;
}

/// Pulls text and figures out of a paper
#[async_trait]
pub trait ContentExtractor: Send + Sync {
    /// `work_dir` receives any files written (downloaded PDF, figure images)
    async fn extract(
        &self,
        paper: &PaperRecord,
        work_dir: &Path,
    ) -> Result<ExtractedContent, CollaboratorError>;
}

/// Length bounds passed to the summarizer, in words
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryConstraints {
    pub min_length: usize,
    pub max_length: usize,
    pub key_takeaways: usize,
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        text: &str,
        constraints: &SummaryConstraints,
    ) -> Result<PaperSummary, CollaboratorError>;
}

#[async_trait]
pub trait FigureSelector: Send + Sync {
    async fn select_figures(
        &self,
        figures: &[Figure],
        max_count: usize,
        min_quality_score: f64,
    ) -> Result<Vec<Figure>, CollaboratorError>;
}

/// Voice settings for the narrator
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceConfig {
    pub voice: String,
    /// Words per minute
    pub rate: u32,
}

/// Text-to-speech. Each call accepts at most `max_chunk_length` characters.
#[async_trait]
pub trait Narrator: Send + Sync {
    fn max_chunk_length(&self) -> usize;

    async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceConfig,
        output: &Path,
    ) -> Result<AudioRef, CollaboratorError>;
}

/// Visual settings shared by every renderer
#[derive(Debug, Clone, PartialEq)]
pub struct StyleConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub slide_duration: Duration,
    pub background_color: String,
    /// Generative renderers only
    pub scene_count: u32,
    /// Generative renderers only
    pub style_preset: String,
}

impl StyleConfig {
    pub fn from_config(config: &Config) -> Self {
        let video = &config.video_generation;
        Self {
            width: video.width,
            height: video.height,
            fps: video.fps,
            slide_duration: Duration::from_secs_f64(video.slide_duration_seconds.max(0.1)),
            background_color: video.background_color.clone(),
            scene_count: video.runway.scene_count,
            style_preset: video.runway.style_preset.clone(),
        }
    }
}

/// Everything a renderer needs for one video
#[derive(Debug, Clone, Copy)]
pub struct RenderRequest<'a> {
    pub paper: &'a PaperRecord,
    pub summary: &'a PaperSummary,
    pub figures: &'a [Figure],
    pub narration: &'a [AudioRef],
    pub style: &'a StyleConfig,
    pub output: &'a Path,
}

/// Turns a summary, figures and narration into a video file
#[async_trait]
pub trait VideoRenderer: Send + Sync {
    fn name(&self) -> &str;

    async fn render(&self, request: &RenderRequest<'_>) -> Result<VideoRef, CollaboratorError>;
}

/// Upload metadata
#[derive(Debug, Clone, PartialEq)]
pub struct VideoMetadata {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub privacy: String,
    pub category_id: String,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn upload(
        &self,
        video: &VideoRef,
        metadata: &VideoMetadata,
    ) -> Result<PublishedRef, CollaboratorError>;
}

/// Archives a finished video outside the run directory
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn name(&self) -> &str;

    /// Store `video` for `paper` and return the URL of the stored copy
    async fn store(&self, paper: &PaperRecord, video: &VideoRef) -> Result<String, CollaboratorError>;
}

/// The full set of collaborators one run uses
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn PaperSource>,
    pub extractor: Arc<dyn ContentExtractor>,
    pub summarizer: Arc<dyn Summarizer>,
    pub figure_selector: Arc<dyn FigureSelector>,
    pub narrator: Arc<dyn Narrator>,
    pub renderer: Arc<dyn VideoRenderer>,
    pub publisher: Arc<dyn Publisher>,
    /// Video archive; `None` when archiving is disabled
    pub object_store: Option<Arc<dyn ObjectStore>>,
}

impl Collaborators {
    /// Build the production collaborators described by `config`
    pub fn from_config(config: &Config, limiter: Arc<RateLimiter>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("medibrief/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let ledger = PublishLedger::new(config.ledger_path());
        let source = PubMedSource::new(http.clone(), config.pubmed.clone(), limiter, ledger)
            .with_api_key(config.api_keys.pubmed.clone())
            .with_request_timeout(config.pipeline.fetch_timeout());

        let publisher: Arc<dyn Publisher> = if config.youtube.dry_run {
            Arc::new(DryRunPublisher::new())
        } else {
            let token = config.api_keys.youtube.clone().unwrap_or_default();
            Arc::new(YouTubePublisher::new(http.clone(), config.youtube.upload_url.clone(), token))
        };

        let summarizer = match config.summarization.fabric_binary {
            Some(ref binary) => FabricSummarizer::with_binary_path(binary, &config.summarization.pattern),
            None => FabricSummarizer::new(&config.summarization.pattern),
        };

        Ok(Self {
            source: Arc::new(source),
            extractor: Arc::new(PdfExtractor::new(http.clone(), config.pdf_processing.clone())),
            summarizer: Arc::new(summarizer),
            figure_selector: Arc::new(ScoringFigureSelector::new(
                config.figure_selection.min_figure_size,
            )),
            narrator: Arc::new(CommandNarrator::new(&config.tts)),
            renderer: renderer_from_config(config, http.clone()),
            publisher,
            object_store: object_store_from_config(
                &config.cloud_storage,
                config.archive_dir(),
                config.api_keys.gcs.clone(),
                http,
            ),
        })
    }
}

/// Map a non-success HTTP status onto the error taxonomy
pub fn classify_status(status: StatusCode, headers: &HeaderMap, body: &str) -> CollaboratorError {
    let message = format!("HTTP {}: {}", status.as_u16(), truncate(body.trim(), 300));

    match status.as_u16() {
        429 => CollaboratorError::RateLimited {
            message,
            retry_after: retry_after(headers),
        },
        408 | 500..=599 => CollaboratorError::Unavailable(message),
        401 | 403 => CollaboratorError::Auth(message),
        _ => CollaboratorError::InvalidInput(message),
    }
}

/// Transport-level failures are worth retrying
pub fn classify_transport(err: reqwest::Error) -> CollaboratorError {
    if let Some(status) = err.status() {
        return classify_status(status, &HeaderMap::new(), &err.to_string());
    }
    CollaboratorError::Unavailable(err.to_string())
}

/// `Retry-After` in seconds (HTTP-date values are ignored)
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Send a request and fail on non-success statuses
pub(crate) async fn send_checked(
    request: reqwest::RequestBuilder,
) -> Result<reqwest::Response, CollaboratorError> {
    let response = request.send().await.map_err(classify_transport)?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let headers = response.headers().clone();
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, &headers, &body))
}

/// Truncate to at most `max` characters
pub(crate) fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
