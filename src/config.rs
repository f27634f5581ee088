//! Configuration for medibrief runs.
//!
//! Configuration sources (highest priority first):
//! 1. Command-line overrides (`--specialty`, `--days`, `--max-papers`, `--dry-run`)
//! 2. Environment variables (MEDIBRIEF_HOME, MEDIBRIEF_<SERVICE>_API_KEY)
//! 3. Config file (`--config`, or .medibrief/config.yaml in the current
//!    directory or a parent)
//! 4. Defaults (~/.medibrief)
//!
//! The loaded value is immutable; callers share it as `Arc<Config>`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::rate_limiter::rate_interval;
use crate::core::retry::{RetryDelay, RetryPolicy};
use crate::domain::Stage;

/// Directory searched for in the current directory and its parents
pub const CONFIG_DIR: &str = ".medibrief";

/// File name inside [`CONFIG_DIR`]
pub const CONFIG_FILE: &str = "config.yaml";

/// Services whose API key may come from `MEDIBRIEF_<SERVICE>_API_KEY`
pub const KEYED_SERVICES: [&str; 4] = ["pubmed", "runway", "youtube", "gcs"];

/// Full configuration (matches the YAML structure)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub api_keys: ApiKeys,
    pub pubmed: PubMedConfig,
    pub pipeline: PipelineConfig,
    /// Service key -> requests per second
    pub rate_limits: RateLimits,
    pub summarization: SummarizationConfig,
    pub figure_selection: FigureSelectionConfig,
    pub pdf_processing: PdfProcessingConfig,
    pub tts: TtsConfig,
    pub video_generation: VideoGenerationConfig,
    pub youtube: YouTubeConfig,
    pub cloud_storage: CloudStorageConfig,
    pub logging: LoggingConfig,

    /// Where this configuration was read from
    #[serde(skip)]
    pub config_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// State directory (runs, publish ledger); relative to the config file
    pub home: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiKeys {
    pub pubmed: Option<String>,
    pub runway: Option<String>,
    /// OAuth access token for the YouTube Data API
    pub youtube: Option<String>,
    /// OAuth access token for Cloud Storage
    pub gcs: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PubMedConfig {
    pub base_url: String,
    /// One search per specialty; results are merged
    pub specialties: Vec<String>,
    pub time_period_days: u32,
    pub max_results_per_query: usize,
    pub max_papers_per_run: usize,
    /// Identifies the client to NCBI
    pub tool: String,
    pub email: Option<String>,
}

impl Default for PubMedConfig {
    fn default() -> Self {
        Self {
            base_url: "https://eutils.ncbi.nlm.nih.gov/entrez/eutils".to_string(),
            specialties: vec!["cardiology".to_string()],
            time_period_days: 7,
            max_results_per_query: 10,
            max_papers_per_run: 10,
            tool: "medibrief".to_string(),
            email: None,
        }
    }
}

/// Retry delay growth
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_concurrent_papers: usize,
    /// Attempts per stage, including the first
    pub max_retries: u32,
    pub retry_delay_seconds: f64,
    pub backoff: Backoff,
    pub backoff_multiplier: f64,
    pub max_delay_seconds: f64,
    /// Stage name -> timeout in seconds
    pub stage_timeouts: HashMap<String, u64>,
    /// Stage name -> attempts
    pub stage_max_attempts: HashMap<String, u32>,
    /// Timeout for each candidate fetch attempt
    pub fetch_timeout_seconds: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_papers: 5,
            max_retries: 3,
            retry_delay_seconds: 30.0,
            backoff: Backoff::Fixed,
            backoff_multiplier: 2.0,
            max_delay_seconds: 300.0,
            stage_timeouts: HashMap::new(),
            stage_max_attempts: HashMap::new(),
            fetch_timeout_seconds: 120,
        }
    }
}

impl PipelineConfig {
    /// Build the retry policy shared by every stage
    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        let delay_ms = (self.retry_delay_seconds.max(0.0) * 1000.0) as u64;
        let delay = match self.backoff {
            Backoff::Fixed => RetryDelay::Fixed { delay_ms },
            Backoff::Exponential => RetryDelay::Exponential {
                initial_delay_ms: delay_ms,
                multiplier: self.backoff_multiplier,
                max_delay_ms: (self.max_delay_seconds.max(0.0) * 1000.0) as u64,
            },
        };

        let mut policy = RetryPolicy::new(self.max_retries, delay);
        for (name, attempts) in &self.stage_max_attempts {
            let stage: Stage = name
                .parse()
                .map_err(|e: String| anyhow::anyhow!("pipeline.stage_max_attempts: {}", e))?;
            policy = policy.with_stage_limit(stage, *attempts);
        }
        Ok(policy)
    }

    /// Per-stage timeouts, defaults filled in for stages not configured
    pub fn stage_timeouts(&self) -> Result<HashMap<Stage, Duration>> {
        let mut timeouts: HashMap<Stage, Duration> = Stage::SEQUENCE
            .iter()
            .map(|stage| (*stage, stage.default_timeout()))
            .collect();

        for (name, secs) in &self.stage_timeouts {
            let stage: Stage = name
                .parse()
                .map_err(|e: String| anyhow::anyhow!("pipeline.stage_timeouts: {}", e))?;
            if *secs == 0 {
                anyhow::bail!("pipeline.stage_timeouts.{} must be at least 1 second", name);
            }
            timeouts.insert(stage, Duration::from_secs(*secs));
        }
        Ok(timeouts)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds)
    }
}

/// Requests per second, keyed by service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RateLimits(pub HashMap<String, f64>);

impl Default for RateLimits {
    fn default() -> Self {
        let mut limits = HashMap::new();
        limits.insert("pubmed".to_string(), 3.0);
        limits.insert("renderer".to_string(), 1.0);
        Self(limits)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizationConfig {
    /// Fabric binary; when unset `fabric-ai` then `fabric` are tried
    pub fabric_binary: Option<String>,
    pub pattern: String,
    /// Summary length bounds in words
    pub min_length: usize,
    pub max_length: usize,
    pub key_takeaways: usize,
}

impl Default for SummarizationConfig {
    fn default() -> Self {
        Self {
            fabric_binary: None,
            pattern: "summarize".to_string(),
            min_length: 150,
            max_length: 300,
            key_takeaways: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FigureSelectionConfig {
    pub max_figures: usize,
    pub min_quality_score: f64,
    /// Images at least this wide and tall earn the size bonus
    pub min_figure_size: u32,
}

impl Default for FigureSelectionConfig {
    fn default() -> Self {
        Self {
            max_figures: 3,
            min_quality_score: 0.5,
            min_figure_size: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PdfProcessingConfig {
    /// Use the abstract when the PDF cannot be parsed
    pub fallback_to_abstract: bool,
    pub max_pdf_bytes: u64,
    /// Line prefixes that mark figure captions
    pub caption_keywords: Vec<String>,
}

impl Default for PdfProcessingConfig {
    fn default() -> Self {
        Self {
            fallback_to_abstract: true,
            max_pdf_bytes: 50 * 1024 * 1024,
            caption_keywords: vec!["Figure".to_string(), "Fig.".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    pub program: String,
    /// Argument template; `{output}`, `{voice}` and `{rate}` are substituted
    pub args: Vec<String>,
    pub voice: String,
    /// Words per minute
    pub rate: u32,
    /// Longest text passed to one synthesizer call
    pub max_chunk_length: usize,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            program: "espeak-ng".to_string(),
            args: ["-v", "{voice}", "-s", "{rate}", "-w", "{output}", "--stdin"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            voice: "en-us".to_string(),
            rate: 165,
            max_chunk_length: 4500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoGenerationConfig {
    /// "moviepy" (alias "template") or "runway"
    pub method: String,
    pub ffmpeg_binary: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub slide_duration_seconds: f64,
    pub background_color: String,
    pub runway: RunwayConfig,
}

impl Default for VideoGenerationConfig {
    fn default() -> Self {
        Self {
            method: "moviepy".to_string(),
            ffmpeg_binary: "ffmpeg".to_string(),
            width: 1920,
            height: 1080,
            fps: 30,
            slide_duration_seconds: 5.0,
            background_color: "black".to_string(),
            runway: RunwayConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunwayConfig {
    pub base_url: String,
    pub model: String,
    pub scene_count: u32,
    pub style_preset: String,
    /// Seconds of footage per scene
    pub scene_duration: u32,
    pub poll_interval_seconds: u64,
    /// Render with the template renderer when Runway is unavailable
    pub fallback_to_template: bool,
}

impl Default for RunwayConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.dev.runwayml.com/v1".to_string(),
            model: "gen3a_turbo".to_string(),
            scene_count: 3,
            style_preset: "medical-explainer".to_string(),
            scene_duration: 5,
            poll_interval_seconds: 5,
            fallback_to_template: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct YouTubeConfig {
    pub dry_run: bool,
    pub upload_url: String,
    pub privacy_status: String,
    pub category_id: String,
    pub tags: Vec<String>,
    /// Placeholders: {title} {authors} {journal} {publication_date} {doi} {key_takeaways}
    pub description_template: String,
}

impl Default for YouTubeConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            upload_url: "https://www.googleapis.com/upload/youtube/v3/videos".to_string(),
            privacy_status: "private".to_string(),
            category_id: "28".to_string(),
            tags: vec!["medicine".to_string(), "research".to_string()],
            description_template: DEFAULT_DESCRIPTION_TEMPLATE.to_string(),
        }
    }
}

/// Where finished videos are archived besides the publisher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudStorageConfig {
    pub enabled: bool,
    /// "local" or "gcs"
    pub backend: String,
    /// Bucket for the gcs backend
    pub bucket: String,
    pub base_url: String,
    /// Archive root for the local backend; defaults to `<home>/archive`
    pub archive_dir: Option<PathBuf>,
}

impl Default for CloudStorageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: "local".to_string(),
            bucket: String::new(),
            base_url: "https://storage.googleapis.com".to_string(),
            archive_dir: None,
        }
    }
}

pub const DEFAULT_DESCRIPTION_TEMPLATE: &str = "{title}

Authors: {authors}
Journal: {journal}
Published: {publication_date}
DOI: {doi}

Key takeaways:
{key_takeaways}
";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Also write logs to this file
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Overrides taken from the command line
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub specialty: Option<String>,
    pub days: Option<u32>,
    pub max_papers: Option<usize>,
    pub dry_run: bool,
}

impl Config {
    /// Load from `explicit`, or the discovered config file, or defaults.
    /// Environment overrides are applied and the result validated.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => find_config_file(),
        };

        let mut config = match path {
            Some(ref path) => Self::from_file(path)?,
            None => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file; relative paths resolve against its directory
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config = Self::from_yaml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        let base = path.parent().unwrap_or(Path::new("."));
        if let Some(ref home) = config.paths.home {
            config.paths.home = Some(resolve_path(base, home));
        }
        if let Some(ref file) = config.logging.file {
            config.logging.file = Some(resolve_path(base, file));
        }
        if let Some(ref dir) = config.cloud_storage.archive_dir {
            config.cloud_storage.archive_dir = Some(resolve_path(base, dir));
        }
        config.config_file = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        // An empty file is a valid (all-defaults) configuration
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply environment overrides through `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(home) = lookup("MEDIBRIEF_HOME").filter(|v| !v.is_empty()) {
            self.paths.home = Some(PathBuf::from(home));
        }

        for service in KEYED_SERVICES {
            let slot = match service {
                "pubmed" => &mut self.api_keys.pubmed,
                "runway" => &mut self.api_keys.runway,
                "youtube" => &mut self.api_keys.youtube,
                _ => &mut self.api_keys.gcs,
            };
            if slot.as_deref().map_or(true, str::is_empty) {
                let var = format!("MEDIBRIEF_{}_API_KEY", service.to_uppercase());
                if let Some(value) = lookup(&var).filter(|v| !v.is_empty()) {
                    *slot = Some(value);
                }
            }
        }
    }

    pub fn apply_overrides(&mut self, overrides: &RunOverrides) {
        if let Some(ref specialty) = overrides.specialty {
            self.pubmed.specialties = vec![specialty.clone()];
        }
        if let Some(days) = overrides.days {
            self.pubmed.time_period_days = days;
        }
        if let Some(max) = overrides.max_papers {
            self.pubmed.max_papers_per_run = max;
        }
        if overrides.dry_run {
            self.youtube.dry_run = true;
        }
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let pipeline = &self.pipeline;
        if pipeline.max_concurrent_papers == 0 {
            anyhow::bail!("pipeline.max_concurrent_papers must be at least 1");
        }
        if pipeline.max_retries == 0 {
            anyhow::bail!("pipeline.max_retries must be at least 1");
        }
        if pipeline.retry_delay_seconds < 0.0 || !pipeline.retry_delay_seconds.is_finite() {
            anyhow::bail!("pipeline.retry_delay_seconds must be a non-negative number");
        }
        if pipeline.backoff == Backoff::Exponential && pipeline.backoff_multiplier < 1.0 {
            anyhow::bail!("pipeline.backoff_multiplier must be at least 1.0");
        }
        if pipeline.fetch_timeout_seconds == 0 {
            anyhow::bail!("pipeline.fetch_timeout_seconds must be at least 1");
        }
        pipeline.retry_policy()?;
        pipeline.stage_timeouts()?;

        for (service, rate) in &self.rate_limits.0 {
            if !rate.is_finite() || *rate <= 0.0 {
                anyhow::bail!("rate_limits.{} must be positive (got {})", service, rate);
            }
            if rate_interval(*rate).is_none() {
                anyhow::bail!("rate_limits.{} is too small to pace calls (got {})", service, rate);
            }
        }

        let summarization = &self.summarization;
        if summarization.min_length > summarization.max_length {
            anyhow::bail!(
                "summarization.min_length ({}) exceeds max_length ({})",
                summarization.min_length,
                summarization.max_length
            );
        }

        let score = self.figure_selection.min_quality_score;
        if !(0.0..=1.0).contains(&score) {
            anyhow::bail!("figure_selection.min_quality_score must be in [0, 1] (got {})", score);
        }

        if self.tts.max_chunk_length == 0 {
            anyhow::bail!("tts.max_chunk_length must be at least 1");
        }

        match self.video_generation.method.as_str() {
            "moviepy" | "template" | "runway" => {}
            other => anyhow::bail!(
                "video_generation.method must be 'moviepy', 'template' or 'runway' (got '{}')",
                other
            ),
        }

        let storage = &self.cloud_storage;
        match storage.backend.as_str() {
            "local" => {}
            "gcs" if storage.enabled && storage.bucket.trim().is_empty() => {
                anyhow::bail!("cloud_storage.bucket is required for the gcs backend")
            }
            "gcs" => {}
            other => anyhow::bail!(
                "cloud_storage.backend must be 'local' or 'gcs' (got '{}')",
                other
            ),
        }

        Ok(())
    }

    /// State directory
    pub fn home(&self) -> PathBuf {
        self.paths.home.clone().unwrap_or_else(default_home)
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.home().join("runs")
    }

    /// Append-only record of published papers
    pub fn ledger_path(&self) -> PathBuf {
        self.home().join("published.jsonl")
    }

    /// Root of the local video archive
    pub fn archive_dir(&self) -> PathBuf {
        self.cloud_storage
            .archive_dir
            .clone()
            .unwrap_or_else(|| self.home().join("archive"))
    }

    pub fn is_template_renderer(&self) -> bool {
        matches!(self.video_generation.method.as_str(), "moviepy" | "template")
    }

    /// Copy with every API key masked, for display
    pub fn redacted(&self) -> Self {
        let mask = |key: &Option<String>| key.as_ref().map(|_| "********".to_string());
        let mut copy = self.clone();
        copy.api_keys = ApiKeys {
            pubmed: mask(&self.api_keys.pubmed),
            runway: mask(&self.api_keys.runway),
            youtube: mask(&self.api_keys.youtube),
            gcs: mask(&self.api_keys.gcs),
        };
        copy
    }
}

fn default_home() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(CONFIG_DIR))
        .unwrap_or_else(|| PathBuf::from(CONFIG_DIR))
}

/// Find config file by searching current directory and parents
pub fn find_config_file() -> Option<PathBuf> {
    let current = std::env::current_dir().ok()?;
    find_config_file_from(&current)
}

fn find_config_file_from(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Resolve a path that may be relative to the config file's directory
fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Written by `medibrief init`
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# medibrief configuration
#
# API keys may also come from MEDIBRIEF_PUBMED_API_KEY,
# MEDIBRIEF_RUNWAY_API_KEY, MEDIBRIEF_YOUTUBE_API_KEY and
# MEDIBRIEF_GCS_API_KEY.

paths:
  # State directory (runs, publish ledger), relative to this file
  home: ./

api_keys:
  pubmed: ""
  runway: ""
  youtube: ""
  gcs: ""

pubmed:
  specialties: [cardiology]
  time_period_days: 7
  max_results_per_query: 10
  max_papers_per_run: 10

pipeline:
  max_concurrent_papers: 5
  max_retries: 3
  retry_delay_seconds: 30
  backoff: fixed          # fixed | exponential
  stage_timeouts:
    render_video: 1800
    upload: 1800

rate_limits:
  pubmed: 3.0
  renderer: 1.0

summarization:
  pattern: summarize
  min_length: 150
  max_length: 300
  key_takeaways: 3

figure_selection:
  max_figures: 3
  min_quality_score: 0.5

pdf_processing:
  fallback_to_abstract: true

tts:
  program: espeak-ng
  voice: en-us
  rate: 165
  max_chunk_length: 4500

video_generation:
  method: moviepy         # moviepy | runway
  runway:
    scene_count: 3
    fallback_to_template: true

youtube:
  dry_run: true
  privacy_status: private
  tags: [medicine, research]

cloud_storage:
  enabled: false
  backend: local          # local | gcs
  bucket: ""

logging:
  level: info
"#;
