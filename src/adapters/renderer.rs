//! Video renderers.
//!
//! Two interchangeable variants sit behind [`VideoRenderer`]:
//! - [`TemplateRenderer`]: an ffmpeg slideshow of the selected figures (or
//!   a plain background) under the narration
//! - [`RunwayRenderer`]: generative scenes from the Runway API, stitched
//!   under the narration with the same ffmpeg path
//!
//! [`FallbackRenderer`] puts the template variant behind the generative one
//! for when Runway is not available.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::{Config, RunwayConfig};
use crate::core::error::CollaboratorError;
use crate::domain::{AudioRef, PaperSummary, VideoRef};

use super::process::{describe_failure, run_command};
use super::{send_checked, RenderRequest, StyleConfig, VideoRenderer};

/// Pick the renderer `video_generation.method` asks for
pub fn renderer_from_config(config: &Config, client: reqwest::Client) -> Arc<dyn VideoRenderer> {
    let template = TemplateRenderer::new(&config.video_generation.ffmpeg_binary);
    if config.is_template_renderer() {
        return Arc::new(template);
    }

    let runway = RunwayRenderer::new(
        client,
        config.video_generation.runway.clone(),
        config.api_keys.runway.clone(),
        template.clone(),
    );

    if config.video_generation.runway.fallback_to_template {
        Arc::new(FallbackRenderer::new(Arc::new(runway), Arc::new(template)))
    } else {
        Arc::new(runway)
    }
}

// ============================================================================
// Template (ffmpeg) renderer
// ============================================================================

#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    ffmpeg_binary: String,
}

impl TemplateRenderer {
    pub fn new(ffmpeg_binary: &str) -> Self {
        Self {
            ffmpeg_binary: ffmpeg_binary.to_string(),
        }
    }

    /// Run ffmpeg and confirm it produced `output`
    async fn run_ffmpeg(&self, args: &[String], output: &Path) -> Result<VideoRef, CollaboratorError> {
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                CollaboratorError::Unavailable(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let result = run_command(&self.ffmpeg_binary, args, None).await?;
        if !result.status.success() {
            let message = describe_failure(&self.ffmpeg_binary, &result);
            // Killed by a signal rather than exiting with an error
            return Err(if result.status.code().is_none() {
                CollaboratorError::Unavailable(message)
            } else {
                CollaboratorError::permanent(message)
            });
        }

        if !fs::try_exists(output).await.unwrap_or(false) {
            return Err(CollaboratorError::permanent(format!(
                "ffmpeg wrote no video to {}",
                output.display()
            )));
        }
        Ok(VideoRef(output.to_path_buf()))
    }

    /// Stitch pre-rendered clips under the narration
    pub async fn stitch(
        &self,
        clips: &[PathBuf],
        narration: &[AudioRef],
        style: &StyleConfig,
        output: &Path,
    ) -> Result<VideoRef, CollaboratorError> {
        let args = clip_args(clips, narration, style, output)?;
        self.run_ffmpeg(&args, output).await
    }
}

#[async_trait]
impl VideoRenderer for TemplateRenderer {
    fn name(&self) -> &str {
        "template"
    }

    async fn render(&self, request: &RenderRequest<'_>) -> Result<VideoRef, CollaboratorError> {
        let args = slideshow_args(request)?;
        debug!(paper_id = %request.paper.id, figures = request.figures.len(), "Rendering slideshow");
        self.run_ffmpeg(&args, request.output).await
    }
}

fn scale_filter(style: &StyleConfig) -> String {
    format!(
        "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2:color={bg},setsar=1,fps={fps}",
        w = style.width,
        h = style.height,
        bg = style.background_color,
        fps = style.fps
    )
}

/// Audio inputs, concatenated into `[aout]`
fn audio_graph(narration: &[AudioRef], first_input: usize) -> String {
    let labels: String = (0..narration.len())
        .map(|i| format!("[{}:a]", first_input + i))
        .collect();
    format!("{}concat=n={}:v=0:a=1[aout]", labels, narration.len())
}

fn encode_args(filter: String, output: &Path) -> Vec<String> {
    [
        "-filter_complex",
        filter.as_str(),
        "-map",
        "[vout]",
        "-map",
        "[aout]",
        "-c:v",
        "libx264",
        "-pix_fmt",
        "yuv420p",
        "-c:a",
        "aac",
        "-shortest",
    ]
    .iter()
    .map(|s| s.to_string())
    .chain([output.display().to_string()])
    .collect()
}

/// ffmpeg arguments for a figure slideshow (or plain background) under the narration
pub fn slideshow_args(request: &RenderRequest<'_>) -> Result<Vec<String>, CollaboratorError> {
    if request.narration.is_empty() {
        return Err(CollaboratorError::InvalidInput("no narration to render".into()));
    }

    let style = request.style;
    let mut args = vec!["-y".to_string()];
    let video_inputs;
    let mut filter = String::new();

    if request.figures.is_empty() {
        args.extend([
            "-f".to_string(),
            "lavfi".to_string(),
            "-i".to_string(),
            format!(
                "color=c={}:s={}x{}:r={}",
                style.background_color, style.width, style.height, style.fps
            ),
        ]);
        video_inputs = 1;
        filter.push_str("[0:v]setsar=1[vout];");
    } else {
        let slide = format!("{:.3}", style.slide_duration.as_secs_f64());
        let last = request.figures.len() - 1;

        for (i, figure) in request.figures.iter().enumerate() {
            args.extend(["-loop".to_string(), "1".to_string()]);
            // The last slide holds until the narration ends
            if i != last {
                args.extend(["-t".to_string(), slide.clone()]);
            }
            args.extend(["-i".to_string(), figure.image_path.display().to_string()]);
            filter.push_str(&format!("[{}:v]{}[v{}];", i, scale_filter(style), i));
        }

        video_inputs = request.figures.len();
        let labels: String = (0..video_inputs).map(|i| format!("[v{}]", i)).collect();
        filter.push_str(&format!("{}concat=n={}:v=1:a=0[vout];", labels, video_inputs));
    }

    for segment in request.narration {
        args.extend(["-i".to_string(), segment.0.display().to_string()]);
    }
    filter.push_str(&audio_graph(request.narration, video_inputs));

    args.extend(encode_args(filter, request.output));
    Ok(args)
}

/// ffmpeg arguments that concatenate `clips` and hold the last frame until the narration ends
pub fn clip_args(
    clips: &[PathBuf],
    narration: &[AudioRef],
    style: &StyleConfig,
    output: &Path,
) -> Result<Vec<String>, CollaboratorError> {
    if clips.is_empty() || narration.is_empty() {
        return Err(CollaboratorError::InvalidInput("nothing to stitch".into()));
    }

    let mut args = vec!["-y".to_string()];
    let mut filter = String::new();

    for (i, clip) in clips.iter().enumerate() {
        args.extend(["-i".to_string(), clip.display().to_string()]);
        filter.push_str(&format!("[{}:v]{}[v{}];", i, scale_filter(style), i));
    }
    for segment in narration {
        args.extend(["-i".to_string(), segment.0.display().to_string()]);
    }

    let labels: String = (0..clips.len()).map(|i| format!("[v{}]", i)).collect();
    filter.push_str(&format!(
        "{}concat=n={}:v=1:a=0,tpad=stop_mode=clone:stop=-1[vout];",
        labels,
        clips.len()
    ));
    filter.push_str(&audio_graph(narration, clips.len()));

    args.extend(encode_args(filter, output));
    Ok(args)
}

// ============================================================================
// Runway (generative) renderer
// ============================================================================

const RUNWAY_VERSION: &str = "2024-11-06";

#[derive(Debug, Deserialize)]
struct TaskCreated {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TaskStatus {
    status: String,
    #[serde(default)]
    output: Vec<String>,
    #[serde(default)]
    failure: Option<String>,
}

pub struct RunwayRenderer {
    client: reqwest::Client,
    config: RunwayConfig,
    api_key: Option<String>,
    stitcher: TemplateRenderer,
}

impl RunwayRenderer {
    pub fn new(
        client: reqwest::Client,
        config: RunwayConfig,
        api_key: Option<String>,
        stitcher: TemplateRenderer,
    ) -> Self {
        Self {
            client,
            config,
            api_key: api_key.filter(|k| !k.is_empty()),
            stitcher,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn submit(&self, key: &str, prompt: &str, style: &StyleConfig) -> Result<String, CollaboratorError> {
        let body = json!({
            "model": self.config.model,
            "promptText": prompt,
            "duration": self.config.scene_duration,
            "ratio": format!("{}:{}", style.width, style.height),
        });

        let request = self
            .client
            .post(self.url("text_to_video"))
            .bearer_auth(key)
            .header("X-Runway-Version", RUNWAY_VERSION)
            .json(&body);

        let created: TaskCreated = send_checked(request)
            .await?
            .json()
            .await
            .map_err(|e| CollaboratorError::InvalidInput(format!("unexpected Runway response: {}", e)))?;
        Ok(created.id)
    }

    /// Poll a task until it finishes; the stage timeout bounds the wait
    async fn wait_for(&self, key: &str, task_id: &str) -> Result<String, CollaboratorError> {
        let interval = Duration::from_secs(self.config.poll_interval_seconds.max(1));

        loop {
            let request = self
                .client
                .get(self.url(&format!("tasks/{}", task_id)))
                .bearer_auth(key)
                .header("X-Runway-Version", RUNWAY_VERSION);

            let status: TaskStatus = send_checked(request)
                .await?
                .json()
                .await
                .map_err(|e| CollaboratorError::InvalidInput(format!("unexpected Runway task: {}", e)))?;

            match status.status.as_str() {
                "SUCCEEDED" => {
                    return status.output.into_iter().next().ok_or_else(|| {
                        CollaboratorError::Model(format!("task {} succeeded without output", task_id))
                    })
                }
                "FAILED" | "CANCELLED" => {
                    return Err(CollaboratorError::Model(format!(
                        "task {} failed: {}",
                        task_id,
                        status.failure.unwrap_or_default()
                    )))
                }
                other => debug!(task_id, status = other, "Runway task pending"),
            }

            tokio::time::sleep(interval).await;
        }
    }

    async fn download(&self, url: &str, path: &Path) -> Result<(), CollaboratorError> {
        let bytes = send_checked(self.client.get(url))
            .await?
            .bytes()
            .await
            .map_err(super::classify_transport)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                CollaboratorError::Unavailable(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        fs::write(path, &bytes).await.map_err(|e| {
            CollaboratorError::Unavailable(format!("cannot write {}: {}", path.display(), e))
        })
    }
}

#[async_trait]
impl VideoRenderer for RunwayRenderer {
    fn name(&self) -> &str {
        "runway"
    }

    async fn render(&self, request: &RenderRequest<'_>) -> Result<VideoRef, CollaboratorError> {
        let Some(ref key) = self.api_key else {
            return Err(CollaboratorError::BackendMissing("no Runway API key configured".into()));
        };

        let style = request.style;
        let prompts = scene_prompts(request.summary, style.scene_count, &style.style_preset);
        let clip_dir = request
            .output
            .parent()
            .unwrap_or(Path::new("."))
            .join("scenes");

        let mut clips = Vec::with_capacity(prompts.len());
        for (i, prompt) in prompts.iter().enumerate() {
            let task_id = self.submit(key, prompt, style).await?;
            info!(paper_id = %request.paper.id, scene = i + 1, %task_id, "Runway scene submitted");

            let url = self.wait_for(key, &task_id).await?;
            let path = clip_dir.join(format!("scene_{:02}.mp4", i + 1));
            self.download(&url, &path).await?;
            clips.push(path);
        }

        self.stitcher
            .stitch(&clips, request.narration, style, request.output)
            .await
    }
}

/// One prompt per scene, each covering a consecutive share of the summary's sentences
pub fn scene_prompts(summary: &PaperSummary, scene_count: u32, style_preset: &str) -> Vec<String> {
    let sentences: Vec<&str> = summary
        .summary_text
        .split_inclusive(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    let scenes = (scene_count.max(1) as usize).min(sentences.len().max(1));
    let per_scene = sentences.len().div_ceil(scenes).max(1);

    let mut prompts: Vec<String> = sentences
        .chunks(per_scene)
        .map(|chunk| {
            let text = chunk.join(" ");
            let prompt = format!("{} style medical explainer scene: {}", style_preset, text);
            super::truncate(&prompt, 500).to_string()
        })
        .collect();

    if prompts.is_empty() {
        prompts.push(format!("{} style medical explainer scene", style_preset));
    }
    prompts
}

// ============================================================================
// Fallback
// ============================================================================

/// Renders with `primary`, switching to `fallback` when the primary backend
/// is missing or refuses the request outright
pub struct FallbackRenderer {
    primary: Arc<dyn VideoRenderer>,
    fallback: Arc<dyn VideoRenderer>,
}

impl FallbackRenderer {
    pub fn new(primary: Arc<dyn VideoRenderer>, fallback: Arc<dyn VideoRenderer>) -> Self {
        Self { primary, fallback }
    }
}

fn should_fall_back(err: &CollaboratorError) -> bool {
    matches!(
        err,
        CollaboratorError::BackendMissing(_)
            | CollaboratorError::Unavailable(_)
            | CollaboratorError::Auth(_)
            | CollaboratorError::QuotaExhausted(_)
            | CollaboratorError::InvalidInput(_)
    )
}

#[async_trait]
impl VideoRenderer for FallbackRenderer {
    fn name(&self) -> &str {
        self.primary.name()
    }

    async fn render(&self, request: &RenderRequest<'_>) -> Result<VideoRef, CollaboratorError> {
        match self.primary.render(request).await {
            Err(e) if should_fall_back(&e) => {
                warn!(
                    primary = self.primary.name(),
                    fallback = self.fallback.name(),
                    error = %e,
                    "Renderer unavailable, using fallback"
                );
                self.fallback.render(request).await
            }
            other => other,
        }
    }
}
