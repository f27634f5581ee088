//! Per-run event log and output files.
//!
//! Each event is one JSON object per line in `events.jsonl`. One store
//! exists per run and is shared by every worker, so appends go through an
//! async mutex.
//!
//! Layout:
//! ```text
//! runs/<run_id>/events.jsonl
//! runs/<run_id>/summary.json
//! runs/<run_id>/papers/<paper_id>/<stage>.json
//! runs/<run_id>/papers/<paper_id>/{paper_data,result,error}.json
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::{Event, Stage, StageArtifact};

/// Event log and file layout of one run
pub struct EventStore {
    run_id: Uuid,

    /// `<runs_dir>/<run_id>`
    run_dir: PathBuf,
    events_path: PathBuf,

    /// Per-paper output directories live here
    papers_dir: PathBuf,

    /// Serializes appends from concurrent workers
    write_lock: Mutex<()>,
}

impl EventStore {
    /// Create or open the event store for a run under `runs_dir`
    pub async fn open(runs_dir: &Path, run_id: Uuid) -> Result<Self> {
        let run_dir = runs_dir.join(run_id.to_string());
        let papers_dir = run_dir.join("papers");

        fs::create_dir_all(&papers_dir)
            .await
            .with_context(|| format!("Failed to create run directory: {}", papers_dir.display()))?;

        Ok(Self::at(run_id, run_dir))
    }

    /// Open the store of a run that must already exist
    pub async fn open_existing(runs_dir: &Path, run_id: Uuid) -> Result<Self> {
        let run_dir = runs_dir.join(run_id.to_string());
        if !fs::try_exists(&run_dir).await.unwrap_or(false) {
            anyhow::bail!("Run {} not found in {}", run_id, runs_dir.display());
        }
        Ok(Self::at(run_id, run_dir))
    }

    fn at(run_id: Uuid, run_dir: PathBuf) -> Self {
        Self {
            run_id,
            events_path: run_dir.join("events.jsonl"),
            papers_dir: run_dir.join("papers"),
            run_dir,
            write_lock: Mutex::new(()),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Output directory for one paper (not created)
    pub fn paper_dir(&self, paper_id: &str) -> PathBuf {
        self.papers_dir.join(sanitize_id(paper_id))
    }

    /// Output directory for one paper, created if missing
    pub async fn ensure_paper_dir(&self, paper_id: &str) -> Result<PathBuf> {
        let dir = self.paper_dir(paper_id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create paper directory: {}", dir.display()))?;
        Ok(dir)
    }

    /// Append one event as a single line
    pub async fn append(&self, event: &Event) -> Result<()> {
        let json = serde_json::to_string(event).context("Failed to serialize event")?;

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to open events file: {}",
                    self.events_path.display()
                )
            })?;

        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Every event of the run, in append order
    pub async fn replay(&self) -> Result<Vec<Event>> {
        if !fs::try_exists(&self.events_path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Events concerning one paper, in order
    pub async fn paper_events(&self, paper_id: &str) -> Result<Vec<Event>> {
        let events = self.replay().await?;
        Ok(events
            .into_iter()
            .filter(|e| e.paper_id.as_deref() == Some(paper_id))
            .collect())
    }

    /// Persist a stage artifact as `<paper>/<stage>.json`
    pub async fn store_artifact(&self, paper_id: &str, artifact: &StageArtifact) -> Result<PathBuf> {
        let name = format!("{}.json", artifact.stage().name());
        self.write_paper_json(paper_id, &name, artifact).await
    }

    /// Load a stage artifact written by `store_artifact`
    pub async fn load_artifact(&self, paper_id: &str, stage: Stage) -> Result<Option<StageArtifact>> {
        let path = self.paper_dir(paper_id).join(format!("{}.json", stage.name()));
        read_json(&path).await
    }

    /// Write `<paper>/<name>` as pretty JSON
    pub async fn write_paper_json<T: Serialize + ?Sized>(
        &self,
        paper_id: &str,
        name: &str,
        value: &T,
    ) -> Result<PathBuf> {
        let dir = self.ensure_paper_dir(paper_id).await?;
        write_json(&dir.join(name), value).await
    }

    /// Write `<run>/<name>` as pretty JSON
    pub async fn write_run_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<PathBuf> {
        write_json(&self.run_dir.join(name), value).await
    }

    /// Read `<run>/<name>` if present
    pub async fn read_run_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        read_json(&self.run_dir.join(name)).await
    }

    /// Ids of the runs under `runs_dir`; other directories are ignored
    pub async fn list_runs(runs_dir: &Path) -> Result<Vec<Uuid>> {
        if !fs::try_exists(runs_dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(runs_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(uuid) = Uuid::parse_str(name) {
                        runs.push(uuid);
                    }
                }
            }
        }

        Ok(runs)
    }
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<PathBuf> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
    fs::write(path, json)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path.to_path_buf())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !fs::try_exists(path).await.unwrap_or(false) {
        return Ok(None);
    }
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(value))
}

/// Paper ids come from external sources; keep them filesystem-safe
fn sanitize_id(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "unknown".to_string()
    } else {
        cleaned
    }
}

/// Generate an idempotency key for one stage of one paper
pub fn generate_idempotency_key(run_id: Uuid, paper_id: &str, stage: &str, input: &str) -> String {
    let input_hash = hash_input(input);
    format!("{}:{}:{}:{}", run_id, paper_id, stage, input_hash)
}

/// First 8 bytes of the SHA-256 of `input`, hex encoded
pub fn hash_input(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}
