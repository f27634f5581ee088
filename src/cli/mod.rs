//! Command-line interface for medibrief.
//!
//! Provides commands for running the pipeline, checking the status of a
//! run, listing runs, showing the configuration and initializing a state
//! directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::adapters::Collaborators;
use crate::config::{Config, RunOverrides, CONFIG_DIR, CONFIG_FILE, DEFAULT_CONFIG_TEMPLATE};
use crate::core::{load_run_summary, EventStore, Orchestrator, RateLimiter};
use crate::domain::{JobStatus, RunSummary};

/// External programs the default collaborators shell out to
const REQUIRED_TOOLS: [&str; 3] = ["ffmpeg", "espeak-ng", "fabric"];

/// medibrief - Turn recent medical papers into narrated summary videos
#[derive(Parser, Debug)]
#[command(name = "medibrief")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (default: .medibrief/config.yaml in this or a parent directory)
    #[arg(short, long, global = true, env = "MEDIBRIEF_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the pipeline once
    Run {
        /// Only this specialty (replaces the configured list)
        #[arg(short, long)]
        specialty: Option<String>,

        /// Look-back window in days
        #[arg(short, long)]
        days: Option<u32>,

        /// Maximum papers to process
        #[arg(short, long)]
        max_papers: Option<usize>,

        /// Render everything but do not upload
        #[arg(long)]
        dry_run: bool,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show resolved configuration (secrets redacted)
    Config,

    /// Create the state directory and a default config file
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let config_path = self.config.as_deref();
        match self.command {
            Commands::Run {
                specialty,
                days,
                max_papers,
                dry_run,
            } => {
                let overrides = RunOverrides {
                    specialty,
                    days,
                    max_papers,
                    dry_run,
                };
                run_pipeline(config_path, &overrides).await
            }
            Commands::Status { run_id } => show_status(config_path, &run_id).await,
            Commands::Runs { limit } => list_runs(config_path, limit).await,
            Commands::Config => show_config(config_path),
            Commands::Init { force } => init(config_path, force).await,
        }
    }
}

async fn run_pipeline(config_path: Option<&Path>, overrides: &RunOverrides) -> Result<()> {
    let mut config = Config::load(config_path)?;
    config.apply_overrides(overrides);
    config.validate()?;
    let config = Arc::new(config);

    let limiter = Arc::new(RateLimiter::new(&config.rate_limits.0));
    let collaborators = Collaborators::from_config(&config, limiter.clone())
        .context("Failed to set up collaborators")?;

    let orchestrator = Orchestrator::new(config.clone(), collaborators, limiter);
    let summary = orchestrator.run().await?;

    print_summary(&summary);
    if config.youtube.dry_run {
        println!("\n(dry run: nothing was uploaded)");
    }
    Ok(())
}

async fn show_status(config_path: Option<&Path>, run_id_str: &str) -> Result<()> {
    let run_id = Uuid::parse_str(run_id_str)
        .with_context(|| format!("Invalid run ID: {}", run_id_str))?;
    let config = Config::load(config_path)?;

    let summary = load_run_summary(&config.runs_dir(), run_id)
        .await?
        .with_context(|| format!("Run {} has no events", run_id))?;

    print_summary(&summary);
    Ok(())
}

async fn list_runs(config_path: Option<&Path>, limit: usize) -> Result<()> {
    let config = Config::load(config_path)?;
    let runs_dir = config.runs_dir();

    let mut summaries = Vec::new();
    for run_id in EventStore::list_runs(&runs_dir).await? {
        match load_run_summary(&runs_dir, run_id).await {
            Ok(Some(summary)) => summaries.push(summary),
            Ok(None) => {}
            Err(e) => tracing::warn!(%run_id, error = %e, "Skipping unreadable run"),
        }
    }

    if summaries.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    println!(
        "{:<38} {:<20} {:<10} {:>9} {:>7} {:>8}",
        "RUN ID", "STARTED", "STATE", "SUCCEEDED", "FAILED", "SKIPPED"
    );
    println!("{}", "-".repeat(97));

    for summary in summaries.into_iter().take(limit) {
        println!(
            "{:<38} {:<20} {:<10} {:>9} {:>7} {:>8}",
            summary.run_id,
            summary.started_at.format("%Y-%m-%d %H:%M:%S"),
            run_state(&summary),
            summary.succeeded,
            summary.failed,
            summary.skipped
        );
    }

    Ok(())
}

fn run_state(summary: &RunSummary) -> &'static str {
    if summary.run_error.is_some() {
        "failed"
    } else if summary.is_finalized() {
        "completed"
    } else {
        "running"
    }
}

fn print_summary(summary: &RunSummary) {
    println!("Run ID:     {}", summary.run_id);
    println!("State:      {}", run_state(summary));
    println!("Started:    {}", summary.started_at);
    if let Some(finished) = summary.finished_at {
        println!("Finished:   {}", finished);
    }
    if let Some(ref error) = summary.run_error {
        println!("Run error:  {}", error);
    }
    println!(
        "Papers:     {} candidates, {} succeeded, {} failed, {} skipped",
        summary.candidates, summary.succeeded, summary.failed, summary.skipped
    );

    if summary.outcomes.is_empty() {
        return;
    }

    println!();
    println!("{:<12} {:<10} {:<50}", "PAPER", "STATUS", "TITLE / RESULT");
    println!("{}", "-".repeat(74));
    for outcome in &summary.outcomes {
        let title: String = outcome.title.chars().take(50).collect();
        println!("{:<12} {:<10} {:<50}", outcome.paper_id, outcome.status.as_str(), title);

        match outcome.status {
            JobStatus::Failed => {
                let stage = outcome.failed_stage.as_deref().unwrap_or("?");
                let error = outcome.error.as_deref().unwrap_or("unknown error");
                println!("{:<23} failed at {}: {}", "", stage, error);
            }
            JobStatus::Succeeded => {
                if let Some(ref published) = outcome.published {
                    let target = published.url.as_deref().unwrap_or(&published.id);
                    println!("{:<23} {}", "", target);
                }
                if let Some(ref url) = outcome.storage_url {
                    println!("{:<23} archived: {}", "", url);
                }
            }
            _ => {}
        }
    }
}

fn show_config(config_path: Option<&Path>) -> Result<()> {
    let config = Config::load(config_path)?;

    println!(
        "# Config file: {}",
        config
            .config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!("# Home: {}", config.home().display());
    println!("# Runs: {}", config.runs_dir().display());
    println!("# Publish ledger: {}", config.ledger_path().display());
    println!();
    print!("{}", serde_yaml::to_string(&config.redacted())?);

    Ok(())
}

async fn init(config_path: Option<&Path>, force: bool) -> Result<()> {
    let config_file = match config_path {
        Some(path) => path.to_path_buf(),
        None => std::env::current_dir()?.join(CONFIG_DIR).join(CONFIG_FILE),
    };

    if config_file.exists() && !force {
        println!("Config already exists: {} (use --force to overwrite)", config_file.display());
    } else {
        if let Some(parent) = config_file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&config_file, DEFAULT_CONFIG_TEMPLATE)
            .await
            .with_context(|| format!("Failed to write {}", config_file.display()))?;
        println!("Wrote {}", config_file.display());
    }

    let config = Config::load(Some(&config_file))?;
    let runs_dir = config.runs_dir();
    tokio::fs::create_dir_all(&runs_dir)
        .await
        .with_context(|| format!("Failed to create {}", runs_dir.display()))?;
    println!("State directory: {}", config.home().display());

    println!();
    println!("Tools:");
    for tool in REQUIRED_TOOLS {
        match find_on_path(tool) {
            Some(path) => println!("  ✓ {:<10} {}", tool, path.display()),
            None => println!("  ✗ {:<10} not found on PATH", tool),
        }
    }

    Ok(())
}

/// First executable named `program` on PATH
fn find_on_path(program: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}
