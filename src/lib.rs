//! medibrief - Medical paper to narrated video pipeline
//!
//! Fetches recent papers for the configured specialties, and turns each
//! one into a narrated summary video that gets published.
//!
//! # Architecture
//!
//! Every paper is a job that walks a fixed stage sequence:
//! extract, summarize, select figures, synthesize narration, render,
//! upload, record. Each stage calls one external collaborator through
//! a rate limiter, a timeout and a retry policy. Jobs run on a bounded
//! worker pool and fail independently of each other.
//!
//! All state changes are recorded as immutable events, so a run's summary
//! can be rebuilt by replaying its log.
//!
//! # Modules
//!
//! - `adapters`: Collaborator traits and their implementations
//! - `core`: Orchestration logic (executor, retries, rate limits, event store)
//! - `domain`: Data structures (paper, job, artifacts, events, summary)
//! - `config`: YAML configuration
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Process this week's cardiology papers without uploading
//! medibrief run --specialty cardiology --dry-run
//!
//! # Check a run
//! medibrief status <run-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use crate::config::Config;
pub use crate::core::{Orchestrator, RunError, RunReport};
pub use domain::{Event, EventType, JobStatus, PaperJob, PaperRecord, RunSummary, Stage};
