//! Domain types for the MediBrief orchestrator.
//!
//! This module contains the core data structures:
//! - Paper: source records and collaborator references
//! - Stage: the fixed stage sequence
//! - Artifact: stage outputs
//! - Job: one paper's state machine
//! - Events: immutable records of state changes
//! - Summary: run-level outcome report

pub mod artifact;
pub mod events;
pub mod job;
pub mod paper;
pub mod stage;
pub mod summary;

// Re-export commonly used types
pub use artifact::{ExtractedContent, Narration, PaperSummary, StageArtifact};
pub use events::{Event, EventType};
pub use job::{ErrorRecord, JobStatus, PaperJob, TransitionError};
pub use paper::{AudioRef, Figure, PaperRecord, PublishedRef, VideoRef};
pub use stage::Stage;
pub use summary::{PaperOutcome, RunSummary};
