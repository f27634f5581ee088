//! Core orchestration logic.
//!
//! This module contains:
//! - Error taxonomy shared by collaborators, stages and runs
//! - RateLimiter and RetryPolicy
//! - StageExecutor: one stage of one job, with timeouts and retries
//! - EventStore: Append-only event logging
//! - Orchestrator: Main execution engine

pub mod error;
pub mod event_store;
pub mod executor;
pub mod narration;
pub mod orchestrator;
pub mod rate_limiter;
pub mod retry;

// Re-export commonly used types
pub use error::{CollaboratorError, ErrorKind, RunError, StageFailure};
pub use event_store::{generate_idempotency_key, hash_input, EventStore};
pub use executor::{CallPacer, StageExecutor};
pub use narration::split_into_chunks;
pub use orchestrator::{build_metadata, load_run_summary, Orchestrator, RunReport};
pub use rate_limiter::RateLimiter;
pub use retry::{RetryDecision, RetryDelay, RetryPolicy};
