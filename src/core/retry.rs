//! Retry decisions for failed stage calls.
//!
//! Only transient errors are retried, and only while the stage has
//! attempts left. The delay is a configurable strategy: a fixed wait, or
//! an exponential backoff with a cap.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::Stage;

use super::error::ErrorKind;

/// How long to wait between attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "strategy")]
pub enum RetryDelay {
    /// Same delay before every retry
    Fixed { delay_ms: u64 },

    /// `initial * multiplier^(attempt-1)`, capped at `max_delay_ms`
    Exponential {
        initial_delay_ms: u64,
        multiplier: f64,
        max_delay_ms: u64,
    },
}

impl Default for RetryDelay {
    fn default() -> Self {
        Self::Fixed { delay_ms: 30_000 }
    }
}

impl RetryDelay {
    /// Calculate delay after a specific failed attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match *self {
            RetryDelay::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            RetryDelay::Exponential {
                initial_delay_ms,
                multiplier,
                max_delay_ms,
            } => {
                if attempt <= 1 {
                    return Duration::from_millis(initial_delay_ms.min(max_delay_ms));
                }

                let delay = initial_delay_ms as f64 * multiplier.powi((attempt - 1) as i32);
                let capped = delay.min(max_delay_ms as f64) as u64;
                Duration::from_millis(capped)
            }
        }
    }

    /// Upper bound for any delay, including collaborator-provided hints
    pub fn cap(&self) -> Duration {
        match *self {
            RetryDelay::Fixed { delay_ms } => {
                Duration::from_millis(delay_ms.max(1).saturating_mul(10))
            }
            RetryDelay::Exponential { max_delay_ms, .. } => Duration::from_millis(max_delay_ms),
        }
    }
}

/// Outcome of consulting the policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Retry policy shared by every stage of a run
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts per stage (including first try)
    pub max_attempts: u32,

    /// Per-stage overrides of `max_attempts`
    pub stage_max_attempts: HashMap<Stage, u32>,

    pub delay: RetryDelay,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            stage_max_attempts: HashMap::new(),
            delay: RetryDelay::default(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: RetryDelay) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            stage_max_attempts: HashMap::new(),
            delay,
        }
    }

    pub fn with_stage_limit(mut self, stage: Stage, max_attempts: u32) -> Self {
        self.stage_max_attempts.insert(stage, max_attempts.max(1));
        self
    }

    /// Attempt budget for a stage
    pub fn max_attempts_for(&self, stage: Stage) -> u32 {
        self.stage_max_attempts
            .get(&stage)
            .copied()
            .unwrap_or(self.max_attempts)
    }

    /// Decide what to do after `attempt` (1-indexed) of `stage` failed.
    ///
    /// `hint` is a delay requested by the collaborator; it replaces the
    /// computed delay but never exceeds the strategy's cap.
    pub fn decide(
        &self,
        stage: Stage,
        attempt: u32,
        kind: ErrorKind,
        hint: Option<Duration>,
    ) -> RetryDecision {
        self.decide_with_budget(self.max_attempts_for(stage), attempt, kind, hint)
    }

    /// Same decision for calls that are not pipeline stages (candidate fetch)
    pub fn decide_with_budget(
        &self,
        max_attempts: u32,
        attempt: u32,
        kind: ErrorKind,
        hint: Option<Duration>,
    ) -> RetryDecision {
        if kind == ErrorKind::Permanent || attempt >= max_attempts {
            return RetryDecision::GiveUp;
        }

        let delay = match hint {
            Some(hint) => hint.min(self.delay.cap()),
            None => self.delay.delay_for_attempt(attempt),
        };
        RetryDecision::RetryAfter(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exponential() -> RetryDelay {
        RetryDelay::Exponential {
            initial_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 10000,
        }
    }

    #[test]
    fn test_exponential_delays() {
        let delay = exponential();

        assert_eq!(delay.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(delay.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(delay.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(delay.delay_for_attempt(4), Duration::from_millis(8000));
        assert_eq!(delay.delay_for_attempt(5), Duration::from_millis(10000)); // Capped
    }

    #[test]
    fn test_fixed_delay_is_constant() {
        let delay = RetryDelay::Fixed { delay_ms: 500 };
        assert_eq!(delay.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(delay.delay_for_attempt(7), Duration::from_millis(500));
    }

    #[test]
    fn test_permanent_gives_up_immediately() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(Stage::Upload, 1, ErrorKind::Permanent, None),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_transient_retries_until_budget() {
        let policy = RetryPolicy::new(3, RetryDelay::Fixed { delay_ms: 10 });

        assert_eq!(
            policy.decide(Stage::Summarize, 1, ErrorKind::Transient, None),
            RetryDecision::RetryAfter(Duration::from_millis(10))
        );
        assert_eq!(
            policy.decide(Stage::Summarize, 2, ErrorKind::Transient, None),
            RetryDecision::RetryAfter(Duration::from_millis(10))
        );
        assert_eq!(
            policy.decide(Stage::Summarize, 3, ErrorKind::Transient, None),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_stage_override() {
        let policy = RetryPolicy::new(3, RetryDelay::Fixed { delay_ms: 10 })
            .with_stage_limit(Stage::RenderVideo, 1);

        assert_eq!(policy.max_attempts_for(Stage::RenderVideo), 1);
        assert_eq!(policy.max_attempts_for(Stage::Extract), 3);
        assert_eq!(
            policy.decide(Stage::RenderVideo, 1, ErrorKind::Transient, None),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_hint_is_capped() {
        let policy = RetryPolicy::new(5, exponential());

        assert_eq!(
            policy.decide(Stage::Upload, 1, ErrorKind::Transient, Some(Duration::from_secs(3))),
            RetryDecision::RetryAfter(Duration::from_secs(3))
        );
        assert_eq!(
            policy.decide(Stage::Upload, 1, ErrorKind::Transient, Some(Duration::from_secs(600))),
            RetryDecision::RetryAfter(Duration::from_millis(10000))
        );
    }

    #[test]
    fn test_fixed_cap_saturates() {
        let delay = RetryDelay::Fixed { delay_ms: u64::MAX };
        assert_eq!(delay.cap(), Duration::from_millis(u64::MAX));

        let policy = RetryPolicy::new(2, delay);
        assert_eq!(
            policy.decide(Stage::Upload, 1, ErrorKind::Transient, Some(Duration::from_secs(5))),
            RetryDecision::RetryAfter(Duration::from_secs(5))
        );
    }
}
