//! Retry policies with exponential backoff and resumable attempt state.
//!
//! The attempt counter is fed from persisted history, so a process restart
//! mid-retry continues the same budget instead of starting over.

use crate::errors::ErrorKind;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Jitter applied to computed backoff delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter, deterministic delays.
    None,
    /// Random from 0 to the computed delay.
    #[default]
    Full,
}

/// Retry behavior for one stage.
///
/// Immutable per stage, supplied by pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_interval_ms: u64,
    /// Multiplier applied to the delay after each retry.
    pub backoff_multiplier: f64,
    /// Cap on the computed delay, in milliseconds.
    pub max_interval_ms: u64,
    /// Jitter strategy.
    pub jitter: JitterStrategy,
    /// Error kinds never retried under this policy, in addition to the
    /// kinds that are inherently non-retryable.
    #[serde(default)]
    pub non_retryable: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval_ms: 1000,
            backoff_multiplier: 2.0,
            max_interval_ms: 30_000,
            jitter: JitterStrategy::Full,
            non_retryable: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the default parameters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the initial retry interval.
    #[must_use]
    pub fn with_initial_interval_ms(mut self, interval: u64) -> Self {
        self.initial_interval_ms = interval;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_interval_ms(mut self, interval: u64) -> Self {
        self.max_interval_ms = interval;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Marks additional error kinds as non-retryable.
    #[must_use]
    pub fn with_non_retryable(mut self, kinds: Vec<ErrorKind>) -> Self {
        self.non_retryable = kinds;
        self
    }

    /// Whether a failure of `kind` may be retried under this policy.
    ///
    /// Attempt-budget exhaustion is tracked separately by [`RetryState`].
    #[must_use]
    pub fn permits_retry(&self, kind: ErrorKind) -> bool {
        kind.is_retryable() && !self.non_retryable.contains(&kind)
    }
}

/// Attempt tracking for one stage execution.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// Attempts completed so far, including any recorded before a restart.
    pub attempt: u32,
}

impl RetryState {
    /// Starts with no attempts taken.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resumes from a persisted attempt count.
    #[must_use]
    pub fn resume(completed_attempts: u32) -> Self {
        Self {
            attempt: completed_attempts,
        }
    }

    /// The 1-based number the next attempt will carry.
    #[must_use]
    pub fn next_attempt_number(&self) -> u32 {
        self.attempt + 1
    }

    /// Records one completed attempt.
    pub fn record_attempt(&mut self) {
        self.attempt += 1;
    }

    /// Returns true once the budget is spent.
    #[must_use]
    pub fn is_exhausted(&self, policy: &RetryPolicy) -> bool {
        self.attempt >= policy.max_attempts
    }

    /// The delay to wait before the next attempt.
    ///
    /// Call after [`record_attempt`](Self::record_attempt): the first
    /// retry waits the initial interval, each later retry multiplies it,
    /// capped at the policy maximum.
    #[must_use]
    pub fn backoff_delay(&self, policy: &RetryPolicy) -> Duration {
        let exponent = self.attempt.saturating_sub(1);
        let raw = policy.initial_interval_ms as f64
            * policy.backoff_multiplier.powi(exponent.min(i32::MAX as u32) as i32);
        let capped = raw.min(policy.max_interval_ms as f64).max(0.0) as u64;

        let jittered = match policy.jitter {
            JitterStrategy::None => capped,
            JitterStrategy::Full => {
                if capped == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=capped)
                }
            }
        };

        Duration::from_millis(jittered)
    }
}
