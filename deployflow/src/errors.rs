//! Error types for the deployflow core.
//!
//! Failures are classified by [`ErrorKind`]; the kind decides whether the
//! activity executor retries and what the run reports as its terminal
//! reason.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classification of a failure observed while driving a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A transient external fault. Retried per the stage's policy.
    RetryableExternal,
    /// A permanent external fault (invalid image, rejected by policy).
    /// Fails the stage immediately.
    NonRetryableExternal,
    /// A per-attempt deadline was exceeded.
    Timeout,
    /// The manual approval gate returned anything other than approval.
    ApprovalRejected,
    /// Heartbeat pulses stopped for longer than the stall threshold.
    StallDetected,
    /// The run was cancelled by an operator or an external timeout.
    Cancelled,
    /// A compensation activity (cleanup or rollback) failed. Recorded,
    /// never escalated.
    CompensationFailure,
}

impl ErrorKind {
    /// Returns true if failures of this kind may be re-attempted.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::RetryableExternal | Self::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RetryableExternal => write!(f, "retryable_external"),
            Self::NonRetryableExternal => write!(f, "non_retryable_external"),
            Self::Timeout => write!(f, "timeout"),
            Self::ApprovalRejected => write!(f, "approval_rejected"),
            Self::StallDetected => write!(f, "stall_detected"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::CompensationFailure => write!(f, "compensation_failure"),
        }
    }
}

/// Error from one external activity invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ActivityError {
    /// The failure classification.
    pub kind: ErrorKind,
    /// Human-readable description of what went wrong.
    pub message: String,
}

impl ActivityError {
    /// Creates an error with an explicit kind.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates a transient external failure.
    #[must_use]
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RetryableExternal, message)
    }

    /// Creates a permanent external failure.
    #[must_use]
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NonRetryableExternal, message)
    }

    /// Creates a deadline-exceeded failure.
    #[must_use]
    pub fn timeout(deadline: std::time::Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("deadline of {:.1}s exceeded", deadline.as_secs_f64()),
        )
    }

    /// Creates a cancellation failure carrying the operator's reason.
    #[must_use]
    pub fn cancelled(reason: Option<String>) -> Self {
        Self::new(
            ErrorKind::Cancelled,
            reason.unwrap_or_else(|| "run cancelled".to_string()),
        )
    }

    /// Creates a heartbeat-stall failure.
    #[must_use]
    pub fn stalled(silent_for: std::time::Duration) -> Self {
        Self::new(
            ErrorKind::StallDetected,
            format!(
                "no heartbeat for {:.1}s, activity presumed dead",
                silent_for.as_secs_f64()
            ),
        )
    }

    /// Returns true if this error may be re-attempted.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// The terminal failure recorded on a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    /// The kind of the triggering failure.
    pub kind: ErrorKind,
    /// Human-readable reason shown to the initiating caller.
    pub message: String,
}

impl RunFailure {
    /// Creates a run failure.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<ActivityError> for RunFailure {
    fn from(err: ActivityError) -> Self {
        Self {
            kind: err.kind,
            message: err.message,
        }
    }
}

/// Errors from the run persistence layer.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The requested run does not exist.
    #[error("run not found: {0}")]
    NotFound(String),

    /// A record could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The storage backend reported a fault.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Top-level error for driving a pipeline run.
#[derive(Debug, Error)]
pub enum DeployflowError {
    /// A persistence fault.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The requested run does not exist in the store.
    #[error("run not found: {0}")]
    RunNotFound(String),

    /// The run's persisted state is inconsistent with the requested
    /// operation.
    #[error("invalid run state: {0}")]
    InvalidState(String),
}
