//! Stage attempt records: the unit of audit history.

use super::StageName;
use crate::errors::{ActivityError, ErrorKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The result of a single stage attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The attempt succeeded, optionally carrying the produced value
    /// (image ID, deployment ID, observed error rate).
    Succeeded {
        /// The value the activity produced, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<serde_json::Value>,
    },
    /// The attempt failed with a classified error.
    Failed {
        /// The failure classification.
        kind: ErrorKind,
        /// Human-readable description.
        message: String,
    },
    /// The attempt exceeded its deadline.
    TimedOut,
}

impl AttemptOutcome {
    /// Creates a success outcome without a value.
    #[must_use]
    pub fn succeeded() -> Self {
        Self::Succeeded { value: None }
    }

    /// Creates a success outcome carrying a value.
    #[must_use]
    pub fn succeeded_with(value: serde_json::Value) -> Self {
        Self::Succeeded { value: Some(value) }
    }

    /// Creates a failure outcome from an activity error.
    #[must_use]
    pub fn failed(err: &ActivityError) -> Self {
        Self::Failed {
            kind: err.kind,
            message: err.message.clone(),
        }
    }

    /// Returns true if the attempt succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// One recorded attempt of a stage.
///
/// Owned by the activity executor for the duration of the attempt, then
/// folded into the run's history. The (stage, attempt) pair is the
/// idempotency key for persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageAttempt {
    /// Which unit of work this attempt belongs to.
    pub stage: StageName,
    /// 1-based attempt number within the stage.
    pub attempt: u32,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// When the attempt finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// How the attempt ended.
    pub outcome: AttemptOutcome,
}

impl StageAttempt {
    /// Creates a finished attempt record, stamping the finish time now.
    #[must_use]
    pub fn finished(
        stage: StageName,
        attempt: u32,
        started_at: DateTime<Utc>,
        outcome: AttemptOutcome,
    ) -> Self {
        Self {
            stage,
            attempt,
            started_at,
            finished_at: Some(Utc::now()),
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_success_check() {
        assert!(AttemptOutcome::succeeded().is_success());
        assert!(AttemptOutcome::succeeded_with(serde_json::json!("img123")).is_success());
        assert!(!AttemptOutcome::TimedOut.is_success());
        assert!(!AttemptOutcome::failed(&ActivityError::retryable("boom")).is_success());
    }

    #[test]
    fn test_failed_outcome_carries_kind() {
        let outcome = AttemptOutcome::failed(&ActivityError::non_retryable("bad image"));
        match outcome {
            AttemptOutcome::Failed { kind, message } => {
                assert_eq!(kind, ErrorKind::NonRetryableExternal);
                assert_eq!(message, "bad image");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_attempt_serialization_tags_status() {
        let attempt = StageAttempt::finished(
            StageName::Build,
            1,
            Utc::now(),
            AttemptOutcome::succeeded_with(serde_json::json!("img123")),
        );
        let json = serde_json::to_value(&attempt).unwrap();
        assert_eq!(json["stage"], "build");
        assert_eq!(json["outcome"]["status"], "succeeded");
        assert_eq!(json["outcome"]["value"], "img123");
    }
}
