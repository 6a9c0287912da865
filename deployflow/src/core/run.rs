//! The pipeline run record: identity, input, progress, and audit history.

use super::{PipelineStage, StageAttempt, StageName};
use crate::errors::RunFailure;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identity of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    /// Generates a fresh run ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What the pipeline was asked to ship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInput {
    /// Repository reference (URL or slug).
    pub repo_ref: String,
    /// Commit identifier to build and deploy.
    pub commit: String,
}

impl RunInput {
    /// Creates a run input.
    #[must_use]
    pub fn new(repo_ref: impl Into<String>, commit: impl Into<String>) -> Self {
        Self {
            repo_ref: repo_ref.into(),
            commit: commit.into(),
        }
    }
}

/// Health of a deployment at the last observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Not yet observed.
    Unknown,
    /// The observation window completed under the error-rate threshold.
    Healthy,
    /// The error rate exceeded the threshold, the check stalled, or the
    /// run was cancelled mid-observation.
    Unhealthy,
}

/// The deployment produced by the deploy stage.
///
/// Lives from deploy success until rollback or run completion; consumed by
/// the monitoring and rollback stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    /// Identifier returned by the deploy collaborator.
    pub deployment_id: String,
    /// The image that was deployed.
    pub image_id: String,
    /// Health at the last check.
    pub health: HealthStatus,
    /// Last observed error rate, if any check completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_rate: Option<f64>,
}

impl DeploymentRecord {
    /// Creates a record for a fresh deployment.
    #[must_use]
    pub fn new(deployment_id: impl Into<String>, image_id: impl Into<String>) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            image_id: image_id.into(),
            health: HealthStatus::Unknown,
            last_error_rate: None,
        }
    }
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The run has not reached a terminal state.
    Running,
    /// The run completed and the deployment is healthy.
    Succeeded,
    /// The run failed before or without rolling back.
    Failed,
    /// The run failed and the rollback compensation was invoked.
    RolledBack,
}

impl RunStatus {
    /// Returns true once the run can no longer progress.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Returns true for the failing terminal statuses.
    #[must_use]
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::RolledBack)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// Which compensation a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationKind {
    /// Resource cleanup after a build failure.
    Cleanup,
    /// Deployment rollback after an unhealthy observation.
    Rollback,
}

impl CompensationKind {
    /// The stage name compensation attempts are recorded under.
    #[must_use]
    pub fn stage_name(self) -> StageName {
        match self {
            Self::Cleanup => StageName::Cleanup,
            Self::Rollback => StageName::Rollback,
        }
    }
}

impl fmt::Display for CompensationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cleanup => write!(f, "cleanup"),
            Self::Rollback => write!(f, "rollback"),
        }
    }
}

/// Persisted outcome of one compensation invocation.
///
/// Compensation failures are recorded here (and as attempt history) for
/// operator attention; they never change the run's terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationRecord {
    /// Which compensation ran.
    pub kind: CompensationKind,
    /// Whether the compensation itself succeeded.
    pub succeeded: bool,
    /// The compensation's own failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunFailure>,
    /// When the outcome was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// One execution of the full pipeline for a specific commit.
///
/// Created when a run is requested, mutated only by the pipeline state
/// machine, and archived in the store once terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Run identity.
    pub id: RunId,
    /// What to build and deploy.
    pub input: RunInput,
    /// Current state machine position.
    pub stage: PipelineStage,
    /// Terminal status, `Running` until the machine finishes.
    pub status: RunStatus,
    /// Ordered per-stage attempt history, including approval decisions
    /// and compensation attempts.
    pub history: Vec<StageAttempt>,
    /// Compensation outcomes, at most one per kind.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compensations: Vec<CompensationRecord>,
    /// Image produced by the build stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    /// Deployment produced by the deploy stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentRecord>,
    /// The failure that decided a failing terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    /// When the run was requested.
    pub created_at: DateTime<Utc>,
    /// When the run record last changed.
    pub updated_at: DateTime<Utc>,
}

impl PipelineRun {
    /// Creates a fresh run in `Building`.
    #[must_use]
    pub fn new(input: RunInput) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::new(),
            input,
            stage: PipelineStage::Building,
            status: RunStatus::Running,
            history: Vec::new(),
            compensations: Vec::new(),
            image_id: None,
            deployment: None,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Number of already-recorded attempts for a stage.
    ///
    /// The executor resumes its retry budget from this count rather than
    /// restarting at zero after a crash.
    #[must_use]
    pub fn attempts_for(&self, stage: StageName) -> u32 {
        self.history
            .iter()
            .filter(|a| a.stage == stage)
            .map(|a| a.attempt)
            .max()
            .unwrap_or(0)
    }

    /// Advances to the next non-terminal stage.
    pub fn advance(&mut self, stage: PipelineStage) {
        self.stage = stage;
        self.updated_at = Utc::now();
    }

    /// Marks the run succeeded.
    pub fn succeed(&mut self) {
        self.stage = PipelineStage::Succeeded;
        self.status = RunStatus::Succeeded;
        self.updated_at = Utc::now();
    }

    /// Marks the run failed with the triggering failure.
    ///
    /// The status becomes `RolledBack` instead of `Failed` when the
    /// rollback compensation has run; the run is a failure either way.
    pub fn fail(&mut self, failure: RunFailure) {
        self.stage = PipelineStage::Failed;
        self.status = if self
            .compensations
            .iter()
            .any(|c| c.kind == CompensationKind::Rollback)
        {
            RunStatus::RolledBack
        } else {
            RunStatus::Failed
        };
        self.failure = Some(failure);
        self.updated_at = Utc::now();
    }

    /// The caller-visible final result.
    #[must_use]
    pub fn outcome(&self) -> RunOutcome {
        RunOutcome {
            run_id: self.id,
            success: self.status == RunStatus::Succeeded,
            reason: self.failure.as_ref().map(ToString::to_string),
        }
    }
}

/// The initiating caller's final observable result: success plus a
/// human-readable reason drawn from the triggering error kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    /// The run this outcome belongs to.
    pub run_id: RunId,
    /// Whether the run terminated `Succeeded`.
    pub success: bool,
    /// Failure reason, absent on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AttemptOutcome;
    use crate::errors::ErrorKind;

    fn test_run() -> PipelineRun {
        PipelineRun::new(RunInput::new("git@example.com:app.git", "abc1234"))
    }

    #[test]
    fn test_new_run_starts_building() {
        let run = test_run();
        assert_eq!(run.stage, PipelineStage::Building);
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.history.is_empty());
    }

    #[test]
    fn test_attempts_for_counts_per_stage() {
        let mut run = test_run();
        for attempt in 1..=2 {
            run.history.push(StageAttempt::finished(
                StageName::Build,
                attempt,
                Utc::now(),
                AttemptOutcome::failed(&crate::errors::ActivityError::retryable("flaky")),
            ));
        }
        run.history.push(StageAttempt::finished(
            StageName::Test,
            1,
            Utc::now(),
            AttemptOutcome::succeeded(),
        ));

        assert_eq!(run.attempts_for(StageName::Build), 2);
        assert_eq!(run.attempts_for(StageName::Test), 1);
        assert_eq!(run.attempts_for(StageName::Deploy), 0);
    }

    #[test]
    fn test_fail_without_rollback() {
        let mut run = test_run();
        run.fail(RunFailure::new(ErrorKind::NonRetryableExternal, "bad image"));
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.stage, PipelineStage::Failed);
        assert!(run.outcome().reason.unwrap().contains("bad image"));
    }

    #[test]
    fn test_fail_after_rollback_marks_rolled_back() {
        let mut run = test_run();
        run.compensations.push(CompensationRecord {
            kind: CompensationKind::Rollback,
            succeeded: true,
            error: None,
            recorded_at: Utc::now(),
        });
        run.fail(RunFailure::new(ErrorKind::NonRetryableExternal, "error rate"));
        assert_eq!(run.status, RunStatus::RolledBack);
        assert!(run.status.is_failure());
    }

    #[test]
    fn test_outcome_success() {
        let mut run = test_run();
        run.succeed();
        let outcome = run.outcome();
        assert!(outcome.success);
        assert!(outcome.reason.is_none());
    }
}
