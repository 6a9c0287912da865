//! Pipeline stage enums: the state machine's states and the audit
//! vocabulary used in attempt history.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The state of a pipeline run's state machine.
///
/// Runs advance monotonically through the fixed order
/// `Building -> Testing -> AwaitingApproval -> Deploying -> Monitoring ->
/// {Succeeded, RollingBack -> Failed}`; no state is re-entered except via
/// retry of the same stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    /// Building the image from the repository reference.
    Building,
    /// Running the test suite against the built image.
    Testing,
    /// Suspended on the manual approval gate.
    AwaitingApproval,
    /// Deploying the approved image.
    Deploying,
    /// Observing production health for the configured window.
    Monitoring,
    /// Running the rollback compensation after an unhealthy observation.
    RollingBack,
    /// Terminal: the run completed and the deployment is healthy.
    Succeeded,
    /// Terminal: the run failed; the reason is on the run record.
    Failed,
}

impl PipelineStage {
    /// Returns true for the two terminal states.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Building => write!(f, "building"),
            Self::Testing => write!(f, "testing"),
            Self::AwaitingApproval => write!(f, "awaiting_approval"),
            Self::Deploying => write!(f, "deploying"),
            Self::Monitoring => write!(f, "monitoring"),
            Self::RollingBack => write!(f, "rolling_back"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Names of the units of work recorded in a run's attempt history.
///
/// Unlike [`PipelineStage`] this includes the compensations, which are not
/// states of their own but do produce attempt records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// Image build.
    Build,
    /// Test suite.
    Test,
    /// Manual approval decision.
    Approval,
    /// Blue-green deploy.
    Deploy,
    /// Production health observation.
    Monitor,
    /// Rollback compensation.
    Rollback,
    /// Cleanup compensation.
    Cleanup,
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Build => write!(f, "build"),
            Self::Test => write!(f, "test"),
            Self::Approval => write!(f, "approval"),
            Self::Deploy => write!(f, "deploy"),
            Self::Monitor => write!(f, "monitor"),
            Self::Rollback => write!(f, "rollback"),
            Self::Cleanup => write!(f, "cleanup"),
        }
    }
}
