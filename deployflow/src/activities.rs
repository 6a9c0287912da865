//! External collaborator contracts.
//!
//! The actual shell/Docker invocation, Kubernetes calls, and metrics
//! queries live behind this port. Implementations are constructed once at
//! startup and injected into the state machine by reference; the core
//! never reaches for a global registry.

use crate::errors::ActivityError;
use async_trait::async_trait;

/// The external operations a pipeline run drives.
///
/// Implementations should be idempotent enough to retry safely, or report
/// a non-retryable error kind when they are not.
#[async_trait]
pub trait Activities: Send + Sync {
    /// Builds an image for the commit and returns its image ID.
    async fn build_image(&self, repo_ref: &str, commit: &str) -> Result<String, ActivityError>;

    /// Runs the test suite against an image. `Ok(false)` means the suite
    /// completed and failed; errors mean the suite could not run.
    async fn run_tests(&self, image_id: &str) -> Result<bool, ActivityError>;

    /// Deploys an image and returns the deployment ID.
    async fn deploy_image(&self, image_id: &str) -> Result<String, ActivityError>;

    /// Samples the deployment's current error rate.
    async fn check_error_rate(&self, deployment_id: &str) -> Result<f64, ActivityError>;

    /// Rolls a deployment back. Best-effort: failures are recorded, not
    /// escalated.
    async fn rollback_deployment(&self, deployment_id: &str) -> Result<(), ActivityError>;

    /// Cleans up resources left by a failed build. Best-effort.
    async fn cleanup_resources(&self) -> Result<(), ActivityError>;
}
