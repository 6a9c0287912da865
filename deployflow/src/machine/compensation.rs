//! Best-effort compensation: cleanup after a build failure, rollback
//! after an unhealthy observation.
//!
//! A compensation runs at most once per run per kind. Its own failure is
//! recorded on the run and surfaced for operator attention, but the run's
//! fate was already decided by the triggering stage failure.

use crate::activities::Activities;
use crate::cancellation::CancelToken;
use crate::config::PipelineConfig;
use crate::core::{CompensationKind, CompensationRecord, PipelineRun, StageName};
use crate::errors::{ActivityError, ErrorKind, RunFailure};
use crate::executor::ActivityExecutor;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Runs compensations through the activity executor and records their
/// outcomes on the run.
pub struct CompensationHandler {
    activities: Arc<dyn Activities>,
    cleanup: crate::config::StagePolicy,
    rollback: crate::config::StagePolicy,
}

impl CompensationHandler {
    /// Creates a handler using the configuration's compensation policies.
    #[must_use]
    pub fn new(activities: Arc<dyn Activities>, config: &PipelineConfig) -> Self {
        Self {
            activities,
            cleanup: config.cleanup.clone(),
            rollback: config.rollback.clone(),
        }
    }

    /// Runs the compensation of `kind` for the run, unless it already ran.
    ///
    /// Returns the recorded outcome either way. Never escalates: a failed
    /// compensation produces a record with `succeeded: false` and a
    /// `CompensationFailure`, nothing more.
    pub async fn compensate(
        &self,
        executor: &ActivityExecutor,
        kind: CompensationKind,
        run: &mut PipelineRun,
    ) -> CompensationRecord {
        if let Some(existing) = run.compensations.iter().find(|c| c.kind == kind) {
            debug!(run_id = %run.id, %kind, "compensation already recorded, skipping");
            return existing.clone();
        }

        // a cancelled run still gets its teardown: compensations execute
        // under a detached token
        let cancel = CancelToken::new();

        let result = match kind {
            CompensationKind::Cleanup => {
                let work = {
                    let activities = Arc::clone(&self.activities);
                    move |_attempt: u32| {
                        let activities = Arc::clone(&activities);
                        let fut: futures::future::BoxFuture<'static, Result<(), ActivityError>> =
                            Box::pin(async move { activities.cleanup_resources().await });
                        fut
                    }
                };
                executor
                    .execute(
                        run,
                        StageName::Cleanup,
                        &self.cleanup.retry,
                        self.cleanup.timeout(),
                        &cancel,
                        work,
                    )
                    .await
            }
            CompensationKind::Rollback => {
                match run.deployment.as_ref().map(|d| d.deployment_id.clone()) {
                    Some(deployment_id) => {
                        let work = {
                            let activities = Arc::clone(&self.activities);
                            move |_attempt: u32| {
                                let activities = Arc::clone(&activities);
                                let deployment_id = deployment_id.clone();
                                let fut: futures::future::BoxFuture<
                                    'static,
                                    Result<(), ActivityError>,
                                > = Box::pin(async move {
                                    activities.rollback_deployment(&deployment_id).await
                                });
                                fut
                            }
                        };
                        executor
                            .execute(
                                run,
                                StageName::Rollback,
                                &self.rollback.retry,
                                self.rollback.timeout(),
                                &cancel,
                                work,
                            )
                            .await
                    }
                    None => Err(ActivityError::non_retryable("no deployment to roll back")),
                }
            }
        };

        let record = match result {
            Ok(()) => {
                info!(run_id = %run.id, %kind, "compensation succeeded");
                CompensationRecord {
                    kind,
                    succeeded: true,
                    error: None,
                    recorded_at: Utc::now(),
                }
            }
            Err(err) => {
                warn!(
                    run_id = %run.id,
                    %kind,
                    error = %err,
                    "compensation failed; run outcome unchanged, operator attention needed"
                );
                CompensationRecord {
                    kind,
                    succeeded: false,
                    error: Some(RunFailure::new(
                        ErrorKind::CompensationFailure,
                        err.to_string(),
                    )),
                    recorded_at: Utc::now(),
                }
            }
        };

        run.compensations.push(record.clone());
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DeploymentRecord, RunInput};
    use crate::store::{InMemoryRunStore, RunStore};
    use crate::testing::MockActivities;

    async fn setup() -> (
        Arc<MockActivities>,
        ActivityExecutor,
        CompensationHandler,
        PipelineRun,
    ) {
        let store = Arc::new(InMemoryRunStore::new());
        let activities = Arc::new(MockActivities::new());
        let run = PipelineRun::new(RunInput::new("git@example.com:app.git", "abc1234"));
        store.save(&run).await.unwrap();
        let executor = ActivityExecutor::new(store);
        let handler =
            CompensationHandler::new(activities.clone(), &PipelineConfig::default());
        (activities, executor, handler, run)
    }

    #[tokio::test]
    async fn test_cleanup_success_recorded() {
        let (activities, executor, handler, mut run) = setup().await;

        let record = handler
            .compensate(&executor, CompensationKind::Cleanup, &mut run)
            .await;

        assert!(record.succeeded);
        assert_eq!(activities.cleanup_calls(), 1);
        assert_eq!(run.compensations.len(), 1);
        assert_eq!(run.attempts_for(StageName::Cleanup), 1);
    }

    #[tokio::test]
    async fn test_rollback_failure_never_escalates() {
        let (activities, executor, handler, mut run) = setup().await;
        run.deployment = Some(DeploymentRecord::new("d1", "img123"));
        activities.script_rollback(Err(ActivityError::non_retryable("rollback api down")));

        let record = handler
            .compensate(&executor, CompensationKind::Rollback, &mut run)
            .await;

        assert!(!record.succeeded);
        let failure = record.error.unwrap();
        assert_eq!(failure.kind, ErrorKind::CompensationFailure);
        assert_eq!(activities.rollback_targets(), vec!["d1".to_string()]);
    }

    #[tokio::test]
    async fn test_compensation_runs_at_most_once_per_kind() {
        let (activities, executor, handler, mut run) = setup().await;

        handler
            .compensate(&executor, CompensationKind::Cleanup, &mut run)
            .await;
        handler
            .compensate(&executor, CompensationKind::Cleanup, &mut run)
            .await;

        assert_eq!(activities.cleanup_calls(), 1);
        assert_eq!(run.compensations.len(), 1);
    }
}
