//! The pipeline state machine.
//!
//! Sequences the stages of one run, persists every transition, and
//! resumes from persisted state after a restart without repeating
//! completed work or re-consuming signals. Each run is one logical task;
//! its suspension points (the approval gate, monitoring, backoff sleeps)
//! are cooperative awaits, so a stalled run never starves others.

mod compensation;


pub use compensation::CompensationHandler;

use crate::activities::Activities;
use crate::cancellation::CancelToken;
use crate::config::PipelineConfig;
use crate::core::{
    AttemptOutcome, CompensationKind, DeploymentRecord, HealthStatus, PipelineRun, PipelineStage,
    RunId, RunInput, RunOutcome, StageAttempt, StageName,
};
use crate::errors::{ActivityError, DeployflowError, ErrorKind, RunFailure};
use crate::events::{EventSink, NoOpEventSink};
use crate::executor::ActivityExecutor;
use crate::heartbeat::HeartbeatHandle;
use crate::signal::{SignalHub, APPROVAL_GATE};
use crate::store::RunStore;
use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// Drives pipeline runs from `Building` to a terminal state.
///
/// Owns no run state between calls: everything lives in the store, which
/// is what makes a run resumable by any machine instance.
pub struct PipelineStateMachine {
    config: PipelineConfig,
    store: Arc<dyn RunStore>,
    activities: Arc<dyn Activities>,
    signals: SignalHub,
    events: Arc<dyn EventSink>,
    executor: ActivityExecutor,
    compensation: CompensationHandler,
}

impl PipelineStateMachine {
    /// Creates a machine over the given collaborators.
    #[must_use]
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn RunStore>,
        activities: Arc<dyn Activities>,
        signals: SignalHub,
    ) -> Self {
        let executor = ActivityExecutor::new(Arc::clone(&store));
        let compensation = CompensationHandler::new(Arc::clone(&activities), &config);
        Self {
            config,
            store,
            activities,
            signals,
            events: Arc::new(NoOpEventSink),
            executor,
            compensation,
        }
    }

    /// Replaces the event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// The signal hub external systems deliver approvals through.
    #[must_use]
    pub fn signals(&self) -> &SignalHub {
        &self.signals
    }

    /// Creates and persists a new run in `Building`, without driving it.
    pub async fn submit(&self, input: RunInput) -> Result<RunId, DeployflowError> {
        let run = PipelineRun::new(input);
        self.store.save(&run).await?;
        info!(
            run_id = %run.id,
            repo = %run.input.repo_ref,
            commit = %run.input.commit,
            "pipeline run submitted"
        );
        self.events.try_emit(
            "run.submitted",
            Some(json!({ "run_id": run.id.to_string() })),
        );
        Ok(run.id)
    }

    /// Drives a run to a terminal state, starting or resuming from its
    /// persisted stage. Already-terminal runs return their outcome
    /// without re-running anything.
    pub async fn execute(
        &self,
        run_id: RunId,
        cancel: &CancelToken,
    ) -> Result<RunOutcome, DeployflowError> {
        let mut run = self
            .store
            .load(run_id)
            .await?
            .ok_or_else(|| DeployflowError::RunNotFound(run_id.to_string()))?;
        if run.stage.is_terminal() {
            return Ok(run.outcome());
        }
        self.drive(&mut run, cancel).await
    }

    /// Convenience: submit and drive in one call.
    pub async fn start(
        &self,
        input: RunInput,
        cancel: &CancelToken,
    ) -> Result<RunOutcome, DeployflowError> {
        let run_id = self.submit(input).await?;
        self.execute(run_id, cancel).await
    }

    async fn drive(
        &self,
        run: &mut PipelineRun,
        cancel: &CancelToken,
    ) -> Result<RunOutcome, DeployflowError> {
        while !run.stage.is_terminal() {
            self.events.try_emit(
                "stage.started",
                Some(json!({
                    "run_id": run.id.to_string(),
                    "stage": run.stage.to_string(),
                })),
            );
            match run.stage {
                PipelineStage::Building => self.run_build(run, cancel).await?,
                PipelineStage::Testing => self.run_test(run, cancel).await?,
                PipelineStage::AwaitingApproval => self.run_approval(run, cancel).await?,
                PipelineStage::Deploying => self.run_deploy(run, cancel).await?,
                PipelineStage::Monitoring => self.run_monitor(run, cancel).await?,
                PipelineStage::RollingBack => self.run_rollback(run).await?,
                PipelineStage::Succeeded | PipelineStage::Failed => break,
            }
            self.store.save(run).await?;
        }

        self.events.try_emit(
            "run.finished",
            Some(json!({
                "run_id": run.id.to_string(),
                "status": run.status.to_string(),
            })),
        );
        info!(run_id = %run.id, status = %run.status, "pipeline run finished");
        Ok(run.outcome())
    }

    async fn run_build(
        &self,
        run: &mut PipelineRun,
        cancel: &CancelToken,
    ) -> Result<(), DeployflowError> {
        let work = {
            let activities = Arc::clone(&self.activities);
            let repo = run.input.repo_ref.clone();
            let commit = run.input.commit.clone();
            move |_attempt: u32| {
                let activities = Arc::clone(&activities);
                let repo = repo.clone();
                let commit = commit.clone();
                let fut: BoxFuture<'static, Result<String, ActivityError>> =
                    Box::pin(async move { activities.build_image(&repo, &commit).await });
                fut
            }
        };

        match self
            .executor
            .execute(
                run,
                StageName::Build,
                &self.config.build.retry,
                self.config.build.timeout(),
                cancel,
                work,
            )
            .await
        {
            Ok(image_id) => {
                info!(run_id = %run.id, image_id = %image_id, "image built");
                run.image_id = Some(image_id);
                run.advance(PipelineStage::Testing);
            }
            Err(err) => {
                warn!(run_id = %run.id, error = %err, "build failed, cleaning up");
                let record = self
                    .compensation
                    .compensate(&self.executor, CompensationKind::Cleanup, run)
                    .await;
                self.events
                    .try_emit("compensation.finished", serde_json::to_value(&record).ok());
                run.fail(err.into());
            }
        }
        Ok(())
    }

    async fn run_test(
        &self,
        run: &mut PipelineRun,
        cancel: &CancelToken,
    ) -> Result<(), DeployflowError> {
        let image_id = run.image_id.clone().ok_or_else(|| {
            DeployflowError::InvalidState(format!("run {}: testing without an image", run.id))
        })?;

        let work = {
            let activities = Arc::clone(&self.activities);
            move |_attempt: u32| {
                let activities = Arc::clone(&activities);
                let image_id = image_id.clone();
                let fut: BoxFuture<'static, Result<bool, ActivityError>> =
                    Box::pin(async move {
                        // tests fail closed: a completed-but-failing suite
                        // is a non-retryable stage failure
                        match activities.run_tests(&image_id).await {
                            Ok(true) => Ok(true),
                            Ok(false) => Err(ActivityError::non_retryable("tests failed")),
                            Err(err) => Err(err),
                        }
                    });
                fut
            }
        };

        match self
            .executor
            .execute(
                run,
                StageName::Test,
                &self.config.test.retry,
                self.config.test.timeout(),
                cancel,
                work,
            )
            .await
        {
            Ok(_) => {
                info!(run_id = %run.id, "tests passed");
                run.advance(PipelineStage::AwaitingApproval);
            }
            Err(err) => {
                warn!(run_id = %run.id, error = %err, "test stage failed");
                run.fail(err.into());
            }
        }
        Ok(())
    }

    async fn run_approval(
        &self,
        run: &mut PipelineRun,
        cancel: &CancelToken,
    ) -> Result<(), DeployflowError> {
        let started_at = Utc::now();
        info!(run_id = %run.id, "waiting for manual approval");

        let decision = tokio::select! {
            value = self.signals.await_signal(run.id, APPROVAL_GATE) => Some(value),
            () = cancel.cancelled() => None,
        };

        let attempt_number = run.attempts_for(StageName::Approval) + 1;
        match decision {
            Some(value) if value == "approved" => {
                info!(run_id = %run.id, "deployment approved");
                self.record_attempt(
                    run,
                    StageAttempt::finished(
                        StageName::Approval,
                        attempt_number,
                        started_at,
                        AttemptOutcome::succeeded_with(json!(value)),
                    ),
                )
                .await?;
                self.events.try_emit(
                    "signal.consumed",
                    Some(json!({ "run_id": run.id.to_string(), "gate": APPROVAL_GATE })),
                );
                run.advance(PipelineStage::Deploying);
            }
            Some(value) => {
                warn!(run_id = %run.id, decision = %value, "deployment rejected by manual approval");
                let failure = RunFailure::new(
                    ErrorKind::ApprovalRejected,
                    format!("deployment rejected by manual approval: {value}"),
                );
                self.record_attempt(
                    run,
                    StageAttempt::finished(
                        StageName::Approval,
                        attempt_number,
                        started_at,
                        AttemptOutcome::Failed {
                            kind: failure.kind,
                            message: failure.message.clone(),
                        },
                    ),
                )
                .await?;
                run.fail(failure);
            }
            None => {
                let err = ActivityError::cancelled(cancel.reason());
                warn!(run_id = %run.id, "approval wait cancelled");
                self.record_attempt(
                    run,
                    StageAttempt::finished(
                        StageName::Approval,
                        attempt_number,
                        started_at,
                        AttemptOutcome::failed(&err),
                    ),
                )
                .await?;
                run.fail(err.into());
            }
        }
        Ok(())
    }

    async fn run_deploy(
        &self,
        run: &mut PipelineRun,
        cancel: &CancelToken,
    ) -> Result<(), DeployflowError> {
        let image_id = run.image_id.clone().ok_or_else(|| {
            DeployflowError::InvalidState(format!("run {}: deploying without an image", run.id))
        })?;

        let work = {
            let activities = Arc::clone(&self.activities);
            let image_id = image_id.clone();
            move |_attempt: u32| {
                let activities = Arc::clone(&activities);
                let image_id = image_id.clone();
                let fut: BoxFuture<'static, Result<String, ActivityError>> =
                    Box::pin(async move { activities.deploy_image(&image_id).await });
                fut
            }
        };

        match self
            .executor
            .execute(
                run,
                StageName::Deploy,
                &self.config.deploy.retry,
                self.config.deploy.timeout(),
                cancel,
                work,
            )
            .await
        {
            Ok(deployment_id) => {
                info!(run_id = %run.id, deployment_id = %deployment_id, "deployment live");
                run.deployment = Some(DeploymentRecord::new(deployment_id, image_id));
                run.advance(PipelineStage::Monitoring);
            }
            Err(err) => {
                warn!(run_id = %run.id, error = %err, "deploy failed");
                run.fail(err.into());
            }
        }
        Ok(())
    }

    async fn run_monitor(
        &self,
        run: &mut PipelineRun,
        cancel: &CancelToken,
    ) -> Result<(), DeployflowError> {
        let deployment_id = run
            .deployment
            .as_ref()
            .map(|d| d.deployment_id.clone())
            .ok_or_else(|| {
                DeployflowError::InvalidState(format!(
                    "run {}: monitoring without a deployment",
                    run.id
                ))
            })?;
        let monitor = self.config.monitor.clone();
        let hb = HeartbeatHandle::new(monitor.heartbeat_interval(), monitor.stall_threshold());
        let stage_started = Utc::now();
        info!(
            run_id = %run.id,
            deployment_id = %deployment_id,
            window_s = monitor.observation_window().as_secs(),
            "observing deployment health"
        );

        let work = {
            let activities = Arc::clone(&self.activities);
            let deployment_id = deployment_id.clone();
            let hb = hb.clone();
            let monitor = monitor.clone();
            move |_attempt: u32| {
                let activities = Arc::clone(&activities);
                let deployment_id = deployment_id.clone();
                let hb = hb.clone();
                let monitor = monitor.clone();
                let fut: BoxFuture<'static, Result<f64, ActivityError>> = Box::pin(async move {
                    let deadline = tokio::time::Instant::now() + monitor.observation_window();
                    loop {
                        hb.pulse();
                        let rate = activities.check_error_rate(&deployment_id).await?;
                        if rate > monitor.error_rate_threshold {
                            return Err(ActivityError::non_retryable(format!(
                                "error rate {rate:.4} exceeded threshold {:.4}",
                                monitor.error_rate_threshold
                            )));
                        }
                        if tokio::time::Instant::now() >= deadline {
                            return Ok(rate);
                        }
                        tokio::time::sleep(monitor.poll_interval()).await;
                        if tokio::time::Instant::now() >= deadline {
                            return Ok(rate);
                        }
                    }
                });
                fut
            }
        };

        let observed = tokio::select! {
            result = self.executor.execute(
                run,
                StageName::Monitor,
                &self.config.monitor_stage.retry,
                self.config.monitor_stage.timeout(),
                cancel,
                work,
            ) => result,
            () = hb.stalled() => Err(ActivityError::stalled(hb.elapsed_since_pulse())),
            () = cancel.cancelled() => Err(ActivityError::cancelled(cancel.reason())),
        };

        match observed {
            Ok(rate) => {
                if let Some(dep) = run.deployment.as_mut() {
                    dep.health = HealthStatus::Healthy;
                    dep.last_error_rate = Some(rate);
                }
                info!(run_id = %run.id, rate, "deployment healthy for the full observation window");
                run.succeed();
            }
            Err(err) => {
                // the stall and cancel races resolve outside the
                // executor, so their attempts are recorded here
                if matches!(err.kind, ErrorKind::StallDetected | ErrorKind::Cancelled) {
                    let attempt = StageAttempt::finished(
                        StageName::Monitor,
                        run.attempts_for(StageName::Monitor) + 1,
                        stage_started,
                        AttemptOutcome::failed(&err),
                    );
                    self.record_attempt(run, attempt).await?;
                }
                warn!(run_id = %run.id, error = %err, "deployment unhealthy, rolling back");
                if let Some(dep) = run.deployment.as_mut() {
                    dep.health = HealthStatus::Unhealthy;
                }
                run.failure = Some(err.into());
                run.advance(PipelineStage::RollingBack);
            }
        }
        Ok(())
    }

    async fn run_rollback(&self, run: &mut PipelineRun) -> Result<(), DeployflowError> {
        let record = self
            .compensation
            .compensate(&self.executor, CompensationKind::Rollback, run)
            .await;
        self.events
            .try_emit("compensation.finished", serde_json::to_value(&record).ok());

        let failure = run.failure.clone().unwrap_or_else(|| {
            RunFailure::new(
                ErrorKind::NonRetryableExternal,
                "monitoring reported unhealthy",
            )
        });
        run.fail(failure);
        Ok(())
    }

    async fn record_attempt(
        &self,
        run: &mut PipelineRun,
        attempt: StageAttempt,
    ) -> Result<(), DeployflowError> {
        run.history.push(attempt.clone());
        run.updated_at = Utc::now();
        self.store.record_attempt(run.id, &attempt).await?;
        Ok(())
    }
}
