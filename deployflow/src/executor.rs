//! Single-activity execution with deadlines, retries, and durable attempt
//! records.
//!
//! Every attempt is persisted before the retry decision, so a process
//! restart mid-retry resumes from the recorded attempt count instead of
//! restarting the budget. This is what makes the core durable rather than
//! a plain retry loop.

use crate::cancellation::CancelToken;
use crate::core::{AttemptOutcome, PipelineRun, StageAttempt, StageName};
use crate::errors::ActivityError;
use crate::retry::{RetryPolicy, RetryState};
use crate::store::RunStore;
use chrono::Utc;
use futures::future::BoxFuture;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Executes one unit of external work per call, under a retry policy.
pub struct ActivityExecutor {
    store: Arc<dyn RunStore>,
}

impl ActivityExecutor {
    /// Creates an executor recording attempts through the given store.
    #[must_use]
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    /// Runs `work` until it succeeds, its failure is non-retryable, or
    /// the attempt budget is exhausted.
    ///
    /// The budget resumes from the run's recorded attempts for `stage`.
    /// Each attempt runs under `timeout` and produces one attempt record
    /// in the run's history and the store. Backoff sleeps are interrupted
    /// by cancellation.
    pub async fn execute<T, F>(
        &self,
        run: &mut PipelineRun,
        stage: StageName,
        policy: &RetryPolicy,
        timeout: Duration,
        cancel: &CancelToken,
        work: F,
    ) -> Result<T, ActivityError>
    where
        T: Serialize + Send,
        F: Fn(u32) -> BoxFuture<'static, Result<T, ActivityError>> + Send + Sync,
    {
        let mut state = RetryState::resume(run.attempts_for(stage));
        if state.is_exhausted(policy) {
            return Err(ActivityError::non_retryable(format!(
                "{stage}: retry budget exhausted before execution"
            )));
        }

        loop {
            if cancel.is_cancelled() {
                return Err(ActivityError::cancelled(cancel.reason()));
            }

            let attempt_number = state.next_attempt_number();
            let started_at = Utc::now();
            debug!(
                run_id = %run.id,
                stage = %stage,
                attempt = attempt_number,
                max_attempts = policy.max_attempts,
                "starting activity attempt"
            );

            let result = tokio::time::timeout(timeout, work(attempt_number)).await;
            state.record_attempt();

            let error = match result {
                Ok(Ok(value)) => {
                    let recorded = serde_json::to_value(&value)
                        .ok()
                        .filter(|v| !v.is_null());
                    let outcome = match recorded {
                        Some(v) => AttemptOutcome::succeeded_with(v),
                        None => AttemptOutcome::succeeded(),
                    };
                    self.record(run, StageAttempt::finished(stage, attempt_number, started_at, outcome))
                        .await?;
                    return Ok(value);
                }
                Ok(Err(err)) => {
                    self.record(
                        run,
                        StageAttempt::finished(
                            stage,
                            attempt_number,
                            started_at,
                            AttemptOutcome::failed(&err),
                        ),
                    )
                    .await?;
                    err
                }
                Err(_elapsed) => {
                    self.record(
                        run,
                        StageAttempt::finished(
                            stage,
                            attempt_number,
                            started_at,
                            AttemptOutcome::TimedOut,
                        ),
                    )
                    .await?;
                    ActivityError::timeout(timeout)
                }
            };

            if !policy.permits_retry(error.kind) {
                warn!(
                    run_id = %run.id,
                    stage = %stage,
                    error = %error,
                    "activity failed with non-retryable error"
                );
                return Err(error);
            }
            if state.is_exhausted(policy) {
                warn!(
                    run_id = %run.id,
                    stage = %stage,
                    attempts = state.attempt,
                    error = %error,
                    "activity retry budget exhausted"
                );
                return Err(error);
            }

            let delay = state.backoff_delay(policy);
            debug!(
                run_id = %run.id,
                stage = %stage,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "backing off before retry"
            );
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => {
                    return Err(ActivityError::cancelled(cancel.reason()));
                }
            }
        }
    }

    async fn record(
        &self,
        run: &mut PipelineRun,
        attempt: StageAttempt,
    ) -> Result<(), ActivityError> {
        run.history.push(attempt.clone());
        run.updated_at = Utc::now();
        self.store
            .record_attempt(run.id, &attempt)
            .await
            .map_err(|err| {
                ActivityError::non_retryable(format!("attempt record failed: {err}"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RunInput;
    use crate::errors::ErrorKind;
    use crate::retry::JitterStrategy;
    use crate::store::InMemoryRunStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(max_attempts)
            .with_initial_interval_ms(10)
            .with_jitter(JitterStrategy::None)
    }

    async fn setup() -> (Arc<InMemoryRunStore>, ActivityExecutor, PipelineRun) {
        let store = Arc::new(InMemoryRunStore::new());
        let run = PipelineRun::new(RunInput::new("git@example.com:app.git", "abc1234"));
        store.save(&run).await.unwrap();
        let executor = ActivityExecutor::new(store.clone());
        (store, executor, run)
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_first_attempt() {
        let (store, executor, mut run) = setup().await;

        let result = executor
            .execute(
                &mut run,
                StageName::Build,
                &fast_policy(3),
                Duration::from_secs(5),
                &CancelToken::new(),
                |_| Box::pin(async { Ok("img123".to_string()) }),
            )
            .await;

        assert_eq!(result.unwrap(), "img123");
        assert_eq!(run.history.len(), 1);
        assert!(run.history[0].outcome.is_success());

        let stored = store.load(run.id).await.unwrap().unwrap();
        assert_eq!(stored.history.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_uses_exactly_max_attempts() {
        let (store, executor, mut run) = setup().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result: Result<(), ActivityError> = executor
            .execute(
                &mut run,
                StageName::Build,
                &fast_policy(4),
                Duration::from_secs(5),
                &CancelToken::new(),
                move |_| {
                    let counter = counter.clone();
                    Box::pin(async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err(ActivityError::retryable("registry flaking"))
                    })
                },
            )
            .await;

        assert_eq!(result.unwrap_err().kind, ErrorKind::RetryableExternal);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(run.attempts_for(StageName::Build), 4);

        let stored = store.load(run.id).await.unwrap().unwrap();
        assert_eq!(stored.history.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_failure_stops_immediately() {
        let (_store, executor, mut run) = setup().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result: Result<(), ActivityError> = executor
            .execute(
                &mut run,
                StageName::Build,
                &fast_policy(5),
                Duration::from_secs(5),
                &CancelToken::new(),
                move |_| {
                    let counter = counter.clone();
                    Box::pin(async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err(ActivityError::non_retryable("image rejected by policy"))
                    })
                },
            )
            .await;

        assert_eq!(result.unwrap_err().kind, ErrorKind::NonRetryableExternal);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_recorded_and_retried() {
        let (_store, executor, mut run) = setup().await;

        let result: Result<(), ActivityError> = executor
            .execute(
                &mut run,
                StageName::Deploy,
                &fast_policy(2),
                Duration::from_secs(1),
                &CancelToken::new(),
                |_| {
                    Box::pin(async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(())
                    })
                },
            )
            .await;

        assert_eq!(result.unwrap_err().kind, ErrorKind::Timeout);
        assert_eq!(run.history.len(), 2);
        assert!(run
            .history
            .iter()
            .all(|a| matches!(a.outcome, AttemptOutcome::TimedOut)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumes_budget_from_recorded_attempts() {
        let (_store, executor, mut run) = setup().await;

        // two attempts already on record from before the restart
        for attempt in 1..=2 {
            run.history.push(StageAttempt::finished(
                StageName::Build,
                attempt,
                Utc::now(),
                AttemptOutcome::failed(&ActivityError::retryable("flaky")),
            ));
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result: Result<(), ActivityError> = executor
            .execute(
                &mut run,
                StageName::Build,
                &fast_policy(3),
                Duration::from_secs(5),
                &CancelToken::new(),
                move |attempt| {
                    let counter = counter.clone();
                    Box::pin(async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(attempt, 3);
                        Err(ActivityError::retryable("still flaky"))
                    })
                },
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(run.attempts_for(StageName::Build), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_backoff() {
        let (_store, executor, mut run) = setup().await;
        let cancel = CancelToken::new();
        let aborter = cancel.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            aborter.cancel("operator abort");
        });

        let slow_retry = RetryPolicy::new()
            .with_max_attempts(3)
            .with_initial_interval_ms(3_600_000)
            .with_jitter(JitterStrategy::None);

        let result: Result<(), ActivityError> = executor
            .execute(
                &mut run,
                StageName::Build,
                &slow_retry,
                Duration::from_secs(5),
                &cancel,
                |_| Box::pin(async { Err(ActivityError::retryable("flaky")) }),
            )
            .await;

        assert_eq!(result.unwrap_err().kind, ErrorKind::Cancelled);
        assert_eq!(run.history.len(), 1);
    }
}
