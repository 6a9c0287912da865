//! A scripted mock of the external collaborators.

use crate::activities::Activities;
use crate::errors::ActivityError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

type Script<T> = Mutex<VecDeque<Result<T, ActivityError>>>;

/// A mock [`Activities`] implementation with scripted outcomes and call
/// tracking.
///
/// Each operation pops the next scripted result; the final scripted entry
/// is sticky and repeats, so one entry scripts "always behave like this".
/// Unscripted operations succeed with plausible defaults.
#[derive(Debug, Default)]
pub struct MockActivities {
    build_results: Script<String>,
    test_results: Script<bool>,
    deploy_results: Script<String>,
    error_rates: Script<f64>,
    rollback_results: Script<()>,
    cleanup_results: Script<()>,

    build_calls: Mutex<usize>,
    test_calls: Mutex<usize>,
    deploy_calls: Mutex<usize>,
    check_calls: Mutex<usize>,
    rollback_calls: Mutex<usize>,
    cleanup_calls: Mutex<usize>,

    rollback_targets: Mutex<Vec<String>>,
    check_latency: Mutex<Duration>,
}

impl MockActivities {
    /// Creates a mock with empty scripts and default successes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the next build outcome.
    pub fn script_build(&self, result: Result<String, ActivityError>) {
        self.build_results.lock().push_back(result);
    }

    /// Scripts the next test outcome.
    pub fn script_tests(&self, result: Result<bool, ActivityError>) {
        self.test_results.lock().push_back(result);
    }

    /// Scripts the next deploy outcome.
    pub fn script_deploy(&self, result: Result<String, ActivityError>) {
        self.deploy_results.lock().push_back(result);
    }

    /// Scripts the next error-rate sample.
    pub fn script_error_rate(&self, result: Result<f64, ActivityError>) {
        self.error_rates.lock().push_back(result);
    }

    /// Scripts the next rollback outcome.
    pub fn script_rollback(&self, result: Result<(), ActivityError>) {
        self.rollback_results.lock().push_back(result);
    }

    /// Scripts the next cleanup outcome.
    pub fn script_cleanup(&self, result: Result<(), ActivityError>) {
        self.cleanup_results.lock().push_back(result);
    }

    /// Makes every `check_error_rate` call take this long. Used to
    /// simulate a hung metrics backend for stall tests.
    pub fn set_check_latency(&self, latency: Duration) {
        *self.check_latency.lock() = latency;
    }

    /// Number of `build_image` calls.
    #[must_use]
    pub fn build_calls(&self) -> usize {
        *self.build_calls.lock()
    }

    /// Number of `run_tests` calls.
    #[must_use]
    pub fn test_calls(&self) -> usize {
        *self.test_calls.lock()
    }

    /// Number of `deploy_image` calls.
    #[must_use]
    pub fn deploy_calls(&self) -> usize {
        *self.deploy_calls.lock()
    }

    /// Number of `check_error_rate` calls.
    #[must_use]
    pub fn check_calls(&self) -> usize {
        *self.check_calls.lock()
    }

    /// Number of `rollback_deployment` calls.
    #[must_use]
    pub fn rollback_calls(&self) -> usize {
        *self.rollback_calls.lock()
    }

    /// Number of `cleanup_resources` calls.
    #[must_use]
    pub fn cleanup_calls(&self) -> usize {
        *self.cleanup_calls.lock()
    }

    /// Deployment IDs passed to `rollback_deployment`, in order.
    #[must_use]
    pub fn rollback_targets(&self) -> Vec<String> {
        self.rollback_targets.lock().clone()
    }

    fn next<T: Clone>(script: &Script<T>) -> Option<Result<T, ActivityError>> {
        let mut script = script.lock();
        if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        }
    }
}

#[async_trait]
impl Activities for MockActivities {
    async fn build_image(&self, _repo_ref: &str, commit: &str) -> Result<String, ActivityError> {
        *self.build_calls.lock() += 1;
        Self::next(&self.build_results).unwrap_or_else(|| {
            let short = &commit[..commit.len().min(8)];
            Ok(format!("registry.example.com/app:{short}"))
        })
    }

    async fn run_tests(&self, _image_id: &str) -> Result<bool, ActivityError> {
        *self.test_calls.lock() += 1;
        Self::next(&self.test_results).unwrap_or(Ok(true))
    }

    async fn deploy_image(&self, _image_id: &str) -> Result<String, ActivityError> {
        *self.deploy_calls.lock() += 1;
        let count = *self.deploy_calls.lock();
        Self::next(&self.deploy_results).unwrap_or(Ok(format!("deploy-{count}")))
    }

    async fn check_error_rate(&self, _deployment_id: &str) -> Result<f64, ActivityError> {
        *self.check_calls.lock() += 1;
        let latency = *self.check_latency.lock();
        if latency > Duration::ZERO {
            tokio::time::sleep(latency).await;
        }
        Self::next(&self.error_rates).unwrap_or(Ok(0.01))
    }

    async fn rollback_deployment(&self, deployment_id: &str) -> Result<(), ActivityError> {
        *self.rollback_calls.lock() += 1;
        self.rollback_targets.lock().push(deployment_id.to_string());
        Self::next(&self.rollback_results).unwrap_or(Ok(()))
    }

    async fn cleanup_resources(&self) -> Result<(), ActivityError> {
        *self.cleanup_calls.lock() += 1;
        Self::next(&self.cleanup_results).unwrap_or(Ok(()))
    }
}
