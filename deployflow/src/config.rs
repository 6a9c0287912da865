//! Pipeline configuration: per-stage retry and timeout policies plus the
//! monitoring stage's observation parameters.
//!
//! Defaults mirror the production deployment worker this core was built
//! for: 10/15/30 minute build/test/deploy deadlines, a 2 minute health
//! observation window, a 30 second heartbeat stall threshold, and 3
//! attempts per activity.

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry and deadline policy for one activity stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagePolicy {
    /// Retry policy for the stage.
    pub retry: RetryPolicy,
    /// Per-attempt deadline, in milliseconds.
    pub timeout_ms: u64,
}

impl StagePolicy {
    /// Creates a policy with the default retry behavior and the given
    /// per-attempt deadline.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            retry: RetryPolicy::default(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The per-attempt deadline.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Parameters of the production health observation.
///
/// The observation window is mandatory: monitoring always reaches a
/// healthy/unhealthy decision within it rather than polling unbounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorPolicy {
    /// Interval between error-rate checks, in milliseconds.
    pub poll_interval_ms: u64,
    /// Error rate above which the deployment is unhealthy.
    pub error_rate_threshold: f64,
    /// How long the deployment must stay healthy, in milliseconds.
    pub observation_window_ms: u64,
    /// Expected heartbeat cadence, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Silence longer than this declares the check stalled, in
    /// milliseconds.
    pub stall_threshold_ms: u64,
}

impl Default for MonitorPolicy {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10_000,
            error_rate_threshold: 0.05,
            observation_window_ms: 120_000,
            heartbeat_interval_ms: 10_000,
            stall_threshold_ms: 30_000,
        }
    }
}

impl MonitorPolicy {
    /// Creates a policy with the default parameters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Sets the error-rate threshold.
    #[must_use]
    pub fn with_error_rate_threshold(mut self, threshold: f64) -> Self {
        self.error_rate_threshold = threshold;
        self
    }

    /// Sets the observation window.
    #[must_use]
    pub fn with_observation_window(mut self, window: Duration) -> Self {
        self.observation_window_ms = window.as_millis() as u64;
        self
    }

    /// Sets the stall threshold.
    #[must_use]
    pub fn with_stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold_ms = threshold.as_millis() as u64;
        self
    }

    /// The interval between error-rate checks.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// The required healthy observation window.
    #[must_use]
    pub fn observation_window(&self) -> Duration {
        Duration::from_millis(self.observation_window_ms)
    }

    /// The expected heartbeat cadence.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// The heartbeat stall threshold.
    #[must_use]
    pub fn stall_threshold(&self) -> Duration {
        Duration::from_millis(self.stall_threshold_ms)
    }
}

/// Full pipeline configuration, one policy per stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Build stage policy.
    pub build: StagePolicy,
    /// Test stage policy.
    pub test: StagePolicy,
    /// Deploy stage policy.
    pub deploy: StagePolicy,
    /// Monitoring stage activity policy. The deadline must exceed the
    /// observation window or healthy runs would time out.
    pub monitor_stage: StagePolicy,
    /// Monitoring observation parameters.
    pub monitor: MonitorPolicy,
    /// Rollback compensation policy. Single attempt: compensations are
    /// best-effort and at most once per run.
    pub rollback: StagePolicy,
    /// Cleanup compensation policy. Single attempt, same as rollback.
    pub cleanup: StagePolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let monitor = MonitorPolicy::default();
        let monitor_timeout = monitor.observation_window() + Duration::from_secs(30);
        let single_attempt = RetryPolicy::default().with_max_attempts(1);

        Self {
            build: StagePolicy::new(Duration::from_secs(10 * 60)),
            test: StagePolicy::new(Duration::from_secs(15 * 60)),
            deploy: StagePolicy::new(Duration::from_secs(30 * 60)),
            monitor_stage: StagePolicy::new(monitor_timeout),
            monitor,
            rollback: StagePolicy::new(Duration::from_secs(5 * 60))
                .with_retry(single_attempt.clone()),
            cleanup: StagePolicy::new(Duration::from_secs(5 * 60)).with_retry(single_attempt),
        }
    }
}

impl PipelineConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the build policy.
    #[must_use]
    pub fn with_build(mut self, policy: StagePolicy) -> Self {
        self.build = policy;
        self
    }

    /// Replaces the test policy.
    #[must_use]
    pub fn with_test(mut self, policy: StagePolicy) -> Self {
        self.test = policy;
        self
    }

    /// Replaces the deploy policy.
    #[must_use]
    pub fn with_deploy(mut self, policy: StagePolicy) -> Self {
        self.deploy = policy;
        self
    }

    /// Replaces the monitoring observation parameters and stretches the
    /// monitoring stage deadline to cover the new window.
    #[must_use]
    pub fn with_monitor(mut self, monitor: MonitorPolicy) -> Self {
        self.monitor_stage.timeout_ms = monitor.observation_window_ms + 30_000;
        self.monitor = monitor;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_worker_constants() {
        let config = PipelineConfig::default();
        assert_eq!(config.build.timeout(), Duration::from_secs(600));
        assert_eq!(config.test.timeout(), Duration::from_secs(900));
        assert_eq!(config.deploy.timeout(), Duration::from_secs(1800));
        assert_eq!(config.monitor.observation_window(), Duration::from_secs(120));
        assert_eq!(config.monitor.stall_threshold(), Duration::from_secs(30));
        assert!((config.monitor.error_rate_threshold - 0.05).abs() < f64::EPSILON);
    }

    #[test]
    fn test_monitor_stage_deadline_covers_window() {
        let config = PipelineConfig::default();
        assert!(config.monitor_stage.timeout() > config.monitor.observation_window());

        let config = config.with_monitor(
            MonitorPolicy::new().with_observation_window(Duration::from_secs(600)),
        );
        assert!(config.monitor_stage.timeout() > Duration::from_secs(600));
    }

    #[test]
    fn test_compensations_single_attempt() {
        let config = PipelineConfig::default();
        assert_eq!(config.rollback.retry.max_attempts, 1);
        assert_eq!(config.cleanup.retry.max_attempts, 1);
    }
}
