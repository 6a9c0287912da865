//! Liveness tracking for the long-running monitoring activity.
//!
//! The monitoring loop pulses on every health-check cycle; absence of a
//! pulse within the stall threshold is the sole stall signal, independent
//! of what the check itself returns. A slow or hung external check is
//! thereby distinguishable from a healthy long-poll loop.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant};

struct Inner {
    last_pulse: Mutex<Instant>,
    expected_interval: Duration,
    stall_threshold: Duration,
}

/// Shared handle to the liveness state of one monitoring attempt.
///
/// Cheap to clone; the polling loop pulses through one clone while the
/// state machine races the stall watchdog on another. Discarded without
/// further pulsing when the stage completes or the run is aborted.
#[derive(Clone)]
pub struct HeartbeatHandle {
    inner: Arc<Inner>,
}

impl HeartbeatHandle {
    /// Creates a handle, treating creation as the first pulse.
    #[must_use]
    pub fn new(expected_interval: Duration, stall_threshold: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                last_pulse: Mutex::new(Instant::now()),
                expected_interval,
                stall_threshold,
            }),
        }
    }

    /// Records a liveness pulse.
    pub fn pulse(&self) {
        *self.inner.last_pulse.lock() = Instant::now();
    }

    /// The cadence the monitored activity is expected to pulse at.
    #[must_use]
    pub fn expected_interval(&self) -> Duration {
        self.inner.expected_interval
    }

    /// The silence threshold that declares a stall.
    #[must_use]
    pub fn stall_threshold(&self) -> Duration {
        self.inner.stall_threshold
    }

    /// Time since the last pulse.
    #[must_use]
    pub fn elapsed_since_pulse(&self) -> Duration {
        self.inner.last_pulse.lock().elapsed()
    }

    /// Returns true once the silence has exceeded the stall threshold.
    #[must_use]
    pub fn is_stalled(&self) -> bool {
        self.elapsed_since_pulse() > self.inner.stall_threshold
    }

    /// Suspends until the handle stalls.
    ///
    /// Sleeps until the current pulse's deadline and re-arms whenever a
    /// new pulse has moved it.
    pub async fn stalled(&self) {
        loop {
            let seen = *self.inner.last_pulse.lock();
            time::sleep_until(seen + self.inner.stall_threshold).await;
            if *self.inner.last_pulse.lock() == seen {
                return;
            }
        }
    }
}

impl std::fmt::Debug for HeartbeatHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatHandle")
            .field("elapsed_since_pulse", &self.elapsed_since_pulse())
            .field("stall_threshold", &self.inner.stall_threshold)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> HeartbeatHandle {
        HeartbeatHandle::new(Duration::from_secs(10), Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_handle_not_stalled() {
        let hb = handle();
        assert!(!hb.is_stalled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_past_threshold_stalls() {
        let hb = handle();
        time::sleep(Duration::from_secs(31)).await;
        assert!(hb.is_stalled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pulse_resets_the_clock() {
        let hb = handle();
        time::sleep(Duration::from_secs(25)).await;
        hb.pulse();
        time::sleep(Duration::from_secs(25)).await;
        assert!(!hb.is_stalled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_fires_on_silence() {
        let hb = handle();
        tokio::select! {
            () = hb.stalled() => {}
            () = time::sleep(Duration::from_secs(3600)) => panic!("watchdog never fired"),
        }
        assert!(hb.elapsed_since_pulse() >= hb.stall_threshold());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_survives_ongoing_pulses() {
        let hb = handle();
        let pulser = hb.clone();

        tokio::spawn(async move {
            for _ in 0..12 {
                time::sleep(Duration::from_secs(10)).await;
                pulser.pulse();
            }
            // pulses stop here; the watchdog should fire ~30s later
        });

        let start = Instant::now();
        hb.stalled().await;
        assert!(start.elapsed() >= Duration::from_secs(150));
    }
}
