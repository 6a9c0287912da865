//! Durable signal gates for out-of-band external input.
//!
//! A gate is an at-most-once-consumed rendezvous keyed by (run, gate
//! name). Delivery before the wait is registered is buffered, so there is
//! no lost-signal race; deliveries after consumption are no-ops. Waiting
//! suspends cooperatively and holds no worker thread.

use crate::core::RunId;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::pin::pin;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

/// The gate name the approval stage waits on.
pub const APPROVAL_GATE: &str = "approval";

/// What happened to a delivered signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The value was buffered (or handed straight to a waiter).
    Buffered,
    /// A value is already buffered and not yet consumed; this one was
    /// dropped.
    AlreadyPending,
    /// The gate was already consumed; late duplicate, ignored.
    AlreadyConsumed,
}

#[derive(Default)]
struct GateState {
    pending: Option<String>,
    consumed: bool,
}

#[derive(Default)]
struct Gate {
    state: Mutex<GateState>,
    notify: Notify,
}

/// Registry of signal gates across runs.
///
/// Consumed gates are retained as tombstones so late duplicates are
/// recognized and ignored for the life of the process.
#[derive(Clone, Default)]
pub struct SignalHub {
    gates: Arc<DashMap<(RunId, String), Arc<Gate>>>,
}

impl SignalHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn gate(&self, run_id: RunId, name: &str) -> Arc<Gate> {
        self.gates
            .entry((run_id, name.to_string()))
            .or_default()
            .clone()
    }

    /// Delivers a signal value to a gate.
    ///
    /// The inbound boundary for the external approval system. At most one
    /// value is buffered per gate until consumed; everything else is
    /// reported back and dropped.
    pub fn deliver(&self, run_id: RunId, name: &str, value: impl Into<String>) -> Delivery {
        let gate = self.gate(run_id, name);
        let mut state = gate.state.lock();

        if state.consumed {
            debug!(%run_id, gate = name, "signal after consumption ignored");
            return Delivery::AlreadyConsumed;
        }
        if state.pending.is_some() {
            debug!(%run_id, gate = name, "signal already buffered, duplicate dropped");
            return Delivery::AlreadyPending;
        }

        state.pending = Some(value.into());
        drop(state);
        gate.notify.notify_waiters();
        Delivery::Buffered
    }

    /// Suspends until exactly one signal for this gate is consumed.
    ///
    /// Resolves immediately if a value was delivered before the wait
    /// began.
    pub async fn await_signal(&self, run_id: RunId, name: &str) -> String {
        let gate = self.gate(run_id, name);
        loop {
            if let Some(value) = Self::try_consume(&gate) {
                return value;
            }
            let mut notified = pin!(gate.notify.notified());
            notified.as_mut().enable();
            if let Some(value) = Self::try_consume(&gate) {
                return value;
            }
            notified.await;
        }
    }

    /// Returns true once the gate's signal has been consumed.
    #[must_use]
    pub fn is_consumed(&self, run_id: RunId, name: &str) -> bool {
        self.gates
            .get(&(run_id, name.to_string()))
            .is_some_and(|gate| gate.state.lock().consumed)
    }

    fn try_consume(gate: &Gate) -> Option<String> {
        let mut state = gate.state.lock();
        let value = state.pending.take()?;
        state.consumed = true;
        Some(value)
    }
}

impl std::fmt::Debug for SignalHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalHub")
            .field("gates", &self.gates.len())
            .finish()
    }
}
