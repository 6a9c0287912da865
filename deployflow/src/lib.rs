//! # Deployflow
//!
//! A durable execution core for multi-stage deployment pipelines
//! (build → test → manual approval → blue-green deploy → health
//! monitoring → rollback).
//!
//! Deployflow guarantees that a pipeline run progresses exactly once per
//! logical step across process restarts, activity failures, and
//! long-running external checks:
//!
//! - **Persisted state machine**: every stage transition is durably
//!   recorded; a restarted run resumes where it left off instead of
//!   repeating completed work or deploying twice
//! - **Retrying activity executor**: deadlines, typed error
//!   classification, exponential backoff, and an attempt budget that
//!   survives restarts
//! - **Heartbeat liveness**: a stalled health check is detected by
//!   missing pulses, independent of what the check returns
//! - **Signal gates**: durable, at-most-once-consumed rendezvous points
//!   for out-of-band human approval, with no lost-signal race
//! - **Compensation**: cleanup and rollback run deterministically on
//!   failure and never change the already-decided outcome
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use deployflow::prelude::*;
//! use std::sync::Arc;
//!
//! let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());
//! let activities: Arc<dyn Activities> = Arc::new(MyActivities::connect()?);
//! let signals = SignalHub::new();
//!
//! let machine = PipelineStateMachine::new(
//!     PipelineConfig::default(),
//!     store,
//!     activities,
//!     signals.clone(),
//! );
//!
//! let run_id = machine.submit(RunInput::new(repo, commit)).await?;
//! // the approval system calls in from outside:
//! //   signals.deliver(run_id, APPROVAL_GATE, "approved");
//! let outcome = machine.execute(run_id, &CancelToken::new()).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod activities;
pub mod cancellation;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod executor;
pub mod heartbeat;
pub mod machine;
pub mod retry;
pub mod signal;
pub mod store;
pub mod telemetry;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::activities::Activities;
    pub use crate::cancellation::CancelToken;
    pub use crate::config::{MonitorPolicy, PipelineConfig, StagePolicy};
    pub use crate::core::{
        CompensationKind, CompensationRecord, DeploymentRecord, HealthStatus, PipelineRun,
        PipelineStage, RunId, RunInput, RunOutcome, RunStatus, StageAttempt, StageName,
    };
    pub use crate::errors::{
        ActivityError, DeployflowError, ErrorKind, RunFailure, StoreError,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::executor::ActivityExecutor;
    pub use crate::heartbeat::HeartbeatHandle;
    pub use crate::machine::PipelineStateMachine;
    pub use crate::retry::{JitterStrategy, RetryPolicy, RetryState};
    pub use crate::signal::{Delivery, SignalHub, APPROVAL_GATE};
    pub use crate::store::{InMemoryRunStore, RunStore};
}
