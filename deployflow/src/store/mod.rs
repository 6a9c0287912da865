//! Run persistence.
//!
//! The store is shared across runs and must tolerate at-least-once
//! writes: full-run snapshots are keyed by run ID and attempt records by
//! (run, stage, attempt number), so replaying a write after a crash is
//! harmless. Concurrent writes to different run IDs are independent.

use crate::core::{PipelineRun, RunId, RunStatus, StageAttempt};
use crate::errors::StoreError;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

/// Repository port for pipeline run state.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Persists a full run snapshot. Idempotent: replaying the same
    /// snapshot is a no-op.
    async fn save(&self, run: &PipelineRun) -> Result<(), StoreError>;

    /// Loads a run by ID, for resumption.
    async fn load(&self, run_id: RunId) -> Result<Option<PipelineRun>, StoreError>;

    /// Appends one attempt record to a run's history. Idempotent under
    /// retry: a record with an already-present (stage, attempt) key
    /// replaces the existing entry instead of duplicating it.
    async fn record_attempt(
        &self,
        run_id: RunId,
        attempt: &StageAttempt,
    ) -> Result<(), StoreError>;

    /// Lists runs by status, for operator dashboards.
    async fn list_by_status(&self, status: RunStatus) -> Result<Vec<PipelineRun>, StoreError>;
}

/// In-memory run store.
///
/// The reference implementation and the test backend. Production
/// deployments put a database behind the same port.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: DashMap<RunId, PipelineRun>,
}

impl InMemoryRunStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    /// Returns true if no runs are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn save(&self, run: &PipelineRun) -> Result<(), StoreError> {
        self.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn load(&self, run_id: RunId) -> Result<Option<PipelineRun>, StoreError> {
        Ok(self.runs.get(&run_id).map(|entry| entry.clone()))
    }

    async fn record_attempt(
        &self,
        run_id: RunId,
        attempt: &StageAttempt,
    ) -> Result<(), StoreError> {
        let mut entry = self
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| StoreError::NotFound(run_id.to_string()))?;

        let existing = entry
            .history
            .iter_mut()
            .find(|a| a.stage == attempt.stage && a.attempt == attempt.attempt);
        match existing {
            Some(slot) => *slot = attempt.clone(),
            None => entry.history.push(attempt.clone()),
        }
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn list_by_status(&self, status: RunStatus) -> Result<Vec<PipelineRun>, StoreError> {
        Ok(self
            .runs
            .iter()
            .filter(|entry| entry.status == status)
            .map(|entry| entry.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AttemptOutcome, RunInput, StageName};
    use crate::errors::ActivityError;

    fn test_run() -> PipelineRun {
        PipelineRun::new(RunInput::new("git@example.com:app.git", "abc1234"))
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let store = InMemoryRunStore::new();
        let run = test_run();

        store.save(&run).await.unwrap();
        let loaded = store.load(run.id).await.unwrap().unwrap();
        assert_eq!(loaded, run);
    }

    #[tokio::test]
    async fn test_load_missing_run() {
        let store = InMemoryRunStore::new();
        assert!(store.load(RunId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_is_idempotent() {
        let store = InMemoryRunStore::new();
        let run = test_run();

        store.save(&run).await.unwrap();
        store.save(&run).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_record_attempt_replay_does_not_duplicate() {
        let store = InMemoryRunStore::new();
        let run = test_run();
        store.save(&run).await.unwrap();

        let attempt = StageAttempt::finished(
            StageName::Build,
            1,
            Utc::now(),
            AttemptOutcome::failed(&ActivityError::retryable("flaky registry")),
        );
        store.record_attempt(run.id, &attempt).await.unwrap();
        store.record_attempt(run.id, &attempt).await.unwrap();

        let loaded = store.load(run.id).await.unwrap().unwrap();
        assert_eq!(loaded.history.len(), 1);
    }

    #[tokio::test]
    async fn test_record_attempt_unknown_run() {
        let store = InMemoryRunStore::new();
        let attempt = StageAttempt::finished(
            StageName::Build,
            1,
            Utc::now(),
            AttemptOutcome::succeeded(),
        );
        let err = store.record_attempt(RunId::new(), &attempt).await;
        assert!(matches!(err, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_by_status() {
        let store = InMemoryRunStore::new();

        let running = test_run();
        store.save(&running).await.unwrap();

        let mut done = test_run();
        done.succeed();
        store.save(&done).await.unwrap();

        let succeeded = store.list_by_status(RunStatus::Succeeded).await.unwrap();
        assert_eq!(succeeded.len(), 1);
        assert_eq!(succeeded[0].id, done.id);

        assert!(store
            .list_by_status(RunStatus::RolledBack)
            .await
            .unwrap()
            .is_empty());
    }
}
