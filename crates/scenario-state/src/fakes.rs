//! In-memory fakes for storage traits (testing only)
//!
//! `MemoryCheckpointStore` and `MemoryRunStore` satisfy the trait contracts
//! without touching disk.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::StorageError;
use crate::run::{RunId, RunRecord};
use crate::schema::ScenarioState;
use crate::storage_traits::*;

fn lock<T>(mutex: &Mutex<T>) -> StorageResult<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|e| StorageError::Backend(format!("lock poisoned: {e}")))
}

// ---------------------------------------------------------------------------
// MemoryCheckpointStore
// ---------------------------------------------------------------------------

/// Checkpoints kept in a `HashMap<run_id, Vec<record>>`.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    records: Mutex<HashMap<String, Vec<CheckpointRecord>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total checkpoints across all runs.
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .map(|r| r.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn checkpoint(
        &self,
        run_id: &RunId,
        state: &ScenarioState,
        index: usize,
        label: &str,
    ) -> StorageResult<CheckpointRecord> {
        let record = CheckpointRecord::build(run_id, state, index, label)?;
        lock(&self.records)?
            .entry(run_id.0.clone())
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    async fn latest(&self, run_id: &RunId) -> StorageResult<CheckpointRecord> {
        lock(&self.records)?
            .get(&run_id.0)
            .and_then(|records| records.last().cloned())
            .ok_or_else(|| StorageError::CheckpointNotFound {
                run_id: run_id.0.clone(),
            })
    }

    async fn history(&self, run_id: &RunId) -> StorageResult<Vec<CheckpointRecord>> {
        Ok(lock(&self.records)?
            .get(&run_id.0)
            .cloned()
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// MemoryRunStore
// ---------------------------------------------------------------------------

/// Run records kept in insertion order.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: Mutex<Vec<RunRecord>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn put_run(&self, record: &RunRecord) -> StorageResult<()> {
        let mut runs = lock(&self.runs)?;
        match runs.iter_mut().find(|r| r.run_id == record.run_id) {
            Some(existing) => *existing = record.clone(),
            None => runs.push(record.clone()),
        }
        Ok(())
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        lock(&self.runs)?
            .iter()
            .find(|r| &r.run_id == run_id)
            .cloned()
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })
    }

    async fn list_runs(&self, scenario_id: &str) -> StorageResult<Vec<RunRecord>> {
        Ok(lock(&self.runs)?
            .iter()
            .filter(|r| r.scenario_id == scenario_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{ExecutionMode, RunStatus};

    #[tokio::test]
    async fn test_latest_returns_last_written() {
        let store = MemoryCheckpointStore::new();
        let run_id = RunId::new();
        let mut state = ScenarioState::blank("scn", "Test");

        store.checkpoint(&run_id, &state, 1, "a").await.unwrap();
        state.meta.name = "Changed".to_string();
        store.checkpoint(&run_id, &state, 2, "b").await.unwrap();

        let latest = store.latest(&run_id).await.unwrap();
        assert_eq!(latest.index, 2);
        assert_eq!(latest.state.meta.name, "Changed");
        assert_eq!(store.history(&run_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_latest_without_checkpoint_is_not_found() {
        let store = MemoryCheckpointStore::new();
        let err = store.latest(&RunId::new()).await.unwrap_err();
        assert!(matches!(err, StorageError::CheckpointNotFound { .. }));
    }

    #[tokio::test]
    async fn test_put_run_replaces_by_id() {
        let store = MemoryRunStore::new();
        let mut record = RunRecord::start("scn", ExecutionMode::Phased, None);
        store.put_run(&record).await.unwrap();
        record.status = RunStatus::Completed;
        store.put_run(&record).await.unwrap();

        let runs = store.list_runs("scn").await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Completed);
        assert!(store.list_runs("other").await.unwrap().is_empty());
    }
}
