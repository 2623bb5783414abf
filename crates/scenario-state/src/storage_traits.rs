//! Storage trait definitions for PlanWeave
//!
//! - `CheckpointStore`: append-only scenario snapshots per run
//! - `RunStore`: run record persistence
//!
//! Both traits are async and backend-agnostic. The orchestration core only
//! talks to these traits; in-memory fakes live in `fakes`, a JSON file
//! backend in `fs`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::run::{RunId, RunRecord};
use crate::schema::ScenarioState;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// One persisted snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub run_id: RunId,
    pub index: usize,
    pub label: String,
    pub state: ScenarioState,
    /// SHA-256 of the snapshot's canonical encoding
    pub digest: String,
    pub saved_at: DateTime<Utc>,
}

impl CheckpointRecord {
    /// Validate `state` and build a record for it.
    ///
    /// Fails with `StorageError::Rejected` when the document does not pass
    /// the commit check; nothing should be written in that case.
    pub fn build(
        run_id: &RunId,
        state: &ScenarioState,
        index: usize,
        label: &str,
    ) -> StorageResult<Self> {
        state.commit_check()?;
        Ok(Self {
            run_id: run_id.clone(),
            index,
            label: label.to_string(),
            digest: state.digest()?,
            state: state.clone(),
            saved_at: Utc::now(),
        })
    }
}

/// Snapshot store.
///
/// Guarantees:
/// - Records for a run are append-only, ordered by write.
/// - `latest` returns the most recently written record.
/// - A state failing `commit_check` is never stored.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn checkpoint(
        &self,
        run_id: &RunId,
        state: &ScenarioState,
        index: usize,
        label: &str,
    ) -> StorageResult<CheckpointRecord>;

    /// Most recent checkpoint. `CheckpointNotFound` if the run never wrote one.
    async fn latest(&self, run_id: &RunId) -> StorageResult<CheckpointRecord>;

    /// All checkpoints of a run, oldest first.
    async fn history(&self, run_id: &RunId) -> StorageResult<Vec<CheckpointRecord>>;
}

/// Run record store. `put_run` inserts or replaces by run id.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn put_run(&self, record: &RunRecord) -> StorageResult<()>;

    /// `RunNotFound` if absent.
    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord>;

    /// Runs for one scenario, oldest first.
    async fn list_runs(&self, scenario_id: &str) -> StorageResult<Vec<RunRecord>>;
}
