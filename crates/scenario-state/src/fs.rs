//! JSON-file store implementing both storage traits.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::StorageError;
use crate::run::{RunId, RunRecord};
use crate::schema::ScenarioState;
use crate::storage_traits::*;

/// Filesystem-backed store.
///
/// Layout:
/// - `<root>/runs/<run_id>.json`
/// - `<root>/checkpoints/<run_id>/<index:06>-<seq:04>.json`
///
/// The sequence suffix keeps repeated writes of the same index (e.g. the
/// terminal snapshot) as separate, ordered files.
pub struct FsStore {
    runs_dir: PathBuf,
    checkpoints_dir: PathBuf,
}

impl FsStore {
    /// Open a store rooted at `root`, creating its directories if needed.
    pub fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let runs_dir = root.as_ref().join("runs");
        let checkpoints_dir = root.as_ref().join("checkpoints");
        fs::create_dir_all(&runs_dir)?;
        fs::create_dir_all(&checkpoints_dir)?;
        Ok(Self {
            runs_dir,
            checkpoints_dir,
        })
    }

    fn run_path(&self, run_id: &RunId) -> PathBuf {
        self.runs_dir.join(format!("{}.json", run_id.0))
    }

    fn run_checkpoint_dir(&self, run_id: &RunId) -> PathBuf {
        self.checkpoints_dir.join(&run_id.0)
    }

    fn sorted_checkpoint_files(&self, run_id: &RunId) -> StorageResult<Vec<PathBuf>> {
        let dir = self.run_checkpoint_dir(run_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort_by_key(|p| seq_of(p));
        Ok(files)
    }
}

fn seq_of(path: &Path) -> u64 {
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.rsplit('-').next())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// Atomic write: temp file in the target directory, then rename.
fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> StorageResult<()> {
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> StorageResult<T> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[async_trait]
impl CheckpointStore for FsStore {
    async fn checkpoint(
        &self,
        run_id: &RunId,
        state: &ScenarioState,
        index: usize,
        label: &str,
    ) -> StorageResult<CheckpointRecord> {
        let record = CheckpointRecord::build(run_id, state, index, label)?;
        let seq = self.sorted_checkpoint_files(run_id)?.len();
        let dir = self.run_checkpoint_dir(run_id);
        let path = dir.join(format!("{index:06}-{seq:04}.json"));
        write_atomic(&dir, &path, &serde_json::to_vec_pretty(&record)?)?;
        debug!(run_id = %run_id, index, label, path = %path.display(), "checkpoint written");
        Ok(record)
    }

    async fn latest(&self, run_id: &RunId) -> StorageResult<CheckpointRecord> {
        let files = self.sorted_checkpoint_files(run_id)?;
        let path = files.last().ok_or_else(|| StorageError::CheckpointNotFound {
            run_id: run_id.0.clone(),
        })?;
        read_json(path)
    }

    async fn history(&self, run_id: &RunId) -> StorageResult<Vec<CheckpointRecord>> {
        self.sorted_checkpoint_files(run_id)?
            .iter()
            .map(|p| read_json(p))
            .collect()
    }
}

#[async_trait]
impl RunStore for FsStore {
    async fn put_run(&self, record: &RunRecord) -> StorageResult<()> {
        let path = self.run_path(&record.run_id);
        write_atomic(&self.runs_dir, &path, &serde_json::to_vec_pretty(record)?)
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        let path = self.run_path(run_id);
        if !path.exists() {
            return Err(StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            });
        }
        read_json(&path)
    }

    async fn list_runs(&self, scenario_id: &str) -> StorageResult<Vec<RunRecord>> {
        let mut runs = Vec::new();
        for entry in fs::read_dir(&self.runs_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                let record: RunRecord = read_json(&path)?;
                if record.scenario_id == scenario_id {
                    runs.push(record);
                }
            }
        }
        runs.sort_by_key(|r| r.started_at);
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::ExecutionMode;

    fn make_store() -> (tempfile::TempDir, FsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn checkpoint_roundtrip() {
        let (_dir, store) = make_store();
        let run_id = RunId::new();
        let state = ScenarioState::blank("scn", "Test");
        let written = store.checkpoint(&run_id, &state, 4, "step").await.unwrap();
        let read = store.latest(&run_id).await.unwrap();
        assert_eq!(read, written);
        assert_eq!(read.index, 4);
    }

    #[tokio::test]
    async fn repeated_index_keeps_write_order() {
        let (_dir, store) = make_store();
        let run_id = RunId::new();
        let mut state = ScenarioState::blank("scn", "Test");
        store.checkpoint(&run_id, &state, 3, "phase").await.unwrap();
        state.meta.name = "Final".to_string();
        store.checkpoint(&run_id, &state, 3, "final").await.unwrap();

        let latest = store.latest(&run_id).await.unwrap();
        assert_eq!(latest.label, "final");
        assert_eq!(store.history(&run_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn run_records_roundtrip_and_filter() {
        let (_dir, store) = make_store();
        let a = RunRecord::start("scn-a", ExecutionMode::Linear, None);
        let b = RunRecord::start("scn-b", ExecutionMode::Phased, None);
        store.put_run(&a).await.unwrap();
        store.put_run(&b).await.unwrap();

        assert_eq!(store.get_run(&a.run_id).await.unwrap(), a);
        let listed = store.list_runs("scn-b").await.unwrap();
        assert_eq!(listed, vec![b]);
    }

    #[tokio::test]
    async fn missing_run_is_not_found() {
        let (_dir, store) = make_store();
        let err = store.get_run(&RunId::new()).await.unwrap_err();
        assert!(matches!(err, StorageError::RunNotFound { .. }));
    }
}
