//! Contract tests for CheckpointStore and RunStore.
//!
//! Every backend must pass the same checks; each test runs against the
//! in-memory fakes and the filesystem store.

use scenario_state::fakes::{MemoryCheckpointStore, MemoryRunStore};
use scenario_state::storage_traits::*;
use scenario_state::{
    ExecutionMode, FsStore, GraphNode, NodeStatus, RunId, RunRecord, RunStatus, ScenarioState,
    StorageError,
};
use serde_json::json;

fn node(id: &str) -> GraphNode {
    GraphNode {
        id: id.to_string(),
        title: id.to_string(),
        pillar: "market".to_string(),
        node_type: "insight".to_string(),
        content: json!({}),
        confidence: 0.5,
        dependencies: Vec::new(),
        status: NodeStatus::Draft,
        updated_at: None,
    }
}

fn invalid_state() -> ScenarioState {
    let mut state = ScenarioState::blank("scn", "Invalid");
    state.graph.nodes = vec![node("dup"), node("dup")];
    state
}

async fn checkpoint_contract(store: &dyn CheckpointStore) {
    let run_id = RunId::new();
    let state = ScenarioState::blank("scn", "Test");

    let record = store.checkpoint(&run_id, &state, 0, "start").await.unwrap();
    assert_eq!(record.digest, state.digest().unwrap());

    let mut next = state.clone();
    next.graph.nodes.push(node("n1"));
    store.checkpoint(&run_id, &next, 1, "step").await.unwrap();

    let latest = store.latest(&run_id).await.unwrap();
    assert_eq!(latest.index, 1);
    assert_eq!(latest.state, next);

    let history = store.history(&run_id).await.unwrap();
    let indices: Vec<usize> = history.iter().map(|r| r.index).collect();
    assert_eq!(indices, vec![0, 1]);
}

async fn rejects_invalid_state(store: &dyn CheckpointStore) {
    let run_id = RunId::new();
    let err = store
        .checkpoint(&run_id, &invalid_state(), 0, "bad")
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Rejected(_)));

    let err = store.latest(&run_id).await.unwrap_err();
    assert!(matches!(err, StorageError::CheckpointNotFound { .. }));
}

async fn run_store_contract(store: &dyn RunStore) {
    let mut record = RunRecord::start("scn-contract", ExecutionMode::Linear, None);
    store.put_run(&record).await.unwrap();

    record.status = RunStatus::Failed;
    record.checkpoint_index = 2;
    record.last_error = Some("boom".to_string());
    store.put_run(&record).await.unwrap();

    let loaded = store.get_run(&record.run_id).await.unwrap();
    assert_eq!(loaded.status, RunStatus::Failed);
    assert_eq!(loaded.checkpoint_index, 2);

    let resumed = RunRecord::resume_from(&loaded);
    store.put_run(&resumed).await.unwrap();
    let runs = store.list_runs("scn-contract").await.unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs
        .iter()
        .any(|r| r.resumed_from_run_id.as_ref() == Some(&record.run_id)));

    let err = store.get_run(&RunId::new()).await.unwrap_err();
    assert!(matches!(err, StorageError::RunNotFound { .. }));
}

#[tokio::test]
async fn memory_checkpoint_store_contract() {
    checkpoint_contract(&MemoryCheckpointStore::new()).await;
}

#[tokio::test]
async fn memory_checkpoint_store_rejects_invalid_state() {
    let store = MemoryCheckpointStore::new();
    rejects_invalid_state(&store).await;
    assert!(store.is_empty());
}

#[tokio::test]
async fn memory_run_store_contract() {
    run_store_contract(&MemoryRunStore::new()).await;
}

#[tokio::test]
async fn fs_store_checkpoint_contract() {
    let dir = tempfile::tempdir().unwrap();
    checkpoint_contract(&FsStore::open(dir.path()).unwrap()).await;
}

#[tokio::test]
async fn fs_store_rejects_invalid_state() {
    let dir = tempfile::tempdir().unwrap();
    rejects_invalid_state(&FsStore::open(dir.path()).unwrap()).await;
}

#[tokio::test]
async fn fs_store_run_contract() {
    let dir = tempfile::tempdir().unwrap();
    run_store_contract(&FsStore::open(dir.path()).unwrap()).await;
}
