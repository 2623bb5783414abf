//! Scenario-State: canonical document and persistence contracts for PlanWeave
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: a fixed, validated document shape and append-only snapshots.
//!
//! ## Key Components
//!
//! - `ScenarioState`: the scenario document, validated on every commit
//! - `RunRecord`: one execution attempt and its resume point
//! - `CheckpointStore` / `RunStore`: storage seams used by the orchestrator
//! - `FsStore`: JSON-file implementation of both stores

mod error;
pub mod fakes;
pub mod fs;
pub mod run;
pub mod schema;
pub mod storage_traits;

pub use error::{SchemaError, SchemaResult, StorageError};
pub use fs::FsStore;
pub use run::{BlockedReason, ExecutionMode, RunId, RunRecord, RunStatus, StepTiming};
pub use schema::{
    Assumption, ComplianceLevel, Decision, DecisionKey, DecisionOption, EvidenceSection,
    EvidenceSource, Fact, GraphEdge, GraphGroup, GraphNode, GraphSection, LedgerEntry, LedgerKind,
    NodeStatus, PillarHealth, PillarStatus, PillarSummary, Provenance, ScenarioMeta,
    ScenarioState, SelectionSource, Severity, SourceType, Telemetry, SECTIONS,
};
pub use storage_traits::{CheckpointRecord, CheckpointStore, RunStore, StorageResult};
