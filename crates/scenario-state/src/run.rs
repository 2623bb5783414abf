//! Run record: one execution attempt over a scenario.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::schema::DecisionKey;

/// Unique identifier for an execution run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random RunId
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        RunId(s.to_string())
    }
}

/// Status of a run. Terminal once it leaves `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Blocked,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Fixed step order, used for single-decision edits.
    Linear,
    /// Cluster phases, used for full builds.
    Phased,
}

/// Why a run ended in `Blocked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockedReason {
    Contradictions,
    PivotRequired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTiming {
    pub step: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub skipped: bool,
}

/// Full run record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub scenario_id: String,
    pub mode: ExecutionMode,
    #[serde(default)]
    pub changed_decision: Option<DecisionKey>,
    pub status: RunStatus,
    /// Resume point; see the executors for what an index counts.
    pub checkpoint_index: usize,
    #[serde(default)]
    pub completed_steps: Vec<String>,
    #[serde(default)]
    pub skipped_steps: Vec<String>,
    #[serde(default)]
    pub completed_clusters: Vec<String>,
    #[serde(default)]
    pub resumed_from_run_id: Option<RunId>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub blocked_reason: Option<BlockedReason>,
    #[serde(default)]
    pub merge_warning_count: usize,
    #[serde(default)]
    pub step_timings: Vec<StepTiming>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    /// A fresh `running` record.
    pub fn start(
        scenario_id: impl Into<String>,
        mode: ExecutionMode,
        changed_decision: Option<DecisionKey>,
    ) -> Self {
        Self {
            run_id: RunId::new(),
            scenario_id: scenario_id.into(),
            mode,
            changed_decision,
            status: RunStatus::Running,
            checkpoint_index: 0,
            completed_steps: Vec::new(),
            skipped_steps: Vec::new(),
            completed_clusters: Vec::new(),
            resumed_from_run_id: None,
            last_error: None,
            blocked_reason: None,
            merge_warning_count: 0,
            step_timings: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// A new `running` record that continues `failed` from its checkpoint.
    pub fn resume_from(failed: &RunRecord) -> Self {
        let mut record = Self::start(
            failed.scenario_id.clone(),
            failed.mode,
            failed.changed_decision,
        );
        record.resumed_from_run_id = Some(failed.run_id.clone());
        record.checkpoint_index = failed.checkpoint_index;
        record
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn duration_ms(&self) -> Option<u64> {
        let finished = self.finished_at?;
        u64::try_from((finished - self.started_at).num_milliseconds()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_unique() {
        assert_ne!(RunId::new(), RunId::new());
    }

    #[test]
    fn test_resume_links_to_failed_run() {
        let mut failed = RunRecord::start("scn", ExecutionMode::Linear, Some(DecisionKey::Icp));
        failed.status = RunStatus::Failed;
        failed.checkpoint_index = 3;

        let resumed = RunRecord::resume_from(&failed);
        assert_eq!(resumed.resumed_from_run_id.as_ref(), Some(&failed.run_id));
        assert_eq!(resumed.checkpoint_index, 3);
        assert_eq!(resumed.changed_decision, Some(DecisionKey::Icp));
        assert_eq!(resumed.status, RunStatus::Running);
        assert_ne!(resumed.run_id, failed.run_id);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&RunStatus::Blocked).unwrap();
        assert_eq!(json, "\"blocked\"");
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }
}
