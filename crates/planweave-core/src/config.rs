//! Orchestrator tuning.

use std::path::Path;

use serde::{Deserialize, Serialize};
use state_merge::MergePolicy;

use crate::error::{OrchestratorError, OrchestratorResult};

/// Run-level knobs. Every field has a default, so a config file only needs
/// the values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Upper bound on cluster tasks running at once within a phase.
    pub max_concurrency: usize,
    /// Feedback rounds allowed per run.
    pub max_feedback_rounds: u32,
    /// Node-count drift per pillar that still counts as unchanged.
    pub node_count_tolerance: usize,
    /// Change score above which a critical-decision change forces a pivot.
    pub pivot_threshold: f64,
    /// Change score at which a feedback round is recorded as material.
    pub material_change_threshold: f64,
    pub merge: MergePolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            max_feedback_rounds: 1,
            node_count_tolerance: 2,
            pivot_threshold: 0.5,
            material_change_threshold: 0.3,
            merge: MergePolicy::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Load from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> OrchestratorResult<Self> {
        let bytes = std::fs::read(path)?;
        let config: Self = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_max_feedback_rounds(mut self, rounds: u32) -> Self {
        self.max_feedback_rounds = rounds;
        self
    }

    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.max_concurrency == 0 {
            return Err(OrchestratorError::Config(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        let unit = 0.0..=1.0;
        if !unit.contains(&self.pivot_threshold)
            || !unit.contains(&self.material_change_threshold)
            || !unit.contains(&self.merge.assumption_confidence_cap)
        {
            return Err(OrchestratorError::Config(
                "thresholds and confidence cap must lie in [0, 1]".to_string(),
            ));
        }
        if self.material_change_threshold > self.pivot_threshold {
            return Err(OrchestratorError::Config(
                "material_change_threshold must not exceed pivot_threshold".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.max_feedback_rounds, 1);
        assert_eq!(config.node_count_tolerance, 2);
        assert_eq!(config.merge.assumption_confidence_cap, 0.6);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: OrchestratorConfig =
            serde_json::from_str(r#"{"max_concurrency": 2, "merge": {"critical_prefixes": []}}"#)
                .unwrap();
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.pivot_threshold, 0.5);
        assert!(config.merge.critical_prefixes.is_empty());
        assert_eq!(config.merge.assumption_confidence_cap, 0.6);
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let config = OrchestratorConfig {
            material_change_threshold: 0.8,
            ..OrchestratorConfig::default()
        };
        assert!(matches!(config.validate(), Err(OrchestratorError::Config(_))));
        assert!(OrchestratorConfig::default()
            .with_max_concurrency(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("planweave.json");
        std::fs::write(&path, r#"{"max_feedback_rounds": 3}"#).unwrap();
        let config = OrchestratorConfig::from_json_file(&path).unwrap();
        assert_eq!(config.max_feedback_rounds, 3);
    }
}
