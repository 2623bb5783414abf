//! The `AgentOutput` contract returned by every generation step.

use std::collections::HashSet;

use scenario_state::{
    Assumption, DecisionKey, DecisionOption, Fact, GraphNode, Severity, SourceType,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MergeError, MergeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchOp {
    Add,
    Replace,
    Remove,
}

fn default_confidence() -> f64 {
    0.5
}

fn default_source_type() -> SourceType {
    SourceType::Inference
}

/// Evidentiary metadata carried by a patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchMeta {
    #[serde(default = "default_source_type")]
    pub source_type: SourceType,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub sources: Vec<String>,
}

impl Default for PatchMeta {
    fn default() -> Self {
        Self {
            source_type: default_source_type(),
            confidence: default_confidence(),
            sources: Vec::new(),
        }
    }
}

impl PatchMeta {
    pub fn evidence(confidence: f64, sources: Vec<String>) -> Self {
        Self {
            source_type: SourceType::Evidence,
            confidence,
            sources,
        }
    }

    pub fn inference(confidence: f64) -> Self {
        Self {
            source_type: SourceType::Inference,
            confidence,
            sources: Vec::new(),
        }
    }
}

/// One structural edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub op: PatchOp,
    pub path: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub meta: PatchMeta,
}

impl Patch {
    pub fn add(path: impl Into<String>, value: Value) -> Self {
        Self {
            op: PatchOp::Add,
            path: path.into(),
            value,
            meta: PatchMeta::default(),
        }
    }

    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        Self {
            op: PatchOp::Replace,
            path: path.into(),
            value,
            meta: PatchMeta::default(),
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self {
            op: PatchOp::Remove,
            path: path.into(),
            value: Value::Null,
            meta: PatchMeta::default(),
        }
    }

    pub fn with_meta(mut self, meta: PatchMeta) -> Self {
        self.meta = meta;
        self
    }
}

/// A decision's option set plus a recommendation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub decision: DecisionKey,
    pub options: Vec<DecisionOption>,
    #[serde(default)]
    pub recommended_option_id: Option<String>,
}

/// A risk reported by a step; lands in the ledger as `risk:<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Risk {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub detail: String,
    pub severity: Severity,
    #[serde(default)]
    pub pillar: Option<String>,
}

/// Everything a step may contribute to the document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    #[serde(default)]
    pub patches: Vec<Patch>,
    #[serde(default)]
    pub proposals: Vec<Proposal>,
    #[serde(default)]
    pub facts: Vec<Fact>,
    #[serde(default)]
    pub assumptions: Vec<Assumption>,
    #[serde(default)]
    pub risks: Vec<Risk>,
    #[serde(default)]
    pub node_updates: Vec<GraphNode>,
}

impl AgentOutput {
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
            && self.proposals.is_empty()
            && self.facts.is_empty()
            && self.assumptions.is_empty()
            && self.risks.is_empty()
            && self.node_updates.is_empty()
    }

    /// Boundary check applied to every step result before merging.
    pub fn validate(&self, step: &str) -> MergeResult<()> {
        let invalid = |reason: String| MergeError::InvalidOutput {
            step: step.to_string(),
            reason,
        };

        for patch in &self.patches {
            if !patch.path.starts_with('/') {
                return Err(invalid(format!("patch path {:?} is not a pointer", patch.path)));
            }
            if !unit(patch.meta.confidence) {
                return Err(invalid(format!("patch confidence out of range at {}", patch.path)));
            }
        }

        for proposal in &self.proposals {
            let mut seen = HashSet::new();
            if let Some(dup) = proposal.options.iter().find(|o| !seen.insert(o.id.as_str())) {
                return Err(invalid(format!(
                    "proposal for {} repeats option {}",
                    proposal.decision, dup.id
                )));
            }
            if let Some(rec) = &proposal.recommended_option_id {
                if !proposal.options.iter().any(|o| &o.id == rec) {
                    return Err(invalid(format!(
                        "proposal for {} recommends unknown option {rec}",
                        proposal.decision
                    )));
                }
            }
        }

        if let Some(f) = self.facts.iter().find(|f| !unit(f.confidence)) {
            return Err(invalid(format!("fact confidence out of range: {}", f.claim)));
        }
        if let Some(a) = self.assumptions.iter().find(|a| !unit(a.confidence)) {
            return Err(invalid(format!("assumption confidence out of range: {}", a.claim)));
        }
        if self.risks.iter().any(|r| r.id.trim().is_empty()) {
            return Err(invalid("risk with empty id".to_string()));
        }
        if self.node_updates.iter().any(|n| n.id.is_empty()) {
            return Err(invalid("node update with empty id".to_string()));
        }
        if let Some(n) = self.node_updates.iter().find(|n| !unit(n.confidence)) {
            return Err(invalid(format!("node confidence out of range: {}", n.id)));
        }
        Ok(())
    }
}

fn unit(value: f64) -> bool {
    (0.0..=1.0).contains(&value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_patch_deserializes_with_default_meta() {
        let patch: Patch =
            serde_json::from_value(json!({"op": "replace", "path": "/pillars/market/summary", "value": "x"}))
                .unwrap();
        assert_eq!(patch.meta.source_type, SourceType::Inference);
        assert_eq!(patch.meta.confidence, 0.5);
    }

    #[test]
    fn test_validate_rejects_relative_path() {
        let output = AgentOutput {
            patches: vec![Patch::replace("pillars/market", json!({}))],
            ..AgentOutput::default()
        };
        assert!(output.validate("s").is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_recommendation() {
        let output = AgentOutput {
            proposals: vec![Proposal {
                decision: DecisionKey::Pricing,
                options: vec![DecisionOption::new("tiered", "Tiered")],
                recommended_option_id: Some("flat".to_string()),
            }],
            ..AgentOutput::default()
        };
        let err = output.validate("pricing_analyst").unwrap_err();
        assert!(err.to_string().contains("pricing_analyst"));
    }

    #[test]
    fn test_validate_rejects_node_confidence_out_of_range() {
        let node: GraphNode = serde_json::from_value(json!({
            "id": "market.tam",
            "title": "TAM",
            "pillar": "market",
            "type": "insight",
            "content": {},
            "confidence": 1.4,
        }))
        .unwrap();
        let output = AgentOutput {
            node_updates: vec![node],
            ..AgentOutput::default()
        };
        let err = output.validate("market_sizer").unwrap_err();
        assert!(err.to_string().contains("market.tam"));
    }

    #[test]
    fn test_empty_output_is_valid() {
        assert!(AgentOutput::default().validate("s").is_ok());
        assert!(AgentOutput::default().is_empty());
    }
}
