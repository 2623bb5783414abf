//! Canonical scenario document.
//!
//! A scenario is one nested tree with a fixed set of top-level sections.
//! Sections the orchestrator reasons about (evidence, decisions, pillars,
//! graph, ledger, telemetry) are typed; the rest stay free-form JSON.
//!
//! Every construction path goes through [`ScenarioState::from_value`], which
//! rejects missing or unknown sections before any typed decoding happens.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{SchemaError, SchemaResult};

/// The fixed top-level key set, in document order.
pub const SECTIONS: [&str; 12] = [
    "meta",
    "idea",
    "constraints",
    "inputs",
    "evidence",
    "decisions",
    "pillars",
    "graph",
    "risks",
    "execution",
    "telemetry",
    "artifacts",
];

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Regulatory burden declared for the scenario.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceLevel {
    Low,
    #[default]
    Standard,
    High,
}

fn default_team_size() -> u32 {
    1
}

/// Identity and update metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioMeta {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Business category, e.g. `"b2b_saas"` or `"consumer"`.
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub compliance_level: ComplianceLevel,
    #[serde(default = "default_team_size")]
    pub team_size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Evidence
// ---------------------------------------------------------------------------

/// How a claim or written value is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Evidence,
    Inference,
    Assumption,
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Evidence => write!(f, "evidence"),
            Self::Inference => write!(f, "inference"),
            Self::Assumption => write!(f, "assumption"),
        }
    }
}

/// A cited web source. Unique on `normalized_url`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceSource {
    pub url: String,
    #[serde(default)]
    pub normalized_url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub snippets: Vec<String>,
    #[serde(default)]
    pub quality_score: f64,
}

/// A claim backed by source references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub claim: String,
    #[serde(default)]
    pub sources: Vec<String>,
    pub confidence: f64,
    /// Document path the claim supports, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_path: Option<String>,
}

/// An unverified claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assumption {
    pub claim: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceSection {
    #[serde(default)]
    pub sources: Vec<EvidenceSource>,
    #[serde(default)]
    pub facts: Vec<Fact>,
    #[serde(default)]
    pub assumptions: Vec<Assumption>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// The fixed set of decision slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKey {
    /// Ideal customer profile (target customer).
    Icp,
    Positioning,
    Pricing,
    RevenueModel,
    Channel,
    SalesMotion,
    MvpScope,
}

impl DecisionKey {
    pub const ALL: [DecisionKey; 7] = [
        DecisionKey::Icp,
        DecisionKey::Positioning,
        DecisionKey::Pricing,
        DecisionKey::RevenueModel,
        DecisionKey::Channel,
        DecisionKey::SalesMotion,
        DecisionKey::MvpScope,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Icp => "icp",
            Self::Positioning => "positioning",
            Self::Pricing => "pricing",
            Self::RevenueModel => "revenue_model",
            Self::Channel => "channel",
            Self::SalesMotion => "sales_motion",
            Self::MvpScope => "mvp_scope",
        }
    }
}

impl fmt::Display for DecisionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecisionKey {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        DecisionKey::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| SchemaError::UnknownDecision(s.to_string()))
    }
}

/// Who set a decision's selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionSource {
    /// Auto-recommendation by the orchestration layer.
    Auto,
    /// Explicit user action.
    User,
}

/// One mutually exclusive choice for a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionOption {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub summary: String,
    /// Structured traits used by cross-pillar rules (e.g. `segment`).
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl DecisionOption {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            summary: String::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    /// String attribute lookup.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    #[serde(default)]
    pub options: Vec<DecisionOption>,
    #[serde(default)]
    pub recommended_option_id: Option<String>,
    /// Only ever written by the orchestration layer.
    #[serde(default)]
    pub selected_option_id: Option<String>,
    #[serde(default)]
    pub selection_source: Option<SelectionSource>,
}

impl Decision {
    pub fn has_option(&self, option_id: &str) -> bool {
        self.options.iter().any(|o| o.id == option_id)
    }

    pub fn option(&self, option_id: &str) -> Option<&DecisionOption> {
        self.options.iter().find(|o| o.id == option_id)
    }

    pub fn selected_option(&self) -> Option<&DecisionOption> {
        self.selected_option_id
            .as_deref()
            .and_then(|id| self.option(id))
    }

    /// A selection that no longer names one of the current options.
    pub fn selection_is_stale(&self) -> bool {
        self.selected_option_id
            .as_deref()
            .is_some_and(|id| !self.has_option(id))
    }
}

// ---------------------------------------------------------------------------
// Pillars
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PillarStatus {
    #[default]
    Draft,
    Ready,
    PendingUserDecision,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PillarSummary {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub status: PillarStatus,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Draft,
    Active,
    Stale,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub pillar: String,
    #[serde(rename = "type", default)]
    pub node_type: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub status: NodeStatus,
    /// Advances only when the node's content signature changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphGroup {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pillar: Option<String>,
    #[serde(default)]
    pub node_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSection {
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub edges: Vec<GraphEdge>,
    #[serde(default)]
    pub groups: Vec<GraphGroup>,
}

// ---------------------------------------------------------------------------
// Risk ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// High and critical findings prevent finalization.
    pub fn is_blocking(self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    /// Risk reported by a generation step.
    Risk,
    /// A decision-critical claim arrived without sources.
    MissingProof,
    /// Two evidence-backed values disagreed at the same path.
    ConflictingEvidence,
    /// A cross-pillar rule still failing after feedback.
    RuleViolation,
    /// A feedback round moved a pillar materially but below the pivot bar.
    MaterialChange,
}

/// One row of the risk ledger, upserted by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub kind: LedgerKind,
    pub severity: Severity,
    #[serde(default)]
    pub blocking: bool,
    pub title: String,
    #[serde(default)]
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pillar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_step: Option<String>,
    #[serde(default)]
    pub resolved: bool,
}

impl LedgerEntry {
    pub fn new(
        id: impl Into<String>,
        kind: LedgerKind,
        severity: Severity,
        title: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            severity,
            blocking: false,
            title: title.into(),
            detail: String::new(),
            pillar: None,
            path: None,
            source_step: None,
            resolved: false,
        }
    }

    /// Open entries that hold up finalization.
    pub fn is_open_blocker(&self) -> bool {
        !self.resolved && (self.blocking || self.severity.is_blocking())
    }
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

/// Who wrote the value at a path, and how well supported it was.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_type: SourceType,
    pub confidence: f64,
    #[serde(default)]
    pub sources: Vec<String>,
    pub origin: String,
}

/// Per-pillar rule pass/fail tally. Informational only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PillarHealth {
    pub passed: u32,
    pub failed: u32,
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    #[serde(default)]
    pub provenance: BTreeMap<String, Provenance>,
    #[serde(default)]
    pub health: BTreeMap<String, PillarHealth>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// ScenarioState
// ---------------------------------------------------------------------------

/// The canonical scenario document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioState {
    pub meta: ScenarioMeta,
    pub idea: Value,
    pub constraints: Value,
    pub inputs: Value,
    pub evidence: EvidenceSection,
    pub decisions: BTreeMap<DecisionKey, Decision>,
    pub pillars: BTreeMap<String, PillarSummary>,
    pub graph: GraphSection,
    pub risks: Vec<LedgerEntry>,
    pub execution: Value,
    pub telemetry: Telemetry,
    pub artifacts: Value,
}

impl ScenarioState {
    /// An empty scenario with every decision slot present.
    pub fn blank(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            meta: ScenarioMeta {
                id: id.into(),
                name: name.into(),
                category: String::new(),
                compliance_level: ComplianceLevel::default(),
                team_size: default_team_size(),
                updated_at: None,
                updated_by: None,
                extra: Map::new(),
            },
            idea: Value::Object(Map::new()),
            constraints: Value::Object(Map::new()),
            inputs: Value::Object(Map::new()),
            evidence: EvidenceSection::default(),
            decisions: DecisionKey::ALL
                .into_iter()
                .map(|k| (k, Decision::default()))
                .collect(),
            pillars: BTreeMap::new(),
            graph: GraphSection::default(),
            risks: Vec::new(),
            execution: Value::Object(Map::new()),
            telemetry: Telemetry::default(),
            artifacts: Value::Object(Map::new()),
        }
    }

    /// Decode and validate a raw document.
    pub fn from_value(value: Value) -> SchemaResult<Self> {
        check_sections(&value)?;
        let state: ScenarioState =
            serde_json::from_value(value).map_err(|e| SchemaError::Malformed(e.to_string()))?;
        state.validate()?;
        Ok(state)
    }

    pub fn to_value(&self) -> SchemaResult<Value> {
        serde_json::to_value(self).map_err(|e| SchemaError::Malformed(e.to_string()))
    }

    /// Full re-validation, as performed on every commit.
    pub fn commit_check(&self) -> SchemaResult<()> {
        let value = self.to_value()?;
        check_sections(&value)?;
        self.validate()
    }

    /// Structural invariants that serde alone cannot express.
    pub fn validate(&self) -> SchemaResult<()> {
        let mut node_ids = HashSet::new();
        for node in &self.graph.nodes {
            if node.id.is_empty() {
                return Err(SchemaError::EmptyNodeId);
            }
            if !node_ids.insert(node.id.as_str()) {
                return Err(SchemaError::DuplicateNode(node.id.clone()));
            }
            check_unit(&format!("/graph/nodes/{}/confidence", node.id), node.confidence)?;
        }

        for (key, decision) in &self.decisions {
            let mut option_ids = HashSet::new();
            for option in &decision.options {
                if !option_ids.insert(option.id.as_str()) {
                    return Err(SchemaError::DuplicateOption {
                        decision: key.to_string(),
                        option: option.id.clone(),
                    });
                }
            }
            if let Some(rec) = &decision.recommended_option_id {
                if !decision.has_option(rec) {
                    return Err(SchemaError::UnknownRecommendation {
                        decision: key.to_string(),
                        option: rec.clone(),
                    });
                }
            }
        }

        for (i, source) in self.evidence.sources.iter().enumerate() {
            check_unit(&format!("/evidence/sources/{i}/quality_score"), source.quality_score)?;
        }
        for (i, fact) in self.evidence.facts.iter().enumerate() {
            check_unit(&format!("/evidence/facts/{i}/confidence"), fact.confidence)?;
        }
        for (i, assumption) in self.evidence.assumptions.iter().enumerate() {
            check_unit(&format!("/evidence/assumptions/{i}/confidence"), assumption.confidence)?;
        }
        Ok(())
    }

    /// SHA-256 of the canonical JSON encoding.
    pub fn digest(&self) -> SchemaResult<String> {
        let bytes =
            serde_json::to_vec(self).map_err(|e| SchemaError::Malformed(e.to_string()))?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Resolve an RFC 6901 pointer against the encoded document.
    pub fn pointer(&self, pointer: &str) -> Option<Value> {
        self.to_value().ok()?.pointer(pointer).cloned()
    }

    pub fn decision(&self, key: DecisionKey) -> Option<&Decision> {
        self.decisions.get(&key)
    }

    pub fn selection(&self, key: DecisionKey) -> Option<&str> {
        self.decisions
            .get(&key)
            .and_then(|d| d.selected_option_id.as_deref())
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.graph.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_count_for_pillar(&self, pillar: &str) -> usize {
        self.graph.nodes.iter().filter(|n| n.pillar == pillar).count()
    }

    pub fn ledger_entry(&self, id: &str) -> Option<&LedgerEntry> {
        self.risks.iter().find(|e| e.id == id)
    }

    /// Insert or replace a ledger entry by id.
    ///
    /// A resolved entry stays resolved when re-reported with the same content.
    pub fn upsert_ledger_entry(&mut self, entry: LedgerEntry) {
        match self.risks.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => {
                let keep_resolved = existing.resolved
                    && existing.title == entry.title
                    && existing.detail == entry.detail;
                *existing = entry;
                existing.resolved |= keep_resolved;
            }
            None => self.risks.push(entry),
        }
    }

    /// Mark a ledger entry resolved (human action). Returns whether it existed.
    pub fn resolve_ledger_entry(&mut self, id: &str) -> bool {
        match self.risks.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.resolved = true;
                true
            }
            None => false,
        }
    }

    /// Drop an entry entirely, e.g. when the condition behind it cleared.
    pub fn remove_ledger_entry(&mut self, id: &str) -> Option<LedgerEntry> {
        let index = self.risks.iter().position(|e| e.id == id)?;
        Some(self.risks.remove(index))
    }
}

fn check_sections(value: &Value) -> SchemaResult<()> {
    let object = value.as_object().ok_or(SchemaError::NotAnObject)?;
    for section in SECTIONS {
        if !object.contains_key(section) {
            return Err(SchemaError::MissingSection(section.to_string()));
        }
    }
    if let Some(unknown) = object.keys().find(|k| !SECTIONS.contains(&k.as_str())) {
        return Err(SchemaError::UnknownSection(unknown.clone()));
    }
    Ok(())
}

fn check_unit(path: &str, value: f64) -> SchemaResult<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(SchemaError::OutOfRange {
            path: path.to_string(),
            value,
        })
    }
}
