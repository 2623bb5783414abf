//! The merge engine: folds tagged step outputs into canonical state.
//!
//! Order of work for one pass:
//! 1. facts and assumptions (unsourced facts are downgraded)
//! 2. proposals (options and recommendation, never the selection)
//! 3. step risks into the ledger
//! 4. every patch, sorted by `(path priority, cluster, step index, patch index)`
//!
//! The pass is deterministic: the same inputs in any order produce the same
//! document, apart from the `meta.updated_at` stamp.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use scenario_state::{
    Assumption, EvidenceSource, GraphGroup, GraphNode, LedgerEntry, LedgerKind, Provenance,
    ScenarioState, Severity, SourceType,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{MergeResult, PointerError};
use crate::evidence::{merge_sources, upsert_assumption, upsert_fact};
use crate::graph::{merge_groups, upsert_nodes};
use crate::output::{AgentOutput, Patch, PatchMeta, PatchOp};
use crate::pointer::{self, PatchTarget};

/// Merge tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergePolicy {
    /// Confidence ceiling for anything downgraded to an assumption.
    pub assumption_confidence_cap: f64,
    /// Path prefixes whose unsourced claims raise a missing-proof entry.
    pub critical_prefixes: Vec<String>,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            assumption_confidence_cap: 0.6,
            critical_prefixes: vec!["/decisions/".to_string()],
        }
    }
}

impl MergePolicy {
    pub fn is_critical(&self, path: &str) -> bool {
        self.critical_prefixes.iter().any(|p| path.starts_with(p))
    }
}

/// Who produced a patch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchOrigin {
    /// The orchestration layer itself; the only writer of selections.
    Orchestrator,
    Step(String),
}

impl PatchOrigin {
    pub fn step(id: impl Into<String>) -> Self {
        Self::Step(id.into())
    }

    pub fn is_orchestrator(&self) -> bool {
        matches!(self, Self::Orchestrator)
    }
}

impl fmt::Display for PatchOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Orchestrator => f.write_str("orchestrator"),
            Self::Step(id) => f.write_str(id),
        }
    }
}

/// A step output tagged with its position in the run.
#[derive(Debug, Clone)]
pub struct TaggedOutput {
    pub origin: PatchOrigin,
    /// Cluster name; empty for linear runs and orchestrator writes.
    pub cluster: String,
    pub step_index: usize,
    pub output: AgentOutput,
}

impl TaggedOutput {
    pub fn new(origin: PatchOrigin, cluster: impl Into<String>, step_index: usize, output: AgentOutput) -> Self {
        Self {
            origin,
            cluster: cluster.into(),
            step_index,
            output,
        }
    }

    /// Orchestrator-authored patches.
    pub fn orchestrator(patches: Vec<Patch>) -> Self {
        Self::new(
            PatchOrigin::Orchestrator,
            String::new(),
            0,
            AgentOutput {
                patches,
                ..AgentOutput::default()
            },
        )
    }
}

/// Non-fatal issue raised during a merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MergeWarning {
    /// A step tried to write a decision selection.
    OwnershipViolation { origin: String, path: String },
    /// `evidence` patch without sources became an assumption.
    EvidenceDowngraded { origin: String, path: String, confidence: f64 },
    /// Unsourced fact became an assumption.
    FactDowngraded { origin: String, claim: String },
    /// Two writes to one path disagreed.
    ConflictResolved {
        path: String,
        kept: String,
        dropped: String,
        evidence_conflict: bool,
    },
    /// Patch could not be applied, or would break the schema.
    InvalidPatch { origin: String, path: String, reason: String },
    /// `remove` of a path with nothing there.
    MissingTarget { origin: String, path: String },
    /// A proposal no longer contains the selected option.
    SelectionInvalidated { decision: String, option: String },
}

impl MergeWarning {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OwnershipViolation { .. } => "ownership_violation",
            Self::EvidenceDowngraded { .. } => "evidence_downgraded",
            Self::FactDowngraded { .. } => "fact_downgraded",
            Self::ConflictResolved { .. } => "conflict_resolved",
            Self::InvalidPatch { .. } => "invalid_patch",
            Self::MissingTarget { .. } => "missing_target",
            Self::SelectionInvalidated { .. } => "selection_invalidated",
        }
    }
}

impl fmt::Display for MergeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OwnershipViolation { origin, path } => {
                write!(f, "{origin} may not write {path}")
            }
            Self::EvidenceDowngraded { origin, path, confidence } => {
                write!(f, "{origin} claimed evidence at {path} without sources; kept as assumption ({confidence:.2})")
            }
            Self::FactDowngraded { origin, claim } => {
                write!(f, "{origin} stated an unsourced fact: {claim}")
            }
            Self::ConflictResolved { path, kept, dropped, evidence_conflict } => {
                write!(f, "conflict at {path}: kept {kept}, dropped {dropped}")?;
                if *evidence_conflict {
                    write!(f, " (evidence disagrees)")?;
                }
                Ok(())
            }
            Self::InvalidPatch { origin, path, reason } => {
                write!(f, "{origin} patch at {path} rejected: {reason}")
            }
            Self::MissingTarget { origin, path } => {
                write!(f, "{origin} removed missing path {path}")
            }
            Self::SelectionInvalidated { decision, option } => {
                write!(f, "{decision}: selected option {option} is no longer offered")
            }
        }
    }
}

/// Result of one merge pass.
#[derive(Debug, Clone)]
pub struct MergeReport {
    pub state: ScenarioState,
    pub warnings: Vec<MergeWarning>,
    pub applied: usize,
    pub rejected: usize,
    /// Ledger ids of contradictions raised in this pass.
    pub contradictions: Vec<String>,
}

impl MergeReport {
    pub fn ownership_violations(&self) -> usize {
        self.warnings
            .iter()
            .filter(|w| matches!(w, MergeWarning::OwnershipViolation { .. }))
            .count()
    }
}

/// A value written earlier in this pass.
struct Written {
    value: Value,
    meta: PatchMeta,
    origin: PatchOrigin,
}

struct QueuedPatch<'a> {
    priority: u8,
    cluster: &'a str,
    step_index: usize,
    patch_index: usize,
    origin: &'a PatchOrigin,
    patch: Patch,
}

/// Deterministic merge of step outputs.
#[derive(Debug, Clone, Default)]
pub struct MergeEngine {
    policy: MergePolicy,
}

impl MergeEngine {
    pub fn new(policy: MergePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &MergePolicy {
        &self.policy
    }

    pub fn merge(&self, state: &ScenarioState, outputs: &[TaggedOutput]) -> MergeResult<MergeReport> {
        self.merge_at(state, outputs, Utc::now())
    }

    /// Merge with an explicit clock, so tests can pin timestamps.
    pub fn merge_at(
        &self,
        state: &ScenarioState,
        outputs: &[TaggedOutput],
        now: DateTime<Utc>,
    ) -> MergeResult<MergeReport> {
        let mut pass = Pass {
            policy: &self.policy,
            state: state.clone(),
            warnings: Vec::new(),
            applied: 0,
            rejected: 0,
            contradictions: BTreeSet::new(),
            written: HashMap::new(),
            now,
        };

        let mut ordered: Vec<&TaggedOutput> = outputs.iter().collect();
        ordered.sort_by(|a, b| {
            (a.cluster.as_str(), a.step_index).cmp(&(b.cluster.as_str(), b.step_index))
        });

        for tagged in &ordered {
            pass.ingest_claims(tagged);
        }
        for tagged in &ordered {
            pass.apply_proposals(tagged);
            pass.record_risks(tagged);
        }

        let mut queue = Vec::new();
        for tagged in &ordered {
            let mut patches = tagged.output.patches.clone();
            if !tagged.output.node_updates.is_empty() {
                patches.push(node_update_patch(&tagged.output.node_updates)?);
            }
            for (patch_index, patch) in patches.into_iter().enumerate() {
                queue.push(QueuedPatch {
                    priority: pointer::priority(&patch.path),
                    cluster: &tagged.cluster,
                    step_index: tagged.step_index,
                    patch_index,
                    origin: &tagged.origin,
                    patch,
                });
            }
        }
        queue.sort_by(|a, b| {
            (a.priority, a.cluster, a.step_index, a.patch_index).cmp(&(
                b.priority,
                b.cluster,
                b.step_index,
                b.patch_index,
            ))
        });

        for queued in queue {
            pass.apply_patch(queued.origin, queued.patch);
        }

        pass.state.meta.updated_at = Some(now);
        pass.state.meta.updated_by = Some("merge_engine".to_string());
        pass.state.commit_check()?;

        Ok(MergeReport {
            state: pass.state,
            warnings: pass.warnings,
            applied: pass.applied,
            rejected: pass.rejected,
            contradictions: pass.contradictions.into_iter().collect(),
        })
    }
}

fn node_update_patch(nodes: &[GraphNode]) -> MergeResult<Patch> {
    Ok(Patch::add("/graph/nodes", serde_json::to_value(nodes)?))
}

/// Accept either one object or an array of them.
fn in_unit(value: f64) -> bool {
    (0.0..=1.0).contains(&value)
}

fn many<T: serde::de::DeserializeOwned>(value: &Value) -> Result<Vec<T>, serde_json::Error> {
    match value {
        Value::Array(_) => serde_json::from_value(value.clone()),
        other => Ok(vec![serde_json::from_value(other.clone())?]),
    }
}

struct Pass<'p> {
    policy: &'p MergePolicy,
    state: ScenarioState,
    warnings: Vec<MergeWarning>,
    applied: usize,
    rejected: usize,
    contradictions: BTreeSet<String>,
    written: HashMap<String, Written>,
    now: DateTime<Utc>,
}

impl Pass<'_> {
    fn warn(&mut self, warning: MergeWarning) {
        warn!(kind = warning.kind(), "{warning}");
        self.warnings.push(warning);
    }

    fn reject(&mut self, warning: MergeWarning) {
        self.rejected += 1;
        self.warn(warning);
    }

    fn cap(&self, confidence: f64) -> f64 {
        confidence.min(self.policy.assumption_confidence_cap)
    }

    fn ingest_claims(&mut self, tagged: &TaggedOutput) {
        let origin = tagged.origin.to_string();
        for fact in &tagged.output.facts {
            if !fact.sources.is_empty() {
                upsert_fact(&mut self.state.evidence, fact.clone());
                continue;
            }
            let assumption = Assumption {
                claim: fact.claim.clone(),
                confidence: self.cap(fact.confidence),
                target_path: fact.target_path.clone(),
            };
            upsert_assumption(&mut self.state.evidence, assumption);
            self.warn(MergeWarning::FactDowngraded {
                origin: origin.clone(),
                claim: fact.claim.clone(),
            });

            if let Some(path) = fact.target_path.as_deref().filter(|p| self.policy.is_critical(p)) {
                let mut entry = LedgerEntry::new(
                    format!("missing_proof:{path}"),
                    LedgerKind::MissingProof,
                    Severity::Medium,
                    format!("Unsourced claim supports {path}"),
                );
                entry.detail = fact.claim.clone();
                entry.path = Some(path.to_string());
                entry.source_step = Some(origin.clone());
                self.state.upsert_ledger_entry(entry);
            }
        }
        for assumption in &tagged.output.assumptions {
            upsert_assumption(&mut self.state.evidence, assumption.clone());
        }
    }

    fn apply_proposals(&mut self, tagged: &TaggedOutput) {
        for proposal in &tagged.output.proposals {
            let decision = self.state.decisions.entry(proposal.decision).or_default();
            decision.options = proposal.options.clone();
            decision.recommended_option_id = proposal.recommended_option_id.clone();
            let stale = decision
                .selection_is_stale()
                .then(|| decision.selected_option_id.clone().unwrap_or_default());
            if let Some(option) = stale {
                self.warn(MergeWarning::SelectionInvalidated {
                    decision: proposal.decision.to_string(),
                    option,
                });
            }
        }
    }

    fn record_risks(&mut self, tagged: &TaggedOutput) {
        for risk in &tagged.output.risks {
            let mut entry = LedgerEntry::new(
                format!("risk:{}", risk.id),
                LedgerKind::Risk,
                risk.severity,
                risk.title.clone(),
            );
            entry.detail = risk.detail.clone();
            entry.pillar = risk.pillar.clone();
            entry.source_step = Some(tagged.origin.to_string());
            self.state.upsert_ledger_entry(entry);
        }
    }

    fn apply_patch(&mut self, origin: &PatchOrigin, mut patch: Patch) {
        let target = match PatchTarget::parse(&patch.path) {
            Ok(target) => target,
            Err(e) => {
                return self.reject(MergeWarning::InvalidPatch {
                    origin: origin.to_string(),
                    path: patch.path,
                    reason: e.to_string(),
                })
            }
        };

        if matches!(target, PatchTarget::DecisionSelection { .. }) && !origin.is_orchestrator() {
            return self.reject(MergeWarning::OwnershipViolation {
                origin: origin.to_string(),
                path: patch.path,
            });
        }

        if patch.meta.source_type == SourceType::Evidence && patch.meta.sources.is_empty() {
            patch.meta.source_type = SourceType::Assumption;
            patch.meta.confidence = self.cap(patch.meta.confidence);
            self.warn(MergeWarning::EvidenceDowngraded {
                origin: origin.to_string(),
                path: patch.path.clone(),
                confidence: patch.meta.confidence,
            });
        }

        debug!(origin = %origin, op = ?patch.op, path = %patch.path, "applying patch");
        match target {
            PatchTarget::EvidenceSources => self.apply_sources(origin, patch),
            PatchTarget::GraphNodes => self.apply_nodes(origin, patch),
            PatchTarget::GraphGroups => self.apply_groups(origin, patch),
            PatchTarget::DecisionSelection { .. } => {
                let tokens = match pointer::tokens(&patch.path) {
                    Ok(tokens) => tokens,
                    Err(e) => {
                        return self.reject(MergeWarning::InvalidPatch {
                            origin: origin.to_string(),
                            path: patch.path,
                            reason: e.to_string(),
                        })
                    }
                };
                self.apply_pointer(origin, patch, tokens)
            }
            PatchTarget::Pointer(tokens) => self.apply_pointer(origin, patch, tokens),
        }
    }

    fn list_op_supported(&mut self, origin: &PatchOrigin, patch: &Patch) -> bool {
        if patch.op == PatchOp::Remove {
            self.reject(MergeWarning::InvalidPatch {
                origin: origin.to_string(),
                path: patch.path.clone(),
                reason: "merged lists do not support remove".to_string(),
            });
            return false;
        }
        true
    }

    fn apply_sources(&mut self, origin: &PatchOrigin, patch: Patch) {
        if !self.list_op_supported(origin, &patch) {
            return;
        }
        match many::<EvidenceSource>(&patch.value) {
            Ok(sources) => {
                if let Some(bad) = sources.iter().find(|s| !in_unit(s.quality_score)) {
                    return self.reject(MergeWarning::InvalidPatch {
                        origin: origin.to_string(),
                        path: patch.path,
                        reason: format!("quality_score {} out of range for {}", bad.quality_score, bad.url),
                    });
                }
                let added = merge_sources(&mut self.state.evidence.sources, sources);
                debug!(origin = %origin, added, "merged evidence sources");
                self.applied += 1;
            }
            Err(e) => self.reject(MergeWarning::InvalidPatch {
                origin: origin.to_string(),
                path: patch.path,
                reason: e.to_string(),
            }),
        }
    }

    fn apply_nodes(&mut self, origin: &PatchOrigin, patch: Patch) {
        if !self.list_op_supported(origin, &patch) {
            return;
        }
        let nodes = match many::<GraphNode>(&patch.value) {
            Ok(nodes) => nodes,
            Err(e) => {
                return self.reject(MergeWarning::InvalidPatch {
                    origin: origin.to_string(),
                    path: patch.path,
                    reason: e.to_string(),
                })
            }
        };
        if nodes.iter().any(|n| n.id.is_empty()) {
            return self.reject(MergeWarning::InvalidPatch {
                origin: origin.to_string(),
                path: patch.path,
                reason: "graph node id must not be empty".to_string(),
            });
        }
        if let Some(bad) = nodes.iter().find(|n| !in_unit(n.confidence)) {
            return self.reject(MergeWarning::InvalidPatch {
                origin: origin.to_string(),
                path: patch.path,
                reason: format!("confidence {} out of range for node {}", bad.confidence, bad.id),
            });
        }
        let stats = upsert_nodes(&mut self.state.graph.nodes, nodes, self.now);
        debug!(
            origin = %origin,
            inserted = stats.inserted,
            changed = stats.changed,
            unchanged = stats.unchanged,
            "upserted graph nodes"
        );
        self.applied += 1;
    }

    fn apply_groups(&mut self, origin: &PatchOrigin, patch: Patch) {
        if !self.list_op_supported(origin, &patch) {
            return;
        }
        match many::<GraphGroup>(&patch.value) {
            Ok(groups) => {
                merge_groups(&mut self.state.graph.groups, groups);
                self.applied += 1;
            }
            Err(e) => self.reject(MergeWarning::InvalidPatch {
                origin: origin.to_string(),
                path: patch.path,
                reason: e.to_string(),
            }),
        }
    }

    /// Resolve a same-path conflict. Returns the meta to write with, or
    /// `None` when the earlier value stands.
    fn resolve_conflict(&mut self, origin: &PatchOrigin, patch: &Patch) -> Option<PatchMeta> {
        let Some(prev) = self.written.get(&patch.path) else {
            return Some(patch.meta.clone());
        };
        if prev.value == patch.value {
            return Some(prev.meta.clone());
        }

        let prev_evidence = prev.meta.source_type == SourceType::Evidence;
        let new_evidence = patch.meta.source_type == SourceType::Evidence;
        let new_wins_on_confidence = patch.meta.confidence > prev.meta.confidence;
        let prev_origin = prev.origin.to_string();
        let prev_meta = prev.meta.clone();

        let (new_wins, evidence_conflict) = match (prev_evidence, new_evidence) {
            (true, true) => (new_wins_on_confidence, true),
            (true, false) => (false, false),
            (false, true) => (true, false),
            (false, false) => (new_wins_on_confidence, false),
        };

        let (kept, dropped) = if new_wins {
            (origin.to_string(), prev_origin.clone())
        } else {
            (prev_origin.clone(), origin.to_string())
        };
        self.warn(MergeWarning::ConflictResolved {
            path: patch.path.clone(),
            kept,
            dropped,
            evidence_conflict,
        });

        if evidence_conflict {
            let (winner, loser) = if new_wins {
                (&patch.meta, &prev_meta)
            } else {
                (&prev_meta, &patch.meta)
            };
            let id = format!("conflicting_evidence:{}", patch.path);
            let mut entry = LedgerEntry::new(
                id.clone(),
                LedgerKind::ConflictingEvidence,
                Severity::High,
                format!("Conflicting evidence at {}", patch.path),
            );
            entry.blocking = true;
            entry.path = Some(patch.path.clone());
            entry.detail = format!(
                "kept value at confidence {:.2}, discarded value at confidence {:.2}",
                winner.confidence, loser.confidence
            );
            entry.source_step = Some(prev_origin);
            self.state.upsert_ledger_entry(entry);
            self.contradictions.insert(id);
        }

        // Disagreement between two unsourced values lowers trust in the winner.
        let both_soft = !prev_evidence && !new_evidence;
        if new_wins {
            let mut meta = patch.meta.clone();
            if both_soft {
                meta.source_type = SourceType::Assumption;
                meta.confidence = self.cap(meta.confidence);
            }
            Some(meta)
        } else {
            if both_soft {
                let cap = self.policy.assumption_confidence_cap;
                if let Some(prev) = self.written.get_mut(&patch.path) {
                    prev.meta.source_type = SourceType::Assumption;
                    prev.meta.confidence = prev.meta.confidence.min(cap);
                    let meta = prev.meta.clone();
                    let origin = prev.origin.to_string();
                    self.record_provenance(&patch.path, &meta, origin);
                }
            }
            None
        }
    }

    /// Generic write through the encoded document. Each call re-encodes and
    /// re-validates the whole state, so cost grows with patches times
    /// document size; typed list paths above avoid it.
    fn apply_pointer(&mut self, origin: &PatchOrigin, patch: Patch, tokens: Vec<String>) {
        let meta = if patch.op == PatchOp::Remove {
            patch.meta.clone()
        } else {
            match self.resolve_conflict(origin, &patch) {
                Some(meta) => meta,
                None => {
                    self.rejected += 1;
                    return;
                }
            }
        };

        let mut doc = match self.state.to_value() {
            Ok(doc) => doc,
            Err(e) => {
                return self.reject(MergeWarning::InvalidPatch {
                    origin: origin.to_string(),
                    path: patch.path,
                    reason: e.to_string(),
                })
            }
        };

        let result = match patch.op {
            PatchOp::Add => pointer::add(&mut doc, &tokens, patch.value.clone()),
            PatchOp::Replace => pointer::replace(&mut doc, &tokens, patch.value.clone()),
            PatchOp::Remove => pointer::remove(&mut doc, &tokens).map(|_| ()),
        };
        match result {
            Ok(()) => {}
            Err(PointerError::MissingTarget(_)) => {
                return self.reject(MergeWarning::MissingTarget {
                    origin: origin.to_string(),
                    path: patch.path,
                });
            }
            Err(e) => {
                return self.reject(MergeWarning::InvalidPatch {
                    origin: origin.to_string(),
                    path: patch.path,
                    reason: e.to_string(),
                })
            }
        }

        let next = match ScenarioState::from_value(doc) {
            Ok(next) => next,
            Err(e) => {
                return self.reject(MergeWarning::InvalidPatch {
                    origin: origin.to_string(),
                    path: patch.path,
                    reason: e.to_string(),
                })
            }
        };

        if !origin.is_orchestrator() && patch.path.starts_with("/decisions") {
            let changed = next.decisions.iter().any(|(key, decision)| {
                let before = self.state.decisions.get(key);
                before.and_then(|d| d.selected_option_id.as_ref()) != decision.selected_option_id.as_ref()
                    || before.and_then(|d| d.selection_source) != decision.selection_source
            }) || self.state.decisions.keys().any(|k| !next.decisions.contains_key(k));
            if changed {
                return self.reject(MergeWarning::OwnershipViolation {
                    origin: origin.to_string(),
                    path: patch.path,
                });
            }
        }

        self.state = next;
        self.applied += 1;
        if patch.op == PatchOp::Remove {
            self.written.remove(&patch.path);
            self.state.telemetry.provenance.remove(&patch.path);
        } else {
            self.record_provenance(&patch.path, &meta, origin.to_string());
            self.written.insert(
                patch.path,
                Written {
                    value: patch.value,
                    meta,
                    origin: origin.clone(),
                },
            );
        }
    }

    fn record_provenance(&mut self, path: &str, meta: &PatchMeta, origin: String) {
        if path.starts_with("/telemetry/provenance") {
            return;
        }
        self.state.telemetry.provenance.insert(
            path.to_string(),
            Provenance {
                source_type: meta.source_type,
                confidence: meta.confidence,
                sources: meta.sources.clone(),
                origin,
            },
        );
    }
}
