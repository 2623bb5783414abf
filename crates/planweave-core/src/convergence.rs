//! Convergence and pivot detection after a feedback round.
//!
//! Each touched pillar is scored by the share of its high-level fields that
//! moved between the pre- and post-feedback documents. Compared fields are
//! the summary text, one selection per owned decision, and the pillar's
//! node count (with a tolerance).

use scenario_state::{DecisionKey, ScenarioState};
use serde::{Deserialize, Serialize};

use crate::catalog::PipelineCatalog;
use crate::config::OrchestratorConfig;
use crate::impact::ImpactResolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceVerdict {
    Converged,
    /// Moved enough to be worth a review, not enough to stop.
    MaterialChange,
    /// A critical decision flipped and the pillar moved past the threshold.
    PivotRequired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PillarChange {
    pub pillar: String,
    pub change_score: f64,
    pub changed_fields: Vec<String>,
    pub critical_changed: Vec<DecisionKey>,
    pub verdict: ConvergenceVerdict,
}

/// Halt result naming the pillar that needs a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PivotDecision {
    /// Highest-scoring pivoting pillar.
    pub pillar: String,
    pub change_score: f64,
    pub downstream_pillars: Vec<String>,
    /// Every pillar that pivoted, in name order.
    pub pivoting_pillars: Vec<String>,
    pub changed_decisions: Vec<DecisionKey>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceReport {
    pub pillars: Vec<PillarChange>,
    pub pivot: Option<PivotDecision>,
}

impl ConvergenceReport {
    pub fn material(&self) -> impl Iterator<Item = &PillarChange> {
        self.pillars
            .iter()
            .filter(|p| p.verdict == ConvergenceVerdict::MaterialChange)
    }
}

pub struct ConvergenceDetector<'a> {
    catalog: &'a PipelineCatalog,
    config: &'a OrchestratorConfig,
}

impl<'a> ConvergenceDetector<'a> {
    pub fn new(catalog: &'a PipelineCatalog, config: &'a OrchestratorConfig) -> Self {
        Self { catalog, config }
    }

    pub fn score_pillar(&self, pillar: &str, before: &ScenarioState, after: &ScenarioState) -> PillarChange {
        let owned = self.catalog.owned_decisions(pillar);
        let mut changed_fields = Vec::new();

        let summary = |s: &ScenarioState| s.pillars.get(pillar).map(|p| p.summary.clone()).unwrap_or_default();
        if summary(before) != summary(after) {
            changed_fields.push("summary".to_string());
        }
        for key in owned {
            if before.selection(*key) != after.selection(*key) {
                changed_fields.push(format!("decision:{key}"));
            }
        }
        let drift = before
            .node_count_for_pillar(pillar)
            .abs_diff(after.node_count_for_pillar(pillar));
        if drift > self.config.node_count_tolerance {
            changed_fields.push("node_count".to_string());
        }

        let total = owned.len() + 2;
        let change_score = changed_fields.len() as f64 / total as f64;

        let critical_changed: Vec<DecisionKey> = self
            .catalog
            .pillars
            .get(pillar)
            .map(|def| {
                def.critical
                    .iter()
                    .copied()
                    .filter(|k| before.selection(*k) != after.selection(*k))
                    .collect()
            })
            .unwrap_or_default();

        let verdict = if change_score > self.config.pivot_threshold && !critical_changed.is_empty() {
            ConvergenceVerdict::PivotRequired
        } else if change_score >= self.config.material_change_threshold {
            ConvergenceVerdict::MaterialChange
        } else {
            ConvergenceVerdict::Converged
        };

        PillarChange {
            pillar: pillar.to_string(),
            change_score,
            changed_fields,
            critical_changed,
            verdict,
        }
    }

    /// Score every touched pillar and pick the pivot, if any.
    pub fn evaluate<'p>(
        &self,
        touched: impl IntoIterator<Item = &'p str>,
        before: &ScenarioState,
        after: &ScenarioState,
    ) -> ConvergenceReport {
        let mut pillars: Vec<PillarChange> = touched
            .into_iter()
            .map(|p| self.score_pillar(p, before, after))
            .collect();
        pillars.sort_by(|a, b| a.pillar.cmp(&b.pillar));
        pillars.dedup_by(|a, b| a.pillar == b.pillar);

        let pivoting: Vec<&PillarChange> = pillars
            .iter()
            .filter(|p| p.verdict == ConvergenceVerdict::PivotRequired)
            .collect();

        // Highest score wins; name order breaks ties.
        let pivot = pivoting
            .iter()
            .copied()
            .reduce(|best, p| if p.change_score > best.change_score { p } else { best })
            .map(|top| {
                let mut changed: Vec<DecisionKey> = pivoting
                    .iter()
                    .flat_map(|p| p.critical_changed.iter().copied())
                    .collect();
                changed.sort();
                changed.dedup();
                PivotDecision {
                    pillar: top.pillar.clone(),
                    change_score: top.change_score,
                    downstream_pillars: ImpactResolver::new(self.catalog).downstream_pillars(&top.pillar),
                    pivoting_pillars: pivoting.iter().map(|p| p.pillar.clone()).collect(),
                    changed_decisions: changed,
                }
            });

        ConvergenceReport { pillars, pivot }
    }
}
