//! Whole-document validation, run after every full pass and before the
//! final commit of a run.

use scenario_state::{LedgerKind, ScenarioState, Severity};
use serde::{Deserialize, Serialize};

/// One finding that has to be resolved or accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contradiction {
    pub id: String,
    pub severity: Severity,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub blocking: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// True when any contradiction is blocking.
    pub blocking: bool,
    pub contradictions: Vec<Contradiction>,
    /// Paths of decision-critical claims that arrived without sources.
    pub missing_proof: Vec<String>,
    /// Titles of open high or critical step-reported risks.
    pub high_risk_flags: Vec<String>,
}

impl ValidationReport {
    pub fn blocking_ids(&self) -> Vec<String> {
        self.contradictions
            .iter()
            .filter(|c| c.blocking)
            .map(|c| c.id.clone())
            .collect()
    }
}

pub trait Validator: Send + Sync {
    fn validate(&self, state: &ScenarioState) -> ValidationReport;
}

/// Validation over the risk ledger plus decision selections.
///
/// Contradictions are open conflicting-evidence and rule-violation entries,
/// and any selection that no longer names one of its decision's options.
#[derive(Debug, Default, Clone, Copy)]
pub struct LedgerValidator;

impl Validator for LedgerValidator {
    fn validate(&self, state: &ScenarioState) -> ValidationReport {
        let mut report = ValidationReport::default();

        for entry in state.risks.iter().filter(|e| !e.resolved) {
            match entry.kind {
                LedgerKind::ConflictingEvidence | LedgerKind::RuleViolation => {
                    report.contradictions.push(Contradiction {
                        id: entry.id.clone(),
                        severity: entry.severity,
                        title: entry.title.clone(),
                        path: entry.path.clone(),
                        blocking: entry.is_open_blocker(),
                    });
                }
                LedgerKind::MissingProof => {
                    report
                        .missing_proof
                        .push(entry.path.clone().unwrap_or_else(|| entry.id.clone()));
                }
                LedgerKind::Risk if entry.severity.is_blocking() => {
                    report.high_risk_flags.push(entry.title.clone());
                }
                LedgerKind::Risk | LedgerKind::MaterialChange => {}
            }
        }

        for (key, decision) in &state.decisions {
            if decision.selection_is_stale() {
                report.contradictions.push(Contradiction {
                    id: format!("stale_selection:{key}"),
                    severity: Severity::High,
                    title: format!(
                        "{key} selection {} is no longer an option",
                        decision.selected_option_id.as_deref().unwrap_or_default()
                    ),
                    path: Some(format!("/decisions/{key}/selected_option_id")),
                    blocking: true,
                });
            }
        }

        report.blocking = report.contradictions.iter().any(|c| c.blocking);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scenario_state::{DecisionKey, DecisionOption, LedgerEntry};

    #[test]
    fn test_clean_state_is_not_blocking() {
        let report = LedgerValidator.validate(&ScenarioState::blank("s", "S"));
        assert!(!report.blocking);
        assert!(report.contradictions.is_empty());
    }

    #[test]
    fn test_conflicting_evidence_blocks_until_resolved() {
        let mut state = ScenarioState::blank("s", "S");
        let mut entry = LedgerEntry::new(
            "conflicting_evidence:/pillars/market/size",
            LedgerKind::ConflictingEvidence,
            Severity::High,
            "Sources disagree",
        );
        entry.blocking = true;
        state.upsert_ledger_entry(entry);

        let report = LedgerValidator.validate(&state);
        assert!(report.blocking);
        assert_eq!(report.blocking_ids(), vec!["conflicting_evidence:/pillars/market/size"]);

        state.resolve_ledger_entry("conflicting_evidence:/pillars/market/size");
        assert!(!LedgerValidator.validate(&state).blocking);
    }

    #[test]
    fn test_medium_rule_violation_is_advisory() {
        let mut state = ScenarioState::blank("s", "S");
        state.upsert_ledger_entry(LedgerEntry::new(
            "rule_violation:decisions_selected",
            LedgerKind::RuleViolation,
            Severity::Medium,
            "Open decisions",
        ));
        let report = LedgerValidator.validate(&state);
        assert_eq!(report.contradictions.len(), 1);
        assert!(!report.blocking);
    }

    #[test]
    fn test_missing_proof_and_risk_flags() {
        let mut state = ScenarioState::blank("s", "S");
        let mut proof = LedgerEntry::new(
            "missing_proof:/decisions/pricing",
            LedgerKind::MissingProof,
            Severity::Medium,
            "Unsourced",
        );
        proof.path = Some("/decisions/pricing".to_string());
        state.upsert_ledger_entry(proof);
        state.upsert_ledger_entry(LedgerEntry::new(
            "risk:churn",
            LedgerKind::Risk,
            Severity::Critical,
            "Churn risk",
        ));
        state.upsert_ledger_entry(LedgerEntry::new(
            "risk:minor",
            LedgerKind::Risk,
            Severity::Low,
            "Minor",
        ));

        let report = LedgerValidator.validate(&state);
        assert_eq!(report.missing_proof, vec!["/decisions/pricing"]);
        assert_eq!(report.high_risk_flags, vec!["Churn risk"]);
        assert!(!report.blocking);
    }

    #[test]
    fn test_stale_selection_is_a_blocking_contradiction() {
        let mut state = ScenarioState::blank("s", "S");
        let pricing = state.decisions.entry(DecisionKey::Pricing).or_default();
        pricing.options = vec![DecisionOption::new("tiered", "Tiered")];
        pricing.selected_option_id = Some("flat".to_string());

        let report = LedgerValidator.validate(&state);
        assert!(report.blocking);
        assert_eq!(report.contradictions[0].id, "stale_selection:pricing");
    }
}
