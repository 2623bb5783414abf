//! Arbitration for failing rules that do not name their own fix.
//!
//! The orchestrator batches those failures into one [`Arbiter::arbitrate`]
//! call. In production the arbiter is an external reasoning service; the
//! [`HeuristicArbiter`] here routes each failure to its pillar's cluster.

use async_trait::async_trait;
use scenario_state::ScenarioState;
use serde::{Deserialize, Serialize};

use crate::catalog::PipelineCatalog;
use crate::error::ArbiterError;
use crate::rules::RuleResult;

/// An instruction to rerun steps of one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackDirective {
    /// Rule the directive answers.
    pub rule: String,
    pub target_cluster: String,
    /// Steps to rerun. Empty means only the cluster's synthesis step.
    pub affected_steps: Vec<String>,
    pub correction_hint: String,
}

impl FeedbackDirective {
    /// Directive built straight from a rule that names its affected steps.
    pub fn from_rule(result: &RuleResult, catalog: &PipelineCatalog) -> Option<Self> {
        let steps = result.affected_steps.clone()?;
        let target_cluster = steps
            .iter()
            .find_map(|s| catalog.cluster_of(s))
            .map_or_else(|| result.pillar.clone(), |c| c.name.clone());
        Some(Self {
            rule: result.rule.clone(),
            target_cluster,
            affected_steps: steps,
            correction_hint: result.message.clone(),
        })
    }

    /// Generic directive used when arbitration fails: no specific steps, so
    /// only the pillar cluster's synthesis reruns.
    pub fn fallback(result: &RuleResult) -> Self {
        Self {
            rule: result.rule.clone(),
            target_cluster: result.pillar.clone(),
            affected_steps: Vec::new(),
            correction_hint: result.message.clone(),
        }
    }
}

#[async_trait]
pub trait Arbiter: Send + Sync {
    /// Propose one directive per failure. Failures may be dropped when the
    /// arbiter sees nothing to rerun.
    async fn arbitrate(
        &self,
        catalog: &PipelineCatalog,
        state: &ScenarioState,
        failures: &[RuleResult],
    ) -> Result<Vec<FeedbackDirective>, ArbiterError>;
}

/// Routes each failure to the cluster of its pillar, starting at the
/// cluster lead.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicArbiter;

#[async_trait]
impl Arbiter for HeuristicArbiter {
    async fn arbitrate(
        &self,
        catalog: &PipelineCatalog,
        _state: &ScenarioState,
        failures: &[RuleResult],
    ) -> Result<Vec<FeedbackDirective>, ArbiterError> {
        let mut directives = Vec::new();
        for failure in failures {
            let cluster = catalog.cluster(&failure.pillar).ok_or_else(|| {
                ArbiterError::Malformed(format!("no cluster for pillar {}", failure.pillar))
            })?;
            directives.push(FeedbackDirective {
                rule: failure.rule.clone(),
                target_cluster: cluster.name.clone(),
                affected_steps: cluster.lead().map(str::to_string).into_iter().collect(),
                correction_hint: format!("{}: {}", failure.rule, failure.message),
            });
        }
        Ok(directives)
    }
}

/// Always unavailable. Exercises the fallback path.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingArbiter;

#[async_trait]
impl Arbiter for FailingArbiter {
    async fn arbitrate(
        &self,
        _catalog: &PipelineCatalog,
        _state: &ScenarioState,
        _failures: &[RuleResult],
    ) -> Result<Vec<FeedbackDirective>, ArbiterError> {
        Err(ArbiterError::Unavailable("arbiter disabled".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scenario_state::Severity;

    fn failure(rule: &str, pillar: &str, steps: Option<Vec<&str>>) -> RuleResult {
        RuleResult {
            rule: rule.to_string(),
            passed: false,
            severity: Severity::High,
            message: format!("{rule} failed"),
            pillar: pillar.to_string(),
            affected_steps: steps.map(|s| s.into_iter().map(str::to_string).collect()),
        }
    }

    #[tokio::test]
    async fn test_heuristic_routes_to_cluster_lead() {
        let catalog = PipelineCatalog::standard();
        let state = ScenarioState::blank("s", "S");
        let directives = HeuristicArbiter
            .arbitrate(&catalog, &state, &[failure("compliance_covered", "operations", None)])
            .await
            .unwrap();
        assert_eq!(directives.len(), 1);
        assert_eq!(directives[0].target_cluster, "operations");
        assert_eq!(directives[0].affected_steps, vec!["mvp_planner"]);
        assert!(directives[0].correction_hint.starts_with("compliance_covered"));
    }

    #[tokio::test]
    async fn test_heuristic_rejects_unknown_pillar() {
        let catalog = PipelineCatalog::standard();
        let state = ScenarioState::blank("s", "S");
        let err = HeuristicArbiter
            .arbitrate(&catalog, &state, &[failure("x", "legal", None)])
            .await
            .unwrap_err();
        assert!(matches!(err, ArbiterError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_failing_arbiter() {
        let catalog = PipelineCatalog::standard();
        let state = ScenarioState::blank("s", "S");
        assert!(FailingArbiter.arbitrate(&catalog, &state, &[]).await.is_err());
    }

    #[test]
    fn test_directive_from_rule_uses_step_cluster() {
        let catalog = PipelineCatalog::standard();
        let result = failure("pricing_matches_icp", "offer", Some(vec!["pricing_analyst"]));
        let directive = FeedbackDirective::from_rule(&result, &catalog).unwrap();
        assert_eq!(directive.target_cluster, "offer");
        assert_eq!(directive.affected_steps, vec!["pricing_analyst"]);

        let ambiguous = failure("decisions_selected", "customer", None);
        assert!(FeedbackDirective::from_rule(&ambiguous, &catalog).is_none());
        let fallback = FeedbackDirective::fallback(&ambiguous);
        assert_eq!(fallback.target_cluster, "customer");
        assert!(fallback.affected_steps.is_empty());
    }
}
