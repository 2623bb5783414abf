//! Impact resolution: which decisions and steps a change invalidates.
//!
//! Pure functions of the catalog tables plus one input. Traversal is a
//! breadth-first walk with a visited set, so cycles in the decision graph
//! terminate.

use std::collections::{BTreeSet, HashSet, VecDeque};

use scenario_state::DecisionKey;
use serde::{Deserialize, Serialize};

use crate::catalog::PipelineCatalog;

/// Everything invalidated by one changed decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactSet {
    pub changed: Option<DecisionKey>,
    /// Transitively dependent decisions, excluding `changed` itself.
    pub decisions: BTreeSet<DecisionKey>,
    /// Steps to execute, in linear order.
    pub steps: Vec<String>,
}

impl ImpactSet {
    pub fn includes(&self, step: &str) -> bool {
        self.steps.iter().any(|s| s == step)
    }
}

pub struct ImpactResolver<'a> {
    catalog: &'a PipelineCatalog,
}

impl<'a> ImpactResolver<'a> {
    pub fn new(catalog: &'a PipelineCatalog) -> Self {
        Self { catalog }
    }

    /// Transitive dependents of `changed`.
    ///
    /// The seed is only part of the result if a cycle leads back to it.
    pub fn impacted_decisions(&self, changed: DecisionKey) -> BTreeSet<DecisionKey> {
        self.impacted_decisions_from([changed])
    }

    /// Union of the transitive dependents of every seed.
    pub fn impacted_decisions_from(
        &self,
        seeds: impl IntoIterator<Item = DecisionKey>,
    ) -> BTreeSet<DecisionKey> {
        let mut visited: HashSet<DecisionKey> = HashSet::new();
        let mut queue: VecDeque<DecisionKey> = seeds.into_iter().collect();
        let mut impacted = BTreeSet::new();

        while let Some(current) = queue.pop_front() {
            if !visited.insert(current) {
                continue;
            }
            for dependent in self.catalog.dependencies.get(&current).into_iter().flatten() {
                impacted.insert(*dependent);
                if !visited.contains(dependent) {
                    queue.push_back(*dependent);
                }
            }
        }
        impacted
    }

    /// Steps to run for a change, in linear order. `None` means a full build
    /// and selects every step.
    pub fn impacted_steps(&self, changed: Option<DecisionKey>) -> Vec<String> {
        let order = self.catalog.linear_order();
        let Some(changed) = changed else {
            return order;
        };

        let mut decisions = self.impacted_decisions(changed);
        decisions.insert(changed);

        let mut selected: HashSet<&str> = self.catalog.always_run.iter().map(String::as_str).collect();
        for decision in &decisions {
            for step in self.catalog.membership.get(decision).into_iter().flatten() {
                selected.insert(step.as_str());
            }
        }

        order
            .iter()
            .filter(|step| selected.contains(step.as_str()))
            .cloned()
            .collect()
    }

    pub fn resolve(&self, changed: Option<DecisionKey>) -> ImpactSet {
        ImpactSet {
            changed,
            decisions: changed
                .map(|c| self.impacted_decisions(c))
                .unwrap_or_default(),
            steps: self.impacted_steps(changed),
        }
    }

    /// Pillars whose owned decisions depend on anything `pillar` owns.
    pub fn downstream_pillars(&self, pillar: &str) -> Vec<String> {
        let owned = self.catalog.owned_decisions(pillar).iter().copied();
        let impacted = self.impacted_decisions_from(owned);

        self.catalog
            .pillars
            .iter()
            .filter(|(name, def)| {
                name.as_str() != pillar && def.owned.iter().any(|d| impacted.contains(d))
            })
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DecisionKey::*;

    #[test]
    fn test_icp_impacts_every_other_decision() {
        let catalog = PipelineCatalog::standard();
        let resolver = ImpactResolver::new(&catalog);
        let impacted = resolver.impacted_decisions(Icp);
        assert_eq!(
            impacted,
            BTreeSet::from([Positioning, Pricing, RevenueModel, Channel, SalesMotion, MvpScope])
        );
        assert!(!impacted.contains(&Icp));
    }

    #[test]
    fn test_closure_is_stable() {
        let catalog = PipelineCatalog::standard();
        let resolver = ImpactResolver::new(&catalog);
        for key in DecisionKey::ALL {
            let once = resolver.impacted_decisions(key);
            let twice = resolver.impacted_decisions_from(once.iter().copied());
            assert!(twice.is_subset(&once), "closure of {key} grew on reapplication");
        }
    }

    #[test]
    fn test_leaf_decision_impacts_nothing() {
        let catalog = PipelineCatalog::standard();
        let resolver = ImpactResolver::new(&catalog);
        assert!(resolver.impacted_decisions(MvpScope).is_empty());
        assert_eq!(
            resolver.impacted_steps(Some(MvpScope)),
            vec!["mvp_planner", "operations_planner", "operations_synthesis", "graph_builder"]
        );
    }

    #[test]
    fn test_cycle_terminates() {
        let mut catalog = PipelineCatalog::standard();
        catalog.dependencies.insert(RevenueModel, vec![Icp]);
        let resolver = ImpactResolver::new(&catalog);
        let impacted = resolver.impacted_decisions(Pricing);
        assert!(impacted.contains(&Icp));
        assert!(impacted.contains(&Pricing));
    }

    #[test]
    fn test_icp_change_skips_market_steps() {
        let catalog = PipelineCatalog::standard();
        let resolver = ImpactResolver::new(&catalog);
        let impact = resolver.resolve(Some(Icp));
        assert!(impact.includes("icp_profiler"));
        assert!(impact.includes("pricing_analyst"));
        assert!(impact.includes("graph_builder"));
        assert!(!impact.includes("market_research"));
        assert!(!impact.includes("competitor_scan"));
    }

    #[test]
    fn test_full_build_selects_every_step() {
        let catalog = PipelineCatalog::standard();
        let resolver = ImpactResolver::new(&catalog);
        assert_eq!(resolver.impacted_steps(None), catalog.linear_order());
        assert!(resolver.resolve(None).decisions.is_empty());
    }

    #[test]
    fn test_downstream_pillars() {
        let catalog = PipelineCatalog::standard();
        let resolver = ImpactResolver::new(&catalog);
        assert_eq!(
            resolver.downstream_pillars("customer"),
            vec!["finance", "go_to_market", "offer", "operations"]
        );
        assert_eq!(resolver.downstream_pillars("offer"), vec!["finance", "go_to_market"]);
        assert!(resolver.downstream_pillars("market").is_empty());
    }
}
