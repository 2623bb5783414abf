//! Static pipeline tables.
//!
//! The catalog names every step and says how steps relate to decisions,
//! clusters and phases. An edge `A → B` in the decision graph means "B reads
//! A's selection", so changing A invalidates B.

use std::collections::{BTreeMap, HashMap, HashSet};

use scenario_state::DecisionKey;
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, OrchestratorResult};

/// An ordered group of steps owned by one pillar.
///
/// The first step is the cluster lead; the last is the synthesis step, which
/// always reruns when any step of the cluster does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDef {
    pub name: String,
    pub steps: Vec<String>,
}

impl ClusterDef {
    pub fn new(name: &str, steps: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            steps: steps.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn lead(&self) -> Option<&str> {
        self.steps.first().map(String::as_str)
    }

    pub fn synthesis(&self) -> Option<&str> {
        self.steps.last().map(String::as_str)
    }

    pub fn position(&self, step: &str) -> Option<usize> {
        self.steps.iter().position(|s| s == step)
    }
}

/// Decisions a pillar owns and the ones whose change forces a pivot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PillarDef {
    pub owned: Vec<DecisionKey>,
    pub critical: Vec<DecisionKey>,
}

impl PillarDef {
    fn new(owned: &[DecisionKey], critical: &[DecisionKey]) -> Self {
        Self {
            owned: owned.to_vec(),
            critical: critical.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineCatalog {
    /// `decision → decisions that read its selection`
    pub dependencies: BTreeMap<DecisionKey, Vec<DecisionKey>>,
    /// `decision → steps that must rerun when it changes`
    pub membership: BTreeMap<DecisionKey, Vec<String>>,
    /// Steps included in every impacted set.
    pub always_run: Vec<String>,
    pub clusters: Vec<ClusterDef>,
    /// Cluster names per phase; clusters within a phase run concurrently.
    pub phases: Vec<Vec<String>>,
    /// Steps run after the last phase, in order.
    pub finalization: Vec<String>,
    pub pillars: BTreeMap<String, PillarDef>,
}

impl PipelineCatalog {
    /// The reference pipeline: six pillar clusters in three phases, then
    /// graph construction.
    pub fn standard() -> Self {
        use DecisionKey::*;

        let dependencies = BTreeMap::from([
            (Icp, vec![Positioning, Pricing, Channel, SalesMotion, MvpScope]),
            (Positioning, vec![Pricing, Channel]),
            (Pricing, vec![RevenueModel]),
            (Channel, vec![SalesMotion]),
            (RevenueModel, vec![]),
            (SalesMotion, vec![]),
            (MvpScope, vec![]),
        ]);

        let steps = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let membership = BTreeMap::from([
            (Icp, steps(&["customer_research", "icp_profiler", "customer_synthesis"])),
            (Positioning, steps(&["positioning_strategist", "offer_synthesis"])),
            (Pricing, steps(&["pricing_analyst", "offer_synthesis"])),
            (RevenueModel, steps(&["revenue_modeler", "unit_economics", "finance_synthesis"])),
            (Channel, steps(&["channel_planner", "gtm_synthesis"])),
            (SalesMotion, steps(&["sales_motion_planner", "gtm_synthesis"])),
            (MvpScope, steps(&["mvp_planner", "operations_planner", "operations_synthesis"])),
        ]);

        let clusters = vec![
            ClusterDef::new("customer", &["customer_research", "icp_profiler", "customer_synthesis"]),
            ClusterDef::new("market", &["market_research", "competitor_scan", "market_synthesis"]),
            ClusterDef::new("go_to_market", &["channel_planner", "sales_motion_planner", "gtm_synthesis"]),
            ClusterDef::new("offer", &["positioning_strategist", "pricing_analyst", "offer_synthesis"]),
            ClusterDef::new("finance", &["revenue_modeler", "unit_economics", "finance_synthesis"]),
            ClusterDef::new("operations", &["mvp_planner", "operations_planner", "operations_synthesis"]),
        ];

        let pillars = BTreeMap::from([
            ("customer".to_string(), PillarDef::new(&[Icp], &[Icp])),
            ("market".to_string(), PillarDef::new(&[], &[])),
            ("go_to_market".to_string(), PillarDef::new(&[Channel, SalesMotion], &[Icp, Channel])),
            ("offer".to_string(), PillarDef::new(&[Positioning, Pricing], &[Icp, Pricing])),
            ("finance".to_string(), PillarDef::new(&[RevenueModel], &[Pricing, RevenueModel])),
            ("operations".to_string(), PillarDef::new(&[MvpScope], &[MvpScope])),
        ]);

        Self {
            dependencies,
            membership,
            always_run: vec!["graph_builder".to_string()],
            clusters,
            phases: vec![
                vec!["customer".to_string(), "market".to_string()],
                vec!["go_to_market".to_string(), "offer".to_string()],
                vec!["finance".to_string(), "operations".to_string()],
            ],
            finalization: vec!["graph_builder".to_string()],
            pillars,
        }
    }

    pub fn cluster(&self, name: &str) -> Option<&ClusterDef> {
        self.clusters.iter().find(|c| c.name == name)
    }

    /// Cluster that owns `step`, if any. Finalization steps have none.
    pub fn cluster_of(&self, step: &str) -> Option<&ClusterDef> {
        self.clusters.iter().find(|c| c.steps.iter().any(|s| s == step))
    }

    /// Fixed step order used by the linear executor: phases in order,
    /// clusters in declared order within a phase, then finalization.
    pub fn linear_order(&self) -> Vec<String> {
        let mut order = Vec::new();
        for phase in &self.phases {
            for name in phase {
                if let Some(cluster) = self.cluster(name) {
                    order.extend(cluster.steps.iter().cloned());
                }
            }
        }
        order.extend(self.finalization.iter().cloned());
        order
    }

    pub fn linear_position(&self, step: &str) -> Option<usize> {
        self.linear_order().iter().position(|s| s == step)
    }

    pub fn all_steps(&self) -> Vec<String> {
        self.linear_order()
    }

    /// Decisions owned by `pillar`, empty for unknown pillars.
    pub fn owned_decisions(&self, pillar: &str) -> &[DecisionKey] {
        self.pillars
            .get(pillar)
            .map(|p| p.owned.as_slice())
            .unwrap_or_default()
    }

    /// Pillar owning `decision`.
    pub fn owner_of(&self, decision: DecisionKey) -> Option<&str> {
        self.pillars
            .iter()
            .find(|(_, def)| def.owned.contains(&decision))
            .map(|(name, _)| name.as_str())
    }

    /// Check the tables agree with each other.
    ///
    /// Every step must be defined exactly once (in one cluster or in
    /// finalization), every referenced step and cluster must exist, and each
    /// cluster appears in exactly one phase.
    pub fn validate(&self) -> OrchestratorResult<()> {
        let invalid = |msg: String| Err(OrchestratorError::Catalog(msg));

        let mut defined = HashSet::new();
        for step in self
            .clusters
            .iter()
            .flat_map(|c| c.steps.iter())
            .chain(self.finalization.iter())
        {
            if !defined.insert(step.as_str()) {
                return invalid(format!("step {step} is defined more than once"));
            }
        }

        for cluster in &self.clusters {
            if cluster.steps.is_empty() {
                return invalid(format!("cluster {} has no steps", cluster.name));
            }
            if !self.pillars.contains_key(&cluster.name) {
                return invalid(format!("cluster {} has no pillar entry", cluster.name));
            }
        }

        let mut phased: HashMap<&str, usize> = HashMap::new();
        for (i, phase) in self.phases.iter().enumerate() {
            for name in phase {
                if self.cluster(name).is_none() {
                    return invalid(format!("phase {i} names unknown cluster {name}"));
                }
                if phased.insert(name.as_str(), i).is_some() {
                    return invalid(format!("cluster {name} appears in more than one phase"));
                }
            }
        }
        if let Some(orphan) = self.clusters.iter().find(|c| !phased.contains_key(c.name.as_str())) {
            return invalid(format!("cluster {} is not scheduled in any phase", orphan.name));
        }

        for (decision, steps) in &self.membership {
            if let Some(step) = steps.iter().find(|s| !defined.contains(s.as_str())) {
                return invalid(format!("{decision} lists unknown step {step}"));
            }
        }
        if let Some(step) = self.always_run.iter().find(|s| !defined.contains(s.as_str())) {
            return invalid(format!("always-run step {step} is not defined"));
        }
        Ok(())
    }
}
