//! Deterministic template steps for the standard catalog.
//!
//! These stand in for the content-generation services: same input, same
//! output, no I/O. The CLI runs on them, and so do the end-to-end tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use scenario_state::{
    ComplianceLevel, DecisionKey, DecisionOption, EvidenceSource, Fact, GraphEdge, GraphGroup,
    GraphNode, NodeStatus, ScenarioState, SelectionSource, Severity,
};
use serde_json::{json, Value};
use state_merge::{normalize_url, AgentOutput, Patch, PatchMeta, Proposal, Risk};

use crate::catalog::PipelineCatalog;
use crate::error::StepError;
use crate::rules::ScenarioProfile;
use crate::step::{Step, StepRegistry, StepRequest};

/// Id of the node that ties every pillar summary together.
pub const OVERVIEW_NODE: &str = "plan.overview";

const SEGMENTS: [&str; 2] = ["smb", "enterprise"];

/// Registry with a reference step for every step in `catalog`.
pub fn reference_registry(catalog: &PipelineCatalog) -> StepRegistry {
    let mut registry = StepRegistry::new();
    for cluster in &catalog.clusters {
        let owned = catalog.owned_decisions(&cluster.name).to_vec();
        for step in &cluster.steps {
            let synthesis = cluster.synthesis() == Some(step.as_str());
            registry.register(Arc::new(ReferenceStep::new(step, &cluster.name, owned.clone(), synthesis)));
        }
    }
    for step in &catalog.finalization {
        registry.register(Arc::new(GraphBuilderStep::new(step)));
    }
    registry
}

/// A small, complete scenario to build from.
pub fn reference_scenario() -> ScenarioState {
    let mut state = ScenarioState::blank("reference", "Invoice follow-up assistant");
    state.meta.category = "saas".to_string();
    state.meta.compliance_level = ComplianceLevel::Standard;
    state.meta.team_size = 4;
    state.idea = json!({
        "title": "Invoice follow-up assistant",
        "problem": "Agencies lose weeks of cash flow chasing late invoices by hand.",
        "solution": "Drafts and schedules polite reminders from the accounting system.",
    });
    state.constraints = json!({ "budget_usd": 50000, "launch_weeks": 12 });
    state.inputs = json!({ "preferred_segment": "smb", "region": "north_america" });
    state
}

/// Segment the downstream pillars should serve: the ICP selection if there
/// is one, else the scenario input.
fn target_segment(state: &ScenarioState) -> &str {
    state
        .decision(DecisionKey::Icp)
        .and_then(|d| d.selected_option())
        .and_then(|o| o.attribute("segment"))
        .or_else(|| preferred_segment(state))
        .unwrap_or(SEGMENTS[0])
}

fn preferred_segment(state: &ScenarioState) -> Option<&str> {
    state
        .inputs
        .get("preferred_segment")
        .and_then(Value::as_str)
        .filter(|s| SEGMENTS.contains(s))
}

fn title_case(name: &str) -> String {
    name.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

fn node(id: String, title: String, pillar: &str, node_type: &str, content: Value, dependencies: Vec<String>) -> GraphNode {
    GraphNode {
        id,
        title,
        pillar: pillar.to_string(),
        node_type: node_type.to_string(),
        content,
        confidence: 0.7,
        dependencies,
        status: NodeStatus::Draft,
        updated_at: None,
    }
}

/// Options and pick for a decision-making step.
fn proposal_for(step: &str, request: &StepRequest) -> Option<Proposal> {
    let state = request.state.as_ref();
    let enterprise = target_segment(state) == "enterprise";
    let pick = |smb: &str, ent: &str| if enterprise { ent.to_string() } else { smb.to_string() };

    let (decision, options, recommended) = match step {
        "icp_profiler" => (
            DecisionKey::Icp,
            vec![
                DecisionOption::new("smb", "Small agencies").with_attribute("segment", "smb"),
                DecisionOption::new("enterprise", "Enterprise finance teams").with_attribute("segment", "enterprise"),
            ],
            preferred_segment(state).unwrap_or(SEGMENTS[0]).to_string(),
        ),
        "positioning_strategist" => (
            DecisionKey::Positioning,
            vec![
                DecisionOption::new("simplicity", "Set up in ten minutes"),
                DecisionOption::new("control", "Audit-ready collections"),
            ],
            pick("simplicity", "control"),
        ),
        "pricing_analyst" => (
            DecisionKey::Pricing,
            vec![
                DecisionOption::new("smb_tiered", "Tiered monthly plans").with_attribute("segment", "smb"),
                DecisionOption::new("enterprise_contract", "Annual contract").with_attribute("segment", "enterprise"),
            ],
            pick("smb_tiered", "enterprise_contract"),
        ),
        "revenue_modeler" => (
            DecisionKey::RevenueModel,
            vec![
                DecisionOption::new("subscription", "Monthly subscription"),
                DecisionOption::new("contract", "Annual licence"),
            ],
            pick("subscription", "contract"),
        ),
        "channel_planner" => (
            DecisionKey::Channel,
            vec![
                DecisionOption::new("self_serve", "Content and product-led signup").with_attribute("motion", "self_serve"),
                DecisionOption::new("outbound", "Outbound to finance leads").with_attribute("motion", "sales_led"),
            ],
            pick("self_serve", "outbound"),
        ),
        "sales_motion_planner" => (
            DecisionKey::SalesMotion,
            vec![
                DecisionOption::new("self_serve", "Self-serve trial").with_attribute("motion", "self_serve"),
                DecisionOption::new("sales_led", "Sales-led pilot").with_attribute("motion", "sales_led"),
            ],
            pick("self_serve", "sales_led"),
        ),
        "mvp_planner" => {
            let small_team = state.meta.team_size <= 2
                || request.feedback.as_ref().is_some_and(|f| f.mentions("team capacity") || f.mentions("team_capacity"));
            (
                DecisionKey::MvpScope,
                vec![
                    DecisionOption::new("lean", "Reminders only").with_attribute("effort", "small"),
                    DecisionOption::new("full", "Reminders, portal and reporting").with_attribute("effort", "large"),
                ],
                if small_team { "lean" } else { "full" }.to_string(),
            )
        }
        _ => return None,
    };

    Some(Proposal {
        decision,
        options,
        recommended_option_id: Some(recommended),
    })
}

/// Template step for one pillar cluster.
#[derive(Debug, Clone)]
pub struct ReferenceStep {
    id: String,
    pillar: String,
    /// Decisions the pillar owns; synthesis summarizes them.
    owned: Vec<DecisionKey>,
    synthesis: bool,
}

impl ReferenceStep {
    pub fn new(id: &str, pillar: &str, owned: Vec<DecisionKey>, synthesis: bool) -> Self {
        Self {
            id: id.to_string(),
            pillar: pillar.to_string(),
            owned,
            synthesis,
        }
    }

    fn analyze(&self, request: &StepRequest) -> AgentOutput {
        let state = request.state.as_ref();
        let segment = target_segment(state);
        let title = title_case(&self.id);

        let mut output = AgentOutput {
            patches: vec![Patch::replace(
                format!("/pillars/{}/{}", self.pillar, self.id),
                json!(format!("{title} for {} ({segment})", state.meta.name)),
            )
            .with_meta(PatchMeta::inference(0.7))],
            node_updates: vec![
                node(
                    format!("{}.finding", self.id),
                    format!("{title}: key finding"),
                    &self.pillar,
                    "finding",
                    json!({ "step": self.id, "segment": segment }),
                    vec![],
                ),
                node(
                    format!("{}.detail", self.id),
                    format!("{title}: supporting detail"),
                    &self.pillar,
                    "detail",
                    json!({ "step": self.id }),
                    vec![format!("{}.finding", self.id)],
                ),
            ],
            ..AgentOutput::default()
        };
        output.proposals.extend(proposal_for(&self.id, request));

        match self.id.as_str() {
            "market_research" => {
                let url = format!("https://research.example.com/{}/market-size", state.meta.category);
                let source = EvidenceSource {
                    normalized_url: normalize_url(&url),
                    url: url.clone(),
                    title: "Market size survey".to_string(),
                    snippets: vec!["Late payments affect most small agencies.".to_string()],
                    quality_score: 0.8,
                };
                output.patches.push(
                    Patch::add("/evidence/sources", json!([source]))
                        .with_meta(PatchMeta::evidence(0.8, vec![url.clone()])),
                );
                output.facts.push(Fact {
                    claim: "Most small agencies wait more than 30 days on invoices".to_string(),
                    sources: vec![url],
                    confidence: 0.8,
                    target_path: Some("/pillars/market/summary".to_string()),
                });
            }
            "competitor_scan" => output.risks.push(Risk {
                id: "incumbent_response".to_string(),
                title: "Accounting suites may bundle reminders".to_string(),
                detail: String::new(),
                severity: Severity::Medium,
                pillar: Some(self.pillar.clone()),
            }),
            "channel_planner" if request.feedback.is_some() => output.patches.push(
                Patch::replace(
                    "/pillars/go_to_market/liquidity_strategy",
                    json!("Seed the supply side first with concierge onboarding"),
                )
                .with_meta(PatchMeta::inference(0.6)),
            ),
            _ => {}
        }
        output
    }

    fn synthesize(&self, request: &StepRequest) -> AgentOutput {
        let state = request.state.as_ref();
        let title = title_case(&self.pillar);

        // User choices first, then fresh recommendations, then older selections.
        let mut picks: BTreeMap<DecisionKey, String> = BTreeMap::new();
        for key in &self.owned {
            let chosen = state
                .decision(*key)
                .filter(|d| d.selection_source == Some(SelectionSource::User))
                .and_then(|d| d.selected_option())
                .map(|o| o.label.clone());
            let fresh = request
                .cluster_context
                .iter()
                .flat_map(|(_, output)| output.proposals.iter())
                .filter(|p| p.decision == *key)
                .last()
                .and_then(|p| {
                    let id = p.recommended_option_id.as_ref()?;
                    p.options.iter().find(|o| &o.id == id).map(|o| o.label.clone())
                });
            let current = || {
                state
                    .decision(*key)
                    .and_then(|d| d.selected_option())
                    .map(|o| o.label.clone())
            };
            if let Some(label) = chosen.or(fresh).or_else(current) {
                picks.insert(*key, label);
            }
        }

        let summary = if picks.is_empty() {
            format!("{title}: {} inputs reviewed", request.cluster_context.len())
        } else {
            let labels: Vec<String> = picks.iter().map(|(k, label)| format!("{k} {label}")).collect();
            format!("{title}: {}", labels.join("; "))
        };

        let dependencies: Vec<String> = request
            .cluster_context
            .iter()
            .flat_map(|(_, output)| output.node_updates.iter().map(|n| n.id.clone()))
            .filter(|id| id.ends_with(".finding"))
            .collect();

        let mut output = AgentOutput {
            patches: vec![
                Patch::replace(format!("/pillars/{}/summary", self.pillar), json!(summary))
                    .with_meta(PatchMeta::inference(0.75)),
                Patch::replace(format!("/pillars/{}/status", self.pillar), json!("ready")),
            ],
            node_updates: vec![node(
                format!("{}.summary", self.pillar),
                format!("{title} summary"),
                &self.pillar,
                "summary",
                json!({ "summary": summary }),
                dependencies,
            )],
            ..AgentOutput::default()
        };

        let regulated = ScenarioProfile::detect(state).is_regulated();
        if self.id == "operations_synthesis" && regulated && request.feedback.is_some() {
            output.patches.push(
                Patch::replace(
                    "/pillars/operations/compliance_plan",
                    json!("Data processing agreement, access audit log, quarterly review"),
                )
                .with_meta(PatchMeta::inference(0.65)),
            );
        }
        output
    }
}

#[async_trait]
impl Step for ReferenceStep {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(&self, request: StepRequest) -> Result<AgentOutput, StepError> {
        Ok(if self.synthesis {
            self.synthesize(&request)
        } else {
            self.analyze(&request)
        })
    }
}

/// Finalization: groups, edges and the overview node.
#[derive(Debug, Clone)]
pub struct GraphBuilderStep {
    id: String,
}

impl GraphBuilderStep {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }
}

#[async_trait]
impl Step for GraphBuilderStep {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(&self, request: StepRequest) -> Result<AgentOutput, StepError> {
        let nodes: Vec<&GraphNode> = request
            .state
            .graph
            .nodes
            .iter()
            .filter(|n| n.id != OVERVIEW_NODE)
            .collect();

        let mut by_pillar: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for node in &nodes {
            by_pillar.entry(node.pillar.as_str()).or_default().push(node.id.clone());
        }
        let groups: Vec<GraphGroup> = by_pillar
            .iter()
            .map(|(pillar, ids)| GraphGroup {
                id: format!("group.{pillar}"),
                title: title_case(pillar),
                pillar: Some((*pillar).to_string()),
                node_ids: ids.clone(),
            })
            .collect();

        let mut edges: Vec<GraphEdge> = nodes
            .iter()
            .flat_map(|n| {
                n.dependencies.iter().map(|dep| GraphEdge {
                    from: dep.clone(),
                    to: n.id.clone(),
                    kind: "supports".to_string(),
                })
            })
            .collect();
        let summaries: Vec<String> = nodes
            .iter()
            .filter(|n| n.node_type == "summary")
            .map(|n| n.id.clone())
            .collect();
        edges.extend(summaries.iter().map(|id| GraphEdge {
            from: id.clone(),
            to: OVERVIEW_NODE.to_string(),
            kind: "summarizes".to_string(),
        }));
        edges.sort_by(|a, b| (&a.from, &a.to).cmp(&(&b.from, &b.to)));

        let to_json = |e: serde_json::Error| StepError::failed(&self.id, e.to_string());
        Ok(AgentOutput {
            patches: vec![
                Patch::add("/graph/groups", serde_json::to_value(&groups).map_err(to_json)?),
                Patch::replace("/graph/edges", serde_json::to_value(&edges).map_err(to_json)?),
            ],
            node_updates: vec![node(
                OVERVIEW_NODE.to_string(),
                format!("{} plan", request.state.meta.name),
                "plan",
                "overview",
                json!({ "pillars": by_pillar.keys().collect::<Vec<_>>() }),
                summaries,
            )],
            ..AgentOutput::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::FeedbackContext;
    use scenario_state::RunId;

    fn request(state: ScenarioState) -> StepRequest {
        StepRequest::new(RunId::from("r1"), Arc::new(state))
    }

    #[test]
    fn test_registry_covers_standard_catalog() {
        let catalog = PipelineCatalog::standard();
        let registry = reference_registry(&catalog);
        assert_eq!(registry.len(), catalog.all_steps().len());
        assert!(catalog.all_steps().iter().all(|s| registry.contains(s)));
    }

    #[test]
    fn test_reference_scenario_is_valid() {
        let state = reference_scenario();
        state.commit_check().unwrap();
        assert_eq!(preferred_segment(&state), Some("smb"));
        assert!(!ScenarioProfile::detect(&state).is_regulated());
    }

    #[tokio::test]
    async fn test_pricing_follows_icp_selection() {
        let mut state = reference_scenario();
        let icp = state.decisions.entry(DecisionKey::Icp).or_default();
        icp.options = vec![
            DecisionOption::new("smb", "Small").with_attribute("segment", "smb"),
            DecisionOption::new("enterprise", "Large").with_attribute("segment", "enterprise"),
        ];
        icp.selected_option_id = Some("enterprise".to_string());

        let step = ReferenceStep::new("pricing_analyst", "offer", vec![], false);
        let output = step.invoke(request(state)).await.unwrap();
        assert_eq!(output.proposals[0].recommended_option_id.as_deref(), Some("enterprise_contract"));
        assert_eq!(output.node_updates.len(), 2);
    }

    #[tokio::test]
    async fn test_compliance_plan_only_on_feedback_for_regulated() {
        let mut state = reference_scenario();
        state.meta.compliance_level = ComplianceLevel::High;
        let step = ReferenceStep::new("operations_synthesis", "operations", vec![DecisionKey::MvpScope], true);
        let has_plan = |o: &AgentOutput| o.patches.iter().any(|p| p.path.ends_with("compliance_plan"));

        let first = step.invoke(request(state.clone())).await.unwrap();
        assert!(!has_plan(&first));

        let mut corrected = request(state);
        corrected.feedback = Some(FeedbackContext {
            round: 1,
            hints: vec!["add a compliance plan".to_string()],
            rules: vec!["compliance_covered".to_string()],
        });
        assert!(has_plan(&step.invoke(corrected).await.unwrap()));
    }

    #[tokio::test]
    async fn test_synthesis_prefers_fresh_recommendation() {
        let step = ReferenceStep::new("offer_synthesis", "offer", vec![DecisionKey::Pricing], true);
        let analyst = ReferenceStep::new("pricing_analyst", "offer", vec![], false);
        let fresh = analyst.invoke(request(reference_scenario())).await.unwrap();

        let mut req = request(reference_scenario());
        req.cluster_context = vec![("pricing_analyst".to_string(), fresh)];
        let output = step.invoke(req).await.unwrap();
        let summary = output.patches[0].value.as_str().unwrap();
        assert!(summary.contains("Tiered monthly plans"), "{summary}");
        assert_eq!(output.node_updates[0].dependencies, vec!["pricing_analyst.finding"]);
    }
}
