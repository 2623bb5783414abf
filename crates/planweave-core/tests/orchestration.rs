//! End-to-end runs of the orchestrator over the reference pipeline.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use planweave_core::{
    reference_registry, reference_scenario, FailingArbiter, FaultInjection, Orchestrator,
    OrchestratorConfig, OrchestratorError, PipelineCatalog, RecordingSink, ReferenceStep, RunEvent,
    RunOutcome, Step, StepError, StepRequest,
};
use scenario_state::fakes::{MemoryCheckpointStore, MemoryRunStore};
use scenario_state::storage_traits::{CheckpointStore, RunStore};
use scenario_state::{
    BlockedReason, ComplianceLevel, DecisionKey, DecisionOption, GraphNode, LedgerKind, NodeStatus,
    PillarStatus, RunStatus, ScenarioState, SelectionSource,
};
use serde_json::json;
use state_merge::{AgentOutput, Proposal};

struct Harness {
    orchestrator: Orchestrator,
    sink: Arc<RecordingSink>,
    checkpoints: Arc<MemoryCheckpointStore>,
    runs: Arc<MemoryRunStore>,
}

fn harness_with(steps: Vec<Arc<dyn Step>>) -> Harness {
    let catalog = PipelineCatalog::standard();
    let mut registry = reference_registry(&catalog);
    for step in steps {
        registry.register(step);
    }
    let sink = Arc::new(RecordingSink::new());
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let runs = Arc::new(MemoryRunStore::new());
    let orchestrator = Orchestrator::new(catalog, registry, checkpoints.clone(), runs.clone())
        .unwrap()
        .with_events(sink.clone());
    Harness {
        orchestrator,
        sink,
        checkpoints,
        runs,
    }
}

fn harness() -> Harness {
    harness_with(Vec::new())
}

fn node_ids(state: &ScenarioState) -> BTreeSet<String> {
    state.graph.nodes.iter().map(|n| n.id.clone()).collect()
}

fn linear_order() -> Vec<String> {
    PipelineCatalog::standard().linear_order()
}

/// Pricing step that picks the wrong segment until corrected, then
/// over-corrects with a burst of extra nodes.
struct DriftingPricing;

#[async_trait]
impl Step for DriftingPricing {
    fn id(&self) -> &str {
        "pricing_analyst"
    }

    async fn invoke(&self, request: StepRequest) -> Result<AgentOutput, StepError> {
        let corrected = request.feedback.is_some();
        let node_count = if corrected { 6 } else { 2 };
        let node_updates = (0..node_count)
            .map(|i| GraphNode {
                id: format!("pricing_analyst.n{i}"),
                title: format!("Pricing note {i}"),
                pillar: "offer".to_string(),
                node_type: "finding".to_string(),
                content: json!({ "i": i }),
                confidence: 0.6,
                dependencies: Vec::new(),
                status: NodeStatus::Draft,
                updated_at: None,
            })
            .collect();
        let recommended = if corrected { "smb_tiered" } else { "enterprise_contract" };
        Ok(AgentOutput {
            proposals: vec![Proposal {
                decision: DecisionKey::Pricing,
                options: vec![
                    DecisionOption::new("smb_tiered", "Tiered monthly plans").with_attribute("segment", "smb"),
                    DecisionOption::new("enterprise_contract", "Annual contract")
                        .with_attribute("segment", "enterprise"),
                ],
                recommended_option_id: Some(recommended.to_string()),
            }],
            node_updates,
            ..AgentOutput::default()
        })
    }
}

#[tokio::test]
async fn test_full_build_completes() {
    let h = harness();
    let report = h
        .orchestrator
        .build(reference_scenario(), FaultInjection::None)
        .await
        .unwrap();

    assert!(matches!(report.outcome, RunOutcome::Completed), "{:?}", report.outcome);
    assert_eq!(report.run.status, RunStatus::Completed);
    assert!(report.run.finished_at.is_some());
    assert!(report.state.graph.nodes.len() >= 20);
    assert_eq!(report.run.completed_clusters.len(), 6);
    // three phases plus finalization
    assert_eq!(report.run.checkpoint_index, 4);
    assert!(report.state.decisions.values().all(|d| d.selected_option_id.is_some()));
    assert!(!report.validation.blocking);

    let stored = h.runs.get_run(&report.run.run_id).await.unwrap();
    assert_eq!(stored.status, RunStatus::Completed);
    let latest = h.checkpoints.latest(&report.run.run_id).await.unwrap();
    assert_eq!(latest.label, "final");
    assert_eq!(node_ids(&latest.state), node_ids(&report.state));
}

#[tokio::test]
async fn test_build_twice_yields_same_node_ids() {
    let h = harness();
    let first = h
        .orchestrator
        .build(reference_scenario(), FaultInjection::None)
        .await
        .unwrap();
    let second = h
        .orchestrator
        .build(first.state.clone(), FaultInjection::None)
        .await
        .unwrap();

    assert_eq!(node_ids(&first.state), node_ids(&second.state));
    assert_eq!(second.state.graph.nodes.len(), node_ids(&second.state).len());
    assert!(second.state.graph.nodes.len() >= 20);
}

#[tokio::test]
async fn test_concurrency_bound_does_not_change_result() {
    let serial = harness();
    let serial = serial
        .orchestrator
        .with_config(OrchestratorConfig::default().with_max_concurrency(1))
        .unwrap();
    let parallel = harness().orchestrator;

    let a = serial.build(reference_scenario(), FaultInjection::None).await.unwrap();
    let b = parallel.build(reference_scenario(), FaultInjection::None).await.unwrap();

    assert_eq!(node_ids(&a.state), node_ids(&b.state));
    assert_eq!(a.state.decisions, b.state.decisions);
    assert_eq!(a.state.pillars, b.state.pillars);
}

#[tokio::test]
async fn test_partial_rerun_skips_unrelated_steps() {
    let h = harness();
    let built = h
        .orchestrator
        .build(reference_scenario(), FaultInjection::None)
        .await
        .unwrap();
    let selection = h
        .orchestrator
        .select_option(&built.state, DecisionKey::Icp, "enterprise")
        .unwrap();
    assert!(selection.impact.includes("pricing_analyst"));
    assert!(!selection.impact.includes("market_research"));

    let report = h
        .orchestrator
        .rerun(selection.state, Some(DecisionKey::Icp), FaultInjection::None)
        .await
        .unwrap();

    for step in ["market_research", "competitor_scan", "market_synthesis"] {
        assert!(report.run.skipped_steps.iter().any(|s| s == step), "{step} not skipped");
        assert!(!report.run.completed_steps.iter().any(|s| s == step), "{step} ran");
    }
    assert!(report.run.completed_steps.iter().any(|s| s == "pricing_analyst"));
    assert!(report.run.completed_steps.iter().any(|s| s == "graph_builder"));
    assert_eq!(h.sink.count("agent_skipped"), 3);

    let icp = report.state.decision(DecisionKey::Icp).unwrap();
    assert_eq!(icp.selected_option_id.as_deref(), Some("enterprise"));
    assert_eq!(icp.selection_source, Some(SelectionSource::User));
    assert_eq!(report.state.selection(DecisionKey::Pricing), Some("enterprise_contract"));
    assert!(matches!(report.outcome, RunOutcome::Completed), "{:?}", report.outcome);
}

#[tokio::test]
async fn test_linear_failure_then_resume() {
    let h = harness();
    let order = linear_order();
    let failed = h
        .orchestrator
        .rerun(reference_scenario(), None, FaultInjection::at_index(10))
        .await
        .unwrap();

    assert_eq!(failed.run.status, RunStatus::Failed);
    assert_eq!(failed.run.checkpoint_index, 10);
    assert!(failed.run.last_error.is_some());
    let RunOutcome::Failed(failure) = &failed.outcome else {
        panic!("expected failure, got {:?}", failed.outcome);
    };
    assert_eq!(failure.failed_step.as_deref(), Some(order[10].as_str()));
    assert_eq!(failure.checkpoint_index, 10);
    assert_eq!(failure.completed_steps, order[..10].to_vec());
    assert_eq!(h.sink.count("run_failed"), 1);

    let resumed = h
        .orchestrator
        .resume(&failed.run.run_id, FaultInjection::None)
        .await
        .unwrap();
    assert_eq!(resumed.run.resumed_from_run_id.as_ref(), Some(&failed.run.run_id));
    assert_ne!(resumed.run.run_id, failed.run.run_id);
    assert_eq!(resumed.run.status, RunStatus::Completed);
    assert_eq!(resumed.run.completed_steps, order[10..].to_vec());
    assert!(resumed.state.graph.nodes.len() >= 20);
}

/// Pricing step that picks the wrong segment, then errors when asked to
/// correct it.
struct BrittlePricing;

#[async_trait]
impl Step for BrittlePricing {
    fn id(&self) -> &str {
        "pricing_analyst"
    }

    async fn invoke(&self, request: StepRequest) -> Result<AgentOutput, StepError> {
        if request.feedback.is_some() {
            return Err(StepError::failed("pricing_analyst", "pricing service unavailable"));
        }
        DriftingPricing.invoke(request).await
    }
}

/// Sales-motion step that proposes a sales-led motion until corrected.
struct MisalignedMotion {
    inner: ReferenceStep,
}

impl MisalignedMotion {
    fn new() -> Self {
        Self {
            inner: ReferenceStep::new("sales_motion_planner", "go_to_market", vec![DecisionKey::SalesMotion], false),
        }
    }
}

#[async_trait]
impl Step for MisalignedMotion {
    fn id(&self) -> &str {
        "sales_motion_planner"
    }

    async fn invoke(&self, request: StepRequest) -> Result<AgentOutput, StepError> {
        let corrected = request.feedback.is_some();
        let mut output = self.inner.invoke(request).await?;
        if !corrected {
            for proposal in &mut output.proposals {
                proposal.recommended_option_id = Some("sales_led".to_string());
            }
        }
        Ok(output)
    }
}

#[tokio::test]
async fn test_phase_failure_keeps_only_committed_phases() {
    let h = harness();
    let failed = h
        .orchestrator
        .build(reference_scenario(), FaultInjection::at_step("pricing_analyst"))
        .await
        .unwrap();

    let RunOutcome::Failed(failure) = &failed.outcome else {
        panic!("expected failure, got {:?}", failed.outcome);
    };
    assert_eq!(failure.phase, Some(1));
    assert_eq!(failure.failed_cluster.as_deref(), Some("offer"));
    assert_eq!(failure.checkpoint_index, 1);
    assert_eq!(failure.completed_clusters, vec!["customer", "market"]);
    // nothing from the failed phase was merged, not even the cluster that succeeded
    assert!(!failure.partial_state.pillars.contains_key("go_to_market"));
    assert!(!failure.partial_state.pillars.contains_key("offer"));
    assert!(failed.state.pillars.contains_key("customer"));

    let resumed = h
        .orchestrator
        .resume(&failed.run.run_id, FaultInjection::None)
        .await
        .unwrap();
    assert_eq!(resumed.run.status, RunStatus::Completed);
    assert_eq!(
        resumed.run.completed_clusters,
        vec!["go_to_market", "offer", "finance", "operations"]
    );
    assert!(!resumed.run.completed_steps.iter().any(|s| s == "icp_profiler"));
}

#[tokio::test]
async fn test_resume_requires_failed_run() {
    let h = harness();
    let report = h
        .orchestrator
        .build(reference_scenario(), FaultInjection::None)
        .await
        .unwrap();
    let err = h
        .orchestrator
        .resume(&report.run.run_id, FaultInjection::None)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::NotResumable { status: RunStatus::Completed, .. }));
}

#[tokio::test]
async fn test_pivot_halts_run() {
    let h = harness_with(vec![Arc::new(DriftingPricing)]);
    let report = h
        .orchestrator
        .build(reference_scenario(), FaultInjection::None)
        .await
        .unwrap();

    let RunOutcome::PivotRequired(pivot) = &report.outcome else {
        panic!("expected pivot, got {:?}", report.outcome);
    };
    assert_eq!(pivot.pillar, "offer");
    assert_eq!(pivot.change_score, 0.75);
    assert_eq!(pivot.downstream_pillars, vec!["finance", "go_to_market"]);
    assert_eq!(pivot.changed_decisions, vec![DecisionKey::Pricing]);

    assert_eq!(report.run.status, RunStatus::Blocked);
    assert_eq!(report.run.blocked_reason, Some(BlockedReason::PivotRequired));
    assert_eq!(report.state.pillars["offer"].status, PillarStatus::PendingUserDecision);
    // halted before the last phase
    assert!(!report.state.pillars.contains_key("finance"));
    assert_eq!(h.sink.count("pivot_decision_required"), 1);
    assert_eq!(h.sink.count("feedback_round_started"), 1);
}

#[tokio::test]
async fn test_arbiter_outage_falls_back_to_synthesis_rerun() {
    let h = harness();
    let orchestrator = h.orchestrator.with_arbiter(Arc::new(FailingArbiter));
    let mut state = reference_scenario();
    state.meta.compliance_level = ComplianceLevel::High;

    let report = orchestrator.build(state, FaultInjection::None).await.unwrap();

    assert!(matches!(report.outcome, RunOutcome::Completed), "{:?}", report.outcome);
    assert!(report.state.pillars["operations"].fields.contains_key("compliance_plan"));
    let rerun: Vec<Vec<String>> = h
        .sink
        .events()
        .into_iter()
        .filter_map(|e| match e.event {
            RunEvent::FeedbackRoundCompleted { rerun_steps, .. } => Some(rerun_steps),
            _ => None,
        })
        .collect();
    assert_eq!(rerun, vec![vec!["operations_synthesis".to_string()]]);
    assert_eq!(report.state.telemetry.health["operations"].failed, 0);
}

#[tokio::test]
async fn test_events_are_sequenced() {
    let h = harness();
    h.orchestrator
        .build(reference_scenario(), FaultInjection::None)
        .await
        .unwrap();

    let events = h.sink.events();
    let names = h.sink.names();
    assert_eq!(names.first(), Some(&"run_started"));
    assert_eq!(names.last(), Some(&"run_completed"));
    assert!(events.windows(2).all(|w| w[1].seq > w[0].seq));
    assert_eq!(h.sink.count("cluster_phase_started"), 3);
    assert_eq!(h.sink.count("cluster_completed"), 6);
    assert_eq!(h.sink.count("orchestrator_completed"), 3);
    assert_eq!(h.sink.count("agent_started"), h.sink.count("agent_completed"));
    // start, three phases, finalization, final
    assert_eq!(h.sink.count("checkpoint_saved"), 6);
}

#[tokio::test]
async fn test_invalid_scenario_is_never_persisted() {
    let h = harness();
    let mut state = reference_scenario();
    let dup = GraphNode {
        id: "dup".to_string(),
        title: "dup".to_string(),
        pillar: "market".to_string(),
        node_type: "note".to_string(),
        content: json!({}),
        confidence: 0.5,
        dependencies: Vec::new(),
        status: NodeStatus::Draft,
        updated_at: None,
    };
    state.graph.nodes = vec![dup.clone(), dup];

    let err = h
        .orchestrator
        .build(state, FaultInjection::None)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Schema(_)));
    assert!(h.checkpoints.is_empty());
    assert!(h.runs.list_runs("reference").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unregistered_step_is_rejected_up_front() {
    let catalog = PipelineCatalog::standard();
    let mut registry = planweave_core::StepRegistry::new();
    registry.register(Arc::new(DriftingPricing));
    let result = Orchestrator::new(
        catalog,
        registry,
        Arc::new(MemoryCheckpointStore::new()),
        Arc::new(MemoryRunStore::new()),
    );
    assert!(matches!(
        result,
        Err(OrchestratorError::Step(StepError::NotRegistered(_)))
    ));
}

#[tokio::test]
async fn test_select_unknown_option_fails() {
    let h = harness();
    let built = h
        .orchestrator
        .build(reference_scenario(), FaultInjection::None)
        .await
        .unwrap();
    let err = h
        .orchestrator
        .select_option(&built.state, DecisionKey::Pricing, "freemium")
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::UnknownOption { .. }));
}

#[tokio::test]
async fn test_feedback_failure_reports_last_committed_phase() {
    let h = harness_with(vec![Arc::new(BrittlePricing)]);
    let failed = h
        .orchestrator
        .build(reference_scenario(), FaultInjection::None)
        .await
        .unwrap();

    let RunOutcome::Failed(failure) = &failed.outcome else {
        panic!("expected failure, got {:?}", failed.outcome);
    };
    assert_eq!(failure.phase, Some(1));
    assert_eq!(failure.failed_step.as_deref(), Some("pricing_analyst"));
    assert_eq!(failure.checkpoint_index, 1);
    assert_eq!(failure.completed_clusters, vec!["customer", "market"]);
    assert!(!failure
        .completed_steps
        .iter()
        .any(|s| s == "pricing_analyst" || s == "channel_planner"));
    // the partial state matches the snapshot resume would load
    assert!(!failure.partial_state.pillars.contains_key("offer"));
    assert!(!failure.partial_state.pillars.contains_key("go_to_market"));
    let latest = h.checkpoints.latest(&failed.run.run_id).await.unwrap();
    assert_eq!(latest.index, 1);
    assert_eq!(latest.state, failure.partial_state);

    let stored = h.runs.get_run(&failed.run.run_id).await.unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
    assert_eq!(stored.checkpoint_index, 1);
    assert_eq!(stored.completed_clusters, vec!["customer", "market"]);
}

#[tokio::test]
async fn test_moderate_feedback_change_is_recorded_not_blocking() {
    let h = harness_with(vec![Arc::new(MisalignedMotion::new())]);
    let report = h
        .orchestrator
        .build(reference_scenario(), FaultInjection::None)
        .await
        .unwrap();

    assert!(matches!(report.outcome, RunOutcome::Completed), "{:?}", report.outcome);
    assert_eq!(h.sink.count("feedback_round_started"), 1);
    assert_eq!(h.sink.count("pivot_decision_required"), 0);

    let entry = report
        .state
        .ledger_entry("material_change:go_to_market")
        .expect("material change entry");
    assert_eq!(entry.kind, LedgerKind::MaterialChange);
    assert!(!entry.blocking);
    assert!(!entry.is_open_blocker());
    assert_eq!(report.state.selection(DecisionKey::SalesMotion), Some("self_serve"));
    assert_eq!(report.state.pillars["go_to_market"].status, PillarStatus::Ready);
}
