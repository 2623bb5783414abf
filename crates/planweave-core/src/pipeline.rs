//! Shared executor machinery: run context, cluster tasks, failures.
//!
//! The coordinator owns the canonical state for the whole run. Cluster tasks
//! get an `Arc` snapshot and return their outputs; only the coordinator
//! merges, so no two tasks ever mutate shared state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use scenario_state::{
    CheckpointStore, DecisionKey, RunId, RunRecord, RunStore, ScenarioState, SchemaError,
    StepTiming, StorageError,
};
use serde::Serialize;
use state_merge::{AgentOutput, MergeEngine, MergeError, MergeWarning, PatchOrigin, TaggedOutput};
use tokio::sync::Semaphore;
use tracing::warn;

use crate::arbiter::Arbiter;
use crate::catalog::{ClusterDef, PipelineCatalog};
use crate::config::OrchestratorConfig;
use crate::convergence::PivotDecision;
use crate::decisions::reconcile_selections;
use crate::error::{OrchestratorError, OrchestratorResult, StepError};
use crate::events::{EventEmitter, EventSink, RunEvent};
use crate::metrics::METRICS;
use crate::obs;
use crate::step::{invoke_checked, FeedbackContext, StepRegistry, StepRequest};
use crate::validation::Validator;

/// Pseudo-cluster for steps outside every pillar cluster.
pub(crate) const FINALIZATION: &str = "finalization";

/// Collaborators shared by every run of an orchestrator.
#[derive(Clone)]
pub(crate) struct Services {
    pub catalog: Arc<PipelineCatalog>,
    pub registry: StepRegistry,
    pub engine: MergeEngine,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub runs: Arc<dyn RunStore>,
    pub sink: Arc<dyn EventSink>,
    pub arbiter: Arc<dyn Arbiter>,
    pub validator: Arc<dyn Validator>,
    pub config: OrchestratorConfig,
}

/// Simulated failure hook for fault-injection testing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FaultInjection {
    #[default]
    None,
    /// Fail when this step is about to run.
    AtStep(String),
    /// Fail at this position of the linear step order.
    AtIndex(usize),
}

impl FaultInjection {
    pub fn at_step(step: impl Into<String>) -> Self {
        Self::AtStep(step.into())
    }

    pub fn at_index(index: usize) -> Self {
        Self::AtIndex(index)
    }

    pub fn triggers(&self, step: &str, linear_position: Option<usize>) -> bool {
        match self {
            Self::None => false,
            Self::AtStep(target) => target == step,
            Self::AtIndex(index) => linear_position == Some(*index),
        }
    }
}

/// Fatal step or phase fault, with enough state to resume.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineFailure {
    pub failed_step: Option<String>,
    pub failed_cluster: Option<String>,
    pub phase: Option<usize>,
    pub error: String,
    /// Last committed checkpoint index; the resume point.
    pub checkpoint_index: usize,
    pub completed_steps: Vec<String>,
    pub skipped_steps: Vec<String>,
    pub completed_clusters: Vec<String>,
    /// The state as of the last committed checkpoint. Nothing from the
    /// failed step or phase is in it.
    #[serde(skip)]
    pub partial_state: ScenarioState,
}

/// Why an executor stopped early.
pub(crate) enum Halt {
    Pivot(PivotDecision),
    Failed(PipelineFailure),
    Error(OrchestratorError),
}

impl From<OrchestratorError> for Halt {
    fn from(err: OrchestratorError) -> Self {
        Self::Error(err)
    }
}

impl From<StorageError> for Halt {
    fn from(err: StorageError) -> Self {
        Self::Error(err.into())
    }
}

impl From<MergeError> for Halt {
    fn from(err: MergeError) -> Self {
        Self::Error(err.into())
    }
}

impl From<SchemaError> for Halt {
    fn from(err: SchemaError) -> Self {
        Self::Error(err.into())
    }
}

pub(crate) type ExecResult = Result<(), Halt>;

/// Read-only inputs handed to every cluster task.
#[derive(Clone)]
pub(crate) struct TaskShared {
    pub run_id: RunId,
    pub state: Arc<ScenarioState>,
    pub changed: Option<DecisionKey>,
    pub registry: StepRegistry,
    pub catalog: Arc<PipelineCatalog>,
    pub emitter: EventEmitter,
    pub fault: FaultInjection,
}

/// Steps of one cluster to run in order.
pub(crate) struct ClusterTask {
    pub cluster: ClusterDef,
    /// Subset of `cluster.steps` to invoke; the rest only contribute context.
    pub steps: Vec<String>,
    /// Earlier outputs of steps that are not rerun.
    pub prior: BTreeMap<String, AgentOutput>,
    pub feedback: Option<FeedbackContext>,
}

impl ClusterTask {
    pub fn full(cluster: ClusterDef) -> Self {
        Self {
            steps: cluster.steps.clone(),
            cluster,
            prior: BTreeMap::new(),
            feedback: None,
        }
    }
}

pub(crate) struct StepRun {
    pub step: String,
    /// Position within the cluster.
    pub index: usize,
    pub output: AgentOutput,
    pub duration_ms: u64,
}

pub(crate) struct ClusterRun {
    pub cluster: String,
    pub steps: Vec<StepRun>,
}

pub(crate) struct ClusterFailure {
    pub cluster: String,
    pub step: Option<String>,
    pub error: StepError,
}

/// Run a cluster's selected steps sequentially. Each step sees the outputs
/// of the steps before it in cluster order, fresh or prior.
pub(crate) async fn run_cluster(shared: TaskShared, task: ClusterTask) -> Result<ClusterRun, ClusterFailure> {
    let name = task.cluster.name.clone();
    let fail = |step: &str, error: StepError| ClusterFailure {
        cluster: name.clone(),
        step: Some(step.to_string()),
        error,
    };

    let mut context: Vec<(String, AgentOutput)> = Vec::new();
    let mut runs = Vec::new();

    for (index, step_id) in task.cluster.steps.iter().enumerate() {
        if !task.steps.contains(step_id) {
            if let Some(prior) = task.prior.get(step_id) {
                context.push((step_id.clone(), prior.clone()));
            }
            continue;
        }

        if shared
            .fault
            .triggers(step_id, shared.catalog.linear_position(step_id))
        {
            return Err(fail(step_id, StepError::Injected { step: step_id.clone() }));
        }

        let step = shared.registry.get(step_id).map_err(|e| fail(step_id, e))?;
        shared.emitter.emit(RunEvent::AgentStarted {
            step: step_id.clone(),
            cluster: Some(name.clone()),
        });

        let request = StepRequest {
            run_id: shared.run_id.clone(),
            state: Arc::clone(&shared.state),
            changed_decision: shared.changed,
            cluster_context: context.clone(),
            feedback: task.feedback.clone(),
        };
        let started = Instant::now();
        METRICS.inc_steps_invoked();
        let output = invoke_checked(step.as_ref(), request)
            .await
            .map_err(|e| fail(step_id, e))?;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        shared.emitter.emit(RunEvent::AgentCompleted {
            step: step_id.clone(),
            cluster: Some(name.clone()),
            duration_ms,
            patches: output.patches.len(),
        });
        context.push((step_id.clone(), output.clone()));
        runs.push(StepRun {
            step: step_id.clone(),
            index,
            output,
            duration_ms,
        });
    }

    Ok(ClusterRun { cluster: name, steps: runs })
}

/// Run cluster tasks concurrently, bounded by `max_concurrency`. Results come
/// back in task order, whatever order the tasks finish in.
pub(crate) async fn spawn_clusters(
    shared: &TaskShared,
    tasks: Vec<ClusterTask>,
    max_concurrency: usize,
) -> Vec<Result<ClusterRun, ClusterFailure>> {
    let sem = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let mut names = Vec::with_capacity(tasks.len());
    let mut handles = Vec::with_capacity(tasks.len());

    for task in tasks {
        names.push(task.cluster.name.clone());
        let shared = shared.clone();
        let sem = Arc::clone(&sem);
        handles.push(tokio::spawn(async move {
            let _permit = sem.acquire_owned().await.ok();
            run_cluster(shared, task).await
        }));
    }

    join_all(handles)
        .await
        .into_iter()
        .zip(names)
        .map(|(joined, cluster)| match joined {
            Ok(result) => result,
            Err(e) => {
                warn!(cluster = %cluster, error = %e, "cluster task aborted");
                Err(ClusterFailure {
                    step: None,
                    error: StepError::Aborted {
                        step: cluster.clone(),
                        reason: e.to_string(),
                    },
                    cluster,
                })
            }
        })
        .collect()
}

/// Mutable state of one run, owned by the coordinator.
pub(crate) struct RunContext {
    pub services: Arc<Services>,
    pub record: RunRecord,
    pub state: ScenarioState,
    /// `state` as of the last checkpoint.
    pub committed: ScenarioState,
    /// Phase being executed; `None` outside the phased executor.
    pub phase: Option<usize>,
    pub warnings: Vec<MergeWarning>,
    /// Latest output per step in this run.
    pub step_outputs: BTreeMap<String, AgentOutput>,
    /// Clusters whose content exists in `state` and may be rerun.
    pub executed_clusters: BTreeSet<String>,
    pub feedback_rounds: u32,
    pub emitter: EventEmitter,
    pub fault: FaultInjection,
}

impl RunContext {
    pub fn new(services: Arc<Services>, record: RunRecord, state: ScenarioState, fault: FaultInjection) -> Self {
        let emitter = EventEmitter::new(record.run_id.as_str(), Arc::clone(&services.sink));
        Self {
            services,
            record,
            committed: state.clone(),
            state,
            phase: None,
            warnings: Vec::new(),
            step_outputs: BTreeMap::new(),
            executed_clusters: BTreeSet::new(),
            feedback_rounds: 0,
            emitter,
            fault,
        }
    }

    pub fn task_shared(&self) -> TaskShared {
        TaskShared {
            run_id: self.record.run_id.clone(),
            state: Arc::new(self.state.clone()),
            changed: self.record.changed_decision,
            registry: self.services.registry.clone(),
            catalog: Arc::clone(&self.services.catalog),
            emitter: self.emitter.clone(),
            fault: self.fault.clone(),
        }
    }

    /// Merge outputs, then let the orchestrator settle selections.
    pub fn merge(&mut self, outputs: Vec<TaggedOutput>) -> OrchestratorResult<()> {
        let engine = &self.services.engine;
        let report = engine.merge(&self.state, &outputs)?;
        let mut applied = report.applied;
        let mut rejected = report.rejected;
        let mut violations = report.ownership_violations();
        let mut warnings = report.warnings;
        let mut state = report.state;

        let selections = reconcile_selections(&state);
        if !selections.is_empty() {
            let settled = engine.merge(&state, &[TaggedOutput::orchestrator(selections)])?;
            applied += settled.applied;
            rejected += settled.rejected;
            violations += settled.ownership_violations();
            warnings.extend(settled.warnings);
            state = settled.state;
        }

        METRICS.add_merge(applied, rejected, violations);
        obs::emit_merge_summary(self.record.run_id.as_str(), applied, rejected, warnings.len());

        for tagged in outputs {
            if let PatchOrigin::Step(step) = tagged.origin {
                self.step_outputs.insert(step, tagged.output);
            }
        }
        self.record.merge_warning_count += warnings.len();
        self.warnings.extend(warnings);
        self.state = state;
        Ok(())
    }

    /// Merge finished clusters in cluster-name order. With `progress`, their
    /// steps are recorded as completed work of the run.
    pub fn absorb(&mut self, mut runs: Vec<ClusterRun>, progress: bool) -> OrchestratorResult<()> {
        runs.sort_by(|a, b| a.cluster.cmp(&b.cluster));
        let mut tagged = Vec::new();
        for run in runs {
            for step in run.steps {
                self.record.step_timings.push(StepTiming {
                    step: step.step.clone(),
                    duration_ms: step.duration_ms,
                    skipped: false,
                });
                if progress {
                    self.record.completed_steps.push(step.step.clone());
                }
                tagged.push(TaggedOutput::new(
                    PatchOrigin::Step(step.step),
                    run.cluster.clone(),
                    step.index,
                    step.output,
                ));
            }
        }
        self.merge(tagged)
    }

    /// Record a step outside the impacted set.
    pub fn skip(&mut self, step: &str) {
        self.record.skipped_steps.push(step.to_string());
        self.record.step_timings.push(StepTiming {
            step: step.to_string(),
            duration_ms: 0,
            skipped: true,
        });
        self.emitter.emit(RunEvent::AgentSkipped {
            step: step.to_string(),
        });
    }

    /// Persist the state and advance the resume point.
    pub async fn checkpoint(&mut self, index: usize, label: &str) -> OrchestratorResult<()> {
        self.record.checkpoint_index = index;
        self.services
            .checkpoints
            .checkpoint(&self.record.run_id, &self.state, index, label)
            .await?;
        self.services.runs.put_run(&self.record).await?;
        self.committed = self.state.clone();
        METRICS.inc_checkpoints();
        obs::emit_checkpoint_saved(self.record.run_id.as_str(), index, label);
        self.emitter.emit(RunEvent::CheckpointSaved {
            index,
            label: label.to_string(),
        });
        Ok(())
    }

    /// Describe a fault against the last committed checkpoint.
    pub fn failure(&self, failed: ClusterFailure) -> PipelineFailure {
        PipelineFailure {
            failed_step: failed.step,
            failed_cluster: Some(failed.cluster),
            phase: self.phase,
            error: failed.error.to_string(),
            checkpoint_index: self.record.checkpoint_index,
            completed_steps: self.record.completed_steps.clone(),
            skipped_steps: self.record.skipped_steps.clone(),
            completed_clusters: self.record.completed_clusters.clone(),
            partial_state: self.committed.clone(),
        }
    }
}
