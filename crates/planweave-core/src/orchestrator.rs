//! The orchestrator facade: full builds, partial reruns, resume, and
//! explicit user selections over one catalog and one set of stores.

use std::sync::Arc;

use scenario_state::{
    CheckpointStore, DecisionKey, ExecutionMode, RunId, RunRecord, RunStatus, RunStore, ScenarioState,
};
use state_merge::{MergeEngine, MergeWarning, TaggedOutput};
use tracing::{info, Instrument};

use crate::arbiter::{Arbiter, HeuristicArbiter};
use crate::catalog::PipelineCatalog;
use crate::config::OrchestratorConfig;
use crate::decisions::{reconcile_selections, user_selection_patches};
use crate::error::{OrchestratorError, OrchestratorResult, StepError};
use crate::events::{EventSink, RunEvent, TracingSink};
use crate::impact::{ImpactResolver, ImpactSet};
use crate::lifecycle::{finish, RunReport};
use crate::linear::run_linear;
use crate::obs;
use crate::phased::run_phased;
use crate::pipeline::{ExecResult, FaultInjection, RunContext, Services};
use crate::step::StepRegistry;
use crate::validation::{LedgerValidator, ValidationReport, Validator};

/// Result of an explicit user selection.
#[derive(Debug, Clone)]
pub struct SelectionReport {
    pub state: ScenarioState,
    /// What a rerun for this decision would execute.
    pub impact: ImpactSet,
    pub warnings: Vec<MergeWarning>,
}

pub struct Orchestrator {
    services: Arc<Services>,
}

impl Orchestrator {
    /// Checks the catalog and that every step it names is registered.
    pub fn new(
        catalog: PipelineCatalog,
        registry: StepRegistry,
        checkpoints: Arc<dyn CheckpointStore>,
        runs: Arc<dyn RunStore>,
    ) -> OrchestratorResult<Self> {
        catalog.validate()?;
        if let Some(missing) = catalog.all_steps().into_iter().find(|s| !registry.contains(s)) {
            return Err(StepError::NotRegistered(missing).into());
        }
        let config = OrchestratorConfig::default();
        Ok(Self {
            services: Arc::new(Services {
                catalog: Arc::new(catalog),
                registry,
                engine: MergeEngine::new(config.merge.clone()),
                checkpoints,
                runs,
                sink: Arc::new(TracingSink),
                arbiter: Arc::new(HeuristicArbiter),
                validator: Arc::new(LedgerValidator),
                config,
            }),
        })
    }

    pub fn with_events(mut self, sink: Arc<dyn EventSink>) -> Self {
        Arc::make_mut(&mut self.services).sink = sink;
        self
    }

    pub fn with_arbiter(mut self, arbiter: Arc<dyn Arbiter>) -> Self {
        Arc::make_mut(&mut self.services).arbiter = arbiter;
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        Arc::make_mut(&mut self.services).validator = validator;
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> OrchestratorResult<Self> {
        config.validate()?;
        let services = Arc::make_mut(&mut self.services);
        services.engine = MergeEngine::new(config.merge.clone());
        services.config = config;
        Ok(self)
    }

    pub fn catalog(&self) -> &PipelineCatalog {
        &self.services.catalog
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.services.config
    }

    /// Full build: every cluster, phase by phase, then finalization.
    pub async fn build(&self, state: ScenarioState, fault: FaultInjection) -> OrchestratorResult<RunReport> {
        let record = RunRecord::start(state.meta.id.clone(), ExecutionMode::Phased, None);
        self.execute(record, state, fault).await
    }

    /// Linear rerun of the steps impacted by `changed`; every step when
    /// `changed` is `None`.
    pub async fn rerun(
        &self,
        state: ScenarioState,
        changed: Option<DecisionKey>,
        fault: FaultInjection,
    ) -> OrchestratorResult<RunReport> {
        let record = RunRecord::start(state.meta.id.clone(), ExecutionMode::Linear, changed);
        self.execute(record, state, fault).await
    }

    /// Continue a failed run from its last checkpoint under a new run id.
    pub async fn resume(&self, run_id: &RunId, fault: FaultInjection) -> OrchestratorResult<RunReport> {
        let failed = self.services.runs.get_run(run_id).await?;
        if failed.status != RunStatus::Failed {
            return Err(OrchestratorError::NotResumable {
                run_id: run_id.to_string(),
                status: failed.status,
            });
        }
        let snapshot = self.services.checkpoints.latest(run_id).await?;
        let record = RunRecord::resume_from(&failed);
        info!(
            run_id = %record.run_id,
            resumed_from = %run_id,
            checkpoint_index = record.checkpoint_index,
            "resuming failed run"
        );
        self.execute(record, snapshot.state, fault).await
    }

    /// Record a user's choice for `key`. The selection sticks across later
    /// runs for as long as the option is offered.
    pub fn select_option(
        &self,
        state: &ScenarioState,
        key: DecisionKey,
        option: &str,
    ) -> OrchestratorResult<SelectionReport> {
        let patches = user_selection_patches(state, key, option)?;
        let report = self.services.engine.merge(state, &[TaggedOutput::orchestrator(patches)])?;
        let mut warnings = report.warnings;
        let mut state = report.state;

        let settled = reconcile_selections(&state);
        if !settled.is_empty() {
            let report = self.services.engine.merge(&state, &[TaggedOutput::orchestrator(settled)])?;
            warnings.extend(report.warnings);
            state = report.state;
        }

        Ok(SelectionReport {
            state,
            impact: self.impact(Some(key)),
            warnings,
        })
    }

    pub fn impact(&self, changed: Option<DecisionKey>) -> ImpactSet {
        ImpactResolver::new(&self.services.catalog).resolve(changed)
    }

    pub fn validate(&self, state: &ScenarioState) -> ValidationReport {
        self.services.validator.validate(state)
    }

    async fn execute(
        &self,
        record: RunRecord,
        state: ScenarioState,
        fault: FaultInjection,
    ) -> OrchestratorResult<RunReport> {
        state.commit_check()?;
        let span = obs::run_span(record.run_id.as_str());
        let services = Arc::clone(&self.services);

        async move {
            let start = record.checkpoint_index;
            let mut ctx = RunContext::new(services, record, state, fault);
            ctx.services.runs.put_run(&ctx.record).await?;

            let changed = ctx.record.changed_decision.map(|k| k.to_string());
            obs::emit_run_started(
                ctx.record.run_id.as_str(),
                &ctx.record.scenario_id,
                mode_name(ctx.record.mode),
                changed.as_deref(),
            );
            ctx.emitter.emit(RunEvent::RunStarted {
                mode: mode_name(ctx.record.mode).to_string(),
                changed_decision: changed,
                resumed_from_run_id: ctx.record.resumed_from_run_id.as_ref().map(|r| r.to_string()),
                start_index: start,
            });

            let result = dispatch(&mut ctx, start).await;
            finish(ctx, result).await
        }
        .instrument(span)
        .await
    }
}

async fn dispatch(ctx: &mut RunContext, start: usize) -> ExecResult {
    ctx.checkpoint(start, "start").await?;
    match ctx.record.mode {
        ExecutionMode::Linear => run_linear(ctx, start).await,
        ExecutionMode::Phased => run_phased(ctx, start).await,
    }
}

fn mode_name(mode: ExecutionMode) -> &'static str {
    match mode {
        ExecutionMode::Linear => "linear",
        ExecutionMode::Phased => "phased",
    }
}
