//! Run lifecycle: map an executor result onto a terminal run record.
//!
//! `running → {completed, blocked, failed}`. Validation decides between
//! completed and blocked; a pivot also ends blocked; failed is reserved for
//! step and phase faults, which keep their last checkpoint for resume.

use chrono::Utc;
use scenario_state::{BlockedReason, RunRecord, RunStatus, ScenarioState};
use serde::Serialize;
use state_merge::MergeWarning;
use tracing::{info, warn};

use crate::convergence::PivotDecision;
use crate::error::OrchestratorResult;
use crate::events::RunEvent;
use crate::metrics::METRICS;
use crate::obs;
use crate::pipeline::{ExecResult, Halt, PipelineFailure, RunContext};
use crate::validation::{Contradiction, ValidationReport};

/// How a run ended.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    /// Unresolved blocking contradictions.
    Blocked { contradictions: Vec<Contradiction> },
    PivotRequired(PivotDecision),
    Failed(PipelineFailure),
}

impl RunOutcome {
    pub fn status(&self) -> RunStatus {
        match self {
            Self::Completed => RunStatus::Completed,
            Self::Blocked { .. } | Self::PivotRequired(_) => RunStatus::Blocked,
            Self::Failed(_) => RunStatus::Failed,
        }
    }

    pub fn blocked_reason(&self) -> Option<BlockedReason> {
        match self {
            Self::Blocked { .. } => Some(BlockedReason::Contradictions),
            Self::PivotRequired(_) => Some(BlockedReason::PivotRequired),
            Self::Completed | Self::Failed(_) => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Everything a caller needs after a run: the terminal record, the state to
/// store, and what stopped it if it did not complete.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run: RunRecord,
    pub outcome: RunOutcome,
    pub state: ScenarioState,
    pub validation: ValidationReport,
    pub warnings: Vec<MergeWarning>,
}

/// Close out a run. Only storage and internal errors surface as `Err`; step
/// faults become a `Failed` outcome.
pub(crate) async fn finish(mut ctx: RunContext, result: ExecResult) -> OrchestratorResult<RunReport> {
    let run_id = ctx.record.run_id.clone();

    let outcome = match result {
        Err(Halt::Error(err)) => {
            warn!(run_id = %run_id, error = %err, "run aborted");
            ctx.record.status = RunStatus::Failed;
            ctx.record.last_error = Some(err.to_string());
            ctx.record.finished_at = Some(Utc::now());
            ctx.services.runs.put_run(&ctx.record).await?;
            ctx.emitter.emit(RunEvent::RunFailed {
                error: err.to_string(),
                checkpoint_index: ctx.record.checkpoint_index,
            });
            obs::emit_run_failed(run_id.as_str(), ctx.record.checkpoint_index, &err);
            METRICS.flush();
            return Err(err);
        }
        Err(Halt::Failed(failure)) => RunOutcome::Failed(failure),
        Err(Halt::Pivot(pivot)) => RunOutcome::PivotRequired(pivot),
        Ok(()) => RunOutcome::Completed,
    };

    let validation = ctx.services.validator.validate(&ctx.state);
    let outcome = match outcome {
        RunOutcome::Completed if validation.blocking => RunOutcome::Blocked {
            contradictions: validation
                .contradictions
                .iter()
                .filter(|c| c.blocking)
                .cloned()
                .collect(),
        },
        other => other,
    };

    if !matches!(outcome, RunOutcome::Failed(_)) {
        let index = ctx.record.checkpoint_index;
        ctx.checkpoint(index, "final").await?;
    }

    ctx.record.status = outcome.status();
    ctx.record.blocked_reason = outcome.blocked_reason();
    ctx.record.finished_at = Some(Utc::now());
    if let RunOutcome::Failed(failure) = &outcome {
        ctx.record.last_error = Some(failure.error.clone());
    }
    ctx.services.runs.put_run(&ctx.record).await?;

    match &outcome {
        RunOutcome::Completed => {
            ctx.emitter.emit(RunEvent::RunCompleted {
                completed_steps: ctx.record.completed_steps.len(),
                skipped_steps: ctx.record.skipped_steps.len(),
            });
        }
        RunOutcome::PivotRequired(pivot) => {
            ctx.emitter.emit(RunEvent::RunBlocked {
                contradictions: vec![format!("pivot_required:{}", pivot.pillar)],
            });
        }
        RunOutcome::Blocked { contradictions } => {
            ctx.emitter.emit(RunEvent::RunBlocked {
                contradictions: contradictions.iter().map(|c| c.id.clone()).collect(),
            });
        }
        RunOutcome::Failed(failure) => {
            ctx.emitter.emit(RunEvent::RunFailed {
                error: failure.error.clone(),
                checkpoint_index: failure.checkpoint_index,
            });
            obs::emit_run_failed(run_id.as_str(), failure.checkpoint_index, &failure.error);
        }
    }

    let status = serde_json::to_value(ctx.record.status)?;
    obs::emit_run_finished(
        run_id.as_str(),
        status.as_str().unwrap_or_default(),
        ctx.record.duration_ms().unwrap_or_default(),
        ctx.record.completed_steps.len(),
        ctx.record.skipped_steps.len(),
    );
    METRICS.flush();
    info!(run_id = %run_id, status = ?ctx.record.status, "run finished");

    let state = match &outcome {
        RunOutcome::Failed(failure) => failure.partial_state.clone(),
        _ => ctx.state,
    };
    Ok(RunReport {
        run: ctx.record,
        outcome,
        state,
        validation,
        warnings: ctx.warnings,
    })
}
