//! Cross-pillar checks and the bounded feedback loop.
//!
//! After a phase (or after the linear pass) the coordinator evaluates the
//! rule set. Failures become directives, either straight from the rule or
//! through the arbiter, and at most `max_feedback_rounds` rerun rounds run
//! per run. Each round is scored for convergence; a pivot halts the run.

use std::collections::{BTreeMap, BTreeSet};

use scenario_state::{LedgerEntry, LedgerKind, PillarStatus, ScenarioState, Severity};
use tracing::{debug, info, instrument, warn};

use crate::arbiter::FeedbackDirective;
use crate::catalog::PipelineCatalog;
use crate::convergence::{ConvergenceDetector, ConvergenceReport};
use crate::events::RunEvent;
use crate::metrics::METRICS;
use crate::obs;
use crate::pipeline::{spawn_clusters, ClusterTask, ExecResult, Halt, RunContext};
use crate::rules::{pillar_health, RuleResult, RuleSet, ScenarioProfile};
use crate::step::FeedbackContext;

#[instrument(skip(ctx), fields(run_id = %ctx.record.run_id, round = ctx.feedback_rounds))]
pub(crate) async fn cross_check(ctx: &mut RunContext) -> ExecResult {
    let catalog = ctx.services.catalog.clone();
    let rules = RuleSet::for_profile(&ScenarioProfile::detect(&ctx.state));
    let mut results = rules.evaluate(&ctx.state, &catalog);

    let failures: Vec<RuleResult> = results.iter().filter(|r| !r.passed).cloned().collect();
    let directives = if !failures.is_empty() && ctx.feedback_rounds < ctx.services.config.max_feedback_rounds {
        let planned = plan_directives(ctx, &failures).await;
        let (ready, deferred): (Vec<_>, Vec<_>) = planned
            .into_iter()
            .partition(|d| ctx.executed_clusters.contains(&d.target_cluster));
        for directive in &deferred {
            debug!(cluster = %directive.target_cluster, rule = %directive.rule, "cluster not built yet; deferring");
        }
        ready
    } else {
        Vec::new()
    };

    let failed = failures.len();
    ctx.emitter.emit(RunEvent::OrchestratorCompleted {
        passed: results.len() - failed,
        failed,
        directives: directives.len(),
    });
    obs::emit_rules_evaluated(ctx.record.run_id.as_str(), results.len() - failed, failed);

    let mut pivot = None;
    if !directives.is_empty() {
        let (after, report) = feedback_round(ctx, &catalog, directives).await?;
        results = after;
        pivot = report.pivot;
    }

    ctx.state.telemetry.health = pillar_health(&results);
    sync_rule_ledger(&mut ctx.state, &results);

    match pivot {
        Some(decision) => Err(Halt::Pivot(decision)),
        None => Ok(()),
    }
}

/// Directives for every failure. Rules naming their steps route directly;
/// the rest go to the arbiter in one batch.
async fn plan_directives(ctx: &RunContext, failures: &[RuleResult]) -> Vec<FeedbackDirective> {
    let catalog = &ctx.services.catalog;
    let mut directives = Vec::new();
    let mut ambiguous = Vec::new();
    for failure in failures {
        match FeedbackDirective::from_rule(failure, catalog) {
            Some(directive) => directives.push(directive),
            None => ambiguous.push(failure.clone()),
        }
    }

    if !ambiguous.is_empty() {
        match ctx.services.arbiter.arbitrate(catalog, &ctx.state, &ambiguous).await {
            Ok(arbitrated) => directives.extend(arbitrated),
            Err(e) => {
                warn!(error = %e, failures = ambiguous.len(), "arbitration failed; using fallback directives");
                directives.extend(ambiguous.iter().map(FeedbackDirective::fallback));
            }
        }
    }

    directives.retain(|d| {
        let known = catalog.cluster(&d.target_cluster).is_some();
        if !known {
            warn!(cluster = %d.target_cluster, rule = %d.rule, "directive targets unknown cluster; ignored");
        }
        known
    });
    directives
}

async fn feedback_round(
    ctx: &mut RunContext,
    catalog: &PipelineCatalog,
    directives: Vec<FeedbackDirective>,
) -> Result<(Vec<RuleResult>, ConvergenceReport), Halt> {
    ctx.feedback_rounds += 1;
    let round = ctx.feedback_rounds;
    METRICS.inc_feedback_rounds();
    let before = ctx.state.clone();

    let mut grouped: BTreeMap<String, Vec<FeedbackDirective>> = BTreeMap::new();
    for directive in directives {
        grouped.entry(directive.target_cluster.clone()).or_default().push(directive);
    }
    let clusters: Vec<String> = grouped.keys().cloned().collect();
    info!(round, clusters = ?clusters, "feedback round");
    ctx.emitter.emit(RunEvent::FeedbackRoundStarted {
        round,
        clusters: clusters.clone(),
    });

    let mut tasks = Vec::new();
    let mut rerun_steps = Vec::new();
    for (name, group) in &grouped {
        let Some(cluster) = catalog.cluster(name).cloned() else {
            continue;
        };
        let synthesis = cluster.synthesis().map(str::to_string);
        let steps: Vec<String> = cluster
            .steps
            .iter()
            .filter(|s| {
                synthesis.as_deref() == Some(s.as_str())
                    || group.iter().any(|d| d.affected_steps.contains(s))
            })
            .cloned()
            .collect();
        let prior = cluster
            .steps
            .iter()
            .filter_map(|s| ctx.step_outputs.get(s).map(|o| (s.clone(), o.clone())))
            .collect();
        rerun_steps.extend(steps.iter().cloned());
        tasks.push(ClusterTask {
            cluster,
            steps,
            prior,
            feedback: Some(feedback_context(round, group)),
        });
    }

    let shared = ctx.task_shared();
    let mut runs = Vec::new();
    for result in spawn_clusters(&shared, tasks, ctx.services.config.max_concurrency).await {
        match result {
            Ok(run) => runs.push(run),
            Err(failed) => return Err(Halt::Failed(ctx.failure(failed))),
        }
    }
    ctx.absorb(runs, false)?;

    let rules = RuleSet::for_profile(&ScenarioProfile::detect(&ctx.state));
    let results = rules.evaluate(&ctx.state, catalog);
    let remaining_failures = results.iter().filter(|r| !r.passed).count();
    ctx.emitter.emit(RunEvent::FeedbackRoundCompleted {
        round,
        rerun_steps,
        remaining_failures,
    });

    let detector = ConvergenceDetector::new(catalog, &ctx.services.config);
    let report = detector.evaluate(clusters.iter().map(String::as_str), &before, &ctx.state);

    for change in report.material() {
        let mut entry = LedgerEntry::new(
            format!("material_change:{}", change.pillar),
            LedgerKind::MaterialChange,
            Severity::Medium,
            format!("{} moved after feedback round {round}", change.pillar),
        );
        entry.detail = format!(
            "score {:.2}; changed {}",
            change.change_score,
            change.changed_fields.join(", ")
        );
        entry.pillar = Some(change.pillar.clone());
        ctx.state.upsert_ledger_entry(entry);
    }

    if let Some(pivot) = &report.pivot {
        for pillar in &pivot.pivoting_pillars {
            if let Some(summary) = ctx.state.pillars.get_mut(pillar) {
                summary.status = PillarStatus::PendingUserDecision;
            }
        }
        METRICS.inc_pivots();
        warn!(pillar = %pivot.pillar, score = pivot.change_score, "pivot requires a user decision");
        obs::emit_pivot_required(ctx.record.run_id.as_str(), &pivot.pillar, pivot.change_score);
        ctx.emitter.emit(RunEvent::PivotDecisionRequired {
            pillar: pivot.pillar.clone(),
            change_score: pivot.change_score,
            downstream_pillars: pivot.downstream_pillars.clone(),
        });
    }

    Ok((results, report))
}

/// Hints in directive order; rule ids once each, sorted.
fn feedback_context(round: u32, group: &[FeedbackDirective]) -> FeedbackContext {
    let rules: BTreeSet<String> = group.iter().map(|d| d.rule.clone()).collect();
    FeedbackContext {
        round,
        hints: group.iter().map(|d| d.correction_hint.clone()).collect(),
        rules: rules.into_iter().collect(),
    }
}

/// Failing rules get a fresh open entry; passing rules resolve theirs.
fn sync_rule_ledger(state: &mut ScenarioState, results: &[RuleResult]) {
    for result in results {
        let id = format!("rule_violation:{}", result.rule);
        if result.passed {
            state.resolve_ledger_entry(&id);
            continue;
        }
        state.remove_ledger_entry(&id);
        let mut entry = LedgerEntry::new(id, LedgerKind::RuleViolation, result.severity, result.message.clone());
        entry.blocking = result.severity.is_blocking();
        entry.pillar = Some(result.pillar.clone());
        state.upsert_ledger_entry(entry);
    }
}
