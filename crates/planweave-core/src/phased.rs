//! Phased cluster executor for full builds.
//!
//! Clusters within a phase run concurrently under the concurrency bound; the
//! phase commits only after every cluster in it succeeded. The checkpoint
//! index counts committed phases, and finalization is one more phase.

use tracing::{info, instrument};

use crate::catalog::ClusterDef;
use crate::events::RunEvent;
use crate::feedback::cross_check;
use crate::pipeline::{run_cluster, spawn_clusters, ClusterTask, ExecResult, Halt, RunContext, FINALIZATION};

#[instrument(skip(ctx), fields(run_id = %ctx.record.run_id))]
pub(crate) async fn run_phased(ctx: &mut RunContext, start_phase: usize) -> ExecResult {
    let catalog = ctx.services.catalog.clone();

    for phase in catalog.phases.iter().take(start_phase) {
        ctx.executed_clusters.extend(phase.iter().cloned());
    }

    for (index, phase) in catalog.phases.iter().enumerate().skip(start_phase) {
        ctx.phase = Some(index);
        info!(phase = index, clusters = ?phase, "phase started");
        ctx.emitter.emit(RunEvent::ClusterPhaseStarted {
            phase: index,
            clusters: phase.clone(),
        });

        let tasks: Vec<ClusterTask> = phase
            .iter()
            .filter_map(|name| catalog.cluster(name).cloned())
            .map(ClusterTask::full)
            .collect();
        let shared = ctx.task_shared();
        let results = spawn_clusters(&shared, tasks, ctx.services.config.max_concurrency).await;

        // Nothing from a failed phase is merged.
        let mut runs = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(run) => runs.push(run),
                Err(failed) => return Err(Halt::Failed(ctx.failure(failed))),
            }
        }

        runs.sort_by(|a, b| a.cluster.cmp(&b.cluster));
        let finished: Vec<String> = runs.iter().map(|r| r.cluster.clone()).collect();
        let steps: Vec<String> = runs
            .iter()
            .flat_map(|r| r.steps.iter().map(|s| s.step.clone()))
            .collect();
        ctx.absorb(runs, false)?;
        for cluster in &finished {
            ctx.emitter.emit(RunEvent::ClusterCompleted {
                phase: index,
                cluster: cluster.clone(),
            });
            ctx.executed_clusters.insert(cluster.clone());
        }

        // The phase counts as progress only once its feedback settled.
        cross_check(ctx).await?;
        ctx.record.completed_steps.extend(steps);
        ctx.record.completed_clusters.extend(finished);
        ctx.checkpoint(index + 1, &format!("phase:{index}")).await?;
    }

    let phases = catalog.phases.len();
    if start_phase <= phases && !catalog.finalization.is_empty() {
        ctx.phase = Some(phases);
        let steps: Vec<&str> = catalog.finalization.iter().map(String::as_str).collect();
        let task = ClusterTask::full(ClusterDef::new(FINALIZATION, &steps));
        let run = match run_cluster(ctx.task_shared(), task).await {
            Ok(run) => run,
            Err(failed) => return Err(Halt::Failed(ctx.failure(failed))),
        };
        ctx.absorb(vec![run], true)?;
        ctx.checkpoint(phases + 1, "finalize").await?;
    }

    Ok(())
}
