//! Linear executor: the fixed step order, one step at a time.
//!
//! Used for single-decision edits. Steps outside the impacted set are
//! recorded as skipped. Every executed step is merged and checkpointed
//! before the next one starts, so the checkpoint index is always the
//! position of the next step to run.

use tracing::{debug, instrument};

use crate::catalog::ClusterDef;
use crate::feedback::cross_check;
use crate::impact::ImpactResolver;
use crate::pipeline::{run_cluster, ClusterTask, ExecResult, Halt, RunContext, FINALIZATION};

#[instrument(skip(ctx), fields(run_id = %ctx.record.run_id))]
pub(crate) async fn run_linear(ctx: &mut RunContext, start_index: usize) -> ExecResult {
    let catalog = ctx.services.catalog.clone();
    let order = catalog.linear_order();
    let impact = ImpactResolver::new(&catalog).resolve(ctx.record.changed_decision);

    // Everything already in the document is eligible for feedback reruns.
    ctx.executed_clusters
        .extend(catalog.clusters.iter().map(|c| c.name.clone()));

    for (position, step) in order.iter().enumerate().skip(start_index) {
        if !impact.includes(step) {
            debug!(step = %step, "not impacted; skipping");
            ctx.skip(step);
            ctx.record.checkpoint_index = position + 1;
            continue;
        }

        let cluster = catalog
            .cluster_of(step)
            .cloned()
            .unwrap_or_else(|| ClusterDef::new(FINALIZATION, &[step.as_str()]));
        let prior = cluster
            .steps
            .iter()
            .filter_map(|s| ctx.step_outputs.get(s).map(|o| (s.clone(), o.clone())))
            .collect();
        let task = ClusterTask {
            steps: vec![step.clone()],
            cluster,
            prior,
            feedback: None,
        };

        let run = match run_cluster(ctx.task_shared(), task).await {
            Ok(run) => run,
            Err(failed) => return Err(Halt::Failed(ctx.failure(failed))),
        };
        ctx.absorb(vec![run], true)?;
        ctx.checkpoint(position + 1, step).await?;
    }

    cross_check(ctx).await
}
