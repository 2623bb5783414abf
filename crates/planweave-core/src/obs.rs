//! Structured lifecycle log lines for runs.
//!
//! - `run_span` scopes every log line of a run to its `run_id`
//! - `emit_*` functions write one `info!`/`warn!` event per lifecycle point

use tracing::{info, warn};

/// Span carrying the run id. Attach it to the run future with
/// `tracing::Instrument` so it stays entered across awaits.
///
/// ```ignore
/// execute(ctx).instrument(run_span(run_id.as_str())).await
/// ```
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("planweave.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &str, scenario_id: &str, mode: &str, changed: Option<&str>) {
    info!(
        event = "run.started",
        run_id = %run_id,
        scenario_id = %scenario_id,
        mode = %mode,
        changed_decision = changed.unwrap_or("-"),
    );
}

pub fn emit_run_finished(run_id: &str, status: &str, duration_ms: u64, completed: usize, skipped: usize) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        status = %status,
        duration_ms = duration_ms,
        completed_steps = completed,
        skipped_steps = skipped,
    );
}

pub fn emit_checkpoint_saved(run_id: &str, index: usize, label: &str) {
    info!(event = "run.checkpoint", run_id = %run_id, index = index, label = %label);
}

pub fn emit_merge_summary(run_id: &str, applied: usize, rejected: usize, warnings: usize) {
    info!(
        event = "merge.completed",
        run_id = %run_id,
        applied = applied,
        rejected = rejected,
        warnings = warnings,
    );
}

pub fn emit_rules_evaluated(run_id: &str, passed: usize, failed: usize) {
    info!(event = "rules.evaluated", run_id = %run_id, passed = passed, failed = failed);
}

pub fn emit_pivot_required(run_id: &str, pillar: &str, change_score: f64) {
    warn!(
        event = "run.pivot_required",
        run_id = %run_id,
        pillar = %pillar,
        change_score = change_score,
    );
}

pub fn emit_run_failed(run_id: &str, checkpoint_index: usize, error: &dyn std::fmt::Display) {
    warn!(
        event = "run.failed",
        run_id = %run_id,
        checkpoint_index = checkpoint_index,
        error = %error,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_create() {
        let _span = run_span("test-run-id").entered();
        emit_checkpoint_saved("test-run-id", 1, "step");
    }
}
