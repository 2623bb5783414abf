//! Global atomic counters for PlanWeave.
//!
//! Counters are incremented at the call site. [`Metrics::flush`] emits the
//! current values as a single `tracing::info!` event at the end of a run.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters, no allocation or locking.
pub struct Metrics {
    steps_invoked: AtomicU64,
    patches_applied: AtomicU64,
    patches_rejected: AtomicU64,
    ownership_violations: AtomicU64,
    feedback_rounds: AtomicU64,
    checkpoints_written: AtomicU64,
    pivots_detected: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            steps_invoked: AtomicU64::new(0),
            patches_applied: AtomicU64::new(0),
            patches_rejected: AtomicU64::new(0),
            ownership_violations: AtomicU64::new(0),
            feedback_rounds: AtomicU64::new(0),
            checkpoints_written: AtomicU64::new(0),
            pivots_detected: AtomicU64::new(0),
        }
    }

    pub fn inc_steps_invoked(&self) {
        self.steps_invoked.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "steps_invoked", "counter incremented");
    }

    /// Record the outcome counts of one merge pass.
    pub fn add_merge(&self, applied: usize, rejected: usize, ownership_violations: usize) {
        self.patches_applied.fetch_add(applied as u64, Ordering::Relaxed);
        self.patches_rejected.fetch_add(rejected as u64, Ordering::Relaxed);
        self.ownership_violations
            .fetch_add(ownership_violations as u64, Ordering::Relaxed);
    }

    pub fn inc_feedback_rounds(&self) {
        self.feedback_rounds.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "feedback_rounds", "counter incremented");
    }

    pub fn inc_checkpoints(&self) {
        self.checkpoints_written.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "checkpoints_written", "counter incremented");
    }

    pub fn inc_pivots(&self) {
        self.pivots_detected.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "pivots_detected", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            steps_invoked = self.steps_invoked(),
            patches_applied = self.patches_applied(),
            patches_rejected = self.patches_rejected(),
            ownership_violations = self.ownership_violations(),
            feedback_rounds = self.feedback_rounds(),
            checkpoints_written = self.checkpoints_written(),
            pivots_detected = self.pivots_detected(),
        );
    }

    pub fn steps_invoked(&self) -> u64 {
        self.steps_invoked.load(Ordering::Relaxed)
    }

    pub fn patches_applied(&self) -> u64 {
        self.patches_applied.load(Ordering::Relaxed)
    }

    pub fn patches_rejected(&self) -> u64 {
        self.patches_rejected.load(Ordering::Relaxed)
    }

    pub fn ownership_violations(&self) -> u64 {
        self.ownership_violations.load(Ordering::Relaxed)
    }

    pub fn feedback_rounds(&self) -> u64 {
        self.feedback_rounds.load(Ordering::Relaxed)
    }

    pub fn checkpoints_written(&self) -> u64 {
        self.checkpoints_written.load(Ordering::Relaxed)
    }

    pub fn pivots_detected(&self) -> u64 {
        self.pivots_detected.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.steps_invoked.store(0, Ordering::Relaxed);
        self.patches_applied.store(0, Ordering::Relaxed);
        self.patches_rejected.store(0, Ordering::Relaxed);
        self.ownership_violations.store(0, Ordering::Relaxed);
        self.feedback_rounds.store(0, Ordering::Relaxed);
        self.checkpoints_written.store(0, Ordering::Relaxed);
        self.pivots_detected.store(0, Ordering::Relaxed);
    }
}
