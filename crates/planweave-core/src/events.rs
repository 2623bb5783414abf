//! Ordered run events for a real-time notification layer.
//!
//! Every event goes through an [`EventEmitter`], which stamps a per-run
//! sequence number before handing it to an [`EventSink`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;

/// Classification of an event in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        mode: String,
        changed_decision: Option<String>,
        resumed_from_run_id: Option<String>,
        start_index: usize,
    },

    AgentStarted {
        step: String,
        cluster: Option<String>,
    },

    AgentCompleted {
        step: String,
        cluster: Option<String>,
        duration_ms: u64,
        patches: usize,
    },

    /// Step outside the impacted set.
    AgentSkipped { step: String },

    ClusterPhaseStarted { phase: usize, clusters: Vec<String> },

    ClusterCompleted { phase: usize, cluster: String },

    CheckpointSaved { index: usize, label: String },

    /// Cross-pillar rules were evaluated.
    OrchestratorCompleted {
        passed: usize,
        failed: usize,
        directives: usize,
    },

    FeedbackRoundStarted { round: u32, clusters: Vec<String> },

    FeedbackRoundCompleted {
        round: u32,
        rerun_steps: Vec<String>,
        remaining_failures: usize,
    },

    PivotDecisionRequired {
        pillar: String,
        change_score: f64,
        downstream_pillars: Vec<String>,
    },

    RunBlocked { contradictions: Vec<String> },

    RunCompleted {
        completed_steps: usize,
        skipped_steps: usize,
    },

    RunFailed { error: String, checkpoint_index: usize },
}

impl RunEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::AgentStarted { .. } => "agent_started",
            Self::AgentCompleted { .. } => "agent_completed",
            Self::AgentSkipped { .. } => "agent_skipped",
            Self::ClusterPhaseStarted { .. } => "cluster_phase_started",
            Self::ClusterCompleted { .. } => "cluster_completed",
            Self::CheckpointSaved { .. } => "checkpoint_saved",
            Self::OrchestratorCompleted { .. } => "orchestrator_completed",
            Self::FeedbackRoundStarted { .. } => "feedback_round_started",
            Self::FeedbackRoundCompleted { .. } => "feedback_round_completed",
            Self::PivotDecisionRequired { .. } => "pivot_decision_required",
            Self::RunBlocked { .. } => "run_blocked",
            Self::RunCompleted { .. } => "run_completed",
            Self::RunFailed { .. } => "run_failed",
        }
    }
}

/// A sequenced event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub run_id: String,
    /// Monotonically increasing within the run.
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub event: RunEvent,
}

/// Consumer of run events. Must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, envelope: &EventEnvelope);
}

/// Writes each event as a structured log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, envelope: &EventEnvelope) {
        let payload = serde_json::to_string(&envelope.event).unwrap_or_default();
        info!(
            event = envelope.event.name(),
            run_id = %envelope.run_id,
            seq = envelope.seq,
            payload = %payload,
        );
    }
}

/// Forwards events to an unbounded tokio channel.
///
/// Sending never blocks; events are dropped once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<EventEnvelope>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EventEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, envelope: &EventEnvelope) {
        let _ = self.tx.send(envelope.clone());
    }
}

/// Keeps every event in memory. Used by tests and the CLI summary.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<EventEnvelope>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EventEnvelope> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.event.name()).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.names().into_iter().filter(|n| *n == name).count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, envelope: &EventEnvelope) {
        if let Ok(mut events) = self.events.lock() {
            events.push(envelope.clone());
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _envelope: &EventEnvelope) {}
}

/// Per-run event stamper. Clones share one sequence counter, so cluster
/// tasks can emit directly.
#[derive(Clone)]
pub struct EventEmitter {
    run_id: String,
    seq: Arc<AtomicU64>,
    sink: Arc<dyn EventSink>,
}

impl EventEmitter {
    pub fn new(run_id: impl Into<String>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            run_id: run_id.into(),
            seq: Arc::new(AtomicU64::new(0)),
            sink,
        }
    }

    pub fn emit(&self, event: RunEvent) {
        let envelope = EventEnvelope {
            run_id: self.run_id.clone(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            at: Utc::now(),
            event,
        };
        self.sink.emit(&envelope);
    }
}
