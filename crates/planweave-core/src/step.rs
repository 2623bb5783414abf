//! The step invocation contract.
//!
//! A step consumes a read-only view of the scenario and returns an
//! [`AgentOutput`]. Retries and external calls are the step's own business;
//! the orchestrator only sees the structured result.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use scenario_state::{DecisionKey, RunId, ScenarioState};
use serde::{Deserialize, Serialize};
use state_merge::AgentOutput;

use crate::error::StepError;

/// Correction request attached to a feedback rerun.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedbackContext {
    /// 1-based feedback round.
    pub round: u32,
    /// Correction hints addressed to this step's cluster.
    pub hints: Vec<String>,
    /// Ids of the rules that triggered the rerun.
    pub rules: Vec<String>,
}

impl FeedbackContext {
    pub fn mentions(&self, needle: &str) -> bool {
        self.hints.iter().any(|h| h.contains(needle)) || self.rules.iter().any(|r| r.contains(needle))
    }
}

#[derive(Debug, Clone)]
pub struct StepRequest {
    pub run_id: RunId,
    pub state: Arc<ScenarioState>,
    pub changed_decision: Option<DecisionKey>,
    /// Outputs of earlier steps in the same cluster, in cluster order.
    pub cluster_context: Vec<(String, AgentOutput)>,
    pub feedback: Option<FeedbackContext>,
}

impl StepRequest {
    pub fn new(run_id: RunId, state: Arc<ScenarioState>) -> Self {
        Self {
            run_id,
            state,
            changed_decision: None,
            cluster_context: Vec::new(),
            feedback: None,
        }
    }

    pub fn context_for(&self, step: &str) -> Option<&AgentOutput> {
        self.cluster_context
            .iter()
            .find(|(id, _)| id == step)
            .map(|(_, output)| output)
    }
}

#[async_trait]
pub trait Step: Send + Sync {
    fn id(&self) -> &str;

    async fn invoke(&self, request: StepRequest) -> Result<AgentOutput, StepError>;
}

/// Step implementations keyed by id.
#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn Step>>,
}

impl fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<&String> = self.steps.keys().collect();
        ids.sort();
        f.debug_struct("StepRegistry").field("steps", &ids).finish()
    }
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step under its own id, replacing any earlier entry.
    pub fn register(&mut self, step: Arc<dyn Step>) -> &mut Self {
        self.steps.insert(step.id().to_string(), step);
        self
    }

    pub fn with(mut self, step: Arc<dyn Step>) -> Self {
        self.register(step);
        self
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn Step>, StepError> {
        self.steps
            .get(id)
            .cloned()
            .ok_or_else(|| StepError::NotRegistered(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.steps.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Invoke `step` and enforce the output contract at the boundary.
pub async fn invoke_checked(step: &dyn Step, request: StepRequest) -> Result<AgentOutput, StepError> {
    let output = step.invoke(request).await?;
    output
        .validate(step.id())
        .map_err(|e| StepError::InvalidOutput {
            step: step.id().to_string(),
            reason: e.to_string(),
        })?;
    Ok(output)
}
