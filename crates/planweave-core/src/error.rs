//! Error types for planweave-core.

use scenario_state::{RunStatus, SchemaError, StorageError};
use state_merge::MergeError;
use thiserror::Error;

/// Failure of a single step invocation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StepError {
    /// The step ran and reported a failure
    #[error("step {step} failed: {reason}")]
    Failed { step: String, reason: String },

    /// Fault injection fired before the step ran
    #[error("simulated failure at step {step}")]
    Injected { step: String },

    /// The step's output broke the `AgentOutput` contract
    #[error("step {step} returned invalid output: {reason}")]
    InvalidOutput { step: String, reason: String },

    /// No implementation registered for the step id
    #[error("no step registered under {0}")]
    NotRegistered(String),

    /// The task running the step panicked or was cancelled
    #[error("task for {step} aborted: {reason}")]
    Aborted { step: String, reason: String },
}

impl StepError {
    pub fn failed(step: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Failed {
            step: step.into(),
            reason: reason.into(),
        }
    }
}

/// Failure of the external arbitration call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ArbiterError {
    #[error("arbiter unavailable: {0}")]
    Unavailable(String),

    #[error("arbiter returned an unusable answer: {0}")]
    Malformed(String),
}

/// Errors surfaced by the orchestrator API.
///
/// Step and phase faults are not errors: they end the run with a `failed`
/// outcome. These cover misconfiguration and infrastructure failures.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Static pipeline tables are inconsistent
    #[error("invalid pipeline catalog: {0}")]
    Catalog(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("decision {decision} has no option {option}")]
    UnknownOption { decision: String, option: String },

    #[error("only failed runs can be resumed; run {run_id} is {status:?}")]
    NotResumable { run_id: String, status: RunStatus },

    #[error(transparent)]
    Step(#[from] StepError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience result alias.
pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_error_names_the_step() {
        let err = StepError::Injected {
            step: "pricing_analyst".to_string(),
        };
        assert!(err.to_string().contains("pricing_analyst"));
    }

    #[test]
    fn test_storage_error_is_transparent() {
        let err: OrchestratorError = StorageError::RunNotFound {
            run_id: "r1".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "run not found: r1");
    }
}
