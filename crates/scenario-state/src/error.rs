//! Error types for scenario-state

use thiserror::Error;

/// Structural violations of the scenario document.
///
/// A document that produces any of these is rejected before it can be
/// committed or persisted; the caller's previous state is left untouched.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    /// Root value is not a JSON object
    #[error("scenario document must be a JSON object")]
    NotAnObject,

    /// A required top-level section is absent
    #[error("missing required section: {0}")]
    MissingSection(String),

    /// A top-level key outside the fixed section set
    #[error("unknown top-level section: {0}")]
    UnknownSection(String),

    /// A section failed to deserialize into its typed form
    #[error("malformed scenario document: {0}")]
    Malformed(String),

    /// Two graph nodes share an id
    #[error("duplicate graph node id: {0}")]
    DuplicateNode(String),

    /// A graph node with an empty id
    #[error("graph node id must not be empty")]
    EmptyNodeId,

    /// Confidence or quality score outside `[0, 1]`
    #[error("value {value} out of range [0, 1] at {path}")]
    OutOfRange { path: String, value: f64 },

    /// `recommended_option_id` does not name one of the decision's options
    #[error("decision {decision} recommends unknown option {option}")]
    UnknownRecommendation { decision: String, option: String },

    /// Option ids must be unique within a decision
    #[error("decision {decision} lists option {option} more than once")]
    DuplicateOption { decision: String, option: String },

    /// Parsing a decision slot name failed
    #[error("unknown decision slot: {0}")]
    UnknownDecision(String),
}

/// Result type for schema operations
pub type SchemaResult<T> = std::result::Result<T, SchemaError>;

/// Errors from checkpoint and run storage backends
#[derive(Error, Debug)]
pub enum StorageError {
    /// No run record under this id
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// The run never committed a checkpoint
    #[error("no checkpoint recorded for run {run_id}")]
    CheckpointNotFound { run_id: String },

    /// The state failed validation and was not persisted
    #[error("state rejected before persistence: {0}")]
    Rejected(#[from] SchemaError),

    /// Filesystem failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend-specific failure (poisoned lock, unreachable service, ...)
    #[error("storage backend error: {0}")]
    Backend(String),
}
