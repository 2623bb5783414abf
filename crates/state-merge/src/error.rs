//! Error types for state-merge

use scenario_state::SchemaError;
use thiserror::Error;

/// Failures resolving or writing a structural pointer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PointerError {
    /// Pointer is empty or does not start with `/`
    #[error("invalid pointer: {0:?}")]
    Invalid(String),

    /// Nothing at the path to remove or traverse
    #[error("no value at {0}")]
    MissingTarget(String),

    /// A scalar sits where a container is needed
    #[error("cannot descend into non-container at {0}")]
    NotAContainer(String),

    /// Array index is not a number, or past the end
    #[error("bad array index {index:?} at {path}")]
    BadIndex { path: String, index: String },
}

pub type PointerResult<T> = std::result::Result<T, PointerError>;

/// Fatal merge failures. Anything recoverable becomes a `MergeWarning`.
#[derive(Error, Debug)]
pub enum MergeError {
    /// A step returned an output that breaks the contract
    #[error("invalid output from {step}: {reason}")]
    InvalidOutput { step: String, reason: String },

    /// The merged document failed its commit check
    #[error("merged state failed validation: {0}")]
    Schema(#[from] SchemaError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type MergeResult<T> = std::result::Result<T, MergeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pointer_error_display() {
        let err = PointerError::BadIndex {
            path: "/graph/edges".to_string(),
            index: "x".to_string(),
        };
        assert!(err.to_string().contains("/graph/edges"));
    }

    #[test]
    fn test_merge_error_from_schema() {
        let err: MergeError = SchemaError::DuplicateNode("n1".to_string()).into();
        assert!(matches!(err, MergeError::Schema(_)));
    }
}
