//! State-Merge: deterministic reconciliation of step outputs
//!
//! ## Layer 1 - Merge
//!
//! Synchronous and side-effect free: takes a scenario plus tagged step
//! outputs, returns the merged scenario and the warnings raised on the way.
//!
//! ## Key Components
//!
//! - `AgentOutput`: the contract every generation step returns
//! - `PatchTarget`: typed classification of a patch path
//! - `MergeEngine`: ownership, evidence and conflict rules

pub mod engine;
mod error;
pub mod evidence;
pub mod graph;
pub mod output;
pub mod pointer;

pub use engine::{MergeEngine, MergePolicy, MergeReport, MergeWarning, PatchOrigin, TaggedOutput};
pub use error::{MergeError, MergeResult, PointerError, PointerResult};
pub use evidence::normalize_url;
pub use graph::content_signature;
pub use output::{AgentOutput, Patch, PatchMeta, PatchOp, Proposal, Risk};
pub use pointer::PatchTarget;
