//! PlanWeave Core Library
//!
//! Orchestrates content-generation steps over a versioned scenario
//! document: impact resolution, linear and phased execution, the rule and
//! feedback loop, convergence and pivot detection, and the run lifecycle
//! with checkpoint and resume.

pub mod arbiter;
pub mod catalog;
pub mod config;
pub mod convergence;
pub mod decisions;
pub mod error;
pub mod events;
mod feedback;
pub mod impact;
pub mod lifecycle;
mod linear;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
mod phased;
pub mod pipeline;
pub mod reference;
pub mod rules;
pub mod step;
pub mod telemetry;
pub mod validation;

pub use arbiter::{Arbiter, FailingArbiter, FeedbackDirective, HeuristicArbiter};
pub use catalog::{ClusterDef, PillarDef, PipelineCatalog};
pub use config::OrchestratorConfig;
pub use convergence::{
    ConvergenceDetector, ConvergenceReport, ConvergenceVerdict, PillarChange, PivotDecision,
};
pub use error::{ArbiterError, OrchestratorError, OrchestratorResult, StepError};
pub use events::{
    ChannelSink, EventEmitter, EventEnvelope, EventSink, NullSink, RecordingSink, RunEvent,
    TracingSink,
};
pub use impact::{ImpactResolver, ImpactSet};
pub use lifecycle::{RunOutcome, RunReport};
pub use orchestrator::{Orchestrator, SelectionReport};
pub use pipeline::{FaultInjection, PipelineFailure};
pub use reference::{reference_registry, reference_scenario, GraphBuilderStep, ReferenceStep};
pub use rules::{BusinessPattern, CrossCheck, RuleResult, RuleSet, ScenarioProfile};
pub use step::{FeedbackContext, Step, StepRegistry, StepRequest};
pub use validation::{Contradiction, LedgerValidator, ValidationReport, Validator};
