//! State store, dependency graph, quality gates, and the task execution coordinator.
//!
//! This crate implements the Orchestra engine: a transactional in-memory task
//! store, DAG validation and failure cascade, transport retry with backoff,
//! response validation and confidence scoring, the PROCEED/RETRY/CLARIFY/ESCALATE
//! decision machine, and the coordinator that drives tasks through all of them.

pub mod agent;
pub mod context;
pub mod coordinator;
pub mod decision;
pub mod events;
pub mod graph;
pub mod prompt;
pub mod registry;
pub mod retry;
pub mod scorer;
pub mod snapshot;
pub mod store;
pub mod validation;

pub use agent::{AgentExecutor, AgentResponse, AgentStatus, DryRunAgent, ProcessAgent};
pub use context::{DependencyOutput, TaskContext};
pub use coordinator::{
    ClarifyReport, EscalationReport, ExecutionCoordinator, ProjectReport, Stage, TaskOutcome,
};
pub use decision::{Decision, DecisionEngine, DecisionInput, DecisionState};
pub use events::{EventEmitter, OrchestraEvent};
pub use graph::DependencyGraph;
pub use prompt::{PromptBuilder, TemplatePromptBuilder};
pub use registry::{default_registry, ComponentRegistry};
pub use retry::{RetryPolicy, RetryState};
pub use scorer::{check_rule, HeuristicScorer, QualityScorer, SubScores};
pub use snapshot::{load_snapshot, open_store, save_snapshot, StoreSnapshot};
pub use store::{StateStore, Tables, Transaction};
pub use validation::{
    default_rules, Diagnostic, ResponseRule, Severity, ValidationPipeline, ValidationReport,
    DISAGREEMENT_CONFIDENCE,
};
