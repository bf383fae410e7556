//! Shared types, errors, data model, and configuration for the Orchestra task engine.
//!
//! This crate provides the foundational types used across all other Orchestra crates:
//! - `OrchestraError`: unified error taxonomy
//! - [`model`]: tasks, projects, sessions, interactions, and decision records
//! - [`config`]: engine configuration and the `ConfigSource` trait

pub mod config;
pub mod model;

pub use config::{
    ComponentConfig, ConfigSource, DecisionThresholds, DefaultConfig, EngineConfig,
    ExecutionConfig, FileConfig, GraphConfig, RetryConfig, ScoreWeights,
};
pub use model::{
    DecisionAction, DecisionRecord, Interaction, NewTask, Project, Session, Task, TaskStatus,
    TokenUsage,
};

// ---------------------------------------------------------------------------
// DependencyError
// ---------------------------------------------------------------------------

/// Errors raised when a dependency edit would break the task DAG.
///
/// These are always raised before anything is written.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DependencyError {
    #[error("Dependency cycle detected: {}", .cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },

    #[error("Task '{task}' has dependency depth {depth}, exceeding the maximum of {max}")]
    DepthExceeded {
        task: String,
        depth: usize,
        max: usize,
    },

    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("Task '{task}' already exists")]
    DuplicateTask { task: String },
}

// ---------------------------------------------------------------------------
// OrchestraError
// ---------------------------------------------------------------------------

/// Unified error type for all Orchestra subsystems.
#[derive(Debug, thiserror::Error)]
pub enum OrchestraError {
    // === Graph Errors ===
    #[error(transparent)]
    Dependency(#[from] DependencyError),

    // === State Store Errors ===
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Transaction conflict on task '{task}': expected version {expected}, found {found}")]
    TransactionConflict {
        task: String,
        expected: u64,
        found: u64,
    },

    #[error("Task '{task}' is {status}, expected {expected}")]
    InvalidState {
        task: String,
        status: TaskStatus,
        expected: String,
    },

    #[error("Invalid status transition for task '{task}': {from} -> {to}")]
    InvalidTransition {
        task: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    // === Agent Errors ===
    #[error("Transient agent error: {message}")]
    TransientAgent { message: String },

    #[error("Fatal agent error: {message}")]
    FatalAgent { message: String },

    #[error("Agent call timed out after {timeout_ms}ms")]
    AgentTimeout { timeout_ms: u64 },

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Authentication failed: {message}")]
    AuthError { message: String },

    // === Configuration / Input ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Coarse classification of an error, used by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Timeout,
    Transient,
    RateLimit,
    Auth,
    Validation,
    Config,
    Fatal,
    Internal,
}

impl ErrorClass {
    /// Timeouts, transient service failures, and rate limits may succeed on retry.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorClass::Timeout | ErrorClass::Transient | ErrorClass::RateLimit
        )
    }
}

impl OrchestraError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        OrchestraError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn classify(&self) -> ErrorClass {
        match self {
            OrchestraError::AgentTimeout { .. } => ErrorClass::Timeout,
            OrchestraError::TransientAgent { .. } => ErrorClass::Transient,
            OrchestraError::RateLimited { .. } => ErrorClass::RateLimit,
            OrchestraError::AuthError { .. } => ErrorClass::Auth,
            OrchestraError::Validation(_) | OrchestraError::Dependency(_) => {
                ErrorClass::Validation
            }
            OrchestraError::Config(_) => ErrorClass::Config,
            OrchestraError::FatalAgent { .. } => ErrorClass::Fatal,
            OrchestraError::Io(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                ErrorClass::Timeout
            }
            _ => ErrorClass::Internal,
        }
    }

    /// Returns `true` if the error is transient and the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        self.classify().is_retryable()
    }

    /// Returns `true` if the error is permanent and retrying will not help.
    pub fn is_terminal(&self) -> bool {
        !self.is_retryable()
    }

    /// Returns `true` for failures raised by the agent executor itself, as opposed
    /// to state-store or configuration problems in the engine.
    pub fn is_agent_error(&self) -> bool {
        matches!(
            self,
            OrchestraError::TransientAgent { .. }
                | OrchestraError::FatalAgent { .. }
                | OrchestraError::AgentTimeout { .. }
                | OrchestraError::RateLimited { .. }
                | OrchestraError::AuthError { .. }
        )
    }
}

/// A convenience alias for `Result<T, OrchestraError>`.
pub type Result<T> = std::result::Result<T, OrchestraError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_cycle() {
        let err = OrchestraError::from(DependencyError::Cycle {
            cycle: vec!["a".into(), "b".into(), "c".into(), "a".into()],
        });
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> c -> a");
    }

    #[test]
    fn error_display_depth_exceeded() {
        let err = DependencyError::DepthExceeded {
            task: "deploy".into(),
            depth: 11,
            max: 10,
        };
        assert_eq!(
            err.to_string(),
            "Task 'deploy' has dependency depth 11, exceeding the maximum of 10"
        );
    }

    #[test]
    fn error_display_unknown_dependency() {
        let err = DependencyError::UnknownDependency {
            task: "b".into(),
            dependency: "ghost".into(),
        };
        assert_eq!(err.to_string(), "Task 'b' depends on unknown task 'ghost'");
    }

    #[test]
    fn error_display_not_found() {
        let err = OrchestraError::not_found("Task", "t-1");
        assert_eq!(err.to_string(), "Task 't-1' not found");
    }

    #[test]
    fn error_display_invalid_state() {
        let err = OrchestraError::InvalidState {
            task: "t-1".into(),
            status: TaskStatus::Completed,
            expected: "clarify_pending".into(),
        };
        assert_eq!(err.to_string(), "Task 't-1' is completed, expected clarify_pending");
    }

    #[test]
    fn error_display_invalid_transition() {
        let err = OrchestraError::InvalidTransition {
            task: "t-1".into(),
            from: TaskStatus::Failed,
            to: TaskStatus::InProgress,
        };
        assert_eq!(
            err.to_string(),
            "Invalid status transition for task 't-1': failed -> in_progress"
        );
    }

    // --- classification ---

    #[test]
    fn retryable_classes() {
        assert!(OrchestraError::AgentTimeout { timeout_ms: 10 }.is_retryable());
        assert!(OrchestraError::TransientAgent {
            message: "503".into()
        }
        .is_retryable());
        assert!(OrchestraError::RateLimited { retry_after_ms: 0 }.is_retryable());
    }

    #[test]
    fn terminal_classes() {
        assert!(OrchestraError::AuthError {
            message: "bad key".into()
        }
        .is_terminal());
        assert!(OrchestraError::Validation("bad".into()).is_terminal());
        assert!(OrchestraError::Config("missing".into()).is_terminal());
        assert!(OrchestraError::FatalAgent {
            message: "crashed".into()
        }
        .is_terminal());
        assert!(OrchestraError::not_found("Task", "x").is_terminal());
    }

    #[test]
    fn io_timeout_is_classified_as_timeout() {
        let err: OrchestraError =
            std::io::Error::new(std::io::ErrorKind::TimedOut, "slow pipe").into();
        assert_eq!(err.classify(), ErrorClass::Timeout);
        assert!(err.is_retryable());
    }

    #[test]
    fn agent_error_detection() {
        assert!(OrchestraError::FatalAgent {
            message: "x".into()
        }
        .is_agent_error());
        assert!(!OrchestraError::not_found("Task", "x").is_agent_error());
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: OrchestraError = json_err.into();
        assert!(matches!(err, OrchestraError::Json(_)));
    }
}
