//! Persistent data model: tasks, projects, sessions, interactions, and decisions.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known keys stored in [`Task::metadata`].
pub mod meta_keys {
    /// Id of the failed task that caused this task to be blocked.
    pub const BLOCKED_BY: &str = "blocked_by";
    /// Accepted agent output, recorded when the task completes.
    pub const OUTPUT: &str = "output";
    /// Why the task was failed by escalation.
    pub const FAILURE_REASON: &str = "failure_reason";
    pub const CLARIFY_REASON: &str = "clarify_reason";
    pub const CLARIFY_SCORE: &str = "clarify_score";
    pub const CLARIFY_CONFIDENCE: &str = "clarify_confidence";
    /// RFC 3339 timestamp of when the task entered `clarify_pending`.
    pub const CLARIFY_SINCE: &str = "clarify_since";
    pub const HUMAN_INPUT: &str = "human_input";
    pub const LAST_SHORTFALL: &str = "last_shortfall";
    /// Quality rules handed to the scorer (array of strings).
    pub const RULES: &str = "rules";
    /// Expected response format, e.g. `"json"`.
    pub const EXPECTED_FORMAT: &str = "expected_format";
    /// Section headings the response must contain (array of strings).
    pub const REQUIRED_SECTIONS: &str = "required_sections";
}

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    InProgress,
    Blocked,
    ClarifyPending,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Pending or ready: the task has not been picked up by a worker yet.
    pub fn is_claimable(self) -> bool {
        matches!(self, Self::Pending | Self::Ready)
    }

    /// Whether the status lattice permits moving from `self` to `next`.
    ///
    /// `Pending <-> Ready` is a readiness recomputation and is allowed in both
    /// directions; every other edge follows the execution lattice.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Cancelled) | (_, Blocked) => self != next,
            (Pending, Ready) | (Ready, Pending) => true,
            (Pending | Ready, InProgress) => true,
            (InProgress, Completed | Failed | ClarifyPending) => true,
            (ClarifyPending, InProgress) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::ClarifyPending => "clarify_pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    /// Ids of the tasks this one depends on. Stored as a list, treated as a set.
    pub depends_on: Vec<String>,
    /// Longest dependency chain from a root task; cached at graph-build time.
    pub dependency_depth: usize,
    pub retry_count: u32,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Row version, bumped on every committed update.
    #[serde(default)]
    pub version: u64,
}

impl Task {
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    fn meta_string_list(&self, key: &str) -> Vec<String> {
        self.metadata
            .get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Quality rules handed to the scorer.
    pub fn rules(&self) -> Vec<String> {
        self.meta_string_list(meta_keys::RULES)
    }

    pub fn required_sections(&self) -> Vec<String> {
        self.meta_string_list(meta_keys::REQUIRED_SECTIONS)
    }

    pub fn expected_format(&self) -> Option<&str> {
        self.meta_str(meta_keys::EXPECTED_FORMAT)
    }

    pub fn output(&self) -> Option<&str> {
        self.meta_str(meta_keys::OUTPUT)
    }
}

/// Caller-supplied fields for a task about to be created.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    /// Explicit id; a UUID is generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl NewTask {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

// ---------------------------------------------------------------------------
// Project / Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub goal: String,
    /// Task ids in creation order.
    #[serde(default)]
    pub task_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            goal: String::new(),
            task_ids: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = goal.into();
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub project_id: String,
    pub usage: TokenUsage,
    pub agent_calls: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn start(project_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            usage: TokenUsage::default(),
            agent_calls: 0,
            started_at: Utc::now(),
            ended_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Interaction / DecisionRecord (append-only ledgers)
// ---------------------------------------------------------------------------

/// One agent attempt within a task pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub id: String,
    pub task_id: String,
    pub session_id: Option<String>,
    pub attempt: u32,
    pub prompt: String,
    pub response: String,
    pub timestamp: DateTime<Utc>,
}

impl Interaction {
    pub fn new(
        task_id: impl Into<String>,
        session_id: Option<String>,
        attempt: u32,
        prompt: impl Into<String>,
        response: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            session_id,
            attempt,
            prompt: prompt.into(),
            response: response.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Proceed,
    Retry,
    Clarify,
    Escalate,
}

impl fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Proceed => "proceed",
            Self::Retry => "retry",
            Self::Clarify => "clarify",
            Self::Escalate => "escalate",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: String,
    pub task_id: String,
    pub composite_score: f64,
    pub confidence: f64,
    pub action: DecisionAction,
    pub rationale: String,
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
}

impl DecisionRecord {
    pub fn new(
        task_id: impl Into<String>,
        composite_score: f64,
        confidence: f64,
        action: DecisionAction,
        rationale: impl Into<String>,
        retry_count: u32,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            composite_score,
            confidence,
            action,
            rationale: rationale.into(),
            retry_count,
            timestamp: Utc::now(),
        }
    }
}
