//! Engine event system for observability.
//!
//! Emits [`OrchestraEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! external observers (loggers, metrics collectors, UI, etc.) can follow store
//! changes and task progress without coupling to the engine internals. Nothing
//! in the engine depends on an event being delivered.

use serde::{Deserialize, Serialize};

use orchestra_types::{DecisionAction, TaskStatus};

/// Events emitted by the state store and the execution coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OrchestraEvent {
    // --- store changes (emitted after commit) ---
    ProjectCreated {
        project_id: String,
    },
    TaskCreated {
        task_id: String,
        project_id: String,
    },
    TaskUpdated {
        task_id: String,
        status: TaskStatus,
    },
    SessionStarted {
        session_id: String,
        project_id: String,
    },
    SessionEnded {
        session_id: String,
        total_tokens: u64,
    },

    // --- execution progress ---
    ProjectStarted {
        project_id: String,
        task_count: usize,
    },
    ProjectFinished {
        project_id: String,
        completed: usize,
        failed: usize,
        blocked: usize,
        duration_ms: u64,
    },
    TaskClaimed {
        task_id: String,
    },
    StageStarted {
        task_id: String,
        stage: String,
    },
    AgentRetrying {
        task_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    DecisionMade {
        task_id: String,
        action: DecisionAction,
        composite_score: f64,
        confidence: f64,
    },
    ClarificationRequested {
        task_id: String,
        reason: String,
    },
    TaskEscalated {
        task_id: String,
        blocked: Vec<String>,
    },
    TaskCancelled {
        task_id: String,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<OrchestraEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: OrchestraEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<OrchestraEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
