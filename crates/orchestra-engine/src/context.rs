//! Per-attempt view of a task handed to the prompt builder and the agent.

use orchestra_types::{Interaction, Project, Task};

/// Output of a completed dependency, carried into the dependent's prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct DependencyOutput {
    pub task_id: String,
    pub title: String,
    pub output: String,
}

/// Everything stage 1 gathers from the store for one pipeline attempt.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task: Task,
    pub project: Project,
    pub prior_interactions: Vec<Interaction>,
    pub dependency_outputs: Vec<DependencyOutput>,
    /// Quality shortfall of the previous attempt; empty on the first attempt.
    pub shortfall: Vec<String>,
    /// Answer supplied through `resume_clarification`, if any.
    pub human_input: Option<String>,
    /// 0 on the first attempt, then the task's retry count.
    pub attempt: u32,
    pub session_id: Option<String>,
}

impl TaskContext {
    pub fn new(task: Task, project: Project) -> Self {
        Self {
            attempt: task.retry_count,
            task,
            project,
            prior_interactions: Vec::new(),
            dependency_outputs: Vec::new(),
            shortfall: Vec::new(),
            human_input: None,
            session_id: None,
        }
    }

    pub fn is_retry(&self) -> bool {
        !self.shortfall.is_empty()
    }
}
