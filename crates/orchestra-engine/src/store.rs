//! Transactional, thread-safe state store for projects, tasks, sessions,
//! interactions, and decision records.
//!
//! All mutation goes through [`StateStore::transaction`]: the closure works on a
//! private copy of the project, task and session rows, and the copy replaces
//! the committed rows only if the closure returns `Ok`. The interaction and
//! decision ledgers are append-only, so they are never copied: appends are
//! buffered in the transaction and added to the committed ledgers on commit.
//! Any error (or panic) leaves the committed state untouched. A single mutex
//! serialises transactions, so read-modify-write sequences such as "compute
//! the ready set, then claim one task" must run inside one transaction.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use orchestra_types::model::meta_keys;
use orchestra_types::{
    DecisionRecord, DependencyError, GraphConfig, Interaction, NewTask, OrchestraError, Project,
    Result, Session, Task, TaskStatus, TokenUsage,
};

use crate::events::{EventEmitter, OrchestraEvent};
use crate::graph::DependencyGraph;

/// The raw tables owned by the store, as captured by [`StateStore::snapshot`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    pub projects: HashMap<String, Project>,
    pub tasks: HashMap<String, Task>,
    pub sessions: HashMap<String, Session>,
    /// Append-only.
    pub interactions: Vec<Interaction>,
    /// Append-only.
    pub decisions: Vec<DecisionRecord>,
}

/// Mutable rows; copied for every transaction.
#[derive(Debug, Clone, Default)]
struct Rows {
    projects: HashMap<String, Project>,
    tasks: HashMap<String, Task>,
    sessions: HashMap<String, Session>,
}

#[derive(Debug, Default)]
struct Ledgers {
    interactions: Vec<Interaction>,
    decisions: Vec<DecisionRecord>,
}

impl Ledgers {
    fn append(&mut self, other: Ledgers) {
        self.interactions.extend(other.interactions);
        self.decisions.extend(other.decisions);
    }
}

#[derive(Debug, Default)]
struct State {
    rows: Rows,
    ledgers: Ledgers,
}

impl State {
    fn from_tables(tables: Tables) -> Self {
        Self {
            rows: Rows {
                projects: tables.projects,
                tasks: tables.tasks,
                sessions: tables.sessions,
            },
            ledgers: Ledgers {
                interactions: tables.interactions,
                decisions: tables.decisions,
            },
        }
    }

    fn to_tables(&self) -> Tables {
        Tables {
            projects: self.rows.projects.clone(),
            tasks: self.rows.tasks.clone(),
            sessions: self.rows.sessions.clone(),
            interactions: self.ledgers.interactions.clone(),
            decisions: self.ledgers.decisions.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// Shared handle to the store. Cloning yields another handle to the **same** state.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<tokio::sync::Mutex<State>>,
    events: EventEmitter,
    graph_config: GraphConfig,
}

impl StateStore {
    pub fn new() -> Self {
        Self::from_tables(Tables::default())
    }

    pub fn from_tables(tables: Tables) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(State::from_tables(tables))),
            events: EventEmitter::default(),
            graph_config: GraphConfig::default(),
        }
    }

    pub fn with_graph_config(mut self, config: GraphConfig) -> Self {
        self.graph_config = config;
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn graph_config(&self) -> GraphConfig {
        self.graph_config
    }

    /// Run `f` atomically. Writes commit together when `f` returns `Ok`;
    /// otherwise none of them do. Change events are emitted after commit.
    pub async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        let mut working = state.rows.clone();
        let mut tx = Transaction {
            rows: &mut working,
            ledgers: &state.ledgers,
            appended: Ledgers::default(),
            graph_config: self.graph_config,
            pending_events: Vec::new(),
        };

        match f(&mut tx) {
            Ok(value) => {
                let Transaction {
                    appended,
                    pending_events,
                    ..
                } = tx;
                state.rows = working;
                state.ledgers.append(appended);
                drop(guard);
                for event in pending_events {
                    self.events.emit(event);
                }
                Ok(value)
            }
            Err(e) => {
                tracing::debug!(error = %e, "Transaction rolled back");
                Err(e)
            }
        }
    }

    /// Run a read-only closure against the committed state under the lock.
    pub async fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        let view = Transaction {
            rows: &mut state.rows,
            ledgers: &state.ledgers,
            appended: Ledgers::default(),
            graph_config: self.graph_config,
            pending_events: Vec::new(),
        };
        f(&view)
    }

    /// Deep copy of the committed tables.
    pub async fn snapshot(&self) -> Tables {
        self.inner.lock().await.to_tables()
    }

    // --- reads ---

    pub async fn get_task(&self, id: &str) -> Result<Task> {
        self.inner
            .lock()
            .await
            .rows
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestraError::not_found("Task", id))
    }

    pub async fn get_project(&self, id: &str) -> Result<Project> {
        self.inner
            .lock()
            .await
            .rows
            .projects
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestraError::not_found("Project", id))
    }

    pub async fn get_session(&self, id: &str) -> Result<Session> {
        self.inner
            .lock()
            .await
            .rows
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestraError::not_found("Session", id))
    }

    pub async fn list_projects(&self) -> Vec<Project> {
        let mut projects: Vec<Project> =
            self.inner.lock().await.rows.projects.values().cloned().collect();
        projects.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        projects
    }

    /// Tasks of a project in creation order.
    pub async fn list_tasks(&self, project_id: &str) -> Result<Vec<Task>> {
        self.read(|tx| Ok(tx.tasks_for_project(project_id)?.into_iter().cloned().collect()))
            .await
    }

    pub async fn interactions_for(&self, task_id: &str) -> Vec<Interaction> {
        self.inner
            .lock()
            .await
            .ledgers
            .interactions
            .iter()
            .filter(|i| i.task_id == task_id)
            .cloned()
            .collect()
    }

    pub async fn decisions_for(&self, task_id: &str) -> Vec<DecisionRecord> {
        self.inner
            .lock()
            .await
            .ledgers
            .decisions
            .iter()
            .filter(|d| d.task_id == task_id)
            .cloned()
            .collect()
    }

    /// Build the dependency graph of a project from committed state.
    pub async fn graph(&self, project_id: &str) -> Result<DependencyGraph> {
        self.read(|tx| tx.graph(project_id)).await
    }

    // --- single-operation writes ---

    pub async fn create_project(&self, project: Project) -> Result<()> {
        self.transaction(|tx| tx.insert_project(project)).await
    }

    /// Create one task. Unknown dependencies and cycles fail before anything is written.
    pub async fn create_task(&self, project_id: &str, new: NewTask) -> Result<String> {
        let mut ids = self
            .transaction(|tx| tx.insert_tasks(project_id, vec![new]))
            .await?;
        Ok(ids.remove(0))
    }

    /// Create a batch of tasks all-or-nothing. Dependencies may reference other
    /// tasks in the same batch regardless of their position.
    pub async fn import_tasks(&self, project_id: &str, batch: Vec<NewTask>) -> Result<Vec<String>> {
        self.transaction(|tx| tx.insert_tasks(project_id, batch)).await
    }

    /// Replace a task's dependency set, re-validating the whole project graph.
    pub async fn set_dependencies(&self, task_id: &str, depends_on: Vec<String>) -> Result<()> {
        self.transaction(|tx| tx.set_dependencies(task_id, depends_on))
            .await
    }

    pub async fn add_dependency(&self, task_id: &str, dependency: &str) -> Result<()> {
        self.transaction(|tx| {
            let mut deps = tx.task(task_id)?.depends_on.clone();
            if !deps.iter().any(|d| d == dependency) {
                deps.push(dependency.to_string());
            }
            tx.set_dependencies(task_id, deps)
        })
        .await
    }

    pub async fn update_task(&self, task: Task) -> Result<()> {
        self.transaction(|tx| tx.update_task(task)).await
    }

    pub async fn start_session(&self, project_id: &str) -> Result<Session> {
        self.transaction(|tx| {
            tx.project(project_id)?;
            let session = Session::start(project_id);
            tx.insert_session(session.clone());
            Ok(session)
        })
        .await
    }

    pub async fn end_session(&self, session_id: &str) -> Result<Session> {
        self.transaction(|tx| tx.end_session(session_id)).await
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// Working view of the tables inside [`StateStore::transaction`].
pub struct Transaction<'a> {
    rows: &'a mut Rows,
    /// Committed ledgers; appends go to `appended` until commit.
    ledgers: &'a Ledgers,
    appended: Ledgers,
    graph_config: GraphConfig,
    pending_events: Vec<OrchestraEvent>,
}

impl Transaction<'_> {
    // --- reads ---

    pub fn task(&self, id: &str) -> Result<&Task> {
        self.rows
            .tasks
            .get(id)
            .ok_or_else(|| OrchestraError::not_found("Task", id))
    }

    fn task_mut(&mut self, id: &str) -> Result<&mut Task> {
        self.rows
            .tasks
            .get_mut(id)
            .ok_or_else(|| OrchestraError::not_found("Task", id))
    }

    pub fn project(&self, id: &str) -> Result<&Project> {
        self.rows
            .projects
            .get(id)
            .ok_or_else(|| OrchestraError::not_found("Project", id))
    }

    pub fn session(&self, id: &str) -> Result<&Session> {
        self.rows
            .sessions
            .get(id)
            .ok_or_else(|| OrchestraError::not_found("Session", id))
    }

    /// Tasks of a project in creation order.
    pub fn tasks_for_project(&self, project_id: &str) -> Result<Vec<&Task>> {
        let project = self.project(project_id)?;
        project.task_ids.iter().map(|id| self.task(id)).collect()
    }

    /// Committed interactions of a task followed by those appended in this
    /// transaction.
    pub fn interactions_for(&self, task_id: &str) -> Vec<&Interaction> {
        self.ledgers
            .interactions
            .iter()
            .chain(&self.appended.interactions)
            .filter(|i| i.task_id == task_id)
            .collect()
    }

    /// Dependency graph of a project as seen by this transaction.
    pub fn graph(&self, project_id: &str) -> Result<DependencyGraph> {
        let tasks = self.tasks_for_project(project_id)?.into_iter().cloned();
        Ok(DependencyGraph::build(tasks)?.with_max_depth(self.graph_config.max_dependency_depth))
    }

    // --- writes ---

    pub fn insert_project(&mut self, project: Project) -> Result<()> {
        if self.rows.projects.contains_key(&project.id) {
            return Err(OrchestraError::Validation(format!(
                "project '{}' already exists",
                project.id
            )));
        }
        self.pending_events.push(OrchestraEvent::ProjectCreated {
            project_id: project.id.clone(),
        });
        self.rows.projects.insert(project.id.clone(), project);
        Ok(())
    }

    /// Insert tasks into a project, then re-validate the project graph.
    pub fn insert_tasks(&mut self, project_id: &str, batch: Vec<NewTask>) -> Result<Vec<String>> {
        self.project(project_id)?;
        let now = Utc::now();
        let mut ids = Vec::with_capacity(batch.len());

        for new in batch {
            let id = new
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            if self.rows.tasks.contains_key(&id) {
                return Err(DependencyError::DuplicateTask { task: id }.into());
            }
            let task = Task {
                id: id.clone(),
                project_id: project_id.to_string(),
                title: new.title,
                description: new.description,
                status: TaskStatus::Pending,
                depends_on: new.depends_on,
                dependency_depth: 0,
                retry_count: 0,
                metadata: new.metadata,
                created_at: now,
                updated_at: now,
                version: 0,
            };
            self.rows.tasks.insert(id.clone(), task);
            if let Some(project) = self.rows.projects.get_mut(project_id) {
                project.task_ids.push(id.clone());
            }
            self.pending_events.push(OrchestraEvent::TaskCreated {
                task_id: id.clone(),
                project_id: project_id.to_string(),
            });
            ids.push(id);
        }

        self.refresh_structure(project_id)?;
        tracing::debug!(project = %project_id, count = ids.len(), "Inserted tasks");
        Ok(ids)
    }

    /// Replace the dependency set of an unstarted task.
    pub fn set_dependencies(&mut self, task_id: &str, depends_on: Vec<String>) -> Result<()> {
        let task = self.task(task_id)?;
        if !task.status.is_claimable() {
            return Err(OrchestraError::InvalidState {
                task: task_id.to_string(),
                status: task.status,
                expected: "pending or ready".into(),
            });
        }
        let project_id = task.project_id.clone();
        let task = self.task_mut(task_id)?;
        task.depends_on = depends_on;
        task.updated_at = Utc::now();
        task.version += 1;
        self.refresh_structure(&project_id)
    }

    /// Re-validate the project graph after a structural edit, refresh cached
    /// depths, and recompute pending/ready for unstarted tasks.
    fn refresh_structure(&mut self, project_id: &str) -> Result<()> {
        let graph = self.graph(project_id)?;
        let depths = graph.depths()?;

        let ready: std::collections::HashSet<String> =
            graph.ready_set().iter().map(|t| t.id.clone()).collect();
        for task in graph.tasks() {
            let depth = depths.get(&task.id).copied().unwrap_or(0);
            let row = self.task_mut(&task.id)?;
            row.dependency_depth = depth;
            if row.status.is_claimable() {
                row.status = if ready.contains(&row.id) {
                    TaskStatus::Ready
                } else {
                    TaskStatus::Pending
                };
            }
        }
        Ok(())
    }

    /// Write a whole task row. The row version must match the committed one.
    /// Terminal tasks accept metadata changes only.
    pub fn update_task(&mut self, task: Task) -> Result<()> {
        let current = self.task(&task.id)?;
        if current.version != task.version {
            return Err(OrchestraError::TransactionConflict {
                task: task.id.clone(),
                expected: task.version,
                found: current.version,
            });
        }
        if current.depends_on != task.depends_on || current.project_id != task.project_id {
            return Err(OrchestraError::Validation(format!(
                "task '{}': use set_dependencies to change the graph",
                task.id
            )));
        }
        if current.status.is_terminal()
            && (current.status != task.status
                || current.title != task.title
                || current.description != task.description
                || current.retry_count != task.retry_count)
        {
            return Err(OrchestraError::InvalidState {
                task: task.id.clone(),
                status: current.status,
                expected: "a non-terminal status (terminal tasks accept metadata only)".into(),
            });
        }
        if current.status != task.status && !current.status.can_transition_to(task.status) {
            return Err(OrchestraError::InvalidTransition {
                task: task.id.clone(),
                from: current.status,
                to: task.status,
            });
        }

        if task.status == TaskStatus::Blocked && current.status != TaskStatus::Blocked {
            return Err(block_refused(&task.id));
        }

        let status_changed = current.status != task.status;
        let mut task = task;
        task.version += 1;
        task.updated_at = Utc::now();
        if status_changed {
            self.pending_events.push(OrchestraEvent::TaskUpdated {
                task_id: task.id.clone(),
                status: task.status,
            });
        }
        self.rows.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    /// Move a task along the status lattice. `blocked` is reserved for the
    /// failure cascade and is refused here.
    pub fn set_status(&mut self, task_id: &str, status: TaskStatus) -> Result<()> {
        if status == TaskStatus::Blocked && self.task(task_id)?.status != TaskStatus::Blocked {
            return Err(block_refused(task_id));
        }
        self.transition(task_id, status)
    }

    /// Block a task behind a failed dependency.
    pub(crate) fn block(&mut self, task_id: &str, failed_id: &str) -> Result<()> {
        self.transition(task_id, TaskStatus::Blocked)?;
        self.annotate(task_id, meta_keys::BLOCKED_BY, serde_json::json!(failed_id))
    }

    fn transition(&mut self, task_id: &str, status: TaskStatus) -> Result<()> {
        let task = self.task_mut(task_id)?;
        if task.status == status {
            return Ok(());
        }
        if !task.status.can_transition_to(status) {
            return Err(OrchestraError::InvalidTransition {
                task: task_id.to_string(),
                from: task.status,
                to: status,
            });
        }
        task.status = status;
        task.updated_at = Utc::now();
        task.version += 1;
        self.pending_events.push(OrchestraEvent::TaskUpdated {
            task_id: task_id.to_string(),
            status,
        });
        Ok(())
    }

    /// Set a metadata key. Allowed in every status, terminal ones included.
    pub fn annotate(&mut self, task_id: &str, key: &str, value: serde_json::Value) -> Result<()> {
        let task = self.task_mut(task_id)?;
        task.metadata.insert(key.to_string(), value);
        task.updated_at = Utc::now();
        task.version += 1;
        Ok(())
    }

    /// Bump the retry counter, refusing to go past `max_retries`.
    pub fn increment_retry(&mut self, task_id: &str, max_retries: u32) -> Result<u32> {
        let task = self.task_mut(task_id)?;
        if task.retry_count >= max_retries {
            return Err(OrchestraError::Validation(format!(
                "task '{task_id}' already used {} of {max_retries} retries",
                task.retry_count
            )));
        }
        task.retry_count += 1;
        task.updated_at = Utc::now();
        task.version += 1;
        Ok(task.retry_count)
    }

    /// Compute the ready set and move its first task (by `rank`, then creation
    /// order) to `in_progress`. Returns `None` when nothing is ready.
    pub fn claim_next_ready(
        &mut self,
        project_id: &str,
        rank: &HashMap<String, usize>,
    ) -> Result<Option<String>> {
        let graph = self.graph(project_id)?;
        let next = graph
            .ready_set()
            .into_iter()
            .enumerate()
            .min_by_key(|(pos, t)| (rank.get(&t.id).copied().unwrap_or(usize::MAX), *pos))
            .map(|(_, t)| t.id.clone());

        if let Some(ref id) = next {
            self.set_status(id, TaskStatus::InProgress)?;
        }
        Ok(next)
    }

    /// Promote pending direct dependents of `task_id` whose dependencies have
    /// all completed. Returns the promoted ids.
    pub fn promote_ready_dependents(&mut self, task_id: &str) -> Result<Vec<String>> {
        let project_id = self.task(task_id)?.project_id.clone();
        let graph = self.graph(&project_id)?;
        let mut promoted = Vec::new();
        for dependent in graph.dependents_of(task_id) {
            let row = self.task(dependent)?;
            if row.status != TaskStatus::Pending {
                continue;
            }
            let satisfied = row
                .depends_on
                .iter()
                .all(|d| matches!(self.task(d), Ok(t) if t.status == TaskStatus::Completed));
            if satisfied {
                promoted.push(dependent.to_string());
            }
        }
        for id in &promoted {
            self.set_status(id, TaskStatus::Ready)?;
        }
        Ok(promoted)
    }

    pub fn record_interaction(&mut self, interaction: Interaction) -> Result<()> {
        self.task(&interaction.task_id)?;
        self.appended.interactions.push(interaction);
        Ok(())
    }

    pub fn record_decision(&mut self, record: DecisionRecord) -> Result<()> {
        self.task(&record.task_id)?;
        self.appended.decisions.push(record);
        Ok(())
    }

    pub fn insert_session(&mut self, session: Session) {
        self.pending_events.push(OrchestraEvent::SessionStarted {
            session_id: session.id.clone(),
            project_id: session.project_id.clone(),
        });
        self.rows.sessions.insert(session.id.clone(), session);
    }

    pub fn add_usage(&mut self, session_id: &str, usage: TokenUsage, agent_calls: u32) -> Result<()> {
        let session = self
            .rows
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| OrchestraError::not_found("Session", session_id))?;
        session.usage.add(usage);
        session.agent_calls += agent_calls;
        Ok(())
    }

    pub fn end_session(&mut self, session_id: &str) -> Result<Session> {
        let session = self
            .rows
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| OrchestraError::not_found("Session", session_id))?;
        session.ended_at.get_or_insert_with(Utc::now);
        let session = session.clone();
        self.pending_events.push(OrchestraEvent::SessionEnded {
            session_id: session.id.clone(),
            total_tokens: session.usage.total(),
        });
        Ok(session)
    }
}

fn block_refused(task_id: &str) -> OrchestraError {
    OrchestraError::Validation(format!(
        "task '{task_id}': tasks are blocked only by a failed dependency"
    ))
}
