//! Task pipeline and project-level execution.
//!
//! Every task runs the same eight stages:
//!
//! 1. build context from the store (task, project, prior interactions,
//!    dependency outputs, last shortfall, human input)
//! 2. build the prompt
//! 3. invoke the agent, wrapped in the retry policy for transport failures
//! 4. structural validation
//! 5. quality scoring
//! 6. confidence scoring
//! 7. decision
//! 8. action: PROCEED completes the task and promotes ready dependents,
//!    RETRY loops back to stage 1 with the shortfall recorded, CLARIFY parks
//!    the task in `clarify_pending`, ESCALATE fails it and blocks its
//!    dependents in the same transaction.
//!
//! Stage 8 re-reads the task inside its transaction, so a cancellation that
//! lands while the agent is running is honoured there and nothing is committed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinSet;

use orchestra_types::model::meta_keys;
use orchestra_types::{
    DecisionAction, DecisionRecord, EngineConfig, Interaction, NewTask, OrchestraError, Result,
    Task, TaskStatus, TokenUsage,
};

use crate::agent::{AgentExecutor, AgentResponse};
use crate::context::{DependencyOutput, TaskContext};
use crate::decision::{DecisionEngine, DecisionInput};
use crate::events::{EventEmitter, OrchestraEvent};
use crate::prompt::{PromptBuilder, TemplatePromptBuilder};
use crate::registry::ComponentRegistry;
use crate::retry::RetryPolicy;
use crate::scorer::QualityScorer;
use crate::store::{StateStore, Transaction};
use crate::validation::{ValidationPipeline, ValidationReport};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// A task parked for human input.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClarifyReport {
    pub task_id: String,
    pub reason: String,
    pub composite_score: f64,
    pub confidence: f64,
}

/// A failed task and every dependent newly blocked by it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EscalationReport {
    pub task_id: String,
    pub reason: String,
    pub blocked: Vec<String>,
}

/// How one pipeline run ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed {
        task_id: String,
        /// Dependents promoted to `ready` by this completion.
        newly_ready: Vec<String>,
    },
    ClarifyPending(ClarifyReport),
    Escalated(EscalationReport),
    Cancelled {
        task_id: String,
    },
}

impl TaskOutcome {
    pub fn task_id(&self) -> &str {
        match self {
            Self::Completed { task_id, .. } | Self::Cancelled { task_id } => task_id,
            Self::ClarifyPending(r) => &r.task_id,
            Self::Escalated(r) => &r.task_id,
        }
    }
}

/// Final state of a project after [`ExecutionCoordinator::execute_project`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProjectReport {
    pub project_id: String,
    pub session_id: Option<String>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub blocked: Vec<String>,
    pub clarify_pending: Vec<String>,
    pub cancelled: Vec<String>,
    /// Pending or ready tasks that were not reached.
    pub pending: Vec<String>,
    /// Tasks some other run still has in flight.
    pub in_progress: Vec<String>,
    pub escalations: Vec<EscalationReport>,
    pub clarifications: Vec<ClarifyReport>,
    pub usage: TokenUsage,
    pub duration_ms: u64,
}

impl ProjectReport {
    fn tally(&mut self, tasks: &[Task]) {
        for task in tasks {
            let bucket = match task.status {
                TaskStatus::Completed => &mut self.completed,
                TaskStatus::Failed => &mut self.failed,
                TaskStatus::Blocked => &mut self.blocked,
                TaskStatus::ClarifyPending => &mut self.clarify_pending,
                TaskStatus::Cancelled => &mut self.cancelled,
                TaskStatus::Pending | TaskStatus::Ready => &mut self.pending,
                TaskStatus::InProgress => &mut self.in_progress,
            };
            bucket.push(task.id.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline stages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Context,
    Prompt,
    Agent,
    Structure,
    Quality,
    Confidence,
    Decision,
    Action,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Context => "context",
            Self::Prompt => "prompt",
            Self::Agent => "agent",
            Self::Structure => "structure",
            Self::Quality => "quality",
            Self::Confidence => "confidence",
            Self::Decision => "decision",
            Self::Action => "action",
        };
        f.write_str(s)
    }
}

/// What stage 8 committed.
enum Step {
    Done(TaskOutcome),
    Retry,
}

// ---------------------------------------------------------------------------
// ExecutionCoordinator
// ---------------------------------------------------------------------------

/// Drives tasks through the pipeline. Cheap to clone; clones share the store
/// and collaborators.
#[derive(Clone)]
pub struct ExecutionCoordinator {
    store: StateStore,
    agent: Arc<dyn AgentExecutor>,
    prompts: Arc<dyn PromptBuilder>,
    scorer: Arc<dyn QualityScorer>,
    validation: Arc<ValidationPipeline>,
    decisions: DecisionEngine,
    retry: RetryPolicy,
    config: Arc<EngineConfig>,
    events: EventEmitter,
}

impl ExecutionCoordinator {
    pub fn new(
        store: StateStore,
        agent: Arc<dyn AgentExecutor>,
        scorer: Arc<dyn QualityScorer>,
        config: EngineConfig,
    ) -> Self {
        let events = store.events().clone();
        Self {
            agent,
            scorer,
            prompts: Arc::new(TemplatePromptBuilder::new()),
            validation: Arc::new(ValidationPipeline::new(config.weights, config.decision)),
            decisions: DecisionEngine::new(config.decision),
            retry: RetryPolicy::from_config(&config.retry),
            config: Arc::new(config),
            events,
            store,
        }
    }

    /// Construct the agent and scorer named in `config.components`.
    pub fn from_registry(
        store: StateStore,
        registry: &ComponentRegistry,
        config: EngineConfig,
    ) -> Result<Self> {
        let agent = registry.agent(&config.components)?;
        let scorer = registry.scorer(&config.components)?;
        Ok(Self::new(store, agent, scorer, config))
    }

    pub fn with_prompt_builder(mut self, prompts: Arc<dyn PromptBuilder>) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_validation(mut self, validation: ValidationPipeline) -> Self {
        self.validation = Arc::new(validation);
        self
    }

    /// Override the transport retry policy (e.g. to drop backoff in dry runs).
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // --- task management ---

    /// Create a task, failing with a dependency error on unknown ids or cycles.
    pub async fn create_task(
        &self,
        project_id: &str,
        title: &str,
        description: &str,
        depends_on: &[&str],
    ) -> Result<String> {
        let new = NewTask::new(title)
            .with_description(description)
            .depends_on(depends_on.iter().copied());
        self.store.create_task(project_id, new).await
    }

    /// Tasks ready to run: unstarted, with every dependency completed.
    pub async fn get_ready_tasks(&self, project_id: &str) -> Result<Vec<Task>> {
        self.store
            .read(|tx| {
                let graph = tx.graph(project_id)?;
                Ok(graph.ready_set().into_iter().cloned().collect())
            })
            .await
    }

    /// Cancel a task in any non-terminal status. Dependents are left alone.
    pub async fn cancel_task(&self, task_id: &str) -> Result<()> {
        self.store
            .transaction(|tx| {
                let task = tx.task(task_id)?;
                if task.status.is_terminal() {
                    return Err(OrchestraError::InvalidState {
                        task: task_id.to_string(),
                        status: task.status,
                        expected: "a non-terminal status".into(),
                    });
                }
                tx.set_status(task_id, TaskStatus::Cancelled)
            })
            .await?;
        tracing::info!(task = %task_id, "Task cancelled");
        self.events.emit(OrchestraEvent::TaskCancelled {
            task_id: task_id.to_string(),
        });
        Ok(())
    }

    /// Continue a `clarify_pending` task with human input and run its pipeline
    /// to the next outcome. Agent calls made after the resume are charged to a
    /// session of their own.
    pub async fn resume_clarification(&self, task_id: &str, human_input: &str) -> Result<TaskOutcome> {
        let project_id = self
            .store
            .transaction(|tx| {
                let task = tx.task(task_id)?;
                if task.status != TaskStatus::ClarifyPending {
                    return Err(OrchestraError::InvalidState {
                        task: task_id.to_string(),
                        status: task.status,
                        expected: TaskStatus::ClarifyPending.to_string(),
                    });
                }
                let project_id = task.project_id.clone();
                tx.annotate(task_id, meta_keys::HUMAN_INPUT, serde_json::json!(human_input))?;
                tx.set_status(task_id, TaskStatus::InProgress)?;
                Ok(project_id)
            })
            .await?;

        let session = self.store.start_session(&project_id).await?;
        tracing::info!(task = %task_id, session = %session.id, "Resuming after clarification");
        let outcome = self.drive(task_id, Some(session.id.clone())).await;
        self.store.end_session(&session.id).await?;
        outcome
    }

    /// Escalate `clarify_pending` tasks that have waited longer than the
    /// configured clarification timeout. No-op when no timeout is configured.
    pub async fn expire_clarifications(&self, project_id: &str) -> Result<Vec<EscalationReport>> {
        let Some(timeout) = self.config.execution.clarify_timeout() else {
            return Ok(Vec::new());
        };
        // Too large to represent as a chrono duration: nothing can expire.
        let Ok(timeout) = chrono::Duration::from_std(timeout) else {
            tracing::debug!(project = %project_id, "Clarification timeout out of range, treating as unbounded");
            return Ok(Vec::new());
        };
        let now = Utc::now();

        let reports = self
            .store
            .transaction(|tx| {
                let expired: Vec<(String, u32)> = tx
                    .tasks_for_project(project_id)?
                    .into_iter()
                    .filter(|t| t.status == TaskStatus::ClarifyPending)
                    .filter(|t| {
                        clarify_since(t)
                            .checked_add_signed(timeout)
                            .is_some_and(|deadline| deadline <= now)
                    })
                    .map(|t| (t.id.clone(), t.retry_count))
                    .collect();

                let mut reports = Vec::with_capacity(expired.len());
                for (id, retry_count) in expired {
                    let reason = format!(
                        "no clarification within {}s",
                        timeout.num_seconds()
                    );
                    tx.set_status(&id, TaskStatus::InProgress)?;
                    tx.record_decision(DecisionRecord::new(
                        &id,
                        0.0,
                        0.0,
                        DecisionAction::Escalate,
                        &reason,
                        retry_count,
                    ))?;
                    reports.push(self.fail_in_tx(tx, &id, &reason)?);
                }
                Ok(reports)
            })
            .await?;

        for report in &reports {
            tracing::warn!(task = %report.task_id, blocked = report.blocked.len(), "Clarification timed out");
            self.emit_escalation(report);
        }
        Ok(reports)
    }

    // --- execution ---

    /// Claim a single ready task and run its pipeline.
    pub async fn run_task(&self, task_id: &str) -> Result<TaskOutcome> {
        self.store
            .transaction(|tx| {
                let task = tx.task(task_id)?;
                let graph = tx.graph(&task.project_id)?;
                if !graph.ready_set().iter().any(|t| t.id == task_id) {
                    return Err(OrchestraError::InvalidState {
                        task: task_id.to_string(),
                        status: task.status,
                        expected: "ready with all dependencies completed".into(),
                    });
                }
                tx.set_status(task_id, TaskStatus::InProgress)
            })
            .await?;
        self.events.emit(OrchestraEvent::TaskClaimed {
            task_id: task_id.to_string(),
        });
        self.drive(task_id, None).await
    }

    /// Run every reachable task of a project.
    ///
    /// The topological order is computed once and used to rank the live ready
    /// set; up to `max_workers` pipelines run at once. Returns when nothing is
    /// ready and nothing this run started is still in flight.
    pub async fn execute_project(&self, project_id: &str) -> Result<ProjectReport> {
        let started = Instant::now();
        let order = self.store.graph(project_id).await?.topological_order()?;
        let rank: Arc<HashMap<String, usize>> = Arc::new(
            order
                .iter()
                .enumerate()
                .map(|(i, id)| (id.clone(), i))
                .collect(),
        );

        let mut report = ProjectReport {
            project_id: project_id.to_string(),
            ..Default::default()
        };
        report.escalations = self.expire_clarifications(project_id).await?;

        let session = self.store.start_session(project_id).await?;
        report.session_id = Some(session.id.clone());
        tracing::info!(project = %project_id, tasks = order.len(), session = %session.id, "Executing project");
        self.events.emit(OrchestraEvent::ProjectStarted {
            project_id: project_id.to_string(),
            task_count: order.len(),
        });

        let max_workers = self.config.execution.max_workers.max(1);
        let mut workers: JoinSet<(String, Result<TaskOutcome>)> = JoinSet::new();
        let mut first_error: Option<OrchestraError> = None;

        loop {
            while first_error.is_none() && workers.len() < max_workers {
                let claimed = match self
                    .store
                    .transaction(|tx| tx.claim_next_ready(project_id, &rank))
                    .await
                {
                    Ok(claimed) => claimed,
                    Err(e) => {
                        first_error = Some(e);
                        break;
                    }
                };
                let Some(task_id) = claimed else { break };

                tracing::debug!(task = %task_id, "Claimed task");
                self.events.emit(OrchestraEvent::TaskClaimed {
                    task_id: task_id.clone(),
                });
                let this = self.clone();
                let session_id = session.id.clone();
                workers.spawn(async move {
                    let outcome = this.drive(&task_id, Some(session_id)).await;
                    (task_id, outcome)
                });
            }

            let Some(joined) = workers.join_next().await else {
                break;
            };
            match joined {
                Ok((_, Ok(TaskOutcome::Escalated(escalation)))) => {
                    report.escalations.push(escalation);
                }
                Ok((_, Ok(TaskOutcome::ClarifyPending(clarify)))) => {
                    report.clarifications.push(clarify);
                }
                Ok((_, Ok(_))) => {}
                Ok((task_id, Err(e))) => {
                    tracing::error!(task = %task_id, error = %e, "Task pipeline failed");
                    first_error.get_or_insert(e);
                }
                Err(join_err) => {
                    first_error.get_or_insert(OrchestraError::Other(format!(
                        "task worker panicked: {join_err}"
                    )));
                }
            }
        }

        let session = self.store.end_session(&session.id).await?;
        if let Some(e) = first_error {
            return Err(e);
        }

        report.usage = session.usage;
        report.tally(&self.store.list_tasks(project_id).await?);
        report.duration_ms = started.elapsed().as_millis() as u64;

        tracing::info!(
            project = %project_id,
            completed = report.completed.len(),
            failed = report.failed.len(),
            blocked = report.blocked.len(),
            clarify_pending = report.clarify_pending.len(),
            duration_ms = report.duration_ms,
            "Project execution finished"
        );
        self.events.emit(OrchestraEvent::ProjectFinished {
            project_id: project_id.to_string(),
            completed: report.completed.len(),
            failed: report.failed.len(),
            blocked: report.blocked.len(),
            duration_ms: report.duration_ms,
        });
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Pipeline
    // -----------------------------------------------------------------------

    /// Run stages 1-8 for a task that is already `in_progress`, looping on
    /// RETRY until another outcome is committed.
    async fn drive(&self, task_id: &str, session_id: Option<String>) -> Result<TaskOutcome> {
        loop {
            self.stage(task_id, Stage::Context);
            let ctx = self.build_context(task_id, session_id.clone()).await?;
            if ctx.task.status == TaskStatus::Cancelled {
                return Ok(TaskOutcome::Cancelled {
                    task_id: task_id.to_string(),
                });
            }

            self.stage(task_id, Stage::Prompt);
            let prompt = match self.prompts.build(&ctx) {
                Ok(p) => p,
                Err(e) => {
                    return self
                        .escalate_now(task_id, format!("prompt construction failed: {e}"))
                        .await
                }
            };

            self.stage(task_id, Stage::Agent);
            let response = match self.invoke_agent(&prompt, &ctx).await {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(task = %task_id, error = %e, "Agent failed");
                    return self.escalate_now(task_id, format!("agent failed: {e}")).await;
                }
            };
            self.store
                .transaction(|tx| {
                    tx.record_interaction(Interaction::new(
                        task_id,
                        session_id.clone(),
                        ctx.attempt,
                        &prompt,
                        &response.text,
                    ))?;
                    if let Some(sid) = &session_id {
                        tx.add_usage(sid, response.usage(), 1)?;
                    }
                    Ok(())
                })
                .await?;

            self.stage(task_id, Stage::Structure);
            let diagnostics = self.validation.check_structure(&ctx.task, &response);

            self.stage(task_id, Stage::Quality);
            let rules = ctx.task.rules();
            let scores = match self
                .retry
                .execute_with_retry(|| self.scorer.score(&ctx.task, &response, &rules), task_id)
                .await
            {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(task = %task_id, error = %e, "Quality scoring failed");
                    return self
                        .escalate_now(task_id, format!("quality scoring failed: {e}"))
                        .await;
                }
            };

            self.stage(task_id, Stage::Confidence);
            let report = self.validation.assess(diagnostics, scores);

            self.stage(task_id, Stage::Decision);
            let decision = self.decisions.evaluate(&DecisionInput {
                composite_score: report.composite_score,
                confidence: report.confidence,
                retry_count: ctx.task.retry_count,
                max_retries: self.config.retry.max_retries,
            });
            tracing::info!(
                task = %task_id,
                action = %decision.action,
                score = report.composite_score,
                confidence = report.confidence,
                retry_count = ctx.task.retry_count,
                "Decision made"
            );

            self.stage(task_id, Stage::Action);
            let step = self
                .store
                .transaction(|tx| {
                    if tx.task(task_id)?.status == TaskStatus::Cancelled {
                        return Ok(Step::Done(TaskOutcome::Cancelled {
                            task_id: task_id.to_string(),
                        }));
                    }
                    tx.record_decision(DecisionRecord::new(
                        task_id,
                        report.composite_score,
                        report.confidence,
                        decision.action,
                        &decision.rationale,
                        ctx.task.retry_count,
                    ))?;
                    self.apply(tx, task_id, decision.action, &decision.rationale, &report, &response)
                })
                .await?;

            match step {
                Step::Retry => {
                    self.emit_decision(task_id, decision.action, &report);
                    tracing::info!(task = %task_id, shortfall = report.shortfall.len(), "Retrying with shortfall");
                }
                Step::Done(outcome) => {
                    if !matches!(outcome, TaskOutcome::Cancelled { .. }) {
                        self.emit_decision(task_id, decision.action, &report);
                    }
                    self.emit_outcome(&outcome);
                    return Ok(outcome);
                }
            }
        }
    }

    /// Stage 1: everything the prompt needs, read under one lock.
    async fn build_context(&self, task_id: &str, session_id: Option<String>) -> Result<TaskContext> {
        self.store
            .read(|tx| {
                let task = tx.task(task_id)?.clone();
                let project = tx.project(&task.project_id)?.clone();

                let mut dependency_outputs = Vec::new();
                for dep_id in &task.depends_on {
                    let dep = tx.task(dep_id)?;
                    if let Some(output) = dep.output() {
                        dependency_outputs.push(DependencyOutput {
                            task_id: dep.id.clone(),
                            title: dep.title.clone(),
                            output: output.to_string(),
                        });
                    }
                }

                let shortfall = task
                    .metadata
                    .get(meta_keys::LAST_SHORTFALL)
                    .and_then(|v| serde_json::from_value::<Vec<String>>(v.clone()).ok())
                    .unwrap_or_default();
                let human_input = task.meta_str(meta_keys::HUMAN_INPUT).map(String::from);

                let mut ctx = TaskContext::new(task, project);
                ctx.prior_interactions = tx.interactions_for(task_id).into_iter().cloned().collect();
                ctx.dependency_outputs = dependency_outputs;
                ctx.shortfall = shortfall;
                ctx.human_input = human_input;
                ctx.session_id = session_id;
                Ok(ctx)
            })
            .await
    }

    /// Stage 3: agent call under the transport retry policy.
    async fn invoke_agent(&self, prompt: &str, ctx: &TaskContext) -> Result<AgentResponse> {
        let task_id = ctx.task.id.as_str();
        self.retry
            .execute_with_retry_notify(
                || self.agent.execute(prompt, ctx),
                task_id,
                |attempt, delay| {
                    self.events.emit(OrchestraEvent::AgentRetrying {
                        task_id: task_id.to_string(),
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                    });
                },
            )
            .await
    }

    /// Stage 8 writes for a decided action.
    fn apply(
        &self,
        tx: &mut Transaction<'_>,
        task_id: &str,
        action: DecisionAction,
        rationale: &str,
        report: &ValidationReport,
        response: &AgentResponse,
    ) -> Result<Step> {
        match action {
            DecisionAction::Proceed => {
                tx.annotate(task_id, meta_keys::OUTPUT, serde_json::json!(response.text))?;
                tx.set_status(task_id, TaskStatus::Completed)?;
                let newly_ready = tx.promote_ready_dependents(task_id)?;
                Ok(Step::Done(TaskOutcome::Completed {
                    task_id: task_id.to_string(),
                    newly_ready,
                }))
            }
            DecisionAction::Retry => {
                tx.increment_retry(task_id, self.config.retry.max_retries)?;
                tx.annotate(task_id, meta_keys::LAST_SHORTFALL, serde_json::json!(report.shortfall))?;
                Ok(Step::Retry)
            }
            DecisionAction::Clarify => {
                tx.annotate(task_id, meta_keys::CLARIFY_REASON, serde_json::json!(rationale))?;
                tx.annotate(task_id, meta_keys::CLARIFY_SCORE, serde_json::json!(report.composite_score))?;
                tx.annotate(task_id, meta_keys::CLARIFY_CONFIDENCE, serde_json::json!(report.confidence))?;
                tx.annotate(task_id, meta_keys::CLARIFY_SINCE, serde_json::json!(Utc::now().to_rfc3339()))?;
                tx.annotate(task_id, meta_keys::LAST_SHORTFALL, serde_json::json!(report.shortfall))?;
                tx.set_status(task_id, TaskStatus::ClarifyPending)?;
                Ok(Step::Done(TaskOutcome::ClarifyPending(ClarifyReport {
                    task_id: task_id.to_string(),
                    reason: rationale.to_string(),
                    composite_score: report.composite_score,
                    confidence: report.confidence,
                })))
            }
            DecisionAction::Escalate => Ok(Step::Done(TaskOutcome::Escalated(
                self.fail_in_tx(tx, task_id, rationale)?,
            ))),
        }
    }

    /// Fail an `in_progress` task and cascade-block its dependents.
    fn fail_in_tx(&self, tx: &mut Transaction<'_>, task_id: &str, reason: &str) -> Result<EscalationReport> {
        tx.annotate(task_id, meta_keys::FAILURE_REASON, serde_json::json!(reason))?;
        tx.set_status(task_id, TaskStatus::Failed)?;
        let project_id = tx.task(task_id)?.project_id.clone();
        let graph = tx.graph(&project_id)?;
        let blocked = graph.propagate_failure(tx, task_id, self.config.graph.cascade_failures)?;
        Ok(EscalationReport {
            task_id: task_id.to_string(),
            reason: reason.to_string(),
            blocked,
        })
    }

    /// ESCALATE without an evaluated response (agent, prompt or scorer failure).
    async fn escalate_now(&self, task_id: &str, reason: String) -> Result<TaskOutcome> {
        let outcome = self
            .store
            .transaction(|tx| {
                let task = tx.task(task_id)?;
                if task.status == TaskStatus::Cancelled {
                    return Ok(TaskOutcome::Cancelled {
                        task_id: task_id.to_string(),
                    });
                }
                let retry_count = task.retry_count;
                tx.record_decision(DecisionRecord::new(
                    task_id,
                    0.0,
                    0.0,
                    DecisionAction::Escalate,
                    &reason,
                    retry_count,
                ))?;
                Ok(TaskOutcome::Escalated(self.fail_in_tx(tx, task_id, &reason)?))
            })
            .await?;
        self.emit_outcome(&outcome);
        Ok(outcome)
    }

    // --- events ---

    fn stage(&self, task_id: &str, stage: Stage) {
        tracing::debug!(task = %task_id, %stage, "Stage started");
        self.events.emit(OrchestraEvent::StageStarted {
            task_id: task_id.to_string(),
            stage: stage.to_string(),
        });
    }

    fn emit_decision(&self, task_id: &str, action: DecisionAction, report: &ValidationReport) {
        self.events.emit(OrchestraEvent::DecisionMade {
            task_id: task_id.to_string(),
            action,
            composite_score: report.composite_score,
            confidence: report.confidence,
        });
    }

    fn emit_escalation(&self, report: &EscalationReport) {
        self.events.emit(OrchestraEvent::TaskEscalated {
            task_id: report.task_id.clone(),
            blocked: report.blocked.clone(),
        });
    }

    fn emit_outcome(&self, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Completed { task_id, newly_ready } => {
                tracing::info!(task = %task_id, newly_ready = newly_ready.len(), "Task completed");
            }
            TaskOutcome::ClarifyPending(report) => {
                tracing::info!(task = %report.task_id, reason = %report.reason, "Task awaiting clarification");
                self.events.emit(OrchestraEvent::ClarificationRequested {
                    task_id: report.task_id.clone(),
                    reason: report.reason.clone(),
                });
            }
            TaskOutcome::Escalated(report) => {
                tracing::warn!(
                    task = %report.task_id,
                    reason = %report.reason,
                    blocked = report.blocked.len(),
                    "Task escalated"
                );
                self.emit_escalation(report);
            }
            TaskOutcome::Cancelled { task_id } => {
                tracing::info!(task = %task_id, "Pipeline stopped: task was cancelled");
            }
        }
    }
}

/// When a task entered `clarify_pending`, falling back to its last update.
fn clarify_since(task: &Task) -> DateTime<Utc> {
    task.meta_str(meta_keys::CLARIFY_SINCE)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(task.updated_at)
}
