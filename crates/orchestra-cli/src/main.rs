//! CLI binary for running and inspecting Orchestra projects.
//!
//! State lives in a JSON snapshot (`--state`) that every subcommand loads and,
//! when it changes anything, writes back.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use serde::Deserialize;

use orchestra_engine::{
    default_registry, open_store, save_snapshot, ExecutionCoordinator, ProjectReport,
    RetryPolicy, StateStore, TaskOutcome,
};
use orchestra_types::model::meta_keys;
use orchestra_types::{
    ConfigSource, DefaultConfig, EngineConfig, FileConfig, NewTask, OrchestraError, Project,
    TaskStatus,
};

#[derive(Parser)]
#[command(name = "orchestra", version, about = "Quality-gated task orchestration for coding agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// State file shared between invocations
    #[arg(long, global = true, default_value = ".orchestra/state.json")]
    state: PathBuf,

    /// Engine configuration file (TOML, or JSON by extension)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a project file (on first run) and execute every reachable task
    Run {
        /// Path to the project .json file
        project: PathBuf,

        /// Don't call the agent; answer every prompt with a placeholder
        #[arg(long)]
        dry_run: bool,

        /// Number of task pipelines to run at once (overrides the config)
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Check a project file's dependency graph without running anything
    Validate {
        /// Path to the project .json file
        project: PathBuf,
    },

    /// List the tasks that are ready to run
    Ready { project_id: String },

    /// Answer a clarification request and continue the task
    Resume {
        task_id: String,

        /// Guidance handed to the agent on the next attempt
        #[arg(short, long)]
        input: String,
    },

    /// Cancel a task. Its dependents are left as they are.
    Cancel { task_id: String },

    /// Show the status of every task in a project
    Status { project_id: String },
}

/// Project definition read by `run` and `validate`.
#[derive(Debug, Deserialize)]
struct ProjectFile {
    id: String,
    name: String,
    #[serde(default)]
    goal: String,
    #[serde(default)]
    tasks: Vec<NewTask>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            project,
            dry_run,
            workers,
        } => {
            cmd_run(&cli.state, config, &project, dry_run, workers).await?;
        }
        Commands::Validate { project } => {
            cmd_validate(config, &project).await?;
        }
        Commands::Ready { project_id } => {
            cmd_ready(&cli.state, config, &project_id).await?;
        }
        Commands::Resume { task_id, input } => {
            cmd_resume(&cli.state, config, &task_id, &input).await?;
        }
        Commands::Cancel { task_id } => {
            cmd_cancel(&cli.state, config, &task_id).await?;
        }
        Commands::Status { project_id } => {
            cmd_status(&cli.state, config, &project_id).await?;
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let config = match path {
        Some(path) => FileConfig::new(path)
            .load()
            .with_context(|| format!("loading config {}", path.display()))?,
        None => DefaultConfig.load()?,
    };
    Ok(config)
}

fn read_project_file(path: &Path) -> anyhow::Result<ProjectFile> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("reading project file {}", path.display()))?;
    let file: ProjectFile = serde_json::from_str(&source)
        .with_context(|| format!("parsing project file {}", path.display()))?;
    Ok(file)
}

async fn load_store(state: &Path, config: &EngineConfig) -> anyhow::Result<StateStore> {
    let store = open_store(state)
        .await
        .with_context(|| format!("opening state file {}", state.display()))?;
    Ok(store.with_graph_config(config.graph))
}

/// Create the project and all its tasks in one transaction.
async fn import_project(store: &StateStore, file: ProjectFile) -> orchestra_types::Result<Vec<String>> {
    let project = Project::new(file.id.as_str(), file.name).with_goal(file.goal);
    let project_id = file.id;
    let tasks = file.tasks;
    store
        .transaction(|tx| {
            tx.insert_project(project)?;
            tx.insert_tasks(&project_id, tasks)
        })
        .await
}

fn coordinator(store: StateStore, config: EngineConfig) -> anyhow::Result<ExecutionCoordinator> {
    let registry = default_registry();
    Ok(ExecutionCoordinator::from_registry(store, &registry, config)?)
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_run(
    state: &Path,
    mut config: EngineConfig,
    project_path: &Path,
    dry_run: bool,
    workers: Option<usize>,
) -> anyhow::Result<()> {
    let file = read_project_file(project_path)?;
    if dry_run {
        config.components.agent = "dry_run".into();
    }
    if let Some(workers) = workers {
        config.execution.max_workers = workers;
    }
    config.validate()?;

    let store = load_store(state, &config).await?;
    let project_id = file.id.clone();
    match store.get_project(&project_id).await {
        Ok(_) => {
            tracing::info!(project = %project_id, "Project already in state, continuing");
        }
        Err(OrchestraError::NotFound { .. }) => {
            let ids = import_project(&store, file).await?;
            tracing::info!(project = %project_id, tasks = ids.len(), "Imported project");
        }
        Err(e) => return Err(e.into()),
    }

    let mut coordinator = coordinator(store.clone(), config)?;
    if dry_run {
        coordinator = coordinator.with_retry_policy(RetryPolicy::immediate(0));
    }

    let result = coordinator.execute_project(&project_id).await;
    save_snapshot(&store, state).await?;
    let report = result?;

    print_report(&report);
    if !report.failed.is_empty() || !report.blocked.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}

async fn cmd_validate(config: EngineConfig, project_path: &Path) -> anyhow::Result<()> {
    let file = read_project_file(project_path)?;
    let project_id = file.id.clone();
    let store = StateStore::new().with_graph_config(config.graph);

    if let Err(e) = import_project(&store, file).await {
        println!("[ERROR] {e}");
        std::process::exit(1);
    }

    let graph = store.graph(&project_id).await?;
    let order = graph.topological_order()?;
    println!("Project '{project_id}' is valid ({} tasks)", order.len());
    println!("\nExecution order:");
    for id in &order {
        if let Some(task) = graph.task(id) {
            let deps = if task.depends_on.is_empty() {
                String::new()
            } else {
                format!(" <- {}", task.depends_on.join(", "))
            };
            println!(
                "  [depth {}] {} {}{}",
                task.dependency_depth, task.id, task.title, deps
            );
        }
    }
    Ok(())
}

async fn cmd_ready(state: &Path, config: EngineConfig, project_id: &str) -> anyhow::Result<()> {
    let store = load_store(state, &config).await?;
    let coordinator = coordinator(store, config)?;
    let ready = coordinator.get_ready_tasks(project_id).await?;

    if ready.is_empty() {
        println!("No tasks ready");
        return Ok(());
    }
    for task in ready {
        println!("{}  {}", task.id, task.title);
    }
    Ok(())
}

async fn cmd_resume(
    state: &Path,
    config: EngineConfig,
    task_id: &str,
    input: &str,
) -> anyhow::Result<()> {
    let store = load_store(state, &config).await?;
    let coordinator = coordinator(store.clone(), config)?;

    let result = coordinator.resume_clarification(task_id, input).await;
    save_snapshot(&store, state).await?;
    print_outcome(&result?);
    Ok(())
}

async fn cmd_cancel(state: &Path, config: EngineConfig, task_id: &str) -> anyhow::Result<()> {
    let store = load_store(state, &config).await?;
    let coordinator = coordinator(store.clone(), config)?;

    coordinator.cancel_task(task_id).await?;
    save_snapshot(&store, state).await?;
    println!("Cancelled {task_id}");
    Ok(())
}

async fn cmd_status(state: &Path, config: EngineConfig, project_id: &str) -> anyhow::Result<()> {
    let store = load_store(state, &config).await?;
    let project = store.get_project(project_id).await?;
    let tasks = store.list_tasks(project_id).await?;

    println!("Project: {} ({})", project.name, project.id);
    if !project.goal.is_empty() {
        println!("Goal: {}", project.goal);
    }

    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for task in &tasks {
        *counts.entry(task.status.as_str()).or_default() += 1;
    }
    let summary: Vec<String> = counts.iter().map(|(s, n)| format!("{s}={n}")).collect();
    println!("Tasks: {} ({})\n", tasks.len(), summary.join(", "));

    for task in &tasks {
        let note = match task.status {
            TaskStatus::Failed => task.meta_str(meta_keys::FAILURE_REASON),
            TaskStatus::Blocked => task.meta_str(meta_keys::BLOCKED_BY),
            TaskStatus::ClarifyPending => task.meta_str(meta_keys::CLARIFY_REASON),
            _ => None,
        };
        print!(
            "  {:<15} {} {} (retries: {})",
            task.status.as_str(),
            task.id,
            task.title,
            task.retry_count
        );
        match note {
            Some(note) => println!(" - {note}"),
            None => println!(),
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_report(report: &ProjectReport) {
    println!("\nProject: {}", report.project_id);
    println!("Completed: {}", report.completed.len());
    if !report.failed.is_empty() {
        println!("Failed: {}", report.failed.join(", "));
    }
    if !report.blocked.is_empty() {
        println!("Blocked: {}", report.blocked.join(", "));
    }
    if !report.cancelled.is_empty() {
        println!("Cancelled: {}", report.cancelled.join(", "));
    }
    if !report.pending.is_empty() {
        println!("Not reached: {}", report.pending.join(", "));
    }
    for clarify in &report.clarifications {
        println!(
            "Needs input: {} ({}). Run `orchestra resume {} --input <text>`",
            clarify.task_id, clarify.reason, clarify.task_id
        );
    }
    for escalation in &report.escalations {
        println!("Escalated: {} ({})", escalation.task_id, escalation.reason);
    }
    println!(
        "Tokens: {} in / {} out",
        report.usage.input_tokens, report.usage.output_tokens
    );
    println!("Duration: {}ms", report.duration_ms);
}

fn print_outcome(outcome: &TaskOutcome) {
    match outcome {
        TaskOutcome::Completed {
            task_id,
            newly_ready,
        } => {
            println!("Completed {task_id}");
            if !newly_ready.is_empty() {
                println!("Now ready: {}", newly_ready.join(", "));
            }
        }
        TaskOutcome::ClarifyPending(report) => {
            println!("{} still needs input: {}", report.task_id, report.reason);
        }
        TaskOutcome::Escalated(report) => {
            println!("Escalated {}: {}", report.task_id, report.reason);
            if !report.blocked.is_empty() {
                println!("Blocked: {}", report.blocked.join(", "));
            }
        }
        TaskOutcome::Cancelled { task_id } => {
            println!("{task_id} was cancelled");
        }
    }
}
