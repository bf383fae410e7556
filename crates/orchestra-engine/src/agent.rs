//! The coding-agent seam: [`AgentExecutor`] and its built-in implementations.
//!
//! [`ProcessAgent`] shells out to a coding-agent CLI (Claude Code by default,
//! `claude -p <prompt> --output-format json`) and classifies failures so the
//! retry policy can tell transient trouble from fatal trouble. [`DryRunAgent`]
//! never spawns anything.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use orchestra_types::{ComponentConfig, OrchestraError, Result, TokenUsage};

use crate::context::TaskContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Success,
    /// The agent ran but reported failure. Scored like any other response.
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub text: String,
    pub status: AgentStatus,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AgentResponse {
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            status: AgentStatus::Success,
            metadata: HashMap::new(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            status: AgentStatus::Error,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Token usage reported under `input_tokens` / `output_tokens`.
    pub fn usage(&self) -> TokenUsage {
        let read = |key: &str| self.metadata.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
        TokenUsage {
            input_tokens: read("input_tokens"),
            output_tokens: read("output_tokens"),
        }
    }
}

/// Runs one prompt through a coding agent.
///
/// Implementations signal transport trouble with [`OrchestraError::TransientAgent`],
/// [`OrchestraError::AgentTimeout`] or [`OrchestraError::RateLimited`] (retried),
/// and unrecoverable trouble with [`OrchestraError::FatalAgent`] or
/// [`OrchestraError::AuthError`].
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    fn name(&self) -> &str;
    async fn execute(&self, prompt: &str, context: &TaskContext) -> Result<AgentResponse>;
}

// ---------------------------------------------------------------------------
// ProcessAgent
// ---------------------------------------------------------------------------

const PROMPT_PLACEHOLDER: &str = "{prompt}";

/// Result shape from `claude -p --output-format json`.
#[derive(Deserialize)]
struct ClaudeOutput {
    #[serde(default)]
    result: String,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    subtype: String,
    #[serde(default)]
    total_cost_usd: Option<f64>,
    #[serde(default)]
    num_turns: Option<u32>,
    #[serde(default)]
    usage: Option<ClaudeUsage>,
}

#[derive(Deserialize)]
struct ClaudeUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Spawns an external agent process per prompt.
#[derive(Debug, Clone)]
pub struct ProcessAgent {
    command: String,
    args: Vec<String>,
    timeout: Duration,
    workdir: Option<PathBuf>,
}

impl ProcessAgent {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            timeout: Duration::from_secs(600),
            workdir: None,
        }
    }

    pub fn from_config(config: &ComponentConfig) -> Self {
        Self {
            command: config.agent_command.clone(),
            args: config.agent_args.clone(),
            timeout: Duration::from_secs(config.agent_timeout_secs),
            workdir: config.workdir.clone(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    /// Arguments with `{prompt}` substituted, or the prompt appended when no
    /// argument carries the placeholder.
    fn render_args(&self, prompt: &str) -> Vec<String> {
        let mut placed = false;
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|a| {
                if a.contains(PROMPT_PLACEHOLDER) {
                    placed = true;
                    a.replace(PROMPT_PLACEHOLDER, prompt)
                } else {
                    a.clone()
                }
            })
            .collect();
        if !placed {
            args.push(prompt.to_string());
        }
        args
    }
}

#[async_trait]
impl AgentExecutor for ProcessAgent {
    fn name(&self) -> &str {
        "process"
    }

    async fn execute(&self, prompt: &str, context: &TaskContext) -> Result<AgentResponse> {
        tracing::info!(
            task = %context.task.id,
            command = %self.command,
            attempt = context.attempt,
            "Invoking agent process"
        );

        let mut cmd = tokio::process::Command::new(&self.command);
        cmd.args(self.render_args(prompt))
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                OrchestraError::FatalAgent {
                    message: format!("agent command '{}' not found", self.command),
                }
            } else {
                OrchestraError::TransientAgent {
                    message: format!("failed to spawn '{}': {e}", self.command),
                }
            }
        })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| OrchestraError::AgentTimeout {
                timeout_ms: self.timeout.as_millis() as u64,
            })?
            .map_err(|e| OrchestraError::TransientAgent {
                message: format!("'{}' execution failed: {e}", self.command),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() && stdout.trim().is_empty() {
            return Err(classify_failure(&self.command, output.status.code(), &stderr));
        }

        let mut response = parse_output(&stdout);
        if !output.status.success() {
            tracing::warn!(
                task = %context.task.id,
                code = ?output.status.code(),
                "Agent process exited with failure after writing output"
            );
            response.status = AgentStatus::Error;
            if let Some(code) = output.status.code() {
                response = response.with_metadata("exit_code", serde_json::json!(code));
            }
        }
        tracing::info!(
            task = %context.task.id,
            status = ?response.status,
            text_len = response.text.len(),
            "Agent process completed"
        );
        Ok(response)
    }
}

/// Map a failed run with no stdout onto the error taxonomy using stderr hints.
fn classify_failure(command: &str, code: Option<i32>, stderr: &str) -> OrchestraError {
    let lower = stderr.to_lowercase();
    let excerpt: String = stderr.trim().chars().take(500).collect();
    if lower.contains("rate limit") || lower.contains("429") || lower.contains("overloaded") {
        OrchestraError::RateLimited { retry_after_ms: 0 }
    } else if lower.contains("unauthorized")
        || lower.contains("authentication")
        || lower.contains("invalid api key")
        || lower.contains("401")
    {
        OrchestraError::AuthError { message: excerpt }
    } else {
        let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
        OrchestraError::TransientAgent {
            message: format!("'{command}' exited with {code}: {excerpt}"),
        }
    }
}

/// Parse Claude-style JSON output; anything else is taken as plain text.
fn parse_output(stdout: &str) -> AgentResponse {
    let Ok(parsed) = serde_json::from_str::<ClaudeOutput>(stdout.trim()) else {
        return AgentResponse::success(stdout.trim());
    };

    let mut response = if parsed.is_error || parsed.subtype.starts_with("error") {
        AgentResponse::error(parsed.result)
    } else {
        AgentResponse::success(parsed.result)
    };
    if let Some(usage) = parsed.usage {
        response = response
            .with_metadata("input_tokens", serde_json::json!(usage.input_tokens))
            .with_metadata("output_tokens", serde_json::json!(usage.output_tokens));
    }
    if let Some(cost) = parsed.total_cost_usd {
        response = response.with_metadata("total_cost_usd", serde_json::json!(cost));
    }
    if let Some(turns) = parsed.num_turns {
        response = response.with_metadata("num_turns", serde_json::json!(turns));
    }
    response
}

// ---------------------------------------------------------------------------
// DryRunAgent
// ---------------------------------------------------------------------------

/// Answers every prompt without running anything.
#[derive(Debug, Clone, Default)]
pub struct DryRunAgent;

#[async_trait]
impl AgentExecutor for DryRunAgent {
    fn name(&self) -> &str {
        "dry_run"
    }

    async fn execute(&self, prompt: &str, context: &TaskContext) -> Result<AgentResponse> {
        tracing::info!(task = %context.task.id, "Dry run: skipping agent execution");
        Ok(AgentResponse::success(format!(
            "Dry run: prompt not sent for '{}' ({} chars)",
            context.task.title,
            prompt.len()
        ))
        .with_metadata("dry_run", serde_json::Value::Bool(true)))
    }
}
