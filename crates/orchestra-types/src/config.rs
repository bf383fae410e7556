//! Engine configuration and the sources it can be loaded from.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{OrchestraError, Result};

/// Retry and backoff settings for agent calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionThresholds {
    pub accept_threshold: f64,
    pub confidence_threshold: f64,
    pub low_floor: f64,
}

impl Default for DecisionThresholds {
    fn default() -> Self {
        Self {
            accept_threshold: 0.75,
            confidence_threshold: 0.6,
            low_floor: 0.2,
        }
    }
}

/// Weights for the composite quality score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub schema: f64,
    pub completeness: f64,
    pub rule: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            schema: 0.3,
            completeness: 0.3,
            rule: 0.4,
        }
    }
}

impl ScoreWeights {
    pub fn sum(&self) -> f64 {
        self.schema + self.completeness + self.rule
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub max_dependency_depth: usize,
    pub cascade_failures: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_dependency_depth: 10,
            cascade_failures: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Number of task pipelines a project run drives at once.
    pub max_workers: usize,
    /// How long a task may wait in `clarify_pending` before it can be escalated.
    /// `None` means wait forever.
    pub clarify_timeout_secs: Option<u64>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_workers: 1,
            clarify_timeout_secs: None,
        }
    }
}

impl ExecutionConfig {
    pub fn clarify_timeout(&self) -> Option<Duration> {
        self.clarify_timeout_secs.map(Duration::from_secs)
    }
}

/// Which registered collaborators to construct at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentConfig {
    pub agent: String,
    pub scorer: String,
    /// Executable run by the `process` agent.
    pub agent_command: String,
    /// Arguments placed before the prompt. `{prompt}` is substituted in place
    /// when present; otherwise the prompt is appended last.
    pub agent_args: Vec<String>,
    pub agent_timeout_secs: u64,
    pub workdir: Option<PathBuf>,
}

impl Default for ComponentConfig {
    fn default() -> Self {
        Self {
            agent: "process".into(),
            scorer: "heuristic".into(),
            agent_command: "claude".into(),
            agent_args: vec![
                "-p".into(),
                "{prompt}".into(),
                "--output-format".into(),
                "json".into(),
                "--no-session-persistence".into(),
            ],
            agent_timeout_secs: 600,
            workdir: None,
        }
    }
}

/// Full engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub retry: RetryConfig,
    pub decision: DecisionThresholds,
    pub weights: ScoreWeights,
    pub graph: GraphConfig,
    pub execution: ExecutionConfig,
    pub components: ComponentConfig,
}

fn check_unit(name: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(OrchestraError::Config(format!(
            "{name} must be within [0, 1], got {value}"
        )));
    }
    Ok(())
}

impl EngineConfig {
    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let d = &self.decision;
        check_unit("accept_threshold", d.accept_threshold)?;
        check_unit("confidence_threshold", d.confidence_threshold)?;
        check_unit("low_floor", d.low_floor)?;
        if d.low_floor > d.accept_threshold {
            return Err(OrchestraError::Config(format!(
                "low_floor ({}) must not exceed accept_threshold ({})",
                d.low_floor, d.accept_threshold
            )));
        }

        let w = &self.weights;
        if w.schema < 0.0 || w.completeness < 0.0 || w.rule < 0.0 || w.sum() <= 0.0 {
            return Err(OrchestraError::Config(
                "score weights must be non-negative with a positive sum".into(),
            ));
        }

        let r = &self.retry;
        if r.backoff_factor < 1.0 {
            return Err(OrchestraError::Config(format!(
                "backoff_factor must be >= 1.0, got {}",
                r.backoff_factor
            )));
        }
        if r.base_delay_ms > r.max_delay_ms {
            return Err(OrchestraError::Config(format!(
                "base_delay_ms ({}) exceeds max_delay_ms ({})",
                r.base_delay_ms, r.max_delay_ms
            )));
        }

        if self.execution.max_workers == 0 {
            return Err(OrchestraError::Config("max_workers must be at least 1".into()));
        }
        if self.graph.max_dependency_depth == 0 {
            return Err(OrchestraError::Config(
                "max_dependency_depth must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ConfigSource
// ---------------------------------------------------------------------------

/// Anything that can produce an [`EngineConfig`].
pub trait ConfigSource {
    fn load(&self) -> Result<EngineConfig>;
}

/// Built-in defaults.
pub struct DefaultConfig;

impl ConfigSource for DefaultConfig {
    fn load(&self) -> Result<EngineConfig> {
        Ok(EngineConfig::default())
    }
}

/// Configuration read from a TOML or JSON file (chosen by extension; TOML otherwise).
pub struct FileConfig {
    path: PathBuf,
}

impl FileConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for FileConfig {
    fn load(&self) -> Result<EngineConfig> {
        let data = std::fs::read_to_string(&self.path)?;
        let is_json = self
            .path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config: EngineConfig = if is_json {
            serde_json::from_str(&data)?
        } else {
            toml::from_str(&data).map_err(|e| {
                OrchestraError::Config(format!("{}: {e}", self.path.display()))
            })?
        };
        config.validate()?;
        tracing::debug!(path = %self.path.display(), "Loaded engine configuration");
        Ok(config)
    }
}
