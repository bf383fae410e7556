//! Startup-time registry mapping configuration names to collaborator
//! constructors.

use std::collections::HashMap;
use std::sync::Arc;

use orchestra_types::{ComponentConfig, OrchestraError, Result};

use crate::agent::{AgentExecutor, DryRunAgent, ProcessAgent};
use crate::scorer::{HeuristicScorer, QualityScorer};

type AgentFactory = Box<dyn Fn(&ComponentConfig) -> Arc<dyn AgentExecutor> + Send + Sync>;
type ScorerFactory = Box<dyn Fn(&ComponentConfig) -> Arc<dyn QualityScorer> + Send + Sync>;

pub struct ComponentRegistry {
    agents: HashMap<String, AgentFactory>,
    scorers: HashMap<String, ScorerFactory>,
}

impl ComponentRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            agents: HashMap::new(),
            scorers: HashMap::new(),
        }
    }

    pub fn register_agent<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ComponentConfig) -> Arc<dyn AgentExecutor> + Send + Sync + 'static,
    {
        self.agents.insert(name.into(), Box::new(factory));
    }

    pub fn register_scorer<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ComponentConfig) -> Arc<dyn QualityScorer> + Send + Sync + 'static,
    {
        self.scorers.insert(name.into(), Box::new(factory));
    }

    pub fn has_agent(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    pub fn has_scorer(&self, name: &str) -> bool {
        self.scorers.contains_key(name)
    }

    /// Construct the agent named by `config.agent`.
    pub fn agent(&self, config: &ComponentConfig) -> Result<Arc<dyn AgentExecutor>> {
        let factory = self.agents.get(&config.agent).ok_or_else(|| {
            OrchestraError::Config(format!(
                "unknown agent '{}' (known: {})",
                config.agent,
                known(&self.agents)
            ))
        })?;
        Ok(factory(config))
    }

    /// Construct the scorer named by `config.scorer`.
    pub fn scorer(&self, config: &ComponentConfig) -> Result<Arc<dyn QualityScorer>> {
        let factory = self.scorers.get(&config.scorer).ok_or_else(|| {
            OrchestraError::Config(format!(
                "unknown scorer '{}' (known: {})",
                config.scorer,
                known(&self.scorers)
            ))
        })?;
        Ok(factory(config))
    }
}

fn known<V>(map: &HashMap<String, V>) -> String {
    let mut names: Vec<&str> = map.keys().map(String::as_str).collect();
    names.sort_unstable();
    names.join(", ")
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry with the built-in `process`, `dry_run` and `heuristic` components.
pub fn default_registry() -> ComponentRegistry {
    let mut reg = ComponentRegistry::new();
    reg.register_agent("process", |cfg| Arc::new(ProcessAgent::from_config(cfg)));
    reg.register_agent("dry_run", |_| Arc::new(DryRunAgent));
    reg.register_scorer("heuristic", |_| Arc::new(HeuristicScorer));
    reg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_resolves_builtins() {
        let reg = default_registry();
        let cfg = ComponentConfig::default();
        assert_eq!(reg.agent(&cfg).unwrap().name(), "process");
        assert_eq!(reg.scorer(&cfg).unwrap().name(), "heuristic");

        let cfg = ComponentConfig {
            agent: "dry_run".into(),
            ..Default::default()
        };
        assert_eq!(reg.agent(&cfg).unwrap().name(), "dry_run");
    }

    #[test]
    fn unknown_names_are_config_errors() {
        let reg = default_registry();
        let cfg = ComponentConfig {
            agent: "telepathy".into(),
            ..Default::default()
        };
        match reg.agent(&cfg) {
            Err(OrchestraError::Config(msg)) => {
                assert!(msg.contains("telepathy"));
                assert!(msg.contains("dry_run, process"));
            }
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("expected an error"),
        }
    }

    #[test]
    fn custom_registration() {
        let mut reg = ComponentRegistry::new();
        assert!(!reg.has_agent("dry_run"));
        reg.register_agent("dry_run", |_| Arc::new(DryRunAgent));
        assert!(reg.has_agent("dry_run"));
        assert!(!reg.has_scorer("heuristic"));
    }
}
