//! `harmonia.toml` parsing.
//!
//! The engine sections (`[health]`, `[coordinator]`, ...) are read straight
//! into [`HarmoniaConfig`]; the CLI adds shell-command agents, a static task
//! list and an optional journal file.

use harmonia_core::{HarmoniaConfig, HarmoniaError, HarmoniaResult};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct CliConfig {
    #[serde(flatten)]
    pub engine: HarmoniaConfig,
    /// JSON-lines journal of evolution records and harmony snapshots.
    #[serde(default)]
    pub journal_path: Option<PathBuf>,
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

/// An agent backed by shell commands.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSpec {
    pub id: String,
    pub capabilities: Vec<String>,
    /// Exit status 0 means healthy. Without one the agent is always healthy.
    #[serde(default)]
    pub probe_command: Option<String>,
    pub execute_command: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub capability: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Names of tasks declared earlier in the file.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub priority: i64,
}

impl CliConfig {
    pub fn from_toml_str(content: &str) -> HarmoniaResult<Self> {
        let config: CliConfig = toml::from_str(content)
            .map_err(|e| HarmoniaError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> HarmoniaResult<()> {
        self.engine.validate()?;

        let mut agent_ids = HashSet::new();
        for agent in &self.agents {
            if !agent_ids.insert(agent.id.as_str()) {
                return Err(HarmoniaError::DuplicateId(agent.id.clone()));
            }
            if agent.capabilities.is_empty() {
                return Err(HarmoniaError::Config(format!(
                    "agent '{}' declares no capabilities",
                    agent.id
                )));
            }
            if agent.execute_command.trim().is_empty() {
                return Err(HarmoniaError::Config(format!(
                    "agent '{}' has an empty execute_command",
                    agent.id
                )));
            }
        }

        let mut declared = HashSet::new();
        for task in &self.tasks {
            for dep in &task.depends_on {
                if !declared.contains(dep.as_str()) {
                    return Err(HarmoniaError::Config(format!(
                        "task '{}' depends on '{}', which is not declared before it",
                        task.name, dep
                    )));
                }
            }
            if !declared.insert(task.name.as_str()) {
                return Err(HarmoniaError::Config(format!(
                    "task name '{}' is declared twice",
                    task.name
                )));
            }
        }
        Ok(())
    }
}

/// Read and parse a config file.
pub fn load_config(path: &Path) -> HarmoniaResult<CliConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        HarmoniaError::Config(format!(
            "Failed to read config '{}': {}",
            path.display(),
            e
        ))
    })?;
    CliConfig::from_toml_str(&content)
}
