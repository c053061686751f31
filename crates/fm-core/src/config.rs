use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration loaded from `~/.foreman/config.toml`.
///
/// Every section has serde defaults so a missing or partial file still
/// yields a runnable configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
}

impl Config {
    /// Load config from `~/.foreman/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings not expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.concurrency_limit == 0 {
            return Err(ConfigError::Validation(
                "scheduler.concurrency_limit must be at least 1".into(),
            ));
        }
        if self.model.max_retries == 0 {
            return Err(ConfigError::Validation(
                "model.max_retries must be at least 1".into(),
            ));
        }
        if self.agents.max_iterations == 0 {
            return Err(ConfigError::Validation(
                "agents.max_iterations must be at least 1".into(),
            ));
        }
        if self.agents.stall_threshold == 0 {
            return Err(ConfigError::Validation(
                "agents.stall_threshold must be at least 1".into(),
            ));
        }
        if self.agents.history_max_turns < 4 {
            return Err(ConfigError::Validation(
                "agents.history_max_turns must be at least 4".into(),
            ));
        }
        if self.workspace.integration_branch.trim().is_empty() {
            return Err(ConfigError::Validation(
                "workspace.integration_branch must not be empty".into(),
            ));
        }
        Ok(())
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".foreman")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON-formatted logs instead of human-readable output.
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Which provider the binary wires up: "stub" or "script".
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Executable for the "script" provider; it receives the conversation
    /// as JSON on stdin and prints the completion text.
    #[serde(default)]
    pub script_path: Option<PathBuf>,
    #[serde(default = "default_model_retries")]
    pub max_retries: u32,
    /// First retry waits this long; later retries double it.
    #[serde(default = "default_backoff_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl ModelConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            script_path: None,
            max_retries: default_model_retries(),
            backoff_base_secs: default_backoff_secs(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_provider() -> String {
    "stub".into()
}
fn default_model_retries() -> u32 {
    3
}
fn default_backoff_secs() -> u64 {
    2
}
fn default_request_timeout() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound on concurrently active SWE agents.
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: u32,
    /// Attempts a task may consume; the attempt that spends the last one
    /// makes it permanently Failed.
    #[serde(default = "default_task_retries")]
    pub max_task_retries: u32,
    /// PM re-planning rounds after a run ends with unfinished tasks.
    /// Zero disables re-planning.
    #[serde(default)]
    pub max_replans: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: default_concurrency_limit(),
            max_task_retries: default_task_retries(),
            max_replans: 0,
        }
    }
}

fn default_concurrency_limit() -> u32 {
    4
}
fn default_task_retries() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// Iteration budget per agent instance.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Consecutive iterations without a recognized directive before the
    /// agent is aborted as stalled.
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold: u32,
    /// Conversation turns kept before the oldest non-seed turns are
    /// trimmed.
    #[serde(default = "default_history_max_turns")]
    pub history_max_turns: usize,
    #[serde(default = "default_iteration_timeout")]
    pub iteration_timeout_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Iterations the PM may spend inspecting files before it must emit a
    /// plan document.
    #[serde(default = "default_planning_iterations")]
    pub planning_max_iterations: u32,
}

impl AgentsConfig {
    pub fn iteration_timeout(&self) -> Duration {
        Duration::from_secs(self.iteration_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            stall_threshold: default_stall_threshold(),
            history_max_turns: default_history_max_turns(),
            iteration_timeout_secs: default_iteration_timeout(),
            command_timeout_secs: default_command_timeout(),
            planning_max_iterations: default_planning_iterations(),
        }
    }
}

fn default_max_iterations() -> u32 {
    15
}
fn default_stall_threshold() -> u32 {
    3
}
fn default_history_max_turns() -> usize {
    80
}
fn default_iteration_timeout() -> u64 {
    300
}
fn default_command_timeout() -> u64 {
    60
}
fn default_planning_iterations() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Branch that accumulates verified task results.
    #[serde(default = "default_integration_branch")]
    pub integration_branch: String,
    /// Directory (under the repo root) holding per-task working copies.
    #[serde(default = "default_workdir_name")]
    pub workdir_name: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            integration_branch: default_integration_branch(),
            workdir_name: default_workdir_name(),
        }
    }
}

fn default_integration_branch() -> String {
    "main".into()
}
fn default_workdir_name() -> String {
    ".workdirs".into()
}
