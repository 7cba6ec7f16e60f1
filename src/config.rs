//! Engine configuration parsing and validation.
//!
//! The parsed [`EngineConfig`] is immutable once loaded: the scheduler and
//! every collaborator receive it by reference (or behind an `Arc`) rather
//! than reading ambient process state.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// How the composed instruction payload reaches the executor.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PromptMode {
    /// Written to the executor's stdin, which is then closed.
    #[default]
    Stdin,
    /// Appended as the final command-line argument.
    Arg,
}

/// Executor invocation settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ExecutorConfig {
    /// Executor binary (e.g., `claude`).
    pub command: String,
    /// Fixed arguments passed before the model flag and prompt.
    #[serde(default)]
    pub args: Vec<String>,
    /// Flag used to pass the model selector; omitted when empty.
    #[serde(default = "default_model_flag")]
    pub model_flag: String,
    /// Model used when a job carries no override.
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Model used for verification agents; falls back to `default_model`.
    #[serde(default)]
    pub verification_model: Option<String>,
    /// Optional file holding the base instructions given to every executor.
    #[serde(default)]
    pub prompt_file: Option<PathBuf>,
    /// Prompt delivery mode.
    #[serde(default)]
    pub prompt_mode: PromptMode,
    /// Extra environment variables passed through to the executor.
    #[serde(default)]
    pub pass_env: Vec<String>,
}

fn default_model_flag() -> String {
    "--model".into()
}

fn default_model() -> String {
    "sonnet".into()
}

/// Retry budgets for the two retryable error classes.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Attempts allowed for transient infrastructure errors.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Cooldown between transient-error retries.
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    /// Attempts allowed for no-response errors.
    #[serde(default = "default_no_response_max_retries")]
    pub no_response_max_retries: u32,
    /// Cooldown between no-response retries.
    #[serde(default = "default_no_response_cooldown_seconds")]
    pub no_response_cooldown_seconds: u64,
}

fn default_max_retries() -> u32 {
    5
}

fn default_cooldown_seconds() -> u64 {
    15
}

fn default_no_response_max_retries() -> u32 {
    3
}

fn default_no_response_cooldown_seconds() -> u64 {
    30
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            cooldown_seconds: default_cooldown_seconds(),
            no_response_max_retries: default_no_response_max_retries(),
            no_response_cooldown_seconds: default_no_response_cooldown_seconds(),
        }
    }
}

/// Parallel verification fan-out settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct VerificationConfig {
    /// Whether verification jobs fan out to several agents.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Upper bound on concurrent verification agents.
    #[serde(default = "default_max_agents")]
    pub max_agents: usize,
    /// Focus preambles, one per agent.
    #[serde(default = "default_focuses")]
    pub focuses: Vec<String>,
    /// Job id prefix identifying the verification category.
    #[serde(default = "default_id_prefix")]
    pub id_prefix: String,
}

fn default_true() -> bool {
    true
}

fn default_max_agents() -> usize {
    3
}

fn default_focuses() -> Vec<String> {
    vec![
        "desktop viewport".into(),
        "mobile viewport".into(),
        "accessibility".into(),
    ]
}

fn default_id_prefix() -> String {
    "V-".into()
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_agents: default_max_agents(),
            focuses: default_focuses(),
            id_prefix: default_id_prefix(),
        }
    }
}

/// Update merger settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct MergeConfig {
    /// Consecutive failed merges of one artifact before it is dead-lettered.
    #[serde(default = "default_merge_attempts")]
    pub max_attempts: u32,
}

fn default_merge_attempts() -> u32 {
    3
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_merge_attempts(),
        }
    }
}

/// Process registry settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub struct RegistryConfig {
    /// Terminate orphaned executor processes at startup without asking.
    #[serde(default)]
    pub auto_kill_orphans: bool,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".storyloop")
}

fn default_max_iterations() -> u32 {
    50
}

fn default_ipc_name() -> String {
    "storyloop".into()
}

/// Engine configuration parsed from `storyloop.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    /// Workspace the executor runs in.
    pub workspace_root: PathBuf,
    /// State directory, relative to the workspace root unless absolute.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Iteration cap before the engine stops with `MaxIterations`.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Named pipe / Unix socket identifier for `storyloop-ctl`.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Executor invocation settings.
    pub executor: ExecutorConfig,
    /// Retry budgets.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Verification fan-out.
    #[serde(default)]
    pub verification: VerificationConfig,
    /// Inbox merge behavior.
    #[serde(default)]
    pub merge: MergeConfig,
    /// Process registry behavior.
    #[serde(default)]
    pub registry: RegistryConfig,
}

impl EngineConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Replace the workspace root, re-running path validation.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the new root does not exist.
    pub fn with_workspace_root(mut self, root: PathBuf) -> Result<Self> {
        self.workspace_root = root;
        self.validate()?;
        Ok(self)
    }

    /// Override the iteration cap.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `max_iterations` is zero.
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Result<Self> {
        self.max_iterations = max_iterations;
        self.validate()?;
        Ok(self)
    }

    /// Absolute path of the state directory holding the job store.
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        if self.state_dir.is_absolute() {
            self.state_dir.clone()
        } else {
            self.workspace_root.join(&self.state_dir)
        }
    }

    /// Path of the staged update inbox.
    #[must_use]
    pub fn inbox_path(&self) -> PathBuf {
        self.state_path().join("inbox.json")
    }

    /// Directory receiving inbox artifacts that could not be merged.
    #[must_use]
    pub fn dead_letter_dir(&self) -> PathBuf {
        self.state_path().join("dead-letter")
    }

    /// Directory receiving retry, exhaustion, and verification incidents.
    #[must_use]
    pub fn incident_dir(&self) -> PathBuf {
        self.state_path().join("incidents")
    }

    /// Directory receiving crash postmortems.
    #[must_use]
    pub fn crash_dir(&self) -> PathBuf {
        self.state_path().join("crashes")
    }

    /// Append-only session registry file.
    #[must_use]
    pub fn registry_path(&self) -> PathBuf {
        self.state_path().join("sessions.log")
    }

    /// Cooldown applied between transient-error retries.
    #[must_use]
    pub fn general_cooldown(&self) -> Duration {
        Duration::from_secs(self.retry.cooldown_seconds)
    }

    /// Cooldown applied between no-response retries.
    #[must_use]
    pub fn no_response_cooldown(&self) -> Duration {
        Duration::from_secs(self.retry.no_response_cooldown_seconds)
    }

    /// Model used for verification agents.
    #[must_use]
    pub fn verification_model(&self) -> &str {
        self.executor
            .verification_model
            .as_deref()
            .unwrap_or(&self.executor.default_model)
    }

    fn validate(&mut self) -> Result<()> {
        if self.executor.command.trim().is_empty() {
            return Err(AppError::Config(
                "executor.command must not be empty".into(),
            ));
        }

        if self.max_iterations == 0 {
            return Err(AppError::Config(
                "max_iterations must be greater than zero".into(),
            ));
        }

        if self.retry.max_retries == 0 || self.retry.no_response_max_retries == 0 {
            return Err(AppError::Config(
                "retry budgets must allow at least one attempt".into(),
            ));
        }

        if self.merge.max_attempts == 0 {
            return Err(AppError::Config(
                "merge.max_attempts must be greater than zero".into(),
            ));
        }

        if self.verification.enabled {
            if self.verification.max_agents == 0 || self.verification.max_agents > 3 {
                return Err(AppError::Config(
                    "verification.max_agents must be between 1 and 3".into(),
                ));
            }
            if self.verification.focuses.is_empty() {
                return Err(AppError::Config(
                    "verification.focuses must not be empty".into(),
                ));
            }
        }

        let canonical_root = self
            .workspace_root
            .canonicalize()
            .map_err(|err| AppError::Config(format!("workspace_root invalid: {err}")))?;
        self.workspace_root = canonical_root;

        Ok(())
    }
}
