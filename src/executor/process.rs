//! External CLI executor.
//!
//! Spawns the configured executor binary with:
//! - `kill_on_drop(true)` so a dropped dispatch future kills the worker.
//! - `env_clear()` plus an allowlist, so only named variables reach it.
//! - `STORYLOOP_SESSION_ID`, `STORYLOOP_JOB_ID`, `STORYLOOP_ROLE` set
//!   explicitly.
//!
//! Every spawned pid is appended to the session registry.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{EngineConfig, ExecutorConfig, PromptMode};
use crate::registry::SessionRegistry;
use crate::{AppError, Result};

use super::{ExecutionRequest, Executor, ExecutorOutput};

/// Environment variables inherited by every executor process.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH", "HOME", "USER", "LANG", "TERM", "TMPDIR", "RUST_LOG",
    // Windows-specific variables.
    "USERPROFILE", "SystemRoot", "TEMP", "TMP", "USERNAME", "APPDATA", "LOCALAPPDATA",
];

/// Runs the configured executor CLI as a child process.
pub struct ProcessExecutor {
    config: ExecutorConfig,
    workspace_root: PathBuf,
    registry: Option<Arc<SessionRegistry>>,
}

impl ProcessExecutor {
    /// Build an executor from engine configuration.
    #[must_use]
    pub fn new(config: &EngineConfig, registry: Option<Arc<SessionRegistry>>) -> Self {
        Self {
            config: config.executor.clone(),
            workspace_root: config.workspace_root.clone(),
            registry,
        }
    }

    fn command(&self, request: &ExecutionRequest) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args);

        if !self.config.model_flag.is_empty() {
            cmd.arg(&self.config.model_flag).arg(&request.model);
        }
        if self.config.prompt_mode == PromptMode::Arg {
            cmd.arg(&request.prompt);
        }

        cmd.env_clear();
        for key in ALLOWED_ENV_VARS
            .iter()
            .copied()
            .chain(self.config.pass_env.iter().map(String::as_str))
        {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }

        cmd.env("STORYLOOP_SESSION_ID", &request.session_id)
            .env("STORYLOOP_JOB_ID", &request.job_id)
            .env("STORYLOOP_ROLE", &request.role)
            .current_dir(&self.workspace_root)
            .stdin(match self.config.prompt_mode {
                PromptMode::Stdin => Stdio::piped(),
                PromptMode::Arg => Stdio::null(),
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, request: ExecutionRequest) -> Result<ExecutorOutput> {
        let mut child = self.command(&request).spawn().map_err(|err| {
            AppError::Executor(format!(
                "failed to spawn executor '{}': {err}",
                self.config.command
            ))
        })?;

        let pid = child.id().unwrap_or(0);
        info!(
            pid,
            session_id = %request.session_id,
            model = %request.model,
            "executor process spawned"
        );

        if let Some(registry) = &self.registry {
            if let Err(err) = registry.record(pid, request.kind) {
                warn!(%err, pid, "failed to record executor in session registry");
            }
        }

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = request.prompt.clone();
            tokio::spawn(async move {
                if let Err(err) = stdin.write_all(prompt.as_bytes()).await {
                    debug!(%err, "executor closed stdin before reading the full prompt");
                }
            });
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|err| AppError::Executor(format!("failed to wait for executor: {err}")))?;

        let exit_code = exit_code(&output.status);
        debug!(pid, ?exit_code, "executor process exited");

        Ok(ExecutorOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code,
        })
    }
}

impl Executor for ProcessExecutor {
    fn execute(
        &self,
        request: ExecutionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutorOutput>> + Send + '_>> {
        let span = info_span!(
            "execute",
            job_id = %request.job_id,
            role = %request.role,
        );
        Box::pin(self.run(request).instrument(span))
    }
}

/// Exit code with signal deaths reported shell-style as `128 + signal`, so
/// a worker killed by SIGINT reports 130.
fn exit_code(status: &std::process::ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Some(128 + signal);
        }
    }
    status.code()
}
