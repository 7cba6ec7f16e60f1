//! Executor abstraction.
//!
//! The [`Executor`] trait decouples the scheduler from how a worker is
//! launched. [`process::ProcessExecutor`] runs an external CLI; tests use
//! scripted in-memory implementations.

pub mod process;
pub mod prompt;

use std::future::Future;
use std::pin::Pin;

use crate::models::process::ProcessKind;
use crate::Result;

/// One executor invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    /// Job being worked on.
    pub job_id: String,
    /// Model / role selector.
    pub model: String,
    /// Composed instruction payload.
    pub prompt: String,
    /// Fresh identifier for this attempt; never reused.
    pub session_id: String,
    /// Registry role of the spawned process.
    pub kind: ProcessKind,
    /// Human-readable role label (e.g. `worker`, `verifier-2`).
    pub role: String,
}

/// Captured result of an executor run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutorOutput {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Exit status; `None` when unavailable.
    pub exit_code: Option<i32>,
}

impl ExecutorOutput {
    /// Output of a run that exited with `code` after printing `stdout`.
    #[must_use]
    pub fn new(stdout: impl Into<String>, exit_code: i32) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(exit_code),
        }
    }

    /// Attach captured stderr.
    #[must_use]
    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    /// Last `n` lines of stdout followed by stderr.
    #[must_use]
    pub fn tail(&self, n: usize) -> String {
        let lines: Vec<&str> = self.stdout.lines().chain(self.stderr.lines()).collect();
        lines[lines.len().saturating_sub(n)..].join("\n")
    }
}

/// Launches a worker for one request and collects its output.
///
/// Dropping the returned future must stop the worker; the scheduler relies
/// on this to honor cancellation mid-dispatch.
pub trait Executor: Send + Sync {
    /// Run the request to completion.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Executor`](crate::AppError::Executor) if the
    /// worker cannot be started or awaited.
    fn execute(
        &self,
        request: ExecutionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutorOutput>> + Send + '_>>;
}
