//! Incident and crash postmortem files.
//!
//! Retry, exhaustion, and verification incidents are written as one
//! timestamped JSON document each under `<state_dir>/incidents/`. Fatal
//! errors produce a plain-text postmortem under `<state_dir>/crashes/`.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::models::outcome::ErrorClass;
use crate::store::atomic::{write_atomic, write_json_atomic};
use crate::Result;

use super::verification::FailureReason;

const FILE_TIMESTAMP: &str = "%Y%m%dT%H%M%S%.3fZ";

/// What happened.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IncidentEvent {
    /// A retryable failure within budget; the job will be re-dispatched.
    Retry {
        /// Failure class.
        error_class: ErrorClass,
        /// Failures of this class so far.
        attempt: u32,
        /// Dispatches left.
        remaining: u32,
        /// Cooldown before the retry.
        cooldown_seconds: u64,
    },
    /// A retry budget ran out; the job stays pending untouched.
    Exhausted {
        /// Failure class.
        error_class: ErrorClass,
        /// Failures of this class.
        attempts: u32,
    },
    /// A verification job failed AND-aggregation.
    VerificationFailed {
        /// One entry per failing agent.
        failures: Vec<FailureReason>,
    },
}

impl IncidentEvent {
    fn slug(&self) -> &'static str {
        match self {
            Self::Retry { .. } => "retry",
            Self::Exhausted { .. } => "exhausted",
            Self::VerificationFailed { .. } => "verification",
        }
    }
}

/// One incident document.
#[derive(Debug, Clone, Serialize)]
pub struct Incident {
    /// When the incident was recorded.
    pub timestamp: DateTime<Utc>,
    /// Scheduler iteration.
    pub iteration: u32,
    /// Job being dispatched.
    pub job_id: String,
    /// Session of the failing attempt, if a single dispatch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Event details.
    #[serde(flatten)]
    pub event: IncidentEvent,
    /// Tail of the executor output.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub output_tail: String,
}

impl Incident {
    /// Incident stamped now.
    #[must_use]
    pub fn new(iteration: u32, job_id: impl Into<String>, event: IncidentEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            iteration,
            job_id: job_id.into(),
            session_id: None,
            event,
            output_tail: String::new(),
        }
    }

    /// Attach the failing session id.
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Attach the tail of the executor output.
    #[must_use]
    pub fn with_output_tail(mut self, tail: impl Into<String>) -> Self {
        self.output_tail = tail.into();
        self
    }
}

/// Writes incident documents into a directory.
#[derive(Debug)]
pub struct IncidentLog {
    dir: PathBuf,
    seq: AtomicU64,
}

impl IncidentLog {
    /// Log writing into `dir`, created on first write.
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            seq: AtomicU64::new(0),
        }
    }

    /// Directory incidents are written to.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `incident` and return its path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the file cannot be written.
    pub fn record(&self, incident: &Incident) -> Result<PathBuf> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let name = format!(
            "{}-{seq:03}-{}-{}.json",
            incident.timestamp.format(FILE_TIMESTAMP),
            incident.event.slug(),
            incident.job_id
        );
        let path = self.dir.join(name);
        write_json_atomic(&path, incident)?;
        warn!(path = %path.display(), event = incident.event.slug(), "incident recorded");
        Ok(path)
    }
}

/// Postmortem written before the engine exits on a fatal error.
#[derive(Debug, Clone, Default)]
pub struct CrashReport {
    /// Iteration during which the error occurred.
    pub iteration: u32,
    /// Job being processed, if any.
    pub job_id: Option<String>,
    /// First unchecked criterion of that job.
    pub last_unchecked: Option<String>,
    /// Error message.
    pub error: String,
    /// Tail of the last executor output.
    pub output_tail: String,
    /// Recent version-control history of the workspace.
    pub git_history: Option<String>,
}

impl CrashReport {
    /// Render the report as plain text.
    #[must_use]
    pub fn render(&self, at: DateTime<Utc>) -> String {
        let mut text = String::new();
        let _ = writeln!(text, "storyloop crash report");
        let _ = writeln!(text, "time: {}", at.to_rfc3339());
        let _ = writeln!(text, "iteration: {}", self.iteration);
        let _ = writeln!(text, "job: {}", self.job_id.as_deref().unwrap_or("-"));
        let _ = writeln!(
            text,
            "last unchecked criterion: {}",
            self.last_unchecked.as_deref().unwrap_or("-")
        );
        let _ = writeln!(text, "error: {}", self.error);
        let _ = writeln!(text, "\n--- output tail ---\n{}", self.output_tail);
        let _ = writeln!(
            text,
            "\n--- recent commits ---\n{}",
            self.git_history.as_deref().unwrap_or("(unavailable)")
        );
        text
    }

    /// Write the report into `dir` and return its path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the file cannot be written.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        let now = Utc::now();
        let path = dir.join(format!("crash-{}.txt", now.format(FILE_TIMESTAMP)));
        write_atomic(&path, self.render(now).as_bytes())?;
        Ok(path)
    }
}

/// `git log --oneline -n 5` in `workspace`, or `None` when git is missing
/// or the workspace is not a repository.
pub async fn git_history(workspace: &Path) -> Option<String> {
    let output = Command::new("git")
        .args(["log", "--oneline", "-n", "5"])
        .current_dir(workspace)
        .kill_on_drop(true)
        .output()
        .await;
    match output {
        Ok(out) if out.status.success() => {
            Some(String::from_utf8_lossy(&out.stdout).trim_end().to_owned())
        }
        Ok(out) => {
            debug!(status = ?out.status, "git log unavailable");
            None
        }
        Err(err) => {
            debug!(%err, "git not runnable");
            None
        }
    }
}
