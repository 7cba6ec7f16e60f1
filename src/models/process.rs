//! Session registry records: one line per spawned process.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::{AppError, Result};

/// How many seconds later than its record a process may appear to have
/// started. Covers the one-second resolution of the boot time.
pub const START_TIME_SLACK_SECS: i64 = 2;

/// Role of a recorded process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    /// The engine itself.
    Engine,
    /// A single-dispatch executor.
    Executor,
    /// One agent of a parallel verification fan-out.
    Verifier,
}

impl Display for ProcessKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Engine => "engine",
            Self::Executor => "executor",
            Self::Verifier => "verifier",
        })
    }
}

impl FromStr for ProcessKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "engine" => Ok(Self::Engine),
            "executor" => Ok(Self::Executor),
            "verifier" => Ok(Self::Verifier),
            other => Err(AppError::Registry(format!("unknown process kind: {other}"))),
        }
    }
}

/// A registry line: `pid kind timestamp parentPid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    /// Recorded process id.
    pub pid: u32,
    /// Process role.
    pub kind: ProcessKind,
    /// When the process was spawned.
    pub started_at: DateTime<Utc>,
    /// Process id of the owning engine session.
    pub parent_pid: u32,
}

impl ProcessRecord {
    /// Record a process started now.
    #[must_use]
    pub fn new(pid: u32, kind: ProcessKind, parent_pid: u32) -> Self {
        Self {
            pid,
            kind,
            started_at: Utc::now(),
            parent_pid,
        }
    }

    /// Whether a live process that started at `process_started` can be the
    /// one this record describes. An unknown start time is trusted.
    #[must_use]
    pub fn is_same_process(&self, process_started: Option<DateTime<Utc>>) -> bool {
        let Some(process_started) = process_started else {
            return true;
        };
        process_started <= self.started_at + chrono::Duration::seconds(START_TIME_SLACK_SECS)
    }

    /// Render as a registry line (without trailing newline).
    #[must_use]
    pub fn to_line(&self) -> String {
        format!(
            "{} {} {} {}",
            self.pid,
            self.kind,
            self.started_at.to_rfc3339(),
            self.parent_pid
        )
    }

    /// Parse a registry line.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Registry` if the line does not have four
    /// well-formed fields.
    pub fn parse_line(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [pid, kind, timestamp, parent] = fields.as_slice() else {
            return Err(AppError::Registry(format!("malformed registry line: {line}")));
        };

        let pid = pid
            .parse()
            .map_err(|e| AppError::Registry(format!("invalid pid '{pid}': {e}")))?;
        let kind = kind.parse()?;
        let started_at = DateTime::parse_from_rfc3339(timestamp)
            .map_err(|e| AppError::Registry(format!("invalid timestamp '{timestamp}': {e}")))?
            .with_timezone(&Utc);
        let parent_pid = parent
            .parse()
            .map_err(|e| AppError::Registry(format!("invalid parent pid '{parent}': {e}")))?;

        Ok(Self {
            pid,
            kind,
            started_at,
            parent_pid,
        })
    }
}
