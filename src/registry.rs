//! Append-only session registry and orphan recovery.
//!
//! `<state_dir>/sessions.log` holds one [`ProcessRecord`] line per spawned
//! process. At startup, records whose owning engine is gone but which are
//! themselves still alive are orphans from a crashed session: they are
//! reported, or terminated when auto-kill is enabled. The log is then
//! compacted to records whose process is still running. A clean shutdown
//! drops the session's own records.
//!
//! A live pid only counts as the recorded process when that process did not
//! start after the record was written. Otherwise the pid was reused by an
//! unrelated process, which is never signalled.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::models::process::{ProcessKind, ProcessRecord};
use crate::store::atomic::write_atomic;
use crate::{AppError, Result};

/// Delay between SIGTERM and SIGKILL when terminating an orphan.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(3);

/// Handle to the session registry file.
#[derive(Debug)]
pub struct SessionRegistry {
    path: PathBuf,
    engine_pid: u32,
    lock: Mutex<()>,
}

impl SessionRegistry {
    /// Registry at `path`, owned by the current process.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self::with_engine_pid(path, std::process::id())
    }

    /// Registry owned by `engine_pid`.
    #[must_use]
    pub fn with_engine_pid(path: PathBuf, engine_pid: u32) -> Self {
        Self {
            path,
            engine_pid,
            lock: Mutex::new(()),
        }
    }

    /// Registry file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record for child `pid` of this engine.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Registry` if the file cannot be appended to.
    pub fn record(&self, pid: u32, kind: ProcessKind) -> Result<()> {
        self.append(&ProcessRecord::new(pid, kind, self.engine_pid))
    }

    /// Append a record for the engine itself.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Registry` if the file cannot be appended to.
    pub fn record_engine(&self) -> Result<()> {
        self.append(&ProcessRecord::new(
            self.engine_pid,
            ProcessKind::Engine,
            parent_pid(),
        ))
    }

    fn append(&self, record: &ProcessRecord) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| AppError::Registry("registry mutex poisoned".into()))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                AppError::Registry(format!("failed to create {}: {err}", parent.display()))
            })?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| {
                AppError::Registry(format!("failed to open {}: {err}", self.path.display()))
            })?;
        writeln!(file, "{}", record.to_line())
            .map_err(|err| AppError::Registry(format!("failed to append record: {err}")))?;
        debug!(pid = record.pid, kind = %record.kind, "process recorded");
        Ok(())
    }

    /// All well-formed records; malformed lines are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Registry` if the file exists but cannot be read.
    pub fn records(&self) -> Result<Vec<ProcessRecord>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(AppError::Registry(format!(
                    "failed to read {}: {err}",
                    self.path.display()
                )))
            }
        };

        Ok(raw
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match ProcessRecord::parse_line(line) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!(%err, "skipping malformed registry line");
                    None
                }
            })
            .collect())
    }

    /// Child records whose engine is dead while they still run.
    ///
    /// # Errors
    ///
    /// Same as [`SessionRegistry::records`].
    pub fn find_orphans(&self) -> Result<Vec<ProcessRecord>> {
        self.find_orphans_with(is_alive, process_start_time)
    }

    /// [`SessionRegistry::find_orphans`] with explicit liveness and
    /// start-time lookups.
    ///
    /// # Errors
    ///
    /// Same as [`SessionRegistry::records`].
    pub fn find_orphans_with(
        &self,
        alive: impl Fn(u32) -> bool,
        started: impl Fn(u32) -> Option<DateTime<Utc>>,
    ) -> Result<Vec<ProcessRecord>> {
        Ok(self
            .records()?
            .into_iter()
            .filter(|r| r.kind != ProcessKind::Engine)
            .filter(|r| r.parent_pid != self.engine_pid && r.pid != self.engine_pid)
            .filter(|r| !alive(r.parent_pid) && alive(r.pid))
            .filter(|r| {
                let same = r.is_same_process(started(r.pid));
                if !same {
                    debug!(pid = r.pid, "pid reused since it was recorded, ignoring");
                }
                same
            })
            .collect())
    }

    /// Rewrite the log keeping only records whose process is alive and
    /// still the one recorded. Returns the number of records dropped.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Registry` or `AppError::Io` if the log cannot be
    /// read or rewritten.
    pub fn compact(&self) -> Result<usize> {
        self.compact_with(is_alive, process_start_time)
    }

    /// [`SessionRegistry::compact`] with explicit liveness and start-time
    /// lookups.
    ///
    /// # Errors
    ///
    /// Same as [`SessionRegistry::compact`].
    pub fn compact_with(
        &self,
        alive: impl Fn(u32) -> bool,
        started: impl Fn(u32) -> Option<DateTime<Utc>>,
    ) -> Result<usize> {
        self.retain(|r| alive(r.pid) && r.is_same_process(started(r.pid)))
    }

    /// Drop this engine's record and the records of its children.
    /// Returns the number of records dropped.
    ///
    /// # Errors
    ///
    /// Same as [`SessionRegistry::compact`].
    pub fn clear_session(&self) -> Result<usize> {
        let engine = self.engine_pid;
        self.retain(|r| r.pid != engine && r.parent_pid != engine)
    }

    fn retain(&self, keep: impl Fn(&ProcessRecord) -> bool) -> Result<usize> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| AppError::Registry("registry mutex poisoned".into()))?;

        if !self.path.exists() {
            return Ok(0);
        }
        let records = self.records()?;
        let total = records.len();
        let kept: Vec<String> = records
            .into_iter()
            .filter(|r| keep(r))
            .map(|r| r.to_line() + "\n")
            .collect();
        let dropped = total - kept.len();
        write_atomic(&self.path, kept.concat().as_bytes())?;
        Ok(dropped)
    }

    /// Detect orphans and terminate them when `auto_kill` is set, otherwise
    /// report them. Compacts the log afterwards.
    ///
    /// Returns the orphans found.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Registry` if the log cannot be read or compacted.
    pub async fn resolve_orphans(
        &self,
        auto_kill: bool,
        grace: Duration,
    ) -> Result<Vec<ProcessRecord>> {
        let orphans = self.find_orphans()?;

        for orphan in &orphans {
            if auto_kill {
                match terminate(orphan.pid, grace).await {
                    Ok(()) => info!(pid = orphan.pid, kind = %orphan.kind, "orphan terminated"),
                    Err(err) => warn!(%err, pid = orphan.pid, "failed to terminate orphan"),
                }
            } else {
                warn!(
                    pid = orphan.pid,
                    kind = %orphan.kind,
                    parent_pid = orphan.parent_pid,
                    started_at = %orphan.started_at,
                    "orphaned process from a previous session; rerun with --kill-orphans to terminate"
                );
            }
        }

        let dropped = self.compact()?;
        debug!(dropped, "session registry compacted");
        Ok(orphans)
    }
}

/// Whether a process with `pid` exists.
#[cfg(unix)]
#[must_use]
pub fn is_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}

/// Whether a process with `pid` exists.
#[cfg(not(unix))]
#[must_use]
pub fn is_alive(_pid: u32) -> bool {
    false
}

/// When the process `pid` started, read from `/proc`.
///
/// `None` when the process is gone or the start time is unavailable.
#[cfg(target_os = "linux")]
#[must_use]
pub fn process_start_time(pid: u32) -> Option<DateTime<Utc>> {
    // `/proc` reports times in USER_HZ, fixed at 100 for userspace.
    const USER_HZ: i64 = 100;

    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The command name may contain spaces and parentheses.
    let rest = stat.get(stat.rfind(')')? + 1..)?;
    // Fields after the name start at `state` (3); `starttime` is 22.
    let ticks: i64 = rest.split_whitespace().nth(19)?.parse().ok()?;

    let boot = fs::read_to_string("/proc/stat").ok()?;
    let btime: i64 = boot
        .lines()
        .find_map(|line| line.strip_prefix("btime "))?
        .trim()
        .parse()
        .ok()?;

    let millis = btime
        .checked_mul(1000)?
        .checked_add(ticks.checked_mul(1000)? / USER_HZ)?;
    DateTime::from_timestamp_millis(millis)
}

/// When the process `pid` started.
///
/// Not available on this platform; records are matched on pid alone.
#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn process_start_time(_pid: u32) -> Option<DateTime<Utc>> {
    None
}

/// Send SIGTERM, wait up to `grace`, then SIGKILL if still alive.
///
/// # Errors
///
/// Returns `AppError::Registry` if a signal cannot be delivered.
#[cfg(unix)]
pub async fn terminate(pid: u32, grace: Duration) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|_| AppError::Registry(format!("pid {pid} out of range")))?;
    let target = Pid::from_raw(raw);

    kill(target, Signal::SIGTERM)
        .map_err(|err| AppError::Registry(format!("SIGTERM to {pid} failed: {err}")))?;

    let step = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    while waited < grace {
        if !is_alive(pid) {
            return Ok(());
        }
        tokio::time::sleep(step).await;
        waited += step;
    }

    if is_alive(pid) {
        kill(target, Signal::SIGKILL)
            .map_err(|err| AppError::Registry(format!("SIGKILL to {pid} failed: {err}")))?;
    }
    Ok(())
}

/// Send SIGTERM, wait up to `grace`, then SIGKILL if still alive.
///
/// # Errors
///
/// Always returns `AppError::Registry` on this platform.
#[cfg(not(unix))]
pub async fn terminate(pid: u32, _grace: Duration) -> Result<()> {
    Err(AppError::Registry(format!(
        "terminating pid {pid} is not supported on this platform"
    )))
}

#[cfg(unix)]
fn parent_pid() -> u32 {
    std::os::unix::process::parent_id()
}

#[cfg(not(unix))]
fn parent_pid() -> u32 {
    0
}
