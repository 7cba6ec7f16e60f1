//! Hot-reload update merger.
//!
//! External collaborators stage queue changes in `inbox.json`; the merger
//! applies them at iteration boundaries. All entries are applied to a
//! cloned store with writes deferred and committed in one flush. The inbox
//! is deleted only after that commit. A failing entry aborts the merge,
//! leaves the inbox in place, and counts toward `merge.max_attempts`, after
//! which the artifact moves to the dead-letter directory. A malformed entry
//! counts the same way. Only text that is not JSON at all is dead-lettered
//! immediately.

use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{info, info_span, warn};

use crate::config::EngineConfig;
use crate::models::inbox::{NewJobEntry, UpdateInbox};
use crate::store::JobStore;
use crate::{AppError, Result};

/// Ids touched by a successful merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Jobs created from full objects or adopted from job files.
    pub added: Vec<String>,
    /// Known jobs re-queued by a bare-id entry.
    pub requeued: Vec<String>,
    /// Jobs patched by `updateJobs`.
    pub patched: Vec<String>,
}

/// Result of one merge attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// No inbox artifact present.
    NoInbox,
    /// Every entry applied and committed; the inbox was deleted.
    Merged(MergeReport),
    /// The artifact was moved aside and will not be retried.
    DeadLettered(PathBuf),
}

/// Applies the staged inbox to the job store.
#[derive(Debug)]
pub struct UpdateMerger {
    inbox_path: PathBuf,
    dead_letter_dir: PathBuf,
    max_attempts: u32,
    failures: Option<(u64, u32)>,
}

impl UpdateMerger {
    /// Construct a merger for the given paths.
    #[must_use]
    pub fn new(inbox_path: PathBuf, dead_letter_dir: PathBuf, max_attempts: u32) -> Self {
        Self {
            inbox_path,
            dead_letter_dir,
            max_attempts: max_attempts.max(1),
            failures: None,
        }
    }

    /// Construct a merger from engine configuration.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.inbox_path(),
            config.dead_letter_dir(),
            config.merge.max_attempts,
        )
    }

    /// Path the merger reads.
    #[must_use]
    pub fn inbox_path(&self) -> &Path {
        &self.inbox_path
    }

    /// Merge the inbox into `store` if one is staged.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Merge` when an entry fails and the artifact is
    /// left in place for retry, or `AppError::Io` if committing the merged
    /// store or dead-lettering fails.
    pub fn merge(&mut self, store: &mut JobStore) -> Result<MergeOutcome> {
        if !self.inbox_path.exists() {
            return Ok(MergeOutcome::NoInbox);
        }

        let span = info_span!("merge_inbox", inbox = %self.inbox_path.display());
        let _guard = span.enter();

        let raw = fs::read_to_string(&self.inbox_path)
            .map_err(|err| AppError::Merge(format!("cannot read inbox: {err}")))?;
        let fingerprint = fingerprint(&raw);

        let doc: Value = match serde_json::from_str(&raw) {
            Ok(doc) => doc,
            Err(err) => {
                warn!(%err, "inbox is not valid JSON, dead-lettering");
                return self.dead_letter().map(MergeOutcome::DeadLettered);
            }
        };
        let inbox = match UpdateInbox::decode(&doc) {
            Ok(inbox) => inbox,
            Err(err) => return self.record_failure(fingerprint, err),
        };

        let mut staged = store.clone();
        staged.defer_writes();

        let report = match apply_entries(&mut staged, &inbox) {
            Ok(report) => report,
            Err(err) => return self.record_failure(fingerprint, err),
        };

        staged.commit()?;
        *store = staged;
        self.failures = None;

        if let Err(err) = fs::remove_file(&self.inbox_path) {
            // Re-merging the same artifact is a no-op.
            warn!(%err, "merged inbox could not be deleted");
        }

        info!(
            added = report.added.len(),
            requeued = report.requeued.len(),
            patched = report.patched.len(),
            "inbox merged"
        );
        Ok(MergeOutcome::Merged(report))
    }

    fn record_failure(&mut self, fingerprint: u64, err: AppError) -> Result<MergeOutcome> {
        let attempts = match self.failures {
            Some((seen, count)) if seen == fingerprint => count + 1,
            _ => 1,
        };
        self.failures = Some((fingerprint, attempts));

        if attempts >= self.max_attempts {
            warn!(%err, attempts, "inbox merge failed repeatedly, dead-lettering");
            self.failures = None;
            return self.dead_letter().map(MergeOutcome::DeadLettered);
        }

        warn!(%err, attempts, max = self.max_attempts, "inbox merge failed, left in place");
        Err(AppError::Merge(format!(
            "attempt {attempts}/{}: {err}",
            self.max_attempts
        )))
    }

    fn dead_letter(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.dead_letter_dir).map_err(|err| {
            AppError::Io(format!(
                "failed to create dead-letter directory {}: {err}",
                self.dead_letter_dir.display()
            ))
        })?;
        let target = self.dead_letter_dir.join(format!(
            "inbox-{}.json",
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
        ));
        fs::rename(&self.inbox_path, &target).map_err(|err| {
            AppError::Io(format!(
                "failed to move inbox to {}: {err}",
                target.display()
            ))
        })?;
        warn!(path = %target.display(), "inbox dead-lettered");
        Ok(target)
    }
}

/// Convert string entries of an `acceptanceCriteria` array into
/// `{text, checked: false}` objects.
pub fn normalize_criteria(fields: &mut Map<String, Value>) {
    let Some(Value::Array(items)) = fields.get_mut("acceptanceCriteria") else {
        return;
    };
    for item in items.iter_mut() {
        if let Value::String(text) = item {
            let text = std::mem::take(text);
            *item = serde_json::json!({ "text": text, "checked": false });
        }
    }
}

fn apply_entries(store: &mut JobStore, inbox: &UpdateInbox) -> Result<MergeReport> {
    let mut report = MergeReport::default();

    for entry in &inbox.new_jobs {
        let id = entry.id().to_owned();
        match entry {
            NewJobEntry::Job(_) | NewJobEntry::Id(_) if store.job(&id).is_some() => {
                if store.ensure_queued(&id)? {
                    report.requeued.push(id);
                }
            }
            NewJobEntry::Job(job) => {
                store.append_job(job.as_ref().clone())?;
                report.added.push(id);
            }
            NewJobEntry::Id(_) => {
                store.adopt_job_file(&id).map_err(|err| {
                    AppError::Merge(format!("newJobs entry {id} has no job file: {err}"))
                })?;
                report.added.push(id);
            }
        }
    }

    for patch in &inbox.update_jobs {
        let mut fields = patch.fields.clone();
        normalize_criteria(&mut fields);
        store.apply_patch(&patch.id, &fields)?;
        report.patched.push(patch.id.clone());
    }

    Ok(report)
}

fn fingerprint(raw: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    raw.hash(&mut hasher);
    hasher.finish()
}
