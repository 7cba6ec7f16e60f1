//! Durable JSON job store: the engine's single source of truth.
//!
//! Layout under the state directory:
//!
//! ```text
//! index.json          {storyOrder, pending, blocked, nextJob}
//! stories/<id>.json   one file per job
//! ```
//!
//! Every mutation updates the in-memory model, re-places the touched job in
//! the pending/blocked partitions, recomputes `nextJob`, and then flushes:
//! job files first, the index last. The index write is the commit point.
//! A store in deferred mode accumulates changes until [`JobStore::commit`].

pub mod atomic;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::models::job::{BlockReason, Criterion, Job};
use crate::models::queue::QueueIndex;
use crate::{AppError, Result};

use self::atomic::write_json_atomic;

const INDEX_FILE: &str = "index.json";
const STORIES_DIR: &str = "stories";

/// Fields owned by the scheduler; patches may not touch them.
const SCHEDULER_FIELDS: &[&str] = &["passes", "completedAt", "completedBy"];

/// In-memory view of the store plus pending writes.
#[derive(Debug, Clone)]
pub struct JobStore {
    root: PathBuf,
    index: QueueIndex,
    jobs: HashMap<String, Job>,
    deferred: bool,
    dirty_jobs: BTreeSet<String>,
    index_dirty: bool,
}

impl JobStore {
    /// Open the store at `root`, creating an empty one if no index exists.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the empty store cannot be written, or any
    /// error of [`JobStore::load`] if an index already exists.
    pub fn init(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if root.join(INDEX_FILE).exists() {
            return Self::load(root);
        }

        fs::create_dir_all(root.join(STORIES_DIR)).map_err(|err| {
            AppError::Io(format!("failed to create store at {}: {err}", root.display()))
        })?;

        let mut store = Self {
            root,
            index: QueueIndex::default(),
            jobs: HashMap::new(),
            deferred: false,
            dirty_jobs: BTreeSet::new(),
            index_dirty: true,
        };
        store.flush()?;
        Ok(store)
    }

    /// Load and validate the store at `root`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the index or any listed job file is
    /// missing or unparsable, or if the files are mutually inconsistent
    /// (unknown ids, overlapping partitions, dangling blockers, a passing
    /// job with open criteria).
    pub fn load(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let index_path = root.join(INDEX_FILE);
        let raw = fs::read_to_string(&index_path).map_err(|err| {
            AppError::Store(format!("cannot read index {}: {err}", index_path.display()))
        })?;
        let mut index: QueueIndex = serde_json::from_str(&raw).map_err(|err| {
            AppError::Store(format!("corrupt index {}: {err}", index_path.display()))
        })?;

        let mut jobs = HashMap::with_capacity(index.story_order.len());
        for id in &index.story_order {
            let job = read_job_file(&root, id)?;
            if jobs.insert(id.clone(), job).is_some() {
                return Err(AppError::Store(format!("duplicate id in storyOrder: {id}")));
            }
        }

        validate_consistency(&index, &jobs)?;

        let mut store = Self {
            root,
            index,
            jobs,
            deferred: false,
            dirty_jobs: BTreeSet::new(),
            index_dirty: false,
        };
        let repaired = store.reconcile_partitions();

        if !store.index.next_job_consistent() {
            warn!(
                cached = ?store.index.next_job,
                head = ?store.index.pending.first(),
                "nextJob disagrees with pending head, recomputing"
            );
            store.index.refresh_next_job();
        }

        debug!(
            root = %store.root.display(),
            jobs = store.jobs.len(),
            pending = store.index.pending.len(),
            blocked = store.index.blocked.len(),
            repaired,
            "job store loaded"
        );

        Ok(store)
    }

    /// Discard the in-memory view and re-read ground truth from disk.
    ///
    /// # Errors
    ///
    /// Same as [`JobStore::load`].
    pub fn reload(&mut self) -> Result<()> {
        *self = Self::load(self.root.clone())?;
        Ok(())
    }

    /// State directory this store lives in.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file holding job `id`.
    #[must_use]
    pub fn job_path(&self, id: &str) -> PathBuf {
        job_file(&self.root, id)
    }

    /// Queue ordering and partitions.
    #[must_use]
    pub fn index(&self) -> &QueueIndex {
        &self.index
    }

    /// Look up a job by id.
    #[must_use]
    pub fn job(&self, id: &str) -> Option<&Job> {
        self.jobs.get(id)
    }

    /// All jobs in `storyOrder`.
    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.index
            .story_order
            .iter()
            .filter_map(|id| self.jobs.get(id))
    }

    /// Head of the pending queue.
    #[must_use]
    pub fn next_pending(&self) -> Option<&str> {
        self.index.pending.first().map(String::as_str)
    }

    /// Number of pending jobs.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.index.pending.len()
    }

    /// Number of blocked jobs.
    #[must_use]
    pub fn blocked_count(&self) -> usize {
        self.index.blocked.len()
    }

    /// Blockers of `job` that do not pass yet.
    #[must_use]
    pub fn unmet_blockers<'a>(&self, job: &'a Job) -> Vec<&'a str> {
        job.blocked_by
            .iter()
            .filter(|b| !self.jobs.get(b.as_str()).is_some_and(|j| j.passes))
            .map(String::as_str)
            .collect()
    }

    /// Mark criterion `index` of job `id` checked. Checking is monotonic:
    /// an already-checked criterion is left as is.
    ///
    /// Returns whether the criterion changed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown job or criterion index,
    /// or `AppError::Io` if the write fails.
    pub fn mark_criterion(&mut self, id: &str, index: usize) -> Result<bool> {
        let job = self.job_mut(id)?;
        let changed = job.check(index)?;
        if changed {
            self.touch(id);
            self.persist()?;
        }
        Ok(changed)
    }

    /// Mark job `id` complete. `completedAt`/`completedBy` are written only
    /// the first time.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvariantViolation` if any criterion is unchecked,
    /// `AppError::NotFound` for an unknown job, or `AppError::Io` if the
    /// write fails.
    pub fn mark_complete(&mut self, id: &str, completed_by: &str) -> Result<()> {
        let job = self.job_mut(id)?;
        if let Some((index, criterion)) = job.first_unchecked() {
            return Err(AppError::InvariantViolation(format!(
                "cannot complete {id}: criterion {index} ('{}') is unchecked",
                criterion.text
            )));
        }

        job.passes = true;
        if job.completed_at.is_none() {
            job.completed_at = Some(Utc::now());
        }
        if job.completed_by.is_none() {
            job.completed_by = Some(completed_by.to_owned());
        }

        self.touch(id);
        self.place(id);
        self.persist()
    }

    /// Move job `id` to the blocked set with an explicit reason.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvariantViolation` if the job already passes,
    /// `AppError::NotFound` for an unknown job, or `AppError::Io` if the
    /// write fails.
    pub fn mark_blocked(&mut self, id: &str, reason: BlockReason) -> Result<()> {
        let job = self.job_mut(id)?;
        if job.passes {
            return Err(AppError::InvariantViolation(format!(
                "cannot block {id}: job already passes"
            )));
        }
        job.block_reason = Some(reason);

        self.touch(id);
        self.place(id);
        self.persist()
    }

    /// Clear the dependency list of job `id` and, unless it also carries an
    /// explicit block reason, move it to the tail of `pending`.
    ///
    /// Returns whether the job became pending.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown job or `AppError::Io` if
    /// the write fails.
    pub fn release_dependencies(&mut self, id: &str) -> Result<bool> {
        let job = self.job_mut(id)?;
        job.blocked_by.clear();
        let explicit = job.block_reason.is_some();

        self.touch(id);
        if !explicit {
            self.index.make_pending(id);
            self.index_dirty = true;
        }
        self.persist()?;
        Ok(!explicit)
    }

    /// Add a job. Idempotent: a known id is a no-op returning `false`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvariantViolation` if the id is not a safe file
    /// name or a blocker id is unknown, or `AppError::Io` if the write fails.
    pub fn append_job(&mut self, mut job: Job) -> Result<bool> {
        if self.jobs.contains_key(&job.id) {
            return Ok(false);
        }

        validate_id(&job.id)?;
        for blocker in &job.blocked_by {
            if blocker == &job.id {
                return Err(AppError::InvariantViolation(format!(
                    "job {} cannot block itself",
                    job.id
                )));
            }
            if !self.jobs.contains_key(blocker) {
                return Err(AppError::InvariantViolation(format!(
                    "job {} is blocked by unknown job {blocker}",
                    job.id
                )));
            }
        }

        job.normalize_passes();
        let id = job.id.clone();
        self.jobs.insert(id.clone(), job);
        self.index.record_order(&id);
        self.touch(&id);
        self.place(&id);
        self.persist()?;
        Ok(true)
    }

    /// Ensure a known job is queued, leaving its current placement alone if
    /// it already sits in `pending` or `blocked`.
    ///
    /// Returns whether the index changed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown job or `AppError::Io` if
    /// the write fails.
    pub fn ensure_queued(&mut self, id: &str) -> Result<bool> {
        let passes = self
            .jobs
            .get(id)
            .map(|j| j.passes)
            .ok_or_else(|| AppError::NotFound(format!("job {id}")))?;

        let mut changed = !self.index.is_known(id);
        self.index.record_order(id);

        if !passes && !self.index.is_pending(id) && !self.index.is_blocked(id) {
            self.place(id);
            changed = true;
        }

        if changed {
            self.index_dirty = true;
            self.persist()?;
        }
        Ok(changed)
    }

    /// Adopt a job file that an external generator wrote directly into
    /// `stories/` without going through the index.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the file is missing or unparsable, plus
    /// any error of [`JobStore::append_job`].
    pub fn adopt_job_file(&mut self, id: &str) -> Result<bool> {
        validate_id(id)?;
        let job = read_job_file(&self.root, id)?;
        self.append_job(job)
    }

    /// Shallow-merge `fields` into job `id`.
    ///
    /// Scheduler-owned fields (`passes`, `completedAt`, `completedBy`) are
    /// ignored. A rewritten criteria list keeps `checked = true` for any
    /// criterion whose text was already checked.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown job,
    /// `AppError::InvariantViolation` if the patch renames the job, names an
    /// unknown blocker, or does not produce a valid job, and `AppError::Io`
    /// if the write fails.
    pub fn apply_patch(&mut self, id: &str, fields: &Map<String, Value>) -> Result<()> {
        let current = self
            .jobs
            .get(id)
            .ok_or_else(|| AppError::NotFound(format!("job {id}")))?;

        let mut merged = match serde_json::to_value(current) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                return Err(AppError::InvariantViolation(format!(
                    "job {id} does not serialize to an object"
                )))
            }
        };

        for (key, value) in fields {
            if key == "id" {
                if value.as_str() != Some(id) {
                    return Err(AppError::InvariantViolation(format!(
                        "patch for {id} attempts to change its id to {value}"
                    )));
                }
                continue;
            }
            if SCHEDULER_FIELDS.contains(&key.as_str()) {
                warn!(job_id = id, field = %key, "ignoring scheduler-owned field in patch");
                continue;
            }
            merged.insert(key.clone(), value.clone());
        }

        let mut patched: Job = serde_json::from_value(Value::Object(merged)).map_err(|err| {
            AppError::InvariantViolation(format!("patch for {id} produces an invalid job: {err}"))
        })?;

        preserve_checked(&current.acceptance_criteria, &mut patched.acceptance_criteria);
        patched.completed_at = patched.completed_at.or(current.completed_at);
        patched.completed_by = patched.completed_by.or_else(|| current.completed_by.clone());

        for blocker in &patched.blocked_by {
            if blocker == id || !self.jobs.contains_key(blocker) {
                return Err(AppError::InvariantViolation(format!(
                    "patch for {id} names invalid blocker {blocker}"
                )));
            }
        }

        patched.normalize_passes();
        self.jobs.insert(id.to_owned(), patched);
        self.touch(id);
        self.place(id);
        self.persist()
    }

    /// Move pending job `id` to the tail of the queue.
    ///
    /// Returns `false` if the job is not pending.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the write fails.
    pub fn skip(&mut self, id: &str) -> Result<bool> {
        if !self.index.rotate_to_tail(id) {
            return Ok(false);
        }
        self.index_dirty = true;
        self.persist()?;
        Ok(true)
    }

    /// Hold writes in memory until [`JobStore::commit`].
    pub fn defer_writes(&mut self) {
        self.deferred = true;
    }

    /// Flush all deferred writes and leave deferred mode.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if any write fails.
    pub fn commit(&mut self) -> Result<()> {
        self.deferred = false;
        self.flush()
    }

    fn job_mut(&mut self, id: &str) -> Result<&mut Job> {
        self.jobs
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("job {id}")))
    }

    fn touch(&mut self, id: &str) {
        self.dirty_jobs.insert(id.to_owned());
    }

    /// Move every queued job whose partition disagrees with its own state.
    ///
    /// A passing job leaves the queue, a held job moves to `blocked`, and a
    /// blocked job with no reason and no `blockedBy` moves to `pending`.
    /// Blocked jobs whose blockers have all passed stay put for the resolver.
    /// The corrected index is written with the next mutation.
    fn reconcile_partitions(&mut self) -> usize {
        let queued: Vec<String> = self
            .index
            .pending
            .iter()
            .chain(self.index.blocked.iter())
            .cloned()
            .collect();

        let mut moved = 0;
        for id in queued {
            let Some(job) = self.jobs.get(&id) else {
                continue;
            };
            let in_blocked = self.index.is_blocked(&id);
            let belongs_blocked = job.block_reason.is_some()
                || !self.unmet_blockers(job).is_empty()
                || (in_blocked && !job.blocked_by.is_empty());
            let misplaced = if job.passes {
                true
            } else if belongs_blocked {
                !in_blocked
            } else {
                in_blocked
            };
            if !misplaced {
                continue;
            }

            warn!(
                job_id = %id,
                passes = job.passes,
                was_blocked = in_blocked,
                "queue partition disagrees with job state, repairing"
            );
            self.place(&id);
            moved += 1;
        }
        moved
    }

    /// Re-derive the partition a job belongs to from its own state.
    fn place(&mut self, id: &str) {
        let Some(job) = self.jobs.get(id) else {
            return;
        };
        let passes = job.passes;
        let held = job.block_reason.is_some() || !self.unmet_blockers(job).is_empty();

        if passes {
            self.index.retire(id);
        } else if held {
            self.index.make_blocked(id);
        } else if !self.index.is_pending(id) {
            self.index.make_pending(id);
        }
        self.index_dirty = true;
    }

    fn persist(&mut self) -> Result<()> {
        if self.deferred {
            return Ok(());
        }
        self.flush()
    }

    fn flush(&mut self) -> Result<()> {
        for id in std::mem::take(&mut self.dirty_jobs) {
            if let Some(job) = self.jobs.get(&id) {
                write_json_atomic(&job_file(&self.root, &id), job)?;
            }
            self.index_dirty = true;
        }

        if self.index_dirty {
            self.index.refresh_next_job();
            write_json_atomic(&self.root.join(INDEX_FILE), &self.index)?;
            self.index_dirty = false;
        }
        Ok(())
    }
}

fn job_file(root: &Path, id: &str) -> PathBuf {
    root.join(STORIES_DIR).join(format!("{id}.json"))
}

fn read_job_file(root: &Path, id: &str) -> Result<Job> {
    let path = job_file(root, id);
    let raw = fs::read_to_string(&path)
        .map_err(|err| AppError::Store(format!("cannot read job {}: {err}", path.display())))?;
    let job: Job = serde_json::from_str(&raw)
        .map_err(|err| AppError::Store(format!("corrupt job {}: {err}", path.display())))?;
    if job.id != id {
        return Err(AppError::Store(format!(
            "job file {} carries id {}",
            path.display(),
            job.id
        )));
    }
    Ok(job)
}

fn validate_id(id: &str) -> Result<()> {
    let safe = !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if safe {
        Ok(())
    } else {
        Err(AppError::InvariantViolation(format!(
            "job id '{id}' is not a valid file name"
        )))
    }
}

fn validate_consistency(index: &QueueIndex, jobs: &HashMap<String, Job>) -> Result<()> {
    let mut seen = HashSet::new();
    for id in index.pending.iter().chain(&index.blocked) {
        if !jobs.contains_key(id) {
            return Err(AppError::Store(format!("queued id {id} missing from storyOrder")));
        }
        if !seen.insert(id.as_str()) {
            return Err(AppError::Store(format!(
                "id {id} appears more than once across pending/blocked"
            )));
        }
    }

    for job in jobs.values() {
        if job.passes && !job.all_checked() {
            return Err(AppError::Store(format!(
                "job {} passes with unchecked criteria",
                job.id
            )));
        }
        if let Some(missing) = job.blocked_by.iter().find(|b| !jobs.contains_key(*b)) {
            return Err(AppError::Store(format!(
                "job {} is blocked by unknown job {missing}",
                job.id
            )));
        }
    }

    Ok(())
}

/// Carry `checked = true` over to rewritten criteria with the same text.
fn preserve_checked(previous: &[Criterion], next: &mut [Criterion]) {
    let done: HashSet<&str> = previous
        .iter()
        .filter(|c| c.checked)
        .map(|c| c.text.as_str())
        .collect();
    for criterion in next.iter_mut() {
        if done.contains(criterion.text.as_str()) {
            criterion.checked = true;
        }
    }
}
