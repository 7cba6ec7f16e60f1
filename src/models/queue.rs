//! Queue index: job ordering and pending/blocked partitions.

use serde::{Deserialize, Serialize};

/// Persistent ordering of the job queue.
///
/// `next_job` is derived: it always mirrors the head of `pending` and is
/// recomputed by every mutating method.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueIndex {
    /// Every job id ever added, in insertion order.
    #[serde(default)]
    pub story_order: Vec<String>,
    /// Jobs ready to run, FIFO.
    #[serde(default)]
    pub pending: Vec<String>,
    /// Jobs waiting on a dependency or an explicit block.
    #[serde(default)]
    pub blocked: Vec<String>,
    /// Cached head of `pending`.
    #[serde(default)]
    pub next_job: Option<String>,
}

impl QueueIndex {
    /// Recompute `next_job` from the head of `pending`.
    pub fn refresh_next_job(&mut self) {
        self.next_job = self.pending.first().cloned();
    }

    /// Whether `id` appears in `story_order`.
    #[must_use]
    pub fn is_known(&self, id: &str) -> bool {
        self.story_order.iter().any(|s| s == id)
    }

    /// Whether `id` is in the pending set.
    #[must_use]
    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.iter().any(|s| s == id)
    }

    /// Whether `id` is in the blocked set.
    #[must_use]
    pub fn is_blocked(&self, id: &str) -> bool {
        self.blocked.iter().any(|s| s == id)
    }

    /// Append to `story_order` unless already present.
    pub fn record_order(&mut self, id: &str) {
        if !self.is_known(id) {
            self.story_order.push(id.to_owned());
        }
    }

    /// Place `id` at the tail of `pending` (set-union) and out of `blocked`.
    pub fn make_pending(&mut self, id: &str) {
        self.blocked.retain(|s| s != id);
        if !self.is_pending(id) {
            self.pending.push(id.to_owned());
        }
        self.refresh_next_job();
    }

    /// Place `id` in `blocked` (set-union) and out of `pending`.
    pub fn make_blocked(&mut self, id: &str) {
        self.pending.retain(|s| s != id);
        if !self.is_blocked(id) {
            self.blocked.push(id.to_owned());
        }
        self.refresh_next_job();
    }

    /// Remove `id` from both partitions (job finished).
    pub fn retire(&mut self, id: &str) {
        self.pending.retain(|s| s != id);
        self.blocked.retain(|s| s != id);
        self.refresh_next_job();
    }

    /// Move `id` from its current pending position to the tail.
    ///
    /// Returns `false` when `id` is not pending.
    pub fn rotate_to_tail(&mut self, id: &str) -> bool {
        let Some(pos) = self.pending.iter().position(|s| s == id) else {
            return false;
        };
        let moved = self.pending.remove(pos);
        self.pending.push(moved);
        self.refresh_next_job();
        true
    }

    /// Whether the cached pointer agrees with the pending head.
    #[must_use]
    pub fn next_job_consistent(&self) -> bool {
        self.next_job.as_deref() == self.pending.first().map(String::as_str)
    }
}
