//! Read-only queue observer.
//!
//! Watches the state directory with `notify`, re-loads the store after each
//! change, and publishes a [`QueueSnapshot`] on a watch channel. It never
//! writes to the store; load failures (for instance mid-rename reads) are
//! logged and the previous snapshot stays current.

use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::store::JobStore;
use crate::{AppError, Result};

/// Display-oriented view of the queue.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    /// Pending ids, head first.
    pub pending: Vec<String>,
    /// Blocked ids.
    pub blocked: Vec<String>,
    /// Cached head of `pending`.
    pub next_job: Option<String>,
    /// Jobs ever recorded.
    pub total: usize,
    /// Jobs that pass.
    pub passing: usize,
}

impl QueueSnapshot {
    /// Snapshot of `store`.
    #[must_use]
    pub fn from_store(store: &JobStore) -> Self {
        let index = store.index();
        Self {
            pending: index.pending.clone(),
            blocked: index.blocked.clone(),
            next_job: index.next_job.clone(),
            total: index.story_order.len(),
            passing: store.jobs().filter(|j| j.passes).count(),
        }
    }
}

/// Start watching the store at `root`.
///
/// # Errors
///
/// Returns `AppError::Io` if the file watcher cannot be created.
pub fn spawn_observer(
    root: PathBuf,
    cancel: CancellationToken,
) -> Result<(watch::Receiver<QueueSnapshot>, JoinHandle<()>)> {
    let initial = load_snapshot(&root).unwrap_or_default();
    let (tx, rx) = watch::channel(initial);
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<()>();

    let mut watcher = notify::recommended_watcher(
        move |result: std::result::Result<Event, notify::Error>| match result {
            Ok(event) if is_store_event(&event) => {
                let _ = event_tx.send(());
            }
            Ok(_) => {}
            Err(err) => warn!(%err, "store watcher error"),
        },
    )
    .map_err(|err| AppError::Io(format!("failed to create store watcher: {err}")))?;

    watcher
        .watch(&root, RecursiveMode::NonRecursive)
        .map_err(|err| AppError::Io(format!("failed to watch {}: {err}", root.display())))?;

    let span = info_span!("observer", root = %root.display());
    let handle = tokio::spawn(
        async move {
            let _watcher = watcher;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = event_rx.recv() => {
                        if event.is_none() {
                            break;
                        }
                        while event_rx.try_recv().is_ok() {}
                        match load_snapshot(&root) {
                            Ok(snapshot) => {
                                tx.send_if_modified(|current| {
                                    if *current == snapshot {
                                        false
                                    } else {
                                        *current = snapshot;
                                        true
                                    }
                                });
                            }
                            Err(err) => debug!(%err, "snapshot skipped"),
                        }
                    }
                }
            }
            debug!("observer stopped");
        }
        .instrument(span),
    );

    Ok((rx, handle))
}

fn load_snapshot(root: &Path) -> Result<QueueSnapshot> {
    JobStore::load(root.to_owned()).map(|store| QueueSnapshot::from_store(&store))
}

fn is_store_event(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) && event
        .paths
        .iter()
        .any(|p| p.file_name().is_some_and(|n| n == "index.json"))
}
