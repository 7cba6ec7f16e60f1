//! Dependency resolver: promote blocked jobs whose blockers all pass.

use std::collections::{HashMap, HashSet};

use tracing::{info, warn};

use crate::store::JobStore;
use crate::Result;

/// Move every blocked job whose blockers all pass to the tail of `pending`,
/// clearing its `blockedBy` list. Jobs blocked with an explicit reason keep
/// their place in `blocked` once their dependencies clear.
///
/// Returns the ids that became pending, in the order they were released.
/// Running it twice without an intervening change is a no-op.
///
/// # Errors
///
/// Returns `AppError::Io` if a store write fails.
pub fn resolve_blocked(store: &mut JobStore) -> Result<Vec<String>> {
    let ready: Vec<String> = store
        .index()
        .blocked
        .iter()
        .filter_map(|id| store.job(id))
        .filter(|job| !job.blocked_by.is_empty() && store.unmet_blockers(job).is_empty())
        .map(|job| job.id.clone())
        .collect();

    let mut released = Vec::with_capacity(ready.len());
    for id in ready {
        if store.release_dependencies(&id)? {
            info!(job_id = %id, "blockers passed, job promoted to pending");
            released.push(id);
        }
    }

    for cycle in find_cycles(store) {
        warn!(jobs = ?cycle, "dependency cycle among blocked jobs; they cannot be released");
    }

    Ok(released)
}

/// Dependency cycles among blocked jobs, each reported once as the list of
/// ids on the cycle.
#[must_use]
pub fn find_cycles(store: &JobStore) -> Vec<Vec<String>> {
    let graph: HashMap<&str, Vec<&str>> = store
        .index()
        .blocked
        .iter()
        .filter_map(|id| store.job(id))
        .map(|job| {
            let edges = job
                .blocked_by
                .iter()
                .map(String::as_str)
                .filter(|b| store.job(b).is_some_and(|j| !j.passes))
                .collect();
            (job.id.as_str(), edges)
        })
        .collect();

    let mut done: HashSet<&str> = HashSet::new();
    let mut cycles = Vec::new();

    for start in store.index().blocked.iter().map(String::as_str) {
        if done.contains(start) {
            continue;
        }
        let mut path: Vec<&str> = Vec::new();
        walk(start, &graph, &mut path, &mut done, &mut cycles);
    }

    cycles
}

fn walk<'a>(
    node: &'a str,
    graph: &HashMap<&'a str, Vec<&'a str>>,
    path: &mut Vec<&'a str>,
    done: &mut HashSet<&'a str>,
    cycles: &mut Vec<Vec<String>>,
) {
    if let Some(pos) = path.iter().position(|n| *n == node) {
        cycles.push(path[pos..].iter().map(|s| (*s).to_owned()).collect());
        return;
    }
    if done.contains(node) {
        return;
    }

    path.push(node);
    if let Some(edges) = graph.get(node) {
        for &next in edges {
            walk(next, graph, path, done, cycles);
        }
    }
    path.pop();
    done.insert(node);
}
