use serde_json::json;
use storyloop::engine::resolver::{find_cycles, resolve_blocked};
use storyloop::models::job::{BlockReason, Job};
use storyloop::store::JobStore;

fn store_with(dir: &std::path::Path, jobs: Vec<Job>) -> JobStore {
    let mut store = JobStore::init(dir.join("state")).expect("store init");
    for job in jobs {
        store.append_job(job).expect("append");
    }
    store
}

fn complete(store: &mut JobStore, id: &str) {
    let count = store.job(id).expect("job").acceptance_criteria.len();
    for index in 0..count {
        store.mark_criterion(id, index).expect("check");
    }
    store.mark_complete(id, "storyloop:test").expect("complete");
}

#[test]
fn nothing_to_release_while_blocker_open() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = store_with(
        dir.path(),
        vec![Job::new("US-1", "a"), Job::new("US-2", "b").with_blocker("US-1")],
    );

    assert!(resolve_blocked(&mut store).expect("resolve").is_empty());
    assert_eq!(store.index().blocked, vec!["US-2"]);
}

#[test]
fn released_jobs_join_the_tail_of_pending() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = store_with(
        dir.path(),
        vec![
            Job::new("US-1", "a").with_criteria(["x"]),
            Job::new("US-2", "b"),
            Job::new("US-3", "c").with_blocker("US-1"),
        ],
    );
    complete(&mut store, "US-1");

    let released = resolve_blocked(&mut store).expect("resolve");
    assert_eq!(released, vec!["US-3"]);
    assert_eq!(store.index().pending, vec!["US-2", "US-3"]);
    assert!(store.job("US-3").expect("job").blocked_by.is_empty());

    let on_disk = JobStore::load(dir.path().join("state")).expect("load");
    assert_eq!(on_disk.index().pending, vec!["US-2", "US-3"]);
}

#[test]
fn resolving_twice_is_a_noop() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = store_with(
        dir.path(),
        vec![Job::new("US-1", "a"), Job::new("US-2", "b").with_blocker("US-1")],
    );
    complete(&mut store, "US-1");

    assert_eq!(resolve_blocked(&mut store).expect("first"), vec!["US-2"]);
    let index = store.index().clone();
    assert!(resolve_blocked(&mut store).expect("second").is_empty());
    assert_eq!(store.index(), &index);
}

#[test]
fn partial_blockers_keep_job_blocked() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = store_with(
        dir.path(),
        vec![
            Job::new("US-1", "a"),
            Job::new("US-2", "b"),
            Job::new("US-3", "c").with_blocker("US-1").with_blocker("US-2"),
        ],
    );
    complete(&mut store, "US-1");

    assert!(resolve_blocked(&mut store).expect("resolve").is_empty());
    complete(&mut store, "US-2");
    assert_eq!(resolve_blocked(&mut store).expect("resolve"), vec!["US-3"]);
}

#[test]
fn explicit_block_survives_dependency_release() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut held = Job::new("US-2", "b").with_blocker("US-1");
    held.block_reason = Some(BlockReason::External("awaiting design".into()));
    let mut store = store_with(dir.path(), vec![Job::new("US-1", "a"), held]);
    complete(&mut store, "US-1");

    assert!(resolve_blocked(&mut store).expect("resolve").is_empty());
    assert_eq!(store.index().blocked, vec!["US-2"]);
    assert!(store.job("US-2").expect("job").blocked_by.is_empty());
}

#[test]
fn cycles_are_reported_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = store_with(
        dir.path(),
        vec![Job::new("US-1", "a"), Job::new("US-2", "b"), Job::new("US-3", "c")],
    );
    // Patches can introduce cycles the append path cannot.
    let patch = |id: &str| match json!({ "blockedBy": [id] }) {
        serde_json::Value::Object(map) => map,
        _ => unreachable!(),
    };
    store.apply_patch("US-1", &patch("US-2")).expect("patch");
    store.apply_patch("US-2", &patch("US-1")).expect("patch");

    let cycles = find_cycles(&store);
    assert_eq!(cycles.len(), 1);
    let mut members = cycles[0].clone();
    members.sort();
    assert_eq!(members, vec!["US-1", "US-2"]);

    assert!(resolve_blocked(&mut store).expect("resolve").is_empty());
    assert_eq!(store.index().pending, vec!["US-3"]);
}
