//! Contract tests for the on-disk job store layout.
//!
//! External generators and dashboards read these files directly, so key
//! names and optional-field omission are part of the interface.

use std::fs;

use serde_json::{json, Value};
use storyloop::models::job::{BlockReason, Job};
use storyloop::store::JobStore;

fn read_json(path: &std::path::Path) -> Value {
    serde_json::from_str(&fs::read_to_string(path).expect("read")).expect("json")
}

#[test]
fn empty_store_index_shape() {
    let dir = tempfile::tempdir().expect("tempdir");
    JobStore::init(dir.path()).expect("store init");

    assert_eq!(
        read_json(&dir.path().join("index.json")),
        json!({ "storyOrder": [], "pending": [], "blocked": [], "nextJob": null })
    );
}

#[test]
fn job_file_keys_are_camel_case() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = JobStore::init(dir.path()).expect("store init");
    store
        .append_job(
            Job::new("US-1", "Login")
                .with_description("Users sign in")
                .with_criteria(["form renders"])
                .with_model("opus"),
        )
        .expect("append");

    let job = read_json(&dir.path().join("stories/US-1.json"));
    assert_eq!(
        job,
        json!({
            "id": "US-1",
            "title": "Login",
            "description": "Users sign in",
            "acceptanceCriteria": [{ "text": "form renders", "checked": false }],
            "passes": false,
            "model": "opus"
        })
    );
}

#[test]
fn completed_and_blocked_jobs_carry_their_fields() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = JobStore::init(dir.path()).expect("store init");
    store.append_job(Job::new("US-1", "a")).expect("append");
    store
        .append_job(Job::new("US-2", "b").with_blocker("US-1"))
        .expect("append");
    store.append_job(Job::new("US-3", "c")).expect("append");
    store.mark_complete("US-1", "storyloop:abc").expect("complete");
    store
        .mark_blocked("US-3", BlockReason::Infra("no database".into()))
        .expect("block");

    let done = read_json(&dir.path().join("stories/US-1.json"));
    assert_eq!(done["passes"], true);
    assert_eq!(done["completedBy"], "storyloop:abc");
    assert!(done["completedAt"].is_string());

    let waiting = read_json(&dir.path().join("stories/US-2.json"));
    assert_eq!(waiting["blockedBy"], json!(["US-1"]));

    let held = read_json(&dir.path().join("stories/US-3.json"));
    assert_eq!(
        held["blockReason"],
        json!({ "kind": "infra", "detail": "no database" })
    );

    let index = read_json(&dir.path().join("index.json"));
    assert_eq!(index["storyOrder"], json!(["US-1", "US-2", "US-3"]));
    assert_eq!(index["pending"], json!([]));
    assert_eq!(index["blocked"], json!(["US-2", "US-3"]));
    assert_eq!(index["nextJob"], Value::Null);
}

#[test]
fn externally_written_store_loads() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::create_dir_all(dir.path().join("stories")).expect("mkdir");
    fs::write(
        dir.path().join("index.json"),
        json!({
            "storyOrder": ["US-1", "US-2"],
            "pending": ["US-1"],
            "blocked": ["US-2"],
            "nextJob": "US-1"
        })
        .to_string(),
    )
    .expect("write index");
    fs::write(
        dir.path().join("stories/US-1.json"),
        json!({ "id": "US-1", "title": "a", "acceptanceCriteria": ["one", "two"] }).to_string(),
    )
    .expect("write job");
    fs::write(
        dir.path().join("stories/US-2.json"),
        json!({ "id": "US-2", "title": "b", "blockedBy": "US-1", "passes": false }).to_string(),
    )
    .expect("write job");

    let store = JobStore::load(dir.path()).expect("load");
    assert_eq!(store.next_pending(), Some("US-1"));
    assert_eq!(store.job("US-1").expect("job").acceptance_criteria.len(), 2);
    assert_eq!(store.job("US-2").expect("job").blocked_by, vec!["US-1"]);
}

#[test]
fn overlapping_partitions_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::create_dir_all(dir.path().join("stories")).expect("mkdir");
    fs::write(
        dir.path().join("index.json"),
        json!({ "storyOrder": ["US-1"], "pending": ["US-1"], "blocked": ["US-1"] }).to_string(),
    )
    .expect("write index");
    fs::write(
        dir.path().join("stories/US-1.json"),
        json!({ "id": "US-1" }).to_string(),
    )
    .expect("write job");

    assert!(JobStore::load(dir.path()).is_err());
}
