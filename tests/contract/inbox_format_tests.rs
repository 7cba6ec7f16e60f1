//! Contract tests for the staged `inbox.json` format.

use serde_json::json;
use storyloop::models::inbox::{NewJobEntry, UpdateInbox};
use storyloop::AppError;

#[test]
fn accepts_ids_and_full_objects() {
    let inbox: UpdateInbox = serde_json::from_value(json!({
        "newJobs": [
            "US-5",
            { "id": "US-6", "title": "Export", "acceptanceCriteria": ["csv"], "blockedBy": "US-5" }
        ],
        "updateJobs": [
            { "id": "US-2", "title": "Renamed", "acceptanceCriteria": ["a", "b"] }
        ]
    }))
    .expect("inbox parses");

    assert_eq!(inbox.new_jobs.len(), 2);
    assert!(matches!(&inbox.new_jobs[0], NewJobEntry::Id(id) if id == "US-5"));
    let NewJobEntry::Job(job) = &inbox.new_jobs[1] else {
        panic!("expected a full job object");
    };
    assert_eq!(job.id, "US-6");
    assert_eq!(job.blocked_by, vec!["US-5"]);
    assert_eq!(inbox.new_jobs[1].id(), "US-6");

    let patch = &inbox.update_jobs[0];
    assert_eq!(patch.id, "US-2");
    assert_eq!(patch.fields["title"], "Renamed");
    assert!(!patch.fields.contains_key("id"));
}

#[test]
fn sections_are_optional() {
    let inbox: UpdateInbox = serde_json::from_str("{}").expect("inbox parses");
    assert!(inbox.new_jobs.is_empty());
    assert!(inbox.update_jobs.is_empty());

    let inbox: UpdateInbox =
        serde_json::from_str(r#"{"updateJobs":[{"id":"US-1","passes":true}]}"#).expect("parses");
    assert!(inbox.new_jobs.is_empty());
    assert_eq!(inbox.update_jobs.len(), 1);
}

#[test]
fn patch_without_id_is_rejected() {
    assert!(serde_json::from_str::<UpdateInbox>(r#"{"updateJobs":[{"title":"x"}]}"#).is_err());
}

#[test]
fn decode_names_the_malformed_entry() {
    let doc = json!({
        "newJobs": [{ "id": "US-2", "title": "ok" }, { "id": "US-3", "acceptanceCriteria": 7 }]
    });
    let err = UpdateInbox::decode(&doc).expect_err("bad entry");
    assert!(matches!(&err, AppError::Merge(msg) if msg.contains("newJobs[1]")), "{err}");
}

#[test]
fn decode_rejects_non_array_sections() {
    assert!(matches!(
        UpdateInbox::decode(&json!({ "updateJobs": { "id": "US-1" } })),
        Err(AppError::Merge(_))
    ));
    assert!(matches!(
        UpdateInbox::decode(&json!(["US-1"])),
        Err(AppError::Merge(_))
    ));
}

#[test]
fn decode_matches_direct_deserialization() {
    let doc = json!({ "newJobs": ["US-5"], "updateJobs": [{ "id": "US-2", "title": "t" }] });
    let decoded = UpdateInbox::decode(&doc).expect("decodes");
    let direct: UpdateInbox = serde_json::from_value(doc).expect("parses");
    assert_eq!(decoded, direct);
}
