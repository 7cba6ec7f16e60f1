use serde_json::json;
use storyloop::models::job::{BlockReason, Criterion, Job, JobCategory};
use storyloop::models::outcome::{ErrorClass, Outcome};
use storyloop::models::process::{ProcessKind, ProcessRecord};
use storyloop::models::queue::QueueIndex;

#[test]
fn category_follows_id_prefix() {
    assert_eq!(JobCategory::from_id("US-12"), JobCategory::Story);
    assert_eq!(JobCategory::from_id("V-3"), JobCategory::Verification);
    assert_eq!(JobCategory::from_id("BUG-7"), JobCategory::Bug);
    assert_eq!(JobCategory::from_id("CHORE-1"), JobCategory::Other);
    assert_eq!(Job::new("V-1", "t").category().label(), "verification");
}

#[test]
fn criteria_accept_plain_strings() {
    let job: Job = serde_json::from_value(json!({
        "id": "US-1",
        "title": "t",
        "acceptanceCriteria": ["plain", { "text": "done", "checked": true }]
    }))
    .expect("job parses");

    assert_eq!(
        job.acceptance_criteria,
        vec![
            Criterion::new("plain"),
            Criterion {
                text: "done".into(),
                checked: true
            }
        ]
    );
    assert_eq!(job.first_unchecked().map(|(i, _)| i), Some(0));
    assert_eq!(job.unchecked_count(), 1);
}

#[test]
fn blocked_by_accepts_null_string_or_list() {
    for (raw, expected) in [
        (json!(null), Vec::<String>::new()),
        (json!(""), vec![]),
        (json!("US-1"), vec!["US-1".to_owned()]),
        (json!(["US-1", "", "US-2"]), vec!["US-1".into(), "US-2".into()]),
    ] {
        let job: Job = serde_json::from_value(json!({ "id": "US-9", "blockedBy": raw }))
            .expect("job parses");
        assert_eq!(job.blocked_by, expected);
    }
}

#[test]
fn serialization_uses_camel_case_and_omits_empty_fields() {
    let job = Job::new("US-1", "t").with_criteria(["a"]);
    let value = serde_json::to_value(&job).expect("serializes");

    assert!(value.get("acceptanceCriteria").is_some());
    assert!(value.get("blockedBy").is_none());
    assert!(value.get("completedAt").is_none());
    assert!(value.get("blockReason").is_none());
    assert_eq!(value["passes"], false);
}

#[test]
fn block_reason_wire_shape() {
    let reason = BlockReason::Decision("pick a vendor".into());
    assert_eq!(
        serde_json::to_value(&reason).expect("serializes"),
        json!({ "kind": "decision", "detail": "pick a vendor" })
    );
    assert_eq!(
        BlockReason::from_kind(" INFRA ", "ci down"),
        Some(BlockReason::Infra("ci down".into()))
    );
    assert_eq!(BlockReason::from_kind("mood", "meh"), None);
}

#[test]
fn passes_cannot_survive_open_criteria() {
    let mut job = Job::new("US-1", "t").with_criteria(["a"]);
    job.passes = true;
    job.normalize_passes();
    assert!(!job.passes);

    let mut empty = Job::new("US-2", "t");
    empty.passes = true;
    empty.normalize_passes();
    assert!(empty.passes, "a job without criteria is vacuously complete");
}

#[test]
fn check_reports_out_of_range_index() {
    let mut job = Job::new("US-1", "t").with_criteria(["a"]);
    assert!(job.check(0).expect("in range"));
    assert!(!job.check(0).expect("idempotent"));
    assert!(job.check(1).is_err());
}

#[test]
fn outcome_error_classes() {
    assert_eq!(Outcome::NoResponseError.error_class(), Some(ErrorClass::NoResponse));
    assert_eq!(
        Outcome::TransientInfraError.error_class(),
        Some(ErrorClass::TransientInfra)
    );
    for outcome in [
        Outcome::Success,
        Outcome::SignalComplete,
        Outcome::SignalAllBlocked,
        Outcome::UserCancelled,
    ] {
        assert_eq!(outcome.error_class(), None);
    }
}

#[test]
fn queue_index_defaults_missing_fields() {
    let index: QueueIndex = serde_json::from_str(r#"{"storyOrder":["US-1"]}"#).expect("parses");
    assert!(index.pending.is_empty());
    assert_eq!(index.next_job, None);
    assert!(index.is_known("US-1"));
}

#[test]
fn process_record_line_format() {
    let record = ProcessRecord::new(4242, ProcessKind::Verifier, 100);
    let line = record.to_line();
    assert!(line.starts_with("4242 verifier "));
    assert!(line.ends_with(" 100"));
    assert_eq!(ProcessRecord::parse_line(&line).expect("parses"), record);

    assert!(ProcessRecord::parse_line("4242 verifier").is_err());
    assert!(ProcessRecord::parse_line("x executor 2024-01-01T00:00:00Z 1").is_err());
    assert!(ProcessRecord::parse_line("1 daemon 2024-01-01T00:00:00Z 1").is_err());
}
