//! Parallel verification fan-out and its effect on the queue.

use std::fs;
use std::sync::Arc;

use storyloop::engine::classifier::{DefaultClassifier, COMPLETE_SENTINEL};
use storyloop::engine::verification::{VerificationDispatcher, NO_SIGNAL_REASON};
use storyloop::engine::Terminal;
use storyloop::executor::prompt::PromptComposer;
use storyloop::executor::ExecutorOutput;
use storyloop::models::job::Job;
use storyloop::models::process::ProcessKind;
use storyloop::store::JobStore;
use tokio_util::sync::CancellationToken;

use super::test_helpers::{ok, scheduler, seed_store, test_config, ScriptedExecutor};

fn verification_job() -> Job {
    Job::new("V-1", "Verify checkout").with_criteria(["renders", "is accessible"])
}

fn focuses() -> Vec<String> {
    vec!["desktop".into(), "mobile".into(), "accessibility".into()]
}

fn second_agent_fails() -> Arc<ScriptedExecutor> {
    ScriptedExecutor::from_fn(|req, _| match req.role.as_str() {
        "verifier-2" => ok("checked the page\nError: layout broken"),
        _ => ok(COMPLETE_SENTINEL),
    })
}

#[tokio::test]
async fn dispatcher_runs_one_agent_per_focus() {
    let exec = ScriptedExecutor::always(ok(COMPLETE_SENTINEL));
    let dispatcher = VerificationDispatcher::new(
        exec.clone(),
        Arc::new(DefaultClassifier::new().unwrap()),
        &focuses(),
        3,
    );
    assert_eq!(dispatcher.agent_count(), 3);

    let report = dispatcher
        .dispatch(&verification_job(), "model-a", &PromptComposer::new("base"))
        .await;

    assert!(report.passed());
    assert_eq!(report.verdicts.len(), 3);
    let calls = exec.calls();
    assert!(calls.iter().all(|r| r.kind == ProcessKind::Verifier));
    assert!(calls.iter().all(|r| r.model == "model-a"));
    let mut roles: Vec<_> = calls.iter().map(|r| r.role.clone()).collect();
    roles.sort();
    assert_eq!(roles, vec!["verifier-1", "verifier-2", "verifier-3"]);
    assert!(calls
        .iter()
        .any(|r| r.prompt.starts_with("Verification focus: mobile.")));
}

#[tokio::test]
async fn one_failing_agent_fails_the_job() {
    let dispatcher = VerificationDispatcher::new(
        second_agent_fails(),
        Arc::new(DefaultClassifier::new().unwrap()),
        &focuses(),
        3,
    );

    let report = dispatcher
        .dispatch(&verification_job(), "m", &PromptComposer::new("base"))
        .await;

    assert!(!report.passed());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].agent, "verifier-2");
    assert_eq!(report.failures[0].focus, "mobile");
    assert_eq!(report.failures[0].reason, "layout broken");
    assert!(report.output_tail.contains("layout broken"));
}

#[tokio::test]
async fn silent_agent_reports_generic_reason() {
    let exec = ScriptedExecutor::always(ok("looked around"));
    let dispatcher = VerificationDispatcher::new(
        exec,
        Arc::new(DefaultClassifier::new().unwrap()),
        &focuses(),
        1,
    );
    assert_eq!(dispatcher.agent_count(), 1);

    let report = dispatcher
        .dispatch(&verification_job(), "m", &PromptComposer::new("base"))
        .await;
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].reason, NO_SIGNAL_REASON);
}

#[tokio::test]
async fn cancelled_agent_marks_report_cancelled() {
    let exec = ScriptedExecutor::from_fn(|req, _| match req.role.as_str() {
        "verifier-1" => ExecutorOutput::new("", 130),
        _ => ok(COMPLETE_SENTINEL),
    });
    let dispatcher = VerificationDispatcher::new(
        exec,
        Arc::new(DefaultClassifier::new().unwrap()),
        &focuses(),
        3,
    );

    let report = dispatcher
        .dispatch(&verification_job(), "m", &PromptComposer::new("base"))
        .await;
    assert!(report.cancelled);
    assert!(!report.passed());
}

#[tokio::test]
async fn scheduler_completes_verified_job() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = seed_store(&config, vec![verification_job()]);
    let exec = ScriptedExecutor::always(ok(COMPLETE_SENTINEL));

    let mut sched = scheduler(config.clone(), store, exec.clone(), CancellationToken::new());
    assert_eq!(sched.run().await.unwrap(), Terminal::Complete);
    assert_eq!(exec.call_count(), 3);

    let on_disk = JobStore::load(config.state_path()).unwrap();
    let job = on_disk.job("V-1").unwrap();
    assert!(job.passes);
    assert!(job.all_checked());
}

#[tokio::test]
async fn scheduler_leaves_failed_verification_pending() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path()).with_max_iterations(1).unwrap();
    let store = seed_store(&config, vec![verification_job()]);

    let mut sched = scheduler(
        config.clone(),
        store,
        second_agent_fails(),
        CancellationToken::new(),
    );
    assert_eq!(sched.run().await.unwrap(), Terminal::MaxIterations);

    let on_disk = JobStore::load(config.state_path()).unwrap();
    let job = on_disk.job("V-1").unwrap();
    assert!(!job.passes);
    assert_eq!(job.unchecked_count(), 2);
    assert_eq!(on_disk.next_pending(), Some("V-1"));

    let incidents: Vec<_> = fs::read_dir(config.incident_dir())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(incidents.len(), 1);
    let body: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&incidents[0]).unwrap()).unwrap();
    assert_eq!(body["event"], "verification_failed");
    assert_eq!(body["failures"][0]["reason"], "layout broken");
}

#[tokio::test]
async fn disabled_verification_dispatches_single_executor() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.verification.enabled = false;
    let store = seed_store(&config, vec![verification_job()]);
    let exec = ScriptedExecutor::always(ok("<check>0</check>\n<check>1</check>"));

    let mut sched = scheduler(config, store, exec.clone(), CancellationToken::new());
    assert_eq!(sched.run().await.unwrap(), Terminal::Complete);
    assert_eq!(exec.call_count(), 1);
    assert_eq!(exec.calls()[0].kind, ProcessKind::Executor);
}
