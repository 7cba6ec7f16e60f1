//! Contract tests for process exit codes and the `status` payload.

use storyloop::engine::{EngineStatus, Terminal, FATAL_EXIT_CODE};

#[test]
fn terminal_exit_codes() {
    assert_eq!(Terminal::Complete.exit_code(), 0);
    assert_eq!(Terminal::MaxIterations.exit_code(), 1);
    assert_eq!(Terminal::Blocked.exit_code(), 2);
    assert_eq!(Terminal::UserCancelled.exit_code(), 130);
    assert_eq!(FATAL_EXIT_CODE, 3);
}

#[test]
fn status_payload_shape() {
    let status = EngineStatus {
        iteration: 2,
        max_iterations: 50,
        current_job: Some("US-4".into()),
        last_outcome: Some("success".into()),
        terminal: Some(Terminal::MaxIterations),
        ..EngineStatus::default()
    };
    let value = serde_json::to_value(&status).expect("serializes");

    for key in [
        "iteration",
        "max_iterations",
        "current_job",
        "last_outcome",
        "last_error",
        "general_remaining",
        "no_response_remaining",
        "pending",
        "blocked",
        "paused",
        "false_completions",
        "terminal",
    ] {
        assert!(value.get(key).is_some(), "missing {key}");
    }
    assert_eq!(value["terminal"], "max_iterations");
    assert!(value["last_error"].is_null());
}
