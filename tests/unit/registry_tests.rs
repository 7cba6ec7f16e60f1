use std::fs;
use std::time::Duration;

use chrono::{DateTime, Utc};

use storyloop::models::process::{ProcessKind, ProcessRecord};
use storyloop::registry::{is_alive, process_start_time, SessionRegistry};

const ENGINE: u32 = 1000;
const DEAD_ENGINE: u32 = 900;

fn registry(dir: &std::path::Path) -> SessionRegistry {
    SessionRegistry::with_engine_pid(dir.join("state/sessions.log"), ENGINE)
}

fn write_records(registry: &SessionRegistry, records: &[ProcessRecord]) {
    fs::create_dir_all(registry.path().parent().expect("parent")).expect("mkdir");
    let body: String = records.iter().map(|r| r.to_line() + "\n").collect();
    fs::write(registry.path(), body).expect("write registry");
}

#[test]
fn records_are_appended_with_owner() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry(dir.path());

    assert!(registry.records().expect("empty").is_empty());
    registry.record(2001, ProcessKind::Executor).expect("record");
    registry.record(2002, ProcessKind::Verifier).expect("record");
    registry.record_engine().expect("record engine");

    let records = registry.records().expect("records");
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].pid, 2001);
    assert_eq!(records[0].parent_pid, ENGINE);
    assert_eq!(records[1].kind, ProcessKind::Verifier);
    assert_eq!(records[2].pid, ENGINE);
    assert_eq!(records[2].kind, ProcessKind::Engine);
}

#[test]
fn malformed_lines_are_skipped() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry(dir.path());
    registry.record(2001, ProcessKind::Executor).expect("record");

    let mut raw = fs::read_to_string(registry.path()).expect("read");
    raw.push_str("garbage line\n\n42 executor not-a-time 1\n");
    fs::write(registry.path(), raw).expect("write");

    let records = registry.records().expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].pid, 2001);
}

#[test]
fn orphans_are_live_children_of_dead_engines() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry(dir.path());
    write_records(
        &registry,
        &[
            ProcessRecord::new(DEAD_ENGINE, ProcessKind::Engine, 1),
            // Live child of a dead engine.
            ProcessRecord::new(3001, ProcessKind::Executor, DEAD_ENGINE),
            // Already exited.
            ProcessRecord::new(3002, ProcessKind::Verifier, DEAD_ENGINE),
            // Belongs to the running engine.
            ProcessRecord::new(3003, ProcessKind::Executor, ENGINE),
            // Parent still alive.
            ProcessRecord::new(3004, ProcessKind::Executor, 800),
        ],
    );

    let alive = |pid: u32| matches!(pid, 3001 | 3003 | 3004 | 800);
    let orphans = registry.find_orphans_with(alive, |_| None).expect("orphans");

    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].pid, 3001);
    assert_eq!(orphans[0].kind, ProcessKind::Executor);
}

fn recorded_at(pid: u32, kind: ProcessKind, parent: u32, at: DateTime<Utc>) -> ProcessRecord {
    ProcessRecord {
        started_at: at,
        ..ProcessRecord::new(pid, kind, parent)
    }
}

#[test]
fn reused_pid_is_not_an_orphan() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry(dir.path());
    let recorded = Utc::now() - chrono::Duration::hours(1);
    write_records(
        &registry,
        &[
            // Pid now held by a process that started after the record.
            recorded_at(5001, ProcessKind::Executor, DEAD_ENGINE, recorded),
            // Same process that was recorded.
            recorded_at(5002, ProcessKind::Verifier, DEAD_ENGINE, recorded),
        ],
    );

    let alive = |pid: u32| matches!(pid, 5001 | 5002);
    let started = |pid: u32| match pid {
        5001 => Some(Utc::now()),
        _ => Some(recorded - chrono::Duration::milliseconds(50)),
    };
    let orphans = registry.find_orphans_with(alive, started).expect("orphans");

    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].pid, 5002);

    let dropped = registry.compact_with(alive, started).expect("compact");
    assert_eq!(dropped, 1);
    let remaining: Vec<u32> = registry
        .records()
        .expect("records")
        .iter()
        .map(|r| r.pid)
        .collect();
    assert_eq!(remaining, vec![5002]);
}

#[test]
fn start_time_within_slack_matches_record() {
    let at = Utc::now();
    let record = recorded_at(1, ProcessKind::Executor, 2, at);
    assert!(record.is_same_process(None));
    assert!(record.is_same_process(Some(at + chrono::Duration::seconds(1))));
    assert!(!record.is_same_process(Some(at + chrono::Duration::seconds(10))));
}

#[test]
fn clear_session_drops_own_records_only() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry(dir.path());
    write_records(
        &registry,
        &[
            ProcessRecord::new(DEAD_ENGINE, ProcessKind::Engine, 1),
            ProcessRecord::new(6001, ProcessKind::Executor, DEAD_ENGINE),
            ProcessRecord::new(ENGINE, ProcessKind::Engine, 1),
            ProcessRecord::new(6002, ProcessKind::Executor, ENGINE),
            ProcessRecord::new(6003, ProcessKind::Verifier, ENGINE),
        ],
    );

    assert_eq!(registry.clear_session().expect("clear"), 3);
    let remaining: Vec<u32> = registry
        .records()
        .expect("records")
        .iter()
        .map(|r| r.pid)
        .collect();
    assert_eq!(remaining, vec![DEAD_ENGINE, 6001]);
}

#[test]
fn compact_keeps_only_live_records() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry(dir.path());
    write_records(
        &registry,
        &[
            ProcessRecord::new(4001, ProcessKind::Executor, ENGINE),
            ProcessRecord::new(4002, ProcessKind::Executor, ENGINE),
            ProcessRecord::new(4003, ProcessKind::Verifier, ENGINE),
        ],
    );

    let dropped = registry.compact_with(|pid| pid == 4002, |_| None).expect("compact");
    assert_eq!(dropped, 2);

    let remaining: Vec<u32> = registry
        .records()
        .expect("records")
        .iter()
        .map(|r| r.pid)
        .collect();
    assert_eq!(remaining, vec![4002]);
}

#[test]
fn compact_without_log_is_noop() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry(dir.path());
    assert_eq!(registry.compact_with(|_| true, |_| None).expect("compact"), 0);
    assert!(!registry.path().exists());
}

#[tokio::test]
async fn resolve_reports_nothing_on_clean_log() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = SessionRegistry::new(dir.path().join("sessions.log"));
    registry.record_engine().expect("record engine");

    let orphans = registry
        .resolve_orphans(false, Duration::from_millis(100))
        .await
        .expect("resolve");
    assert!(orphans.is_empty());
    // The running engine survives compaction.
    assert_eq!(registry.records().expect("records").len(), 1);
}

#[cfg(unix)]
#[test]
fn liveness_check_sees_own_process() {
    assert!(is_alive(std::process::id()));
    assert!(!is_alive(0));
    assert!(!is_alive(u32::MAX));
}

#[cfg(target_os = "linux")]
#[test]
fn own_start_time_precedes_a_fresh_record() {
    let record = ProcessRecord::new(std::process::id(), ProcessKind::Engine, 1);
    let started = process_start_time(std::process::id()).expect("start time");
    assert!(started <= Utc::now() + chrono::Duration::seconds(2));
    assert!(record.is_same_process(Some(started)));
    assert!(process_start_time(u32::MAX).is_none());
}

#[cfg(unix)]
#[tokio::test]
async fn terminate_stops_a_running_process() {
    use std::os::unix::process::ExitStatusExt;

    let mut child = std::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .expect("spawn sleep");

    storyloop::registry::terminate(child.id(), Duration::from_millis(200))
        .await
        .expect("terminate");

    let status = child.wait().expect("wait");
    assert!(status.signal().is_some(), "sleep should die by signal");
}
