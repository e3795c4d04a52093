use std::collections::HashMap;

use stu_place::Place;
use tempfile::tempdir;

use super::*;

#[test]
fn resolve_shell_falls_back_to_bin_sh() {
    // SAFETY: test process, no other threads touching this env var.
    unsafe {
        std::env::remove_var("STU_SHELL");
    }
    // resolve_shell() caches in a OnceLock, so this only asserts the shape
    // of a default resolution rather than re-triggering it if another test
    // already ran first; either way it must be a non-empty path.
    assert!(!resolve_shell().as_bytes().is_empty());
}

#[test]
fn check_not_recursive_invocation_rejects_stu_status() {
    unsafe {
        std::env::set_var("STU_STATUS", "1");
    }
    let result = check_not_recursive_invocation();
    unsafe {
        std::env::remove_var("STU_STATUS");
    }
    assert!(result.is_err());
}

#[test]
fn new_job_is_not_started() {
    let job = Job::new();
    assert!(!job.started());
    assert!(!job.started_or_waited());
    assert!(job.pid().is_none());
}

#[test]
fn statistics_render_matches_expected_shape() {
    let mut stats = Statistics::default();
    stats.job_started();
    stats.job_started();
    stats.job_succeeded();
    stats.job_failed();
    let rendered = stats.render(false);
    assert_eq!(
        rendered,
        "STATISTICS  number of jobs started = 2 (1 succeeded, 1 failed)"
    );
}

#[test]
fn start_and_wait_runs_a_real_command() {
    let dir = tempdir().unwrap();
    let output_path = dir.path().join("out");

    let mut job = Job::new();
    let mut stats = Statistics::default();
    let registry = signals::PidRegistry::new();
    let mapping: HashMap<String, String> = HashMap::new();

    job.start(
        "echo hi",
        &mapping,
        Some(&output_path),
        None,
        &Place::Empty,
        &registry,
        &mut stats,
    )
    .unwrap();

    assert!(job.started());
    let pid = job.pid().unwrap();

    let (waited_pid, status) = wait_any().unwrap();
    assert_eq!(waited_pid, pid);
    let outcome = interpret_wait_status(status);
    job.mark_waited(pid, &outcome, &mut stats);

    assert_eq!(outcome, WaitOutcome::Success);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(std::fs::read_to_string(&output_path).unwrap(), "hi\n");
}

#[test]
fn failing_command_reports_exit_code() {
    let mut job = Job::new();
    let mut stats = Statistics::default();
    let registry = signals::PidRegistry::new();
    let mapping: HashMap<String, String> = HashMap::new();

    job.start("exit 3", &mapping, None, None, &Place::Empty, &registry, &mut stats)
        .unwrap();
    let pid = job.pid().unwrap();
    let (_, status) = wait_any().unwrap();
    let outcome = interpret_wait_status(status);
    job.mark_waited(pid, &outcome, &mut stats);

    assert_eq!(outcome, WaitOutcome::ExitCode(3));
    assert_eq!(stats.failed, 1);
}

#[test]
fn environment_mapping_is_visible_to_the_child() {
    let dir = tempdir().unwrap();
    let output_path = dir.path().join("out");
    let mut mapping = HashMap::new();
    mapping.insert("STU_TEST_VAR".to_string(), "hello".to_string());

    let mut job = Job::new();
    let mut stats = Statistics::default();
    let registry = signals::PidRegistry::new();

    job.start(
        "echo $STU_TEST_VAR",
        &mapping,
        Some(&output_path),
        None,
        &Place::Empty,
        &registry,
        &mut stats,
    )
    .unwrap();
    let pid = job.pid().unwrap();
    let (_, status) = wait_any().unwrap();
    let outcome = interpret_wait_status(status);
    job.mark_waited(pid, &outcome, &mut stats);

    assert_eq!(std::fs::read_to_string(&output_path).unwrap(), "hello\n");
}

#[test]
fn remove_if_existing_deletes_the_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("partial");
    std::fs::write(&path, b"partial output").unwrap();
    let c_path = std::ffi::CString::new(path.to_str().unwrap()).unwrap();

    cleanup::remove_if_existing(&c_path);

    assert!(!path.exists());
}
