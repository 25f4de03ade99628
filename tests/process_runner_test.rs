//! Bounded process runner driven through /bin/sh.
#![cfg(unix)]

use std::time::{Duration, Instant};
use xcoffscan::process::{run_bounded, LaunchFailure, OutputLimits, ProcessOutcome, TRUNCATION_MARKER};

fn limits(timeout_ms: u64, max_output_bytes: u64, max_line_length: usize) -> OutputLimits {
    OutputLimits {
        timeout: Duration::from_millis(timeout_ms),
        max_output_bytes,
        max_line_length,
    }
}

fn sh(script: &str, limits: &OutputLimits) -> (ProcessOutcome, Vec<String>) {
    let mut lines = Vec::new();
    let outcome = run_bounded("/bin/sh", ["-c", script], limits, |line| lines.push(line.to_string()))
        .expect("runner fault");
    (outcome, lines)
}

#[test]
fn test_lines_delivered_in_order() {
    let (outcome, lines) = sh("printf 'one\\ntwo\\nthree'", &limits(5000, 1024, 256));
    let ProcessOutcome::Completed(report) = outcome else {
        panic!("expected completion, got {:?}", outcome);
    };
    assert_eq!(lines, vec!["one", "two", "three"]);
    assert_eq!(report.exit_code, Some(0));
    assert_eq!(report.lines, 3);
    assert_eq!(report.lines_cut, 0);
    assert!(!report.truncated);
}

#[test]
fn test_byte_budget_bounds_consumption() {
    // Endless output; only the budget stops it
    let (outcome, lines) = sh("yes abcdefghij", &limits(10_000, 4096, 256));
    let ProcessOutcome::Completed(report) = outcome else {
        panic!("expected completion, got {:?}", outcome);
    };
    assert!(report.truncated);
    assert!(report.bytes_read <= 4096);
    let delivered: usize = lines.iter().map(|l| l.len() + 1).sum();
    assert!(delivered <= 4096 + 1);
}

#[test]
fn test_long_line_is_cut() {
    let max = 64;
    let script = format!("head -c {} /dev/zero | tr '\\0' x; echo", max + 100);
    let (outcome, lines) = sh(&script, &limits(5000, 1 << 20, max));
    let ProcessOutcome::Completed(report) = outcome else {
        panic!("expected completion, got {:?}", outcome);
    };
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0], format!("{}{}", "x".repeat(max), TRUNCATION_MARKER));
    assert_eq!(report.lines_cut, 1);
    assert!(report.truncated);
    assert!(report.bytes_read < 1 << 20);
}

#[test]
fn test_timeout_terminates_process() {
    let started = Instant::now();
    let (outcome, lines) = sh("echo started; sleep 30", &limits(300, 1024, 256));
    assert!(outcome.is_timeout(), "{:?}", outcome);
    assert_eq!(lines, vec!["started"]);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn test_nonzero_exit_keeps_stderr() {
    let (outcome, _) = sh("echo 'dump: 0654-106 Cannot open' >&2; exit 2", &limits(5000, 1024, 256));
    let report = outcome.report().expect("report").clone();
    assert_eq!(report.exit_code, Some(2));
    assert!(!report.success());
    assert_eq!(report.failure_message(), "dump: 0654-106 Cannot open");
}

#[test]
fn test_launch_failure_never_calls_back() {
    let mut called = false;
    let outcome = run_bounded(
        "/no/such/xcoffscan-tool",
        Vec::<String>::new(),
        &limits(1000, 1024, 256),
        |_| called = true,
    )
    .unwrap();
    assert!(matches!(
        outcome,
        ProcessOutcome::LaunchFailed {
            kind: LaunchFailure::NotFound,
            ..
        }
    ));
    assert!(!called);
}
