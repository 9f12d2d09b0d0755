//! End-to-end tests of the syncx binary

use assert_cmd::Command;
use predicates::prelude::*;

fn syncx() -> Command {
    Command::cargo_bin("syncx").expect("syncx binary should be built")
}

#[test]
fn test_small_run_succeeds_and_reports() {
    syncx()
        .args([
            "--callers", "8", "--keys", "2", "--rounds", "1", "--work-ms", "2",
            "--worker-threads", "2",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("flight:"))
        .stdout(predicate::str::contains("cache:"))
        .stdout(predicate::str::contains("limit:"));
}

#[test]
fn test_close_failures_are_reported_not_fatal() {
    syncx()
        .args([
            "--scenario", "cache", "--callers", "4", "--keys", "2", "--rounds", "1",
            "--work-ms", "1", "--fail-close-every", "1",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("2 close failures"));
}

#[test]
fn test_quiet_prints_nothing() {
    syncx()
        .args(["--scenario", "limit", "--callers", "4", "--rounds", "1", "--work-ms", "1", "-q"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn test_invalid_arguments_fail() {
    syncx()
        .args(["--capacity", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Capacity must be at least 1"));
}

#[test]
fn test_quiet_and_verbose_conflict() {
    syncx()
        .args(["-q", "-v"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Cannot use both --quiet and --verbose"));
}
