//! CLI tests spawning the `conductor` binary and checking exit codes.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use conductor::exit_codes;
use conductor::io::paths::{ConductorPaths, init_conductor};
use conductor::io::store::StateStore;
use conductor::test_support::memory_store;

fn conductor(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_conductor"))
        .current_dir(root)
        .args(args)
        .output()
        .expect("run conductor")
}

#[test]
fn commands_fail_before_init() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = conductor(temp.path(), &["validate"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("conductor init"));
}

#[test]
fn advance_reports_rejection_then_conflict() {
    let temp = tempfile::tempdir().expect("tempdir");
    let init = conductor(temp.path(), &["init"]);
    assert_eq!(init.status.code(), Some(exit_codes::OK));
    assert!(ConductorPaths::new(temp.path()).flows_path.exists());

    let create = conductor(temp.path(), &["create", "1", "--label", "infra"]);
    assert_eq!(create.status.code(), Some(exit_codes::OK));

    let rejected = conductor(temp.path(), &["advance", "1"]);
    assert_eq!(rejected.status.code(), Some(exit_codes::REJECTED));
    assert!(String::from_utf8_lossy(&rejected.stderr).contains("plan.md"));

    fs::write(temp.path().join("plan.md"), "# Plan\n").expect("write plan");
    let advanced = conductor(temp.path(), &["advance", "1", "--expected-version", "1"]);
    assert_eq!(advanced.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&advanced.stdout).contains("plan -> implement/code"));

    let stale = conductor(temp.path(), &["advance", "1", "--expected-version", "1"]);
    assert_eq!(stale.status.code(), Some(exit_codes::CONFLICT));

    let item = memory_store(temp.path()).read("1").expect("read");
    assert_eq!(item.version, 2);
    assert_eq!(item.labels, vec!["infra".to_string()]);
}

#[test]
fn approve_without_pending_review_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_conductor(temp.path(), false).expect("init");
    conductor(temp.path(), &["create", "1"]);
    let output = conductor(temp.path(), &["approve", "1"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("no pending review"));
}

#[test]
fn redirect_reports_the_new_position() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_conductor(temp.path(), false).expect("init");
    conductor(temp.path(), &["create", "1"]);
    let output = conductor(
        temp.path(),
        &["redirect", "1", "--from", "plan", "--to", "implement"],
    );
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&output.stdout).contains("plan -> implement/code (v2)"));
    let item = memory_store(temp.path()).read("1").expect("read");
    assert_eq!(item.position().to_string(), "implement/code");
}
