//! Tests for the client CLI argument-to-request mapping
//!
//! The binary's modules are not a library, so these tests drive the same
//! mapping through a copy of the public surface: `clap` parsing into the
//! wire request is covered by unit tests inside the binary; here we check
//! the installed binary's help/version behave.

use std::process::Command;

fn binary() -> Command {
    Command::new(env!("CARGO_BIN_EXE_lbfeedback"))
}

#[test]
fn test_help_lists_both_personalities() {
    let output = binary().arg("--help").output().unwrap();
    assert!(output.status.success());
    let help = String::from_utf8_lossy(&output.stdout);
    assert!(help.contains("run-agent"));
    assert!(help.contains("status"));
    assert!(help.contains("force"));
}

#[test]
fn test_version_flag() {
    let output = binary().arg("--version").output().unwrap();
    assert!(output.status.success());
    let version = String::from_utf8_lossy(&output.stdout);
    assert!(version.contains("lbfeedback"));
}

#[test]
fn test_unknown_action_exits_nonzero() {
    let output = binary().arg("frobnicate").output().unwrap();
    assert!(!output.status.success());
}

#[test]
fn test_client_without_config_reports_error() {
    let dir = tempfile::tempdir().unwrap();
    let output = binary()
        .env("LBFEEDBACK_CONFIG_DIR", dir.path())
        .args(["status"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("no agent configuration found"),
        "stderr was: {stderr}"
    );
}
