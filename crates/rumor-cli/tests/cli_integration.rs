//! CLI Integration Tests
//!
//! These tests verify argument validation and the input loop of the
//! `rumor` binary end-to-end.

use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::NamedTempFile;

const PEER_HEX: &str = "af1657d1b3d9ddeef844f8c5bddb9ee29e83bc07f72f8ee991de18ca3675329e";

// ============================================================================
// Test Utilities
// ============================================================================

fn cli_cmd() -> Command {
    Command::cargo_bin("rumor").expect("Failed to find rumor binary")
}

fn config_file(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file
}

// ============================================================================
// Argument Validation
// ============================================================================

#[test]
fn test_help() {
    cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("gossip"))
        .stdout(predicate::str::contains("--topic"))
        .stdout(predicate::str::contains("--no-relay"));
}

#[test]
fn test_invalid_topic_fails() {
    cli_cmd()
        .args(["--no-relay", "--topic", "01ag"])
        .write_stdin("exit\n")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid topic"));
}

#[test]
fn test_short_topic_fails() {
    cli_cmd()
        .args(["--no-relay", "--topic", "0x01af"])
        .write_stdin("exit\n")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Expected 32 bytes"));
}

#[test]
fn test_single_positional_is_rejected() {
    cli_cmd()
        .args(["--no-relay", PEER_HEX])
        .assert()
        .failure()
        .stderr(predicate::str::contains("required"));
}

#[test]
fn test_too_many_positionals_rejected() {
    cli_cmd()
        .args(["--no-relay", PEER_HEX, "127.0.0.1:1", "extra"])
        .assert()
        .failure();
}

#[test]
fn test_invalid_bootstrap_identity_fails() {
    cli_cmd()
        .args(["--no-relay", "abcd", "127.0.0.1:4433"])
        .write_stdin("exit\n")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid bootstrap peer"));
}

#[test]
fn test_invalid_secret_key_fails() {
    cli_cmd()
        .args(["--no-relay", "--secret-key", "zz"])
        .write_stdin("exit\n")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid secret key"));
}

#[test]
fn test_invalid_config_fails() {
    let config = config_file(r#"{"max_payload_size": 0}"#);

    cli_cmd()
        .arg("--no-relay")
        .arg("--config")
        .arg(config.path())
        .write_stdin("exit\n")
        .assert()
        .failure()
        .stderr(predicate::str::contains("max_payload_size"));
}

#[test]
fn test_unparseable_config_fails() {
    let config = config_file("not json");

    cli_cmd()
        .arg("--no-relay")
        .arg("--config")
        .arg(config.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid config"));
}

// ============================================================================
// Chat Loop
// ============================================================================

#[test]
fn test_exit_line_shuts_down_cleanly() {
    cli_cmd()
        .arg("--no-relay")
        .write_stdin("hello\nEXIT\n")
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .success()
        .stdout(predicate::str::contains("[App] Node ID:"))
        .stdout(predicate::str::contains("[App] Application finished."));
}

#[test]
fn test_padded_lines_are_sent_and_padded_exit_quits() {
    cli_cmd()
        .arg("--no-relay")
        .write_stdin("  indented message\n   \n  exit  \n")
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .success()
        .stderr(predicate::str::contains("Failed to send").not())
        .stdout(predicate::str::contains("[App] Application finished."));
}

#[test]
fn test_end_of_input_shuts_down_cleanly() {
    cli_cmd()
        .arg("--no-relay")
        .write_stdin("")
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .success()
        .stdout(predicate::str::contains("[App] Application finished."));
}

#[test]
fn test_fixed_secret_key_sets_node_id() {
    let output = cli_cmd()
        .args(["--no-relay", "--secret-key", &"01".repeat(32)])
        .write_stdin("exit\n")
        .timeout(std::time::Duration::from_secs(30))
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let id_line = stdout
        .lines()
        .find_map(|line| line.strip_prefix("[App] Node ID: "))
        .expect("node id printed");
    assert_eq!(id_line.trim().len(), 64);

    // Same key, same identity
    let again = cli_cmd()
        .args(["--no-relay", "--secret-key", &"01".repeat(32)])
        .write_stdin("exit\n")
        .timeout(std::time::Duration::from_secs(30))
        .output()
        .unwrap();
    assert!(String::from_utf8_lossy(&again.stdout).contains(id_line));
}
