//! CLI Integration Tests
//!
//! These tests run the `matchsync` binary end-to-end: scenarios against the
//! in-memory backend and queue inspection on a temporary data directory.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// ============================================================================
// Test Utilities
// ============================================================================

/// Create a CLI command with a temporary data directory
fn cli_cmd(data_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("matchsync").expect("Failed to find matchsync binary");
    cmd.arg("--data-dir").arg(data_dir.path());
    cmd
}

// ============================================================================
// Scenario Tests
// ============================================================================

#[test]
fn test_duplicate_match_scenario() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["scenario", "duplicate-match"])
        .assert()
        .success()
        .stdout(predicate::str::contains("✓ duplicate-match"))
        .stdout(predicate::str::contains("Active matches: 1"));
}

#[test]
fn test_offline_send_scenario() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["scenario", "offline-send", "--count", "4"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Replayed: 4"))
        .stdout(predicate::str::contains("Bob unread: 4"));
}

#[test]
fn test_unread_roundtrip_scenario() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["scenario", "unread-roundtrip"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Unread before read: 3"))
        .stdout(predicate::str::contains("Unread after read: 0"));
}

#[test]
fn test_all_scenarios() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["scenario", "all"])
        .assert()
        .success()
        .stdout(predicate::str::contains("All scenarios passed"));
}

#[test]
fn test_offline_send_rejects_zero_count() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["scenario", "offline-send", "--count", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--count must be at least 1"));
}

// ============================================================================
// Queue Command Tests
// ============================================================================

#[test]
fn test_queue_list_without_queue() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["queue", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No queue for alice"));
}

#[test]
fn test_queued_operations_survive_the_process() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["scenario", "offline-send", "--count", "3", "--stay-offline"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Queued operations: 3"));

    cli_cmd(&data_dir)
        .args(["queue", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Pending operations (3):"))
        .stdout(predicate::str::contains("send_message").count(3));

    cli_cmd(&data_dir)
        .args(["queue", "clear"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Cleared 3 pending operations"));

    cli_cmd(&data_dir)
        .args(["queue", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Queue is empty"));
}

#[test]
fn test_leftover_queue_does_not_break_next_run() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["scenario", "offline-send", "--count", "2", "--stay-offline"])
        .assert()
        .success();

    cli_cmd(&data_dir)
        .args(["scenario", "offline-send", "--count", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Replayed: 2"));
}

// ============================================================================
// Config Tests
// ============================================================================

#[test]
fn test_config_defaults() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"message_page_size\": 50"))
        .stdout(predicate::str::contains("\"profile_fanout\": 8"));
}

#[test]
fn test_config_file_overrides() {
    let data_dir = TempDir::new().unwrap();
    let config = data_dir.path().join("config.json");
    std::fs::write(&config, r#"{ "message_page_size": 20 }"#).unwrap();

    cli_cmd(&data_dir)
        .arg("--config")
        .arg(&config)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"message_page_size\": 20"))
        .stdout(predicate::str::contains("\"listen_timeout_ms\": 10000"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let data_dir = TempDir::new().unwrap();
    let config = data_dir.path().join("config.json");
    std::fs::write(&config, r#"{ "profile_fanout": 0 }"#).unwrap();

    cli_cmd(&data_dir)
        .arg("--config")
        .arg(&config)
        .arg("config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("profile_fanout"));
}

#[test]
fn test_jsonl_logs_written() {
    let data_dir = TempDir::new().unwrap();
    let logs = data_dir.path().join("logs");

    cli_cmd(&data_dir)
        .arg("-v")
        .arg("--log-dir")
        .arg(&logs)
        .args(["scenario", "duplicate-match"])
        .assert()
        .success();

    let files: Vec<_> = std::fs::read_dir(&logs).unwrap().collect();
    assert_eq!(files.len(), 1);
}
