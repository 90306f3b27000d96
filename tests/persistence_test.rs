#![cfg(feature = "storage-rocksdb")]

use assert_cmd::cargo_bin;
use std::process::Command;
use tempfile::tempdir;

#[test]
fn test_rocksdb_state_survives_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("engine_db");

    // 1. First run: open cycle 1
    let mut cmd1 = Command::new(cargo_bin!("cycle-engine"));
    cmd1.arg("tests/fixtures/circle_seed.json")
        .arg("--db-path")
        .arg(&db_path)
        .arg("--at")
        .arg("2026-03-02T00:00:00Z");

    let output1 = cmd1.output().expect("Failed to execute command");
    assert!(output1.status.success());
    let stdout1 = String::from_utf8_lossy(&output1.stdout);
    assert!(stdout1.contains(",1,collecting,"));

    // 2. Second run: contributions land on the cycle opened by the first run
    let mut cmd2 = Command::new(cargo_bin!("cycle-engine"));
    cmd2.arg("tests/fixtures/circle_seed.json")
        .arg("--contributions")
        .arg("tests/fixtures/contributions.csv")
        .arg("--db-path")
        .arg(&db_path)
        .arg("--at")
        .arg("2026-03-09T00:00:00Z");

    let output2 = cmd2.output().expect("Failed to execute command");
    assert!(output2.status.success());
    let stdout2 = String::from_utf8_lossy(&output2.stdout);
    assert!(stdout2.contains(",1,closed,"));
    assert!(stdout2.contains("3/3"));
}
