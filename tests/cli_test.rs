use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;
use tempfile::tempdir;

const SEED: &str = "tests/fixtures/circle_seed.json";
const CONTRIBUTIONS: &str = "tests/fixtures/contributions.csv";

#[test]
fn test_cli_end_to_end() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::new(cargo_bin!());
    cmd.arg(SEED)
        .arg("--contributions")
        .arg(CONTRIBUTIONS)
        .arg("--at")
        .arg("2026-03-02T00:00:00Z")
        .arg("--at")
        .arg("2026-03-09T00:00:00Z");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains(
            "circle_id,cycle_number,status,expected,collected,reserve_covered,platform_fee,payout,contributions,defaults,payout_attempts,payout_transaction_id",
        ))
        .stdout(predicate::str::contains(",1,closed,"))
        .stdout(predicate::str::contains("3/3"))
        .stdout(predicate::str::contains("sim_po_000001"))
        .stdout(predicate::str::contains(",2,scheduled,"));

    Ok(())
}

#[test]
fn test_cli_failing_provider_exhausts_attempts() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::new(cargo_bin!());
    cmd.arg(SEED)
        .arg("--contributions")
        .arg(CONTRIBUTIONS)
        .arg("--fail-payouts");
    for at in [
        "2026-03-02T00:00:00Z",
        "2026-03-09T00:00:00Z",
        "2026-03-09T00:15:00Z",
        "2026-03-09T00:30:00Z",
    ] {
        cmd.arg("--at").arg(at);
    }

    cmd.assert()
        .success()
        .stdout(predicate::str::contains(",1,payout_failed,"));

    Ok(())
}

#[test]
fn test_cli_writes_run_reports() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let report_path = dir.path().join("runs.json");

    let mut cmd = Command::new(cargo_bin!());
    cmd.arg(SEED)
        .arg("--at")
        .arg("2026-03-02T00:00:00Z")
        .arg("--report")
        .arg(&report_path);
    cmd.assert().success();

    let reports: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&report_path)?)?;
    assert_eq!(reports.as_array().map(Vec::len), Some(1));
    assert_eq!(reports[0]["cyclesStarted"], 1);
    assert_eq!(reports[0]["remindersSent"], 3);

    Ok(())
}

#[test]
fn test_cli_missing_seed_fails() {
    let mut cmd = Command::new(cargo_bin!());
    cmd.arg("tests/fixtures/does_not_exist.json");
    cmd.assert().failure();
}
