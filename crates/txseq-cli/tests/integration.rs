#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use std::path::PathBuf;
use tempfile::TempDir;

fn txseq(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("txseq").unwrap();
    cmd.current_dir(dir.path()).env_remove("TXSEQ_CONFIG");
    cmd
}

fn write(dir: &TempDir, name: &str, body: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, body).unwrap();
    path
}

const WITHDRAW: &str = "
seed:
  checking: 100
steps:
  - op: increment
    key: checking
    by: -25
";

const WITHDRAW_THEN_FAIL: &str = "
seed:
  checking: 100
steps:
  - op: increment
    key: checking
    by: -25
  - op: fail
    message: unable to save the account
    style: emitter
  - op: put
    key: audit
    value: never written
";

// ---------------------------------------------------------------------------
// txseq run
// ---------------------------------------------------------------------------

#[test]
fn run_commits_withdrawal() {
    let dir = TempDir::new().unwrap();
    let plan = write(&dir, "plan.yaml", WITHDRAW);

    txseq(&dir)
        .arg("run")
        .arg(&plan)
        .assert()
        .success()
        .stdout(predicate::str::contains("Committed run"))
        .stdout(predicate::str::contains("checking  75"));
}

#[test]
fn run_json_reports_state_and_journal() {
    let dir = TempDir::new().unwrap();
    let plan = write(&dir, "plan.yaml", WITHDRAW);

    let output = txseq(&dir)
        .args(["run", "--json"])
        .arg(&plan)
        .output()
        .unwrap();
    assert!(output.status.success());

    let v: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(v["committed"], true);
    assert_eq!(v["actions_invoked"], 1);
    assert_eq!(v["state"]["checking"], 75);
    assert_eq!(v["journal"], serde_json::json!(["begin", "commit"]));
}

#[test]
fn run_failure_rolls_back_and_exits_2() {
    let dir = TempDir::new().unwrap();
    let plan = write(&dir, "plan.yaml", WITHDRAW_THEN_FAIL);

    txseq(&dir)
        .arg("run")
        .arg(&plan)
        .assert()
        .code(2)
        .stdout(predicate::str::contains("Rolled back run"))
        .stdout(predicate::str::contains("at step 1"))
        .stdout(predicate::str::contains("checking  100"))
        .stderr(predicate::str::contains(
            "error: transaction failed: unable to save the account",
        ));
}

#[test]
fn run_failure_json() {
    let dir = TempDir::new().unwrap();
    let plan = write(&dir, "plan.yaml", WITHDRAW_THEN_FAIL);

    let output = txseq(&dir)
        .args(["--json", "run"])
        .arg(&plan)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));

    let v: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(v["committed"], false);
    assert_eq!(v["outcome"], "rolled_back");
    assert_eq!(v["failed_step"], 1);
    assert_eq!(v["actions_total"], 3);
    assert_eq!(v["actions_invoked"], 2);
    assert_eq!(v["error"], "unable to save the account");
    assert_eq!(v["state"]["checking"], 100);
    assert!(v["state"].get("audit").is_none());
    assert_eq!(v["journal"], serde_json::json!(["begin", "rollback"]));
}

#[test]
fn run_empty_plan_opens_no_transaction() {
    let dir = TempDir::new().unwrap();
    let plan = write(&dir, "plan.yaml", "steps: []\n");

    let output = txseq(&dir).args(["run", "-j"]).arg(&plan).output().unwrap();
    assert!(output.status.success());
    let v: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(v["committed"], true);
    assert_eq!(v["journal"], serde_json::json!([]));
}

#[test]
fn run_uses_local_config_for_timeouts() {
    let dir = TempDir::new().unwrap();
    write(&dir, "txseq.yaml", "action_timeout_ms: 20\n");
    let plan = write(
        &dir,
        "plan.yaml",
        "steps:\n  - op: sleep\n    ms: 5000\n    style: emitter\n",
    );

    txseq(&dir)
        .arg("run")
        .arg(&plan)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("timed out"));
}

#[test]
fn run_rejects_invalid_plan() {
    let dir = TempDir::new().unwrap();
    let plan = write(&dir, "plan.yaml", "steps:\n  - op: abandon\n    style: ready\n");

    txseq(&dir)
        .arg("run")
        .arg(&plan)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("cannot use the ready style"));
}

#[test]
fn run_missing_plan_fails() {
    let dir = TempDir::new().unwrap();
    txseq(&dir)
        .args(["run", "absent.yaml"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("plan file not found"));
}

// ---------------------------------------------------------------------------
// txseq check
// ---------------------------------------------------------------------------

#[test]
fn check_accepts_valid_plan() {
    let dir = TempDir::new().unwrap();
    let plan = write(&dir, "plan.yaml", WITHDRAW_THEN_FAIL);

    txseq(&dir)
        .arg("check")
        .arg(&plan)
        .assert()
        .success()
        .stdout(predicate::str::contains("Plan is valid: 3 step(s)."));
}

#[test]
fn check_lists_issues() {
    let dir = TempDir::new().unwrap();
    let plan = write(
        &dir,
        "plan.yaml",
        "steps:\n  - op: delete\n    key: ''\n  - op: increment\n    key: n\n    by: 0\n",
    );

    let output = txseq(&dir)
        .args(["check", "--json"])
        .arg(&plan)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let v: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(v["steps"], 2);
    assert_eq!(v["issues"].as_array().unwrap().len(), 2);
    assert_eq!(v["issues"][1]["step"], 1);
}

// ---------------------------------------------------------------------------
// txseq config
// ---------------------------------------------------------------------------

#[test]
fn config_show_defaults() {
    let dir = TempDir::new().unwrap();
    txseq(&dir)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("built-in defaults"))
        .stdout(predicate::str::contains("log_rollback_failures: true"));
}

#[test]
fn config_show_reads_env_path() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "custom.yaml", "run_timeout_ms: 1500\n");

    let output = txseq(&dir)
        .args(["config", "show", "--json"])
        .env("TXSEQ_CONFIG", &path)
        .output()
        .unwrap();
    assert!(output.status.success());
    let v: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(v["config"]["run_timeout_ms"], 1500);
}

#[test]
fn config_validate_flags_zero_timeout() {
    let dir = TempDir::new().unwrap();
    write(&dir, "txseq.yaml", "action_timeout_ms: 0\n");

    txseq(&dir)
        .args(["config", "validate"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("[error] action_timeout_ms is 0"))
        .stderr(predicate::str::contains("config validation found errors"));
}

#[test]
fn config_validate_clean() {
    let dir = TempDir::new().unwrap();
    txseq(&dir)
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Config is valid"));
}
