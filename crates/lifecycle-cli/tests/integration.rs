#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn lifecyclectl(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("lifecyclectl").unwrap();
    cmd.current_dir(dir.path())
        .env("LIFECYCLE_ROOT", dir.path())
        .env("LIFECYCLE_IDENTITY", "admin");
    cmd
}

fn init(dir: &TempDir) {
    lifecyclectl(dir).arg("init").assert().success();
}

/// Write `content` into the temp dir and return its path as a string arg.
fn write_file(dir: &TempDir, name: &str, content: &str) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path.to_string_lossy().into_owned()
}

const DELETE_POLICY: &str = "\
name: deletePolicy
phases:
  - name: delete
    min_age: 0s
    actions:
      - type: delete
";

const NIGHTLY: &str = "\
id: nightly
name: snap
schedule: 0 30 1 * * ?
repository: backups
retention:
  expire_after: 30d
  min_count: 5
  max_count: 50
";

fn put_delete_policy(dir: &TempDir) {
    let file = write_file(dir, "delete.yaml", DELETE_POLICY);
    lifecyclectl(dir)
        .args(["policy", "put", &file])
        .assert()
        .success();
}

// ---------------------------------------------------------------------------
// init
// ---------------------------------------------------------------------------

#[test]
fn init_creates_config_and_store() {
    let dir = TempDir::new().unwrap();
    lifecyclectl(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("created: .lifecycle/config.yaml"));

    assert!(dir.path().join(".lifecycle").is_dir());
    assert!(dir.path().join(".lifecycle/config.yaml").exists());
    assert!(dir.path().join(".lifecycle/state.redb").exists());
}

#[test]
fn init_is_idempotent() {
    let dir = TempDir::new().unwrap();
    init(&dir);
    lifecyclectl(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("exists:  .lifecycle/config.yaml"));
}

#[test]
fn commands_before_init_fail() {
    let dir = TempDir::new().unwrap();
    lifecyclectl(&dir)
        .args(["policy", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not initialized"));
}

// ---------------------------------------------------------------------------
// policy
// ---------------------------------------------------------------------------

#[test]
fn policy_put_list_show() {
    let dir = TempDir::new().unwrap();
    init(&dir);
    put_delete_policy(&dir);

    lifecyclectl(&dir)
        .args(["policy", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("deletePolicy"))
        .stdout(predicate::str::contains("admin"));

    let output = lifecyclectl(&dir)
        .args(["--json", "policy", "show", "deletePolicy"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["version"], 1);
    assert_eq!(json["identity"]["principal"], "admin");
    assert_eq!(json["phases"][0]["actions"][0]["type"], "delete");
}

#[test]
fn policy_put_again_bumps_version() {
    let dir = TempDir::new().unwrap();
    init(&dir);
    put_delete_policy(&dir);
    put_delete_policy(&dir);
    lifecyclectl(&dir)
        .args(["policy", "show", "deletePolicy"])
        .assert()
        .success()
        .stdout(predicate::str::contains("version: 2"));
}

#[test]
fn policy_put_without_identity_fails() {
    let dir = TempDir::new().unwrap();
    init(&dir);
    let file = write_file(&dir, "delete.yaml", DELETE_POLICY);
    lifecyclectl(&dir)
        .env_remove("LIFECYCLE_IDENTITY")
        .args(["policy", "put", &file])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--identity"));
}

#[test]
fn policy_with_delete_before_other_actions_is_rejected() {
    let dir = TempDir::new().unwrap();
    init(&dir);
    let file = write_file(
        &dir,
        "bad.yaml",
        "\
name: bad
phases:
  - name: delete
    actions:
      - type: delete
  - name: cold
    actions:
      - type: readonly
",
    );
    lifecyclectl(&dir)
        .args(["policy", "put", &file])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid policy 'bad'"));
}

#[test]
fn policy_in_use_cannot_be_deleted() {
    let dir = TempDir::new().unwrap();
    init(&dir);
    put_delete_policy(&dir);
    lifecyclectl(&dir)
        .args(["bind", "ilm-00001", "deletePolicy"])
        .assert()
        .success();

    lifecyclectl(&dir)
        .args(["policy", "delete", "deletePolicy"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("in use by 1 managed indices"));

    lifecyclectl(&dir).args(["unbind", "ilm-00001"]).assert().success();
    lifecyclectl(&dir)
        .args(["policy", "delete", "deletePolicy"])
        .assert()
        .success();
    lifecyclectl(&dir)
        .args(["policy", "show", "deletePolicy"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("policy not found"));
}

// ---------------------------------------------------------------------------
// bind / explain / retry / move
// ---------------------------------------------------------------------------

#[test]
fn bind_and_explain() {
    let dir = TempDir::new().unwrap();
    init(&dir);
    put_delete_policy(&dir);
    lifecyclectl(&dir)
        .args(["bind", "ilm-00001", "deletePolicy"])
        .assert()
        .success()
        .stdout(predicate::str::contains("as admin"));

    let output = lifecyclectl(&dir)
        .args(["--json", "explain", "ilm-00001"])
        .output()
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["managed"], true);
    assert_eq!(json["policy"], "deletePolicy");
    assert_eq!(json["phase"], "new");

    lifecyclectl(&dir)
        .args(["explain", "other"])
        .assert()
        .success()
        .stdout(predicate::str::contains("managed: false"));
}

#[test]
fn bind_to_another_policy_is_rejected() {
    let dir = TempDir::new().unwrap();
    init(&dir);
    put_delete_policy(&dir);
    let file = write_file(
        &dir,
        "ro.yaml",
        "name: ro\nphases:\n  - name: warm\n    actions:\n      - type: readonly\n",
    );
    lifecyclectl(&dir).args(["policy", "put", &file]).assert().success();
    lifecyclectl(&dir)
        .args(["bind", "ilm-00001", "deletePolicy"])
        .assert()
        .success();
    lifecyclectl(&dir)
        .args(["bind", "ilm-00001", "ro"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already managed"));
}

#[test]
fn retry_without_error_is_rejected() {
    let dir = TempDir::new().unwrap();
    init(&dir);
    put_delete_policy(&dir);
    lifecyclectl(&dir)
        .args(["bind", "ilm-00001", "deletePolicy"])
        .assert()
        .success();
    lifecyclectl(&dir)
        .args(["retry", "ilm-00001"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot retry 'ilm-00001'"));
}

#[test]
fn move_to_policy_step_and_reject_unknown() {
    let dir = TempDir::new().unwrap();
    init(&dir);
    put_delete_policy(&dir);
    lifecyclectl(&dir)
        .args(["bind", "ilm-00001", "deletePolicy"])
        .assert()
        .success();

    lifecyclectl(&dir)
        .args(["move", "ilm-00001", "--to", "hot/rollover/attempt-rollover"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not part of policy"));

    lifecyclectl(&dir)
        .args(["move", "ilm-00001", "--to", "delete"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("phase/action/step"));

    lifecyclectl(&dir)
        .args([
            "move",
            "ilm-00001",
            "--from",
            "new/complete/complete",
            "--to",
            "delete/delete/delete",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("delete/delete/delete"));
}

// ---------------------------------------------------------------------------
// mode
// ---------------------------------------------------------------------------

#[test]
fn ilm_stop_reports_stopping() {
    let dir = TempDir::new().unwrap();
    init(&dir);
    lifecyclectl(&dir)
        .args(["mode", "ilm"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ilm: running"));
    lifecyclectl(&dir)
        .args(["mode", "ilm", "stop"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ilm: stopping"));
    lifecyclectl(&dir)
        .args(["mode", "ilm", "start"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ilm: running"));
}

// ---------------------------------------------------------------------------
// slm
// ---------------------------------------------------------------------------

#[test]
fn slm_put_list_and_request_execution() {
    let dir = TempDir::new().unwrap();
    init(&dir);
    let file = write_file(&dir, "nightly.yaml", NIGHTLY);
    lifecyclectl(&dir)
        .args(["slm", "put", &file])
        .assert()
        .success()
        .stdout(predicate::str::contains("Stored snapshot policy 'nightly'"));

    lifecyclectl(&dir)
        .args(["slm", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("backups"));

    lifecyclectl(&dir)
        .args(["slm", "execute", "nightly"])
        .assert()
        .success();
    let output = lifecyclectl(&dir)
        .args(["--json", "slm", "show", "nightly"])
        .output()
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["metadata"]["execute_requested"], true);
    assert_eq!(json["policy"]["retention"]["max_count"], 50);

    lifecyclectl(&dir).args(["slm", "retention"]).assert().success();
    lifecyclectl(&dir)
        .args(["slm", "stats"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0 taken"));
}

#[test]
fn slm_put_with_bad_schedule_fails() {
    let dir = TempDir::new().unwrap();
    init(&dir);
    let file = write_file(
        &dir,
        "bad.yaml",
        "id: bad\nname: snap\nschedule: every night\nrepository: backups\n",
    );
    lifecyclectl(&dir)
        .args(["slm", "put", &file])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid schedule"));
}

#[test]
fn slm_execute_unknown_policy_fails() {
    let dir = TempDir::new().unwrap();
    init(&dir);
    lifecyclectl(&dir)
        .args(["slm", "execute", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("snapshot policy not found: nope"));
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

#[test]
fn config_defaults_are_valid() {
    let dir = TempDir::new().unwrap();
    init(&dir);
    lifecyclectl(&dir)
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Config is valid"));
    lifecyclectl(&dir)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("poll_interval: 10m"));
}

#[test]
fn config_with_zero_workers_fails_validation() {
    let dir = TempDir::new().unwrap();
    init(&dir);
    std::fs::write(dir.path().join(".lifecycle/config.yaml"), "workers: 0\n").unwrap();
    lifecyclectl(&dir)
        .args(["config", "validate"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("[error] workers must be at least 1"));
}
