use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;

#[test]
fn test_cli_reports_result_as_json() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("run.log");

    Command::cargo_bin("runexec")
        .unwrap()
        .arg("--output")
        .arg(&output)
        .args(["--", "echo", "hello from runexec"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""type": "normal""#))
        .stdout(predicate::str::contains("hello from runexec"));

    assert!(fs::read_to_string(&output).unwrap().starts_with("echo hello from runexec\n"));
}

#[test]
fn test_cli_accepts_json_request() {
    let dir = tempfile::tempdir().unwrap();
    let request = dir.path().join("request.json");
    let output = dir.path().join("run.log");
    fs::write(
        &request,
        serde_json::json!({
            "command": ["sh", "-c", "exit 7"],
            "output_path": output,
        })
        .to_string(),
    )
    .unwrap();

    Command::cargo_bin("runexec")
        .unwrap()
        .arg("--request")
        .arg(&request)
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""value": 7"#));
}

#[test]
fn test_cli_rejects_malformed_request() {
    let dir = tempfile::tempdir().unwrap();
    let request = dir.path().join("request.json");
    fs::write(&request, r#"{"command": ["true"], "output_path": "x", "eval": "os.system('x')"}"#).unwrap();

    Command::cargo_bin("runexec")
        .unwrap()
        .arg("--request")
        .arg(&request)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid run request"));
}

#[test]
fn test_cli_requires_command() {
    Command::cargo_bin("runexec")
        .unwrap()
        .assert()
        .failure()
        .stderr(predicate::str::contains("command must not be empty"));
}
