use crate::{run_command, run_with_env};
use runexec::{EnvironmentConfig, ExitStatus, ResourceLimitSet, RunExecutor};
use std::fs;

#[test]
fn test_true_without_limits() {
    let executor = RunExecutor::new();
    let (result, _dir) = run_command(&executor, &["true"], &ResourceLimitSet::default());

    assert_eq!(result.exit_status, ExitStatus::Normal(0));
    assert!(result.cpu_time_seconds >= 0.0);
    assert!(result.captured_output.is_empty(), "Unexpected output: {:?}", result.captured_output);
    assert!(!result.was_killed_by_limit_enforcement);
    assert_eq!(result.termination_reason, None);
}

#[test]
fn test_output_and_exit_code_are_captured() {
    let executor = RunExecutor::new();
    let (result, dir) = run_command(
        &executor,
        &["sh", "-c", "echo to-stdout; echo to-stderr >&2; exit 3"],
        &ResourceLimitSet::default(),
    );

    assert_eq!(result.exit_status, ExitStatus::Normal(3));
    assert_eq!(result.captured_output, vec!["to-stdout", "to-stderr"]);

    let log = fs::read_to_string(dir.path().join("output.log")).unwrap();
    assert!(log.starts_with("sh -c echo to-stdout; echo to-stderr >&2; exit 3\n"));
    assert!(log.contains(&"-".repeat(80)));
}

#[test]
fn test_multi_line_script_output_excludes_header() {
    let executor = RunExecutor::new();
    let (result, dir) = run_command(
        &executor,
        &["sh", "-c", "echo first\necho second"],
        &ResourceLimitSet::default(),
    );

    assert_eq!(result.exit_status, ExitStatus::Normal(0));
    assert_eq!(result.captured_output, vec!["first", "second"]);

    let log = fs::read_to_string(dir.path().join("output.log")).unwrap();
    assert!(log.starts_with("sh -c echo first\\necho second\n"));
}

#[test]
fn test_missing_executable_is_launch_failure() {
    let executor = RunExecutor::new();
    let (result, _dir) = run_command(&executor, &["no-such-tool-for-runexec"], &ResourceLimitSet::default());

    assert_eq!(result.exit_status, ExitStatus::LaunchFailed);
    assert_eq!(result.wall_time_seconds, 0.0);
    assert_eq!(result.cpu_time_seconds, 0.0);
    assert!(result.captured_output[0].contains("PATH"));
}

#[test]
fn test_additional_environment_is_appended() {
    let inherited = std::env::var("PATH").expect("PATH must be set for tests");
    let mut environment = EnvironmentConfig::default();
    environment.additional.insert("PATH".to_string(), ":/x".to_string());
    environment.new.insert("RUNEXEC_TEST_VALUE".to_string(), "42".to_string());

    let executor = RunExecutor::new();
    let (result, _dir) = run_with_env(
        &executor,
        &["sh", "-c", "echo \"$PATH\"; echo \"$RUNEXEC_TEST_VALUE\""],
        &ResourceLimitSet::default(),
        &environment,
    );

    assert_eq!(result.exit_status, ExitStatus::Normal(0));
    assert_eq!(result.captured_output, vec![format!("{}:/x", inherited), "42".to_string()]);
    assert!(std::env::var("RUNEXEC_TEST_VALUE").is_err(), "Executor environment was modified");
}

#[test]
fn test_working_directory_is_used() {
    let executor = RunExecutor::new();
    let (result, dir) = run_command(&executor, &["sh", "-c", "pwd -P"], &ResourceLimitSet::default());

    let expected = fs::canonicalize(dir.path()).unwrap();
    assert_eq!(result.captured_output, vec![expected.to_string_lossy().to_string()]);
}

#[test]
fn test_large_output_is_truncated() {
    let executor = RunExecutor::new();
    let dir = tempfile::tempdir().unwrap();
    let command: Vec<String> = ["sh", "-c", "i=0; while [ $i -lt 5000 ]; do echo line$i; i=$((i+1)); done"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    let result = executor
        .execute_run(
            &command,
            &ResourceLimitSet::default(),
            &dir.path().join("output.log"),
            None,
            &EnvironmentConfig::default(),
            None,
            Some(2000),
        )
        .unwrap();

    assert_eq!(result.captured_output.first().map(String::as_str), Some("line0"));
    assert_eq!(result.captured_output.last().map(String::as_str), Some("line4999"));
    let warnings = result
        .captured_output
        .iter()
        .filter(|line| line.contains("SOME LINES IN THE MIDDLE WERE REMOVED"))
        .count();
    assert_eq!(warnings, 1);
    assert!(result.captured_output.len() < 1000);
}
