use crate::run_command;
use runexec::{EnvironmentConfig, ExitStatus, ResourceLimitSet, RunExecutor, TerminationReason};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_sleeping_tool_is_killed_after_time_limit() {
    let executor = RunExecutor::new();
    let start = Instant::now();
    let (result, _dir) = run_command(&executor, &["sleep", "5"], &ResourceLimitSet::new().with_cpu_time(1));

    assert_eq!(result.exit_status, ExitStatus::KilledBySignal(libc::SIGKILL));
    assert!(result.cpu_time_seconds <= 2.0);
    assert!(result.was_killed_by_limit_enforcement);
    assert_eq!(result.termination_reason, Some(TerminationReason::WallTime));
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_spinning_tool_is_killed_near_cpu_time_limit() {
    let executor = RunExecutor::new();
    let (result, _dir) = run_command(
        &executor,
        &["sh", "-c", "while true; do :; done"],
        &ResourceLimitSet::new().with_cpu_time(1).with_wall_time(30),
    );

    assert!(matches!(result.exit_status, ExitStatus::KilledBySignal(_)));
    assert!(result.cpu_time_seconds >= 0.5, "CPU time {}", result.cpu_time_seconds);
    assert!(result.cpu_time_seconds <= 3.0, "CPU time {}", result.cpu_time_seconds);
    assert_eq!(result.termination_reason, Some(TerminationReason::CpuTime));
}

/// Whether `pid` exists and is not a zombie
fn is_alive(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => !matches!(
            stat.rsplit(')').next().and_then(|rest| rest.split_whitespace().next()),
            Some("Z") | Some("X")
        ),
        Err(_) => false,
    }
}

#[test]
fn test_detached_descendants_do_not_outlive_run() {
    let executor = RunExecutor::new();
    let (result, dir) = run_command(
        &executor,
        &["sh", "-c", "sleep 60 & echo $! > background.pid; exit 0"],
        &ResourceLimitSet::default(),
    );
    assert_eq!(result.exit_status, ExitStatus::Normal(0));

    let pid: i32 = std::fs::read_to_string(dir.path().join("background.pid"))
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while is_alive(pid) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
    }
    assert!(!is_alive(pid), "Background process {} of the run survived", pid);
}

#[test]
fn test_kill_all_running_interrupts_run() {
    let executor = Arc::new(RunExecutor::new());
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("output.log");

    let runner = {
        let executor = Arc::clone(&executor);
        thread::spawn(move || {
            executor.execute_run(
                &["sleep".to_string(), "30".to_string()],
                &ResourceLimitSet::default(),
                &output,
                None,
                &EnvironmentConfig::default(),
                None,
                None,
            )
        })
    };

    let deadline = Instant::now() + Duration::from_secs(10);
    while executor.running_count() == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    executor.kill_all_running();

    let result = runner.join().unwrap().unwrap();
    assert_eq!(result.exit_status, ExitStatus::KilledBySignal(libc::SIGKILL));
    assert_eq!(result.termination_reason, Some(TerminationReason::Interrupted));
    assert!(!result.was_killed_by_limit_enforcement);
    assert_eq!(executor.running_count(), 0);
}
