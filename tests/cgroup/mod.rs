use crate::run_command;
use runexec::cgroup::{CgroupHierarchy, Subsystem};
use runexec::{EnvironmentConfig, ExitStatus, ResourceLimitSet, RunExecError, RunExecutor, TerminationReason};
use serial_test::serial;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Executor whose cgroups for `subsystems` can actually be created, if any
fn executor_with(subsystems: &[Subsystem]) -> Option<RunExecutor> {
    let executor = RunExecutor::new();
    let mut probe = executor.hierarchy().allocate(subsystems);
    let usable = subsystems.iter().all(|&s| probe.path(s).is_some());
    probe.release();
    if usable {
        Some(executor)
    } else {
        println!("Skipping cgroup test - {:?} cgroups not writable", subsystems);
        None
    }
}

fn child_count(dir: &Path) -> usize {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_name().to_string_lossy().starts_with("benchmark_"))
                .count()
        })
        .unwrap_or(0)
}

#[test]
#[serial]
fn test_cgroups_are_removed_after_run() {
    let Some(executor) = executor_with(&[Subsystem::Cpuacct, Subsystem::Memory]) else {
        return;
    };
    let parents: Vec<_> = [Subsystem::Cpuacct, Subsystem::Memory]
        .iter()
        .filter_map(|&s| executor.hierarchy().path(s).map(Path::to_path_buf))
        .collect();
    let before: Vec<usize> = parents.iter().map(|p| child_count(p)).collect();

    for _ in 0..3 {
        let (result, _dir) = run_command(&executor, &["true"], &ResourceLimitSet::default());
        assert_eq!(result.exit_status, ExitStatus::Normal(0));
        assert!(result.memory_usage_bytes.is_some());
    }

    let after: Vec<usize> = parents.iter().map(|p| child_count(p)).collect();
    assert_eq!(before, after, "Cgroup directories leaked");
}

#[test]
#[serial]
fn test_release_is_idempotent() {
    let Some(executor) = executor_with(&[Subsystem::Memory]) else {
        return;
    };
    let mut allocated = executor.hierarchy().allocate(&[Subsystem::Memory]);
    let dir = allocated.directories()[0].clone();
    assert!(dir.is_dir());

    allocated.release();
    assert!(!dir.exists());
    allocated.release();
}

#[test]
#[serial]
fn test_cpu_time_measured_by_cgroup() {
    let Some(executor) = executor_with(&[Subsystem::Cpuacct]) else {
        return;
    };
    let (result, _dir) = run_command(
        &executor,
        &["sh", "-c", "i=0; while [ $i -lt 300000 ]; do i=$((i+1)); done"],
        &ResourceLimitSet::default(),
    );
    assert_eq!(result.exit_status, ExitStatus::Normal(0));
    assert!(result.cpu_time_seconds > 0.0);
    assert!(result.cpu_time_seconds <= result.wall_time_seconds * 1.5 + 0.1);
}

#[test]
#[serial]
fn test_memory_hog_is_killed_at_limit() {
    let Some(executor) = executor_with(&[Subsystem::Memory]) else {
        return;
    };
    let limit = 64 * 1024 * 1024;
    let limits = ResourceLimitSet::new().with_memory(limit).with_wall_time(60);
    let dir = tempfile::tempdir().unwrap();
    let command: Vec<String> = ["sh", "-c", "x=aaaaaaaaaaaaaaaa; while true; do x=$x$x; done"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let result = match executor.execute_run(
        &command,
        &limits,
        &dir.path().join("output.log"),
        None,
        &EnvironmentConfig::default(),
        None,
        None,
    ) {
        Ok(result) => result,
        Err(RunExecError::Config(message)) => {
            println!("Skipping memory test - {}", message);
            return;
        }
        Err(e) => panic!("Run failed: {}", e),
    };

    assert!(matches!(result.exit_status, ExitStatus::KilledBySignal(_)));
    assert_eq!(result.termination_reason, Some(TerminationReason::Memory));
    let peak = result.memory_usage_bytes.expect("memory usage must be measured");
    assert!(peak <= limit + runexec::oom::OOM_HEADROOM_BYTES, "peak {} above limit", peak);
}

#[test]
#[serial]
fn test_run_is_pinned_to_requested_cores() {
    let Some(executor) = executor_with(&[Subsystem::Cpuset]) else {
        return;
    };
    if executor.hierarchy().available_cpus().is_empty() {
        return;
    }
    let expected = executor.hierarchy().available_cpus()[0];
    let limits = ResourceLimitSet::new().with_cores(1).with_cpu_index(0);
    let (result, _dir) = run_command(
        &executor,
        &["sh", "-c", "grep Cpus_allowed_list /proc/self/status"],
        &limits,
    );

    assert_eq!(result.exit_status, ExitStatus::Normal(0));
    let allowed = result.captured_output[0].split_whitespace().last().unwrap_or_default().to_string();
    assert_eq!(allowed, expected.to_string());
}

#[test]
fn test_unjoinable_cgroup_is_reported_as_cgroup_error() {
    // A plain directory: child cgroups get created but have no tasks file
    let parent = tempfile::tempdir().unwrap();
    let hierarchy = CgroupHierarchy::from_paths(
        HashMap::from([(Subsystem::Cpuacct, parent.path().to_path_buf())]),
        Vec::new(),
    );
    let executor = RunExecutor::with_hierarchy(hierarchy);
    let dir = tempfile::tempdir().unwrap();
    let output_path = dir.path().join("output.log");

    let result = executor.execute_run(
        &["/bin/true".to_string()],
        &ResourceLimitSet::default(),
        &output_path,
        None,
        &EnvironmentConfig::default(),
        None,
        None,
    );

    assert!(matches!(result, Err(RunExecError::Cgroup(_))), "Unexpected result: {:?}", result);
    assert!(!output_path.exists());
    assert_eq!(child_count(parent.path()), 0);
    assert_eq!(executor.running_count(), 0);
}
