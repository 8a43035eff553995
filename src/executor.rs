//! Execution of a single run under cgroup-enforced limits
use crate::cgroup::{AllocatedCgroupSet, CgroupHierarchy, Subsystem};
use crate::launcher::{self, LaunchSpec};
use crate::oom::OomWatcher;
use crate::output;
use crate::request::RunRequest;
use crate::timeout::{kill_process_group, TimeoutWatcher};
use crate::types::{
    EnvironmentConfig, ExitStatus, ResourceLimitSet, Result, RunExecError, RunResult, TerminationReason,
};
use crate::watcher::{spawn_watcher, WatchOutcome, WatcherHandle};
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Relative amount by which the CPU time reported by wait4 may exceed the
/// cgroup's figure before the cgroup accounting is distrusted
pub const CPU_TIME_DISCREPANCY_RATIO: f64 = 0.1;

/// Fraction of the CPU time limit after which a killed run counts as having
/// hit RLIMIT_CPU, as the kernel may account slightly less than the limit
const RLIMIT_CPU_TOLERANCE: f64 = 0.99;

/// Choose between the CPU time from wait4 and from the cgroup. The cgroup
/// figure wins unless wait4 reports more than `ratio` above it, which
/// happens when the tool moved processes out of the cgroup.
pub fn reconcile_cpu_time(wait_cpu_time: f64, cgroup_cpu_time: Option<f64>, ratio: f64) -> f64 {
    match cgroup_cpu_time {
        None => wait_cpu_time,
        Some(cgroup) if wait_cpu_time > cgroup * (1.0 + ratio) => {
            log::warn!(
                "CPU time from wait4 ({:.3}s) is considerably higher than from the cgroup ({:.3}s); \
                 the tool may have left its cgroup, measurements may be unreliable",
                wait_cpu_time,
                cgroup
            );
            wait_cpu_time
        }
        Some(cgroup) => cgroup,
    }
}

fn timeval_seconds(tv: libc::timeval) -> f64 {
    tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0
}

/// Block until `pid` has terminated without reaping it. The zombie keeps its
/// PID and process group reserved until [`wait_for_exit`].
fn wait_for_termination(pid: Pid) -> Result<()> {
    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
    loop {
        let ret = unsafe {
            libc::waitid(
                libc::P_PID,
                pid.as_raw() as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if ret == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(RunExecError::Process(format!("Waiting for process {} failed: {}", pid, err)));
        }
    }
}

/// Reap `pid` and return its exit status together with the CPU time of it
/// and its waited-for descendants.
fn wait_for_exit(pid: Pid) -> Result<(ExitStatus, f64)> {
    let mut status: libc::c_int = 0;
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        let ret = unsafe { libc::wait4(pid.as_raw(), &mut status, 0, &mut usage) };
        if ret == pid.as_raw() {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(RunExecError::Process(format!("Waiting for process {} failed: {}", pid, err)));
        }
    }

    let cpu_time = timeval_seconds(usage.ru_utime) + timeval_seconds(usage.ru_stime);
    let exit_status = match WaitStatus::from_raw(pid, status)? {
        WaitStatus::Exited(_, code) => ExitStatus::Normal(code),
        WaitStatus::Signaled(_, signal, _) => ExitStatus::KilledBySignal(signal as i32),
        other => {
            return Err(RunExecError::Process(format!(
                "Unexpected wait status of process {}: {:?}",
                pid, other
            )))
        }
    };
    Ok((exit_status, cpu_time))
}

/// Runs tools under resource limits and tracks the runs in progress so they
/// can be killed on interrupt. One executor may serve many concurrent runs.
pub struct RunExecutor {
    hierarchy: CgroupHierarchy,
    running: Mutex<HashSet<Pid>>,
    interrupted: AtomicBool,
    cpu_time_discrepancy_ratio: f64,
}

impl RunExecutor {
    /// Create an executor for the cgroups of the current process
    pub fn new() -> Self {
        Self::with_hierarchy(CgroupHierarchy::discover())
    }

    pub fn with_hierarchy(hierarchy: CgroupHierarchy) -> Self {
        Self {
            hierarchy,
            running: Mutex::new(HashSet::new()),
            interrupted: AtomicBool::new(false),
            cpu_time_discrepancy_ratio: CPU_TIME_DISCREPANCY_RATIO,
        }
    }

    pub fn with_cpu_time_discrepancy_ratio(mut self, ratio: f64) -> Self {
        self.cpu_time_discrepancy_ratio = ratio;
        self
    }

    pub fn hierarchy(&self) -> &CgroupHierarchy {
        &self.hierarchy
    }

    fn running(&self) -> MutexGuard<'_, HashSet<Pid>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of runs whose tool is currently executing
    pub fn running_count(&self) -> usize {
        self.running().len()
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Kill the process groups of all runs in progress. Runs started
    /// afterwards fail with [`RunExecError::Interrupted`].
    pub fn kill_all_running(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        let running = self.running();
        log::info!("Killing {} running process groups", running.len());
        for &pid in running.iter() {
            kill_process_group(pid);
        }
    }

    fn register(&self, pid: Pid) {
        self.running().insert(pid);
        if self.is_interrupted() {
            kill_process_group(pid);
        }
    }

    fn unregister(&self, pid: Pid) {
        self.running().remove(&pid);
    }

    pub fn execute_request(&self, request: &RunRequest) -> Result<RunResult> {
        self.execute_run(
            &request.command,
            &request.limits,
            &request.output_path,
            request.cpu_index,
            &request.environment,
            request.working_dir.as_deref(),
            request.max_log_size,
        )
    }

    /// Execute `command` under `limits`, writing its output to `output_path`.
    ///
    /// Returns an error only if the run cannot be set up as requested, e.g. a
    /// memory limit without a memory cgroup. A tool that cannot be executed
    /// yields a result with [`ExitStatus::LaunchFailed`].
    #[allow(clippy::too_many_arguments)]
    pub fn execute_run(
        &self,
        command: &[String],
        limits: &ResourceLimitSet,
        output_path: &Path,
        cpu_index: Option<u32>,
        environment: &EnvironmentConfig,
        working_dir: Option<&Path>,
        max_log_size: Option<u64>,
    ) -> Result<RunResult> {
        if self.is_interrupted() {
            return Err(RunExecError::Interrupted);
        }
        if command.is_empty() {
            return Err(RunExecError::Config("Empty command provided".to_string()));
        }

        let mut subsystems = vec![Subsystem::Cpuacct, Subsystem::Memory];
        if limits.cpu_core_count.is_some() {
            subsystems.push(Subsystem::Cpuset);
        }
        let mut cgroups = self.hierarchy.allocate(&subsystems);

        if let Some(core_count) = limits.cpu_core_count {
            let index = cpu_index.or(limits.requested_cpu_index).unwrap_or(0);
            cgroups.configure_cpu_pinning(index, core_count, self.hierarchy.available_cpus())?;
        }
        let oom_watcher = match limits.memory_limit_bytes {
            Some(limit) => {
                cgroups.configure_memory_limit(limit)?;
                match cgroups.path(Subsystem::Memory) {
                    Some(memory) => Some(OomWatcher::new(memory)?),
                    None => None,
                }
            }
            None => None,
        };

        let start = Instant::now();
        let launched = launcher::launch(LaunchSpec {
            command,
            environment,
            output_path,
            working_dir,
            tasks_files: cgroups.tasks_files(),
            cpu_time_limit_seconds: limits.cpu_time_limit_seconds,
        });
        let pid = match launched {
            Ok(pid) => pid,
            Err(RunExecError::Process(message)) => {
                log::error!("{}", message);
                let mut result = RunResult::launch_failed();
                result.captured_output.push(message);
                return Ok(result);
            }
            Err(e) => return Err(e),
        };
        self.register(pid);

        let mut watchers = Vec::new();
        let terminated = match self.spawn_watchers(pid, limits, &cgroups, oom_watcher, start, &mut watchers) {
            Ok(()) => wait_for_termination(pid),
            Err(e) => {
                kill_process_group(pid);
                Err(e)
            }
        };
        let wall_time = start.elapsed();

        let mut fired = None;
        for watcher in watchers {
            let name = watcher.name();
            let outcome = watcher.join();
            log::debug!("Watcher {} of process {} finished: {:?}", name, pid, outcome);
            if let (None, WatchOutcome::Fired(reason)) = (fired, outcome) {
                fired = Some(reason);
            }
        }
        // The unreaped leader still holds the process group, so no unrelated
        // group can be hit here or by a concurrent kill_all_running.
        self.unregister(pid);
        kill_process_group(pid);
        cgroups.kill_all_tasks();
        let waited = wait_for_exit(pid);

        terminated?;
        let (exit_status, wait_cpu_time) = waited?;
        let result = self.finish_run(
            &mut cgroups,
            limits,
            exit_status,
            wait_cpu_time,
            wall_time,
            fired,
            output_path,
            working_dir,
            max_log_size,
        );
        log::info!(
            "Run of {:?} finished: {:?}, wall time {:.3}s, CPU time {:.3}s, memory {:?}",
            command,
            result.exit_status,
            result.wall_time_seconds,
            result.cpu_time_seconds,
            result.memory_usage_bytes
        );
        Ok(result)
    }

    fn spawn_watchers(
        &self,
        pid: Pid,
        limits: &ResourceLimitSet,
        cgroups: &AllocatedCgroupSet,
        oom_watcher: Option<OomWatcher>,
        start: Instant,
        watchers: &mut Vec<WatcherHandle>,
    ) -> Result<()> {
        if let Some(oom_watcher) = oom_watcher {
            watchers.push(spawn_watcher(oom_watcher.monitor(pid))?);
        }
        if limits.has_time_limit() {
            let core_count = limits.cpu_core_count.unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get() as u32)
                    .unwrap_or(1)
            });
            let cpuacct = cgroups.path(Subsystem::Cpuacct).map(Path::to_path_buf);
            if cpuacct.is_none() && limits.cpu_time_limit_seconds.is_some() {
                log::warn!("Without cpuacct cgroup the CPU time limit is only enforced by RLIMIT_CPU");
            }
            watchers.push(spawn_watcher(TimeoutWatcher::new(
                pid,
                cpuacct,
                limits.cpu_time_limit_seconds.map(Duration::from_secs),
                limits.effective_wall_time_limit().map(Duration::from_secs),
                start,
                core_count,
            ))?);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_run(
        &self,
        cgroups: &mut AllocatedCgroupSet,
        limits: &ResourceLimitSet,
        exit_status: ExitStatus,
        wait_cpu_time: f64,
        wall_time: Duration,
        fired: Option<TerminationReason>,
        output_path: &Path,
        working_dir: Option<&Path>,
        max_log_size: Option<u64>,
    ) -> RunResult {
        let cpu_time = reconcile_cpu_time(
            wait_cpu_time,
            cgroups.read_settled_cpu_time(),
            self.cpu_time_discrepancy_ratio,
        );
        let memory_usage = cgroups.read_peak_memory();
        cgroups.release();

        let termination_reason = fired.or_else(|| match exit_status {
            ExitStatus::KilledBySignal(_) if self.is_interrupted() => Some(TerminationReason::Interrupted),
            // RLIMIT_CPU sends SIGXCPU at the soft and SIGKILL at the hard limit
            ExitStatus::KilledBySignal(signal) => limits
                .cpu_time_limit_seconds
                .filter(|&limit| signal == libc::SIGXCPU || cpu_time >= limit as f64 * RLIMIT_CPU_TOLERANCE)
                .map(|_| TerminationReason::CpuTime),
            _ => None,
        });

        if let Some(max_size) = max_log_size {
            if let Err(e) = output::reduce_file_size_if_necessary(output_path, max_size) {
                log::warn!("Failed to truncate {}: {}", output_path.display(), e);
            }
        }
        let mut captured_output = output::read_output(output_path).unwrap_or_else(|e| {
            log::warn!("Failed to read output of run from {}: {}", output_path.display(), e);
            Vec::new()
        });
        if let Err(e) = output::append_crash_report(output_path, working_dir, &mut captured_output) {
            log::warn!("Failed to append crash report to {}: {}", output_path.display(), e);
        }

        RunResult {
            wall_time_seconds: wall_time.as_secs_f64(),
            cpu_time_seconds: cpu_time,
            memory_usage_bytes: memory_usage,
            exit_status,
            captured_output,
            was_killed_by_limit_enforcement: matches!(
                termination_reason,
                Some(TerminationReason::CpuTime | TerminationReason::WallTime | TerminationReason::Memory)
            ),
            termination_reason,
        }
    }
}

impl Default for RunExecutor {
    fn default() -> Self {
        Self::new()
    }
}
