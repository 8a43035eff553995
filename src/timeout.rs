//! Enforcement of the CPU time and wall time limits of a run
use crate::cgroup;
use crate::types::TerminationReason;
use crate::watcher::{CancelToken, WatchOutcome, Watcher};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Added to every sleep so the next check happens just after the limit
const POLL_MARGIN: Duration = Duration::from_millis(500);
const RETRY_READ_DELAY: Duration = Duration::from_secs(1);

/// Kill the process group `pgid` with SIGKILL, ignoring an already exited group.
pub fn kill_process_group(pgid: Pid) {
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => log::warn!("Failed to kill process group {}: {}", pgid, e),
    }
}

/// Kills the run's process group once its CPU time or wall time is used up
pub struct TimeoutWatcher {
    pgid: Pid,
    cpuacct: Option<PathBuf>,
    cpu_limit: Option<Duration>,
    deadline: Option<Instant>,
    core_count: u32,
    token: CancelToken,
}

impl TimeoutWatcher {
    /// `cpuacct` is the run's cpuacct cgroup; without it only the wall time is enforced.
    pub fn new(
        pgid: Pid,
        cpuacct: Option<PathBuf>,
        cpu_limit: Option<Duration>,
        wall_limit: Option<Duration>,
        start: Instant,
        core_count: u32,
    ) -> Self {
        Self {
            pgid,
            cpu_limit: cpu_limit.filter(|_| cpuacct.is_some()),
            cpuacct,
            deadline: wall_limit.map(|limit| start + limit),
            core_count: core_count.max(1),
            token: CancelToken::new(),
        }
    }

    /// Used CPU time, retrying once per second while the counter is unreadable
    fn used_cpu_time(&self, cpuacct: &std::path::Path) -> Option<Duration> {
        loop {
            match cgroup::read_cpu_time(cpuacct) {
                Ok(seconds) => return Some(Duration::from_secs_f64(seconds)),
                Err(e) => {
                    log::debug!("Retrying CPU time read: {}", e);
                    if self.token.wait_timeout(RETRY_READ_DELAY) {
                        return None;
                    }
                }
            }
        }
    }

    /// One check. Returns the time to sleep, or the reason to kill the run.
    fn check(&self) -> Option<std::result::Result<Duration, TerminationReason>> {
        let mut sleep: Option<Duration> = None;

        if let (Some(limit), Some(cpuacct)) = (self.cpu_limit, self.cpuacct.as_deref()) {
            let used = self.used_cpu_time(cpuacct)?;
            match limit.checked_sub(used).filter(|rest| !rest.is_zero()) {
                Some(rest) => sleep = Some(rest / self.core_count),
                None => return Some(Err(TerminationReason::CpuTime)),
            }
        }

        if let Some(deadline) = self.deadline {
            match deadline.checked_duration_since(Instant::now()).filter(|rest| !rest.is_zero()) {
                Some(rest) => sleep = Some(sleep.map_or(rest, |s| s.min(rest))),
                None => return Some(Err(TerminationReason::WallTime)),
            }
        }

        Some(Ok(sleep.unwrap_or(Duration::from_secs(1)) + POLL_MARGIN))
    }
}

impl Watcher for TimeoutWatcher {
    fn name(&self) -> &'static str {
        "timeout-watcher"
    }

    fn canceller(&self) -> Box<dyn FnOnce() + Send> {
        let token = self.token.clone();
        Box::new(move || token.cancel())
    }

    fn watch(self) -> WatchOutcome {
        while !self.token.is_cancelled() {
            match self.check() {
                None => break,
                Some(Ok(sleep)) => {
                    if self.token.wait_timeout(sleep) {
                        break;
                    }
                }
                Some(Err(reason)) => {
                    log::info!("Killing process group {} because of {:?} limit", self.pgid, reason);
                    kill_process_group(self.pgid);
                    return WatchOutcome::Fired(reason);
                }
            }
        }
        WatchOutcome::Cancelled
    }
}
