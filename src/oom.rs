//! Out-of-memory handling for the memory cgroup of a run.
//!
//! The kernel OOM killer of the cgroup is disabled and replaced by a thread
//! that waits on an eventfd registered through `cgroup.event_control`. When
//! the cgroup runs out of memory the thread kills every task in it and gives
//! the cgroup some headroom, because a task at its limit can stall even while
//! handling SIGKILL.
use crate::cgroup::{self, read_tasks};
use crate::timeout::kill_process_group;
use crate::types::{Result, RunExecError, TerminationReason};
use crate::watcher::{CancelToken, WatchOutcome, Watcher};
use nix::unistd::Pid;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Added to the memory limit after an OOM so the killed tasks can exit
pub const OOM_HEADROOM_BYTES: u64 = 10 * 1024 * 1024;

const LIMIT_FILES: [&str; 2] = ["memory.memsw.limit_in_bytes", "memory.limit_in_bytes"];

fn create_eventfd() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Wait until the eventfd counter is non-zero
fn read_event(fd: &OwnedFd) -> io::Result<u64> {
    let mut value: u64 = 0;
    loop {
        let n = unsafe { libc::read(fd.as_raw_fd(), (&mut value as *mut u64).cast(), 8) };
        if n == 8 {
            return Ok(value);
        }
        let err = io::Error::last_os_error();
        if n < 0 && err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(err);
    }
}

fn signal_event(fd: &OwnedFd) {
    let value: u64 = 1;
    if unsafe { libc::write(fd.as_raw_fd(), (&value as *const u64).cast(), 8) } != 8 {
        log::warn!("Failed to wake OOM watcher: {}", io::Error::last_os_error());
    }
}

/// Raise every memory limit file of `memory` by `increment` bytes,
/// the swap-inclusive limit first since it must never be below the other.
pub fn raise_memory_limit(memory: &Path, increment: u64) {
    for file in LIMIT_FILES {
        let path = memory.join(file);
        if !path.exists() {
            continue;
        }
        let raised = fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|content| content.trim().parse::<u64>().map_err(|e| e.to_string()))
            .and_then(|limit| {
                fs::write(&path, limit.saturating_add(increment).to_string()).map_err(|e| e.to_string())
            });
        if let Err(e) = raised {
            log::warn!("Failed to raise {} after OOM: {}", file, e);
        }
    }
}

/// Watches the memory cgroup of a run for out-of-memory events
pub struct OomWatcher {
    memory: PathBuf,
    pgid: Option<Pid>,
    eventfd: Arc<OwnedFd>,
    _oom_control: File,
    token: CancelToken,
}

impl OomWatcher {
    /// Register for OOM notifications of the cgroup `memory` and disable its
    /// OOM killer. Must succeed before a process with a memory limit is started.
    pub fn new(memory: &Path) -> Result<Self> {
        let oom_control = OpenOptions::new()
            .write(true)
            .open(memory.join("memory.oom_control"))
            .map_err(|e| RunExecError::Cgroup(format!("Failed to open memory.oom_control: {}", e)))?;
        let eventfd = create_eventfd()?;

        let registration = format!("{} {}", eventfd.as_raw_fd(), oom_control.as_raw_fd());
        fs::write(memory.join("cgroup.event_control"), registration).map_err(|e| {
            RunExecError::Cgroup(format!("Failed to register OOM notification: {}", e))
        })?;
        (&oom_control)
            .write_all(b"1")
            .map_err(|e| RunExecError::Cgroup(format!("Failed to disable OOM killer: {}", e)))?;

        log::debug!("Armed OOM watcher for {}", memory.display());
        Ok(Self {
            memory: memory.to_path_buf(),
            pgid: None,
            eventfd: Arc::new(eventfd),
            _oom_control: oom_control,
            token: CancelToken::new(),
        })
    }

    /// Process group killed first when the cgroup runs out of memory
    pub fn monitor(mut self, pgid: Pid) -> Self {
        self.pgid = Some(pgid);
        self
    }
}

impl Watcher for OomWatcher {
    fn name(&self) -> &'static str {
        "oom-watcher"
    }

    fn canceller(&self) -> Box<dyn FnOnce() + Send> {
        let token = self.token.clone();
        let eventfd = Arc::clone(&self.eventfd);
        Box::new(move || {
            token.cancel();
            signal_event(&eventfd);
        })
    }

    fn watch(self) -> WatchOutcome {
        let event = read_event(&self.eventfd);
        if self.token.is_cancelled() {
            return WatchOutcome::Cancelled;
        }
        if let Err(e) = event {
            log::warn!("Waiting for OOM notification failed: {}", e);
            return WatchOutcome::Cancelled;
        }

        log::info!("Run in {} ran out of memory, killing it", self.memory.display());
        if let Some(pgid) = self.pgid {
            kill_process_group(pgid);
        }
        read_tasks(&self.memory).into_iter().for_each(cgroup::kill_pid);
        raise_memory_limit(&self.memory, OOM_HEADROOM_BYTES);
        WatchOutcome::Fired(TerminationReason::Memory)
    }
}
