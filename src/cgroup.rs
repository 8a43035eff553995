//! Cgroup v1 discovery and per-run cgroup allocation
use crate::retry::retry_with_backoff;
use crate::types::{Result, RunExecError};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

const PROC_MOUNTS: &str = "/proc/mounts";
const PROC_SELF_CGROUP: &str = "/proc/self/cgroup";
const PROC_MEMINFO: &str = "/proc/meminfo";

const CGROUP_PREFIX: &str = "benchmark_";
const KILL_ROUNDS: u32 = 10;

/// Cgroup v1 subsystems used for runs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Subsystem {
    Cpuacct,
    Memory,
    Cpuset,
}

impl Subsystem {
    pub const ALL: [Subsystem; 3] = [Subsystem::Cpuacct, Subsystem::Memory, Subsystem::Cpuset];

    pub fn name(&self) -> &'static str {
        match self {
            Subsystem::Cpuacct => "cpuacct",
            Subsystem::Memory => "memory",
            Subsystem::Cpuset => "cpuset",
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Find the mount point of the cgroup v1 hierarchy carrying `subsystem` in
/// the contents of `/proc/mounts`.
pub fn find_mount_point(mounts: &str, subsystem: Subsystem) -> Option<PathBuf> {
    mounts.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || fields[2] != "cgroup" {
            return None;
        }
        fields[3]
            .split(',')
            .any(|option| option == subsystem.name())
            .then(|| PathBuf::from(fields[1]))
    })
}

/// Find the path of the own cgroup relative to the hierarchy root in the
/// contents of `/proc/self/cgroup`.
pub fn find_own_cgroup(self_cgroup: &str, subsystem: Subsystem) -> Option<String> {
    self_cgroup.lines().find_map(|line| {
        let mut parts = line.splitn(3, ':');
        let _id = parts.next()?;
        let subsystems = parts.next()?;
        let path = parts.next()?;
        subsystems
            .split(',')
            .any(|name| name == subsystem.name())
            .then(|| path.to_string())
    })
}

/// Parse a kernel CPU list such as `0-3,8,10-11`.
pub fn parse_cpu_list(list: &str) -> Result<Vec<u32>> {
    let invalid = |part: &str| RunExecError::Cgroup(format!("Invalid CPU list entry '{}'", part));
    let mut cpus = Vec::new();
    for part in list.trim().split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                let start: u32 = start.trim().parse().map_err(|_| invalid(part))?;
                let end: u32 = end.trim().parse().map_err(|_| invalid(part))?;
                if end < start {
                    return Err(invalid(part));
                }
                cpus.extend(start..=end);
            }
            None => cpus.push(part.trim().parse().map_err(|_| invalid(part))?),
        }
    }
    Ok(cpus)
}

/// Pick `core_count` consecutive entries of `available_cpus`, starting at
/// `(requested_index * core_count) % total` and wrapping around.
pub fn core_assignment(requested_index: u32, core_count: u32, available_cpus: &[u32]) -> Result<Vec<u32>> {
    let total = available_cpus.len();
    let count = core_count as usize;
    if count == 0 {
        return Err(RunExecError::Config("Invalid number of CPU cores: 0".to_string()));
    }
    if count > total {
        return Err(RunExecError::Config(format!(
            "Cannot limit to {} CPU cores, only {} are available to this process",
            core_count, total
        )));
    }
    let start = (requested_index as usize * count) % total;
    Ok((0..count).map(|i| available_cpus[(start + i) % total]).collect())
}

/// Read `SwapTotal` in kB from the contents of `/proc/meminfo`.
pub fn parse_swap_total(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find(|line| line.starts_with("SwapTotal:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|value| value.parse().ok())
}

fn swap_configured() -> bool {
    fs::read_to_string(PROC_MEMINFO)
        .ok()
        .and_then(|meminfo| parse_swap_total(&meminfo))
        .map_or(false, |kb| kb > 0)
}

fn write_cgroup_file(dir: &Path, filename: &str, content: &str) -> io::Result<()> {
    fs::write(dir.join(filename), content)
}

fn read_cgroup_file(dir: &Path, filename: &str) -> Result<String> {
    fs::read_to_string(dir.join(filename))
        .map_err(|e| RunExecError::Cgroup(format!("Failed to read {}: {}", filename, e)))
}

/// PIDs listed in the `tasks` file of `dir`. A missing file counts as empty.
pub fn read_tasks(dir: &Path) -> Vec<Pid> {
    match fs::read_to_string(dir.join("tasks")) {
        Ok(content) => content
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .map(Pid::from_raw)
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Cumulative CPU time in seconds from `cpuacct.usage` in `dir`.
pub fn read_cpu_time(dir: &Path) -> Result<f64> {
    let content = read_cgroup_file(dir, "cpuacct.usage")?;
    let nanos: u64 = content.trim().parse().map_err(|e| {
        RunExecError::Cgroup(format!("Malformed cpuacct.usage '{}': {}", content.trim(), e))
    })?;
    Ok(nanos as f64 / 1_000_000_000.0)
}

/// Send SIGKILL to `pid`, ignoring processes that are already gone.
pub fn kill_pid(pid: Pid) {
    match signal::kill(pid, Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => log::warn!("Failed to kill process {}: {}", pid, e),
    }
}

/// Cgroup hierarchies the current process belongs to
#[derive(Clone, Debug, Default)]
pub struct CgroupHierarchy {
    paths: HashMap<Subsystem, PathBuf>,
    cpus: Vec<u32>,
}

impl CgroupHierarchy {
    /// Discover the own cgroup of every subsystem from `/proc`. Subsystems
    /// that cannot be found are logged and left unavailable.
    pub fn discover() -> Self {
        let mounts = fs::read_to_string(PROC_MOUNTS);
        let self_cgroup = fs::read_to_string(PROC_SELF_CGROUP);
        let (mounts, self_cgroup) = match (mounts, self_cgroup) {
            (Ok(m), Ok(c)) => (m, c),
            (Err(e), _) | (_, Err(e)) => {
                log::warn!("Cannot read cgroup information from /proc: {}", e);
                return Self::default();
            }
        };

        let mut hierarchy = Self::from_proc(&mounts, &self_cgroup);
        for subsystem in Subsystem::ALL {
            if hierarchy.path(subsystem).is_none() {
                log::warn!(
                    "Cgroup subsystem {} not available, the corresponding limits and measurements are disabled",
                    subsystem
                );
            }
        }

        if let Some(cpuset) = hierarchy.paths.get(&Subsystem::Cpuset).cloned() {
            match read_cgroup_file(&cpuset,"cpuset.cpus").and_then(|list| parse_cpu_list(&list)) {
                Ok(cpus) => hierarchy.cpus = cpus,
                Err(e) => {
                    log::warn!("Cannot determine usable CPUs, disabling cpuset: {}", e);
                    hierarchy.paths.remove(&Subsystem::Cpuset);
                }
            }
        }
        log::debug!("Discovered cgroup hierarchy: {:?}", hierarchy);
        hierarchy
    }

    /// Build the hierarchy from the contents of `/proc/mounts` and `/proc/self/cgroup`.
    pub fn from_proc(mounts: &str, self_cgroup: &str) -> Self {
        let paths = Subsystem::ALL
            .iter()
            .filter_map(|&subsystem| {
                let mount = find_mount_point(mounts, subsystem)?;
                let own = find_own_cgroup(self_cgroup, subsystem)?;
                Some((subsystem, mount.join(own.trim_start_matches('/'))))
            })
            .collect();
        Self { paths, cpus: Vec::new() }
    }

    /// Build a hierarchy from known paths, e.g. a prepared test directory.
    pub fn from_paths(paths: HashMap<Subsystem, PathBuf>, cpus: Vec<u32>) -> Self {
        Self { paths, cpus }
    }

    pub fn path(&self, subsystem: Subsystem) -> Option<&Path> {
        self.paths.get(&subsystem).map(PathBuf::as_path)
    }

    pub fn available_cpus(&self) -> &[u32] {
        &self.cpus
    }

    /// Create a fresh child cgroup for each requested subsystem. Unavailable
    /// subsystems are skipped; co-mounted subsystems share one directory.
    pub fn allocate(&self, subsystems: &[Subsystem]) -> AllocatedCgroupSet {
        let mut allocated = AllocatedCgroupSet::default();
        let mut by_parent: HashMap<&Path, PathBuf> = HashMap::new();

        for &subsystem in subsystems {
            let Some(parent) = self.path(subsystem) else {
                continue;
            };
            if let Some(existing) = by_parent.get(parent) {
                allocated.by_subsystem.insert(subsystem, existing.clone());
                continue;
            }

            let dir = parent.join(format!("{}{}", CGROUP_PREFIX, uuid::Uuid::new_v4().simple()));
            if let Err(e) = fs::create_dir(&dir) {
                log::warn!("Cannot create {} cgroup in {}: {}", subsystem, parent.display(), e);
                continue;
            }
            for file in ["cpuset.cpus", "cpuset.mems"] {
                if let Ok(value) = fs::read_to_string(parent.join(file)) {
                    let _ = write_cgroup_file(&dir, file, value.trim());
                }
            }
            log::debug!("Created {} cgroup {}", subsystem, dir.display());

            by_parent.insert(parent, dir.clone());
            allocated.by_subsystem.insert(subsystem, dir.clone());
            allocated.created.push(dir);
        }
        allocated
    }
}

/// Child cgroups created for one run
#[derive(Debug, Default)]
pub struct AllocatedCgroupSet {
    by_subsystem: HashMap<Subsystem, PathBuf>,
    created: Vec<PathBuf>,
}

impl AllocatedCgroupSet {
    pub fn path(&self, subsystem: Subsystem) -> Option<&Path> {
        self.by_subsystem.get(&subsystem).map(PathBuf::as_path)
    }

    /// Distinct physical cgroup directories of this run
    pub fn directories(&self) -> &[PathBuf] {
        &self.created
    }

    pub fn tasks_files(&self) -> Vec<PathBuf> {
        self.created.iter().map(|dir| dir.join("tasks")).collect()
    }

    pub fn configure_cpu_pinning(&self, requested_index: u32, core_count: u32, available_cpus: &[u32]) -> Result<()> {
        let cpuset = self.path(Subsystem::Cpuset).ok_or_else(|| {
            RunExecError::Config("CPU core limit requested but the cpuset cgroup is not available".to_string())
        })?;
        let cores = core_assignment(requested_index, core_count, available_cpus)?;
        let list = cores.iter().map(u32::to_string).collect::<Vec<_>>().join(",");
        log::debug!("Pinning run to CPUs {}", list);
        write_cgroup_file(cpuset, "cpuset.cpus", &list)
            .map_err(|e| RunExecError::Cgroup(format!("Failed to write cpuset.cpus: {}", e)))
    }

    pub fn configure_memory_limit(&self, limit_bytes: u64) -> Result<()> {
        self.configure_memory_limit_with(limit_bytes, swap_configured())
    }

    fn configure_memory_limit_with(&self, limit_bytes: u64, swap_present: bool) -> Result<()> {
        let memory = self.path(Subsystem::Memory).ok_or_else(|| {
            RunExecError::Config("Memory limit requested but the memory cgroup is not available".to_string())
        })?;
        let limit = limit_bytes.to_string();
        write_cgroup_file(memory, "memory.limit_in_bytes", &limit)
            .map_err(|e| RunExecError::Cgroup(format!("Failed to write memory.limit_in_bytes: {}", e)))?;

        if memory.join("memory.memsw.limit_in_bytes").exists() {
            match write_cgroup_file(memory, "memory.memsw.limit_in_bytes", &limit) {
                Ok(()) => {}
                Err(e) if e.raw_os_error() == Some(libc::EOPNOTSUPP) => {
                    return Err(RunExecError::Config(
                        "Memory limit including swap is not supported by the kernel, \
                         boot with the kernel parameter swapaccount=1"
                            .to_string(),
                    ));
                }
                Err(e) => {
                    return Err(RunExecError::Cgroup(format!(
                        "Failed to write memory.memsw.limit_in_bytes: {}",
                        e
                    )))
                }
            }
        } else if swap_present {
            return Err(RunExecError::Config(
                "Cannot limit swap usage of the run because memory.memsw.limit_in_bytes is missing; \
                 boot with swapaccount=1 or disable swap"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Read the CPU time until two reads 0.1s apart agree, as the counter may
    /// still be updated after the tasks exited.
    pub fn read_settled_cpu_time(&self) -> Option<f64> {
        let dir = self.path(Subsystem::Cpuacct)?;
        let read = || retry_with_backoff(3, Duration::from_millis(100), || read_cpu_time(dir));
        let mut previous = match read() {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Cannot read CPU time of run: {}", e);
                return None;
            }
        };
        for _ in 0..50 {
            thread::sleep(Duration::from_millis(100));
            match read() {
                Ok(current) if current == previous => return Some(current),
                Ok(current) => previous = current,
                Err(e) => log::warn!("Cannot read CPU time of run: {}", e),
            }
        }
        Some(previous)
    }

    /// Peak memory usage, preferring the swap-inclusive counter
    pub fn read_peak_memory(&self) -> Option<u64> {
        let memory = self.path(Subsystem::Memory)?;
        ["memory.memsw.max_usage_in_bytes", "memory.max_usage_in_bytes"]
            .iter()
            .filter(|file| memory.join(file).exists())
            .find_map(|file| match read_cgroup_file(memory, file) {
                Ok(content) => content.trim().parse().ok(),
                Err(e) => {
                    log::warn!("{}", e);
                    None
                }
            })
    }

    /// Kill every task in every cgroup of the run until all are empty.
    pub fn kill_all_tasks(&self) {
        for dir in &self.created {
            for round in 1..=KILL_ROUNDS {
                let tasks = read_tasks(dir);
                if tasks.is_empty() {
                    break;
                }
                if round > 1 {
                    log::warn!(
                        "Run left {} processes in {} after {} kill rounds",
                        tasks.len(),
                        dir.display(),
                        round - 1
                    );
                }
                tasks.into_iter().for_each(kill_pid);
                thread::sleep(Duration::from_millis(50 * round as u64));
            }
        }
    }

    /// Remove all created cgroups. Failures are logged, never returned.
    pub fn release(&mut self) {
        for dir in self.created.drain(..) {
            let remaining = read_tasks(&dir);
            if !remaining.is_empty() {
                log::warn!(
                    "Cgroup {} still contains tasks {:?} while being removed",
                    dir.display(),
                    remaining
                );
            }
            if let Err(first) = fs::remove_dir(&dir) {
                log::debug!("Removing {} failed, retrying: {}", dir.display(), first);
                thread::sleep(Duration::from_millis(100));
                if let Err(e) = fs::remove_dir(&dir) {
                    log::warn!("Failed to remove cgroup {}: {}", dir.display(), e);
                }
            }
        }
        self.by_subsystem.clear();
    }
}

impl Drop for AllocatedCgroupSet {
    fn drop(&mut self) {
        self.release();
    }
}
