//! Core types shared by the run executor: limits, environment configuration,
//! run results and the crate error type.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Seconds added to the CPU time limit when no explicit wall time limit is given
pub const WALL_TIME_OVERHEAD_SECS: u64 = 2;

/// Limits for a single run
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceLimitSet {
    /// CPU time limit in seconds
    #[serde(default)]
    pub cpu_time_limit_seconds: Option<u64>,
    /// Wall clock time limit in seconds
    #[serde(default)]
    pub wall_time_limit_seconds: Option<u64>,
    /// Memory limit in bytes (RAM plus swap)
    #[serde(default)]
    pub memory_limit_bytes: Option<u64>,
    /// Number of CPU cores the run is pinned to
    #[serde(default)]
    pub cpu_core_count: Option<u32>,
    /// Index used to pick the block of cores for this run
    #[serde(default)]
    pub requested_cpu_index: Option<u32>,
}

impl ResourceLimitSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cpu_time(mut self, seconds: u64) -> Self {
        self.cpu_time_limit_seconds = Some(seconds);
        self
    }

    pub fn with_wall_time(mut self, seconds: u64) -> Self {
        self.wall_time_limit_seconds = Some(seconds);
        self
    }

    pub fn with_memory(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = Some(bytes);
        self
    }

    pub fn with_cores(mut self, count: u32) -> Self {
        self.cpu_core_count = Some(count);
        self
    }

    pub fn with_cpu_index(mut self, index: u32) -> Self {
        self.requested_cpu_index = Some(index);
        self
    }

    /// Wall time limit actually enforced: the explicit one, or the CPU time
    /// limit plus [`WALL_TIME_OVERHEAD_SECS`].
    pub fn effective_wall_time_limit(&self) -> Option<u64> {
        self.wall_time_limit_seconds.or_else(|| {
            self.cpu_time_limit_seconds
                .map(|cpu| cpu.saturating_add(WALL_TIME_OVERHEAD_SECS))
        })
    }

    pub fn has_time_limit(&self) -> bool {
        self.cpu_time_limit_seconds.is_some() || self.wall_time_limit_seconds.is_some()
    }
}

/// How the child's environment is derived from the inherited one
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentConfig {
    /// Variables set to exactly this value
    #[serde(default)]
    pub new: BTreeMap<String, String>,
    /// Values appended to the inherited value of the variable, e.g. `":/opt/bin"` for PATH
    #[serde(default)]
    pub additional: BTreeMap<String, String>,
}

impl EnvironmentConfig {
    /// Compute the variables to set in the child from a lookup of the
    /// inherited environment.
    pub fn resolve<F>(&self, inherited: F) -> BTreeMap<String, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut resolved = self.new.clone();
        for (key, suffix) in &self.additional {
            let value = match resolved.get(key).cloned().or_else(|| inherited(key)) {
                Some(base) => base + suffix,
                None => suffix.clone(),
            };
            resolved.insert(key.clone(), value);
        }
        resolved
    }
}

/// How the run's main process ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ExitStatus {
    /// Exited on its own with this code
    Normal(i32),
    /// Terminated by this signal
    KilledBySignal(i32),
    /// The executable could not be started
    LaunchFailed,
}

/// Which limit enforcement terminated the run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    CpuTime,
    WallTime,
    Memory,
    Interrupted,
}

/// Measurements and output of a single run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub wall_time_seconds: f64,
    pub cpu_time_seconds: f64,
    /// Peak memory usage, `None` when the memory cgroup is unavailable
    pub memory_usage_bytes: Option<u64>,
    pub exit_status: ExitStatus,
    /// Output of the tool without the log header
    pub captured_output: Vec<String>,
    pub was_killed_by_limit_enforcement: bool,
    pub termination_reason: Option<TerminationReason>,
}

impl RunResult {
    pub fn launch_failed() -> Self {
        Self {
            wall_time_seconds: 0.0,
            cpu_time_seconds: 0.0,
            memory_usage_bytes: None,
            exit_status: ExitStatus::LaunchFailed,
            captured_output: Vec::new(),
            was_killed_by_limit_enforcement: false,
            termination_reason: None,
        }
    }
}

/// Errors of the run executor
#[derive(Error, Debug)]
pub enum RunExecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    /// A requested limit cannot be enforced on this machine; the run must not start
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Invalid run request: {0}")]
    Request(String),

    #[error("Executor was interrupted, no further runs are started")]
    Interrupted,
}

impl From<nix::Error> for RunExecError {
    fn from(errno: nix::Error) -> Self {
        RunExecError::Io(std::io::Error::from(errno))
    }
}

/// Result type alias for run executor operations
pub type Result<T> = std::result::Result<T, RunExecError>;
