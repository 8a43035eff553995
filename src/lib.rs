//! runexec: execute a tool under cgroup-enforced resource limits.
//!
//! A run is started in freshly created cgroup v1 children of the caller's own
//! cgroups. CPU time and wall time are enforced by a background watcher that
//! kills the run's process group, memory by the kernel together with an OOM
//! watcher, and CPU cores by a cpuset. After the run all of its processes are
//! killed, the cgroups removed and the measured CPU time, wall time and peak
//! memory returned as a [`RunResult`].

pub mod cgroup;
pub mod cli;
pub mod executor;
pub mod launcher;
pub mod oom;
pub mod output;
pub mod request;
pub mod resource_limits;
pub mod retry;
pub mod timeout;
pub mod types;
pub mod watcher;

pub use executor::RunExecutor;
pub use request::RunRequest;
pub use types::{
    EnvironmentConfig, ExitStatus, ResourceLimitSet, Result, RunExecError, RunResult, TerminationReason,
};
