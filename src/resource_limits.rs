//! Resource limits applied with rlimit inside the child before exec
use nix::sys::resource::{setrlimit, Resource};
use std::io;

/// Set RLIMIT_CPU of the calling process. Runs between fork and exec, so it
/// only performs the syscall and allocates nothing.
pub fn set_cpu_time_limit(limit_seconds: u64) -> io::Result<()> {
    setrlimit(Resource::RLIMIT_CPU, limit_seconds, limit_seconds).map_err(io::Error::from)
}
