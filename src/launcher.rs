//! Starting the tool of a run inside its cgroups
use crate::resource_limits;
use crate::types::{EnvironmentConfig, Result, RunExecError};
use nix::sys::signal::SigSet;
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Number of lines of the header written before the tool's output
pub const HEADER_LINES: usize = 6;
const SEPARATOR_WIDTH: usize = 80;

/// Header of the log file: the command line and a separator. Line breaks
/// inside arguments are escaped so the header is always [`HEADER_LINES`]
/// lines long.
pub fn log_header(command: &[String]) -> String {
    let command_line = command
        .join(" ")
        .replace('\n', "\\n")
        .replace('\r', "\\r");
    format!("{}\n\n\n{}\n\n\n", command_line, "-".repeat(SEPARATOR_WIDTH))
}

/// Everything needed to start one run
#[derive(Debug)]
pub struct LaunchSpec<'a> {
    pub command: &'a [String],
    pub environment: &'a EnvironmentConfig,
    pub output_path: &'a Path,
    pub working_dir: Option<&'a Path>,
    /// `tasks` files the process adds itself to before exec
    pub tasks_files: Vec<PathBuf>,
    pub cpu_time_limit_seconds: Option<u64>,
}

/// Write `pid` to the already opened cgroup file `fd` using only raw syscalls
fn join_cgroup(fd: RawFd, pid: libc::pid_t) -> io::Result<()> {
    let mut digits = [0u8; 16];
    let mut start = digits.len();
    let mut rest = pid as u32;
    loop {
        start -= 1;
        digits[start] = b'0' + (rest % 10) as u8;
        rest /= 10;
        if rest == 0 {
            break;
        }
    }

    let len = digits.len() - start;
    let written = unsafe { libc::write(fd, digits[start..].as_ptr().cast(), len) };
    if written == len as isize {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Open the `tasks` files in the parent, so a cgroup that cannot be joined
/// is reported as such instead of as a failure to execute the tool.
fn open_tasks_files(paths: &[PathBuf]) -> Result<Vec<File>> {
    paths
        .iter()
        .map(|path| {
            OpenOptions::new()
                .write(true)
                .open(path)
                .map_err(|e| RunExecError::Cgroup(format!("Cannot join cgroup via {}: {}", path.display(), e)))
        })
        .collect()
}

fn open_log(output_path: &Path, command: &[String]) -> Result<File> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(output_path)
        .map_err(|e| {
            RunExecError::Io(io::Error::new(
                e.kind(),
                format!("Failed to create output file {}: {}", output_path.display(), e),
            ))
        })?;
    file.write_all(log_header(command).as_bytes())?;
    file.flush()?;
    Ok(file)
}

/// Start the tool as leader of a new process group with stdout and stderr
/// appended to the log file. Failing to execute the tool is reported as
/// [`RunExecError::Process`], a cgroup that cannot be joined as
/// [`RunExecError::Cgroup`].
pub fn launch(spec: LaunchSpec<'_>) -> Result<Pid> {
    let (program, args) = spec
        .command
        .split_first()
        .ok_or_else(|| RunExecError::Config("Empty command provided".to_string()))?;

    // Close-on-exec, but still open in the child until exec
    let tasks_files = open_tasks_files(&spec.tasks_files)?;
    let log = open_log(spec.output_path, spec.command)?;
    let stderr = log.try_clone()?;
    let cpu_time_limit = spec.cpu_time_limit_seconds;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(spec.environment.resolve(|key| std::env::var(key).ok()))
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(stderr))
        .process_group(0);
    if let Some(dir) = spec.working_dir {
        cmd.current_dir(dir);
    }

    unsafe {
        cmd.pre_exec(move || {
            // The executor may block signals for its own signal handling thread.
            SigSet::empty().thread_set_mask().map_err(io::Error::from)?;

            let pid = libc::getpid();
            for tasks in &tasks_files {
                join_cgroup(tasks.as_raw_fd(), pid)?;
            }

            if let Some(limit) = cpu_time_limit {
                resource_limits::set_cpu_time_limit(limit)?;
            }
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(|e| {
        RunExecError::Process(format!(
            "Cannot execute '{}': {}. Make sure the tool is installed and its executable is reachable via PATH",
            program, e
        ))
    })?;
    let pid = Pid::from_raw(child.id() as i32);
    log::debug!("Started {:?} as process {}", spec.command, pid);
    Ok(pid)
}
