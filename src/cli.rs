//! Command line interface of the `runexec` binary
use crate::request::RunRequest;
use crate::types::{EnvironmentConfig, ResourceLimitSet};
use clap::Parser;
use std::path::PathBuf;

/// Parse a `KEY=VALUE` argument
fn parse_key_val(arg: &str) -> Result<(String, String), String> {
    match arg.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("invalid KEY=VALUE: no `=` or empty key in `{}`", arg)),
    }
}

#[derive(Parser, Debug)]
#[command(name = "runexec")]
#[command(
    about = "Execute a command under CPU time, wall time, memory and core limits and report its resource usage",
    long_about = None
)]
pub struct Cli {
    /// CPU time limit in seconds
    #[arg(long = "timelimit", value_name = "SECONDS")]
    pub cpu_time_limit: Option<u64>,

    /// Wall time limit in seconds (default: CPU time limit plus a small overhead)
    #[arg(long = "walltimelimit", value_name = "SECONDS")]
    pub wall_time_limit: Option<u64>,

    /// Memory limit in bytes, including swap
    #[arg(long = "memlimit", value_name = "BYTES")]
    pub memory_limit: Option<u64>,

    /// Number of CPU cores the command may use
    #[arg(long)]
    pub cores: Option<u32>,

    /// Index selecting the block of cores for this run
    #[arg(long)]
    pub cpu_index: Option<u32>,

    /// File the output of the command is written to
    #[arg(long, default_value = "output.log")]
    pub output: PathBuf,

    /// Working directory of the command
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// Truncate the output file to about this many bytes
    #[arg(long = "maxlogsize", value_name = "BYTES")]
    pub max_log_size: Option<u64>,

    /// Set an environment variable for the command
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    pub env: Vec<(String, String)>,

    /// Append a value to an inherited environment variable, e.g. PATH=:/opt/bin
    #[arg(long = "append-env", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    pub append_env: Vec<(String, String)>,

    /// Read the complete run description from this JSON file instead
    #[arg(long, conflicts_with = "command")]
    pub request: Option<PathBuf>,

    /// Command to execute and its arguments
    #[arg(last = true)]
    pub command: Vec<String>,
}

impl Cli {
    /// Run request described by the command line arguments
    pub fn to_request(&self) -> RunRequest {
        let limits = ResourceLimitSet {
            cpu_time_limit_seconds: self.cpu_time_limit,
            wall_time_limit_seconds: self.wall_time_limit,
            memory_limit_bytes: self.memory_limit,
            cpu_core_count: self.cores,
            requested_cpu_index: self.cpu_index,
        };
        let environment = EnvironmentConfig {
            new: self.env.iter().cloned().collect(),
            additional: self.append_env.iter().cloned().collect(),
        };
        RunRequest {
            command: self.command.clone(),
            limits,
            output_path: self.output.clone(),
            cpu_index: self.cpu_index,
            environment,
            working_dir: self.dir.clone(),
            max_log_size: self.max_log_size,
        }
    }
}
