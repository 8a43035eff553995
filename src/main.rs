//! runexec: run a single command under resource limits and report its
//! CPU time, wall time, peak memory and exit status as JSON.
//!
//! # Usage
//! ```bash
//! runexec --timelimit 900 --memlimit 15000000000 --cores 2 --output run.log -- ./tool input.c
//! runexec --request run.json
//! ```
use anyhow::{Context, Result};
use clap::Parser;
use nix::sys::signal::{SigSet, Signal};
use runexec::cli::Cli;
use runexec::{RunExecutor, RunRequest};
use std::sync::Arc;
use std::thread;

/// Kill all runs when SIGINT or SIGTERM arrives. The signals are blocked in
/// the calling thread, so this must run before any other thread is started.
fn install_interrupt_handler(executor: Arc<RunExecutor>) -> Result<()> {
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    signals.thread_block().context("Failed to block termination signals")?;

    thread::Builder::new()
        .name("interrupt-handler".to_string())
        .spawn(move || match signals.wait() {
            Ok(signal) => {
                log::warn!("Received {}, killing all running processes", signal);
                executor.kill_all_running();
            }
            Err(e) => log::error!("Waiting for termination signals failed: {}", e),
        })
        .context("Failed to start interrupt handler")?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    if !cfg!(target_os = "linux") {
        log::warn!("runexec needs Linux cgroups, limits will not be enforced on this platform");
    }

    let cli = Cli::parse();
    let request = match &cli.request {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read run request {}", path.display()))?;
            RunRequest::from_json(&json)?
        }
        None => {
            let request = cli.to_request();
            request.validate()?;
            request
        }
    };

    let executor = Arc::new(RunExecutor::new());
    install_interrupt_handler(Arc::clone(&executor))?;

    let result = executor.execute_request(&request)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
