//! Background watchers that enforce limits while a run is in progress
use crate::types::{Result, TerminationReason};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How a watcher finished
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchOutcome {
    Cancelled,
    /// The watcher killed the run
    Fired(TerminationReason),
}

/// Cancellation flag that can wake a sleeping watcher
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, condvar) = &*self.inner;
        *flag.lock().unwrap_or_else(|e| e.into_inner()) = true;
        condvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sleep for `timeout` unless cancelled earlier. Returns whether the token is cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, condvar) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, _) = condvar
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }
}

/// A limit enforcer that runs on its own thread.
///
/// Watchers are built by the executor and started with [`spawn_watcher`];
/// they never start themselves.
pub trait Watcher: Send + 'static {
    fn name(&self) -> &'static str;

    /// Closure that stops `watch` as soon as possible, even while it is blocked
    fn canceller(&self) -> Box<dyn FnOnce() + Send>;

    /// Block until the watcher fires or is cancelled
    fn watch(self) -> WatchOutcome;
}

/// Handle of a running watcher
pub struct WatcherHandle {
    name: &'static str,
    canceller: Option<Box<dyn FnOnce() + Send>>,
    thread: Option<JoinHandle<WatchOutcome>>,
}

impl WatcherHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Request the watcher to stop. Further calls are no-ops.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.canceller.take() {
            cancel();
        }
    }

    /// Cancel the watcher and wait for its thread to finish
    pub fn join(mut self) -> WatchOutcome {
        self.finish()
    }

    fn finish(&mut self) -> WatchOutcome {
        self.cancel();
        match self.thread.take().map(JoinHandle::join) {
            Some(Ok(outcome)) => outcome,
            Some(Err(_)) => {
                log::error!("Watcher thread {} panicked", self.name);
                WatchOutcome::Cancelled
            }
            None => WatchOutcome::Cancelled,
        }
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.finish();
        }
    }
}

/// Start `watcher` on a new thread
pub fn spawn_watcher<W: Watcher>(watcher: W) -> Result<WatcherHandle> {
    let name = watcher.name();
    let canceller = watcher.canceller();
    let thread = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || watcher.watch())?;
    Ok(WatcherHandle {
        name,
        canceller: Some(canceller),
        thread: Some(thread),
    })
}
