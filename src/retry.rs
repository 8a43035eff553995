//! Retrying of transiently failing cgroup file operations
use crate::types::Result;
use std::thread;
use std::time::Duration;

/// Run `op` up to `attempts` times, sleeping `delay` between attempts and
/// doubling it after each failure. Returns the last error if every attempt fails.
pub fn retry_with_backoff<T, F>(attempts: u32, delay: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut delay = delay;
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                log::debug!("Attempt {} of {} failed: {}", attempt, attempts, e);
                thread::sleep(delay);
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
        }
    }
}
