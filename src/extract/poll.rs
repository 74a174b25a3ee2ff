use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::error::ExtractError;

/// How often to ask, how fast to back off, and when to give up.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_interval: Duration,
    pub backoff: f64,
    pub timeout: Duration,
}

#[derive(Debug)]
pub enum Progress<T> {
    Pending(String),
    Done(T),
}

const STOP_CHECK: Duration = Duration::from_millis(250);

/// Call `check` until it reports `Done`, errors, the timeout passes, or `stop` is set.
///
/// Only the calling task waits; the delay grows by `backoff` up to `max_interval`.
pub async fn poll_until<T, F, Fut>(policy: &PollPolicy, stop: &AtomicBool, mut check: F) -> Result<T, ExtractError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Progress<T>, ExtractError>>,
{
    let started = Instant::now();
    let mut delay = policy.interval;
    let mut attempt = 0u32;

    loop {
        if stop.load(Ordering::Acquire) {
            return Err(ExtractError::Cancelled);
        }

        attempt += 1;
        match check().await? {
            Progress::Done(value) => return Ok(value),
            Progress::Pending(status) => {
                debug!(attempt, status = %status, "Still waiting on extraction");
            }
        }

        if started.elapsed() + delay > policy.timeout {
            return Err(ExtractError::TimedOut(policy.timeout));
        }
        if !sleep_unless_stopped(delay, stop).await {
            return Err(ExtractError::Cancelled);
        }
        delay = delay.mul_f64(policy.backoff).min(policy.max_interval);
    }
}

/// Returns false if `stop` was raised during the wait.
async fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if stop.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        sleep((deadline - now).min(STOP_CHECK)).await;
    }
}
