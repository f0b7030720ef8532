use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::error::{Error, Result};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

/// Bounded retry with a fixed pause, applied to every board call.
///
/// Only errors for which [`Error::is_transient`] holds are retried. A
/// transient error on the final attempt is downgraded to
/// [`Error::BoardPermanent`] so callers see a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Run `op`, retrying transient failures. `what` names the call in logs.
    pub fn run<T, F>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(val) => return Ok(val),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    warn!(
                        what,
                        attempt,
                        max_attempts,
                        error = %e,
                        backoff_ms = self.backoff.as_millis() as u64,
                        "retrying after transient board error"
                    );
                    if !self.backoff.is_zero() {
                        thread::sleep(self.backoff);
                    }
                    attempt += 1;
                }
                Err(Error::BoardTransient(msg)) => {
                    return Err(Error::BoardPermanent(format!(
                        "{what} failed after {attempt} attempts: {msg}"
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }
}
