//! Bounded retry with fixed backoff
//!
//! Used wherever the installer waits on the kernel or udev: partition nodes
//! appearing, a device-mapper mapping becoming closable, the network coming
//! up. Every loop has a hard attempt ceiling.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Fixed attempt count with a fixed sleep between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Zero is treated as one.
    pub attempts: u32,
    /// Sleep between attempts, in milliseconds.
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, backoff_ms: u64) -> Self {
        Self {
            attempts,
            backoff_ms,
        }
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    fn ceiling(&self) -> u32 {
        self.attempts.max(1)
    }
}

/// Returned when every attempt failed.
#[derive(Debug, Error)]
#[error("{what} still failing after {attempts} attempt(s): {last_error}")]
pub struct RetryExhausted<E: fmt::Display + fmt::Debug> {
    pub what: String,
    pub attempts: u32,
    pub last_error: E,
}

/// Run `op` until it succeeds or the policy's ceiling is reached.
///
/// `op` receives the 1-based attempt number so callers can escalate
/// (e.g. kill holders of a busy device) on later attempts.
pub fn retry<T, E, F>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, RetryExhausted<E>>
where
    E: fmt::Display + fmt::Debug,
    F: FnMut(u32) -> Result<T, E>,
{
    let ceiling = policy.ceiling();
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!("{} succeeded on attempt {}/{}", what, attempt, ceiling);
                }
                return Ok(value);
            }
            Err(e) if attempt >= ceiling => {
                return Err(RetryExhausted {
                    what: what.to_string(),
                    attempts: attempt,
                    last_error: e,
                });
            }
            Err(e) => {
                tracing::debug!("{} attempt {}/{} failed: {}", what, attempt, ceiling, e);
                std::thread::sleep(policy.backoff());
                attempt += 1;
            }
        }
    }
}
