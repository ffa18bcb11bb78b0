//! Bounded retry with attempt-scaled backoff.
//!
//! Shared by the version checker and the downloader. Attempt `n` (1-based)
//! that fails transiently sleeps `base_delay * n` before attempt `n + 1`.
//! Non-transient failures are returned immediately.

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Classifies failures as worth retrying or not.
pub trait Transient {
    /// Returns `true` if the same operation may succeed when repeated.
    fn is_transient(&self) -> bool;
}

/// How many times to try and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Values below 1 act as 1.
    pub max_attempts: u32,
    /// Backoff unit.
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Create a policy.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// A policy that tries once.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Delay slept after failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

/// The last failure after retries stopped.
#[derive(Debug)]
pub struct RetryError<E> {
    /// Attempts made, including the failing one.
    pub attempts: u32,
    /// Error from the final attempt.
    pub error: E,
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (after {} attempt(s))", self.error, self.attempts)
    }
}

/// Run `op` until it succeeds, fails non-transiently, or the policy runs out.
///
/// `op` receives the 1-based attempt number.
///
/// # Errors
///
/// Returns the final error together with the number of attempts made.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if !error.is_transient() || attempt >= max_attempts => {
                return Err(RetryError {
                    attempts: attempt,
                    error,
                });
            }
            Err(error) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    op = label,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "attempt failed, retrying: {error}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
