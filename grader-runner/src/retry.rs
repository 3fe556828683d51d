//! Retry policy for transient pipeline operations
//!
//! Git fetches and pushes are retried with exponential backoff according to
//! the configured policy. `max_attempts == 1` means a failure is final.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (at least 1)
    pub max_attempts: u32,
    /// Delay before the second attempt, doubled for each further attempt
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
        }
    }

    pub fn bounded(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
        }
    }

    /// Runs `op` until it succeeds or the attempts are exhausted
    ///
    /// Returns the last error when every attempt failed.
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        let mut delay = self.initial_backoff;

        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.max_attempts => return Err(e),
                Err(e) => {
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        what, attempt, self.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_BACKOFF);
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}
