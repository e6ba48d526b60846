//! Bounded retry with fixed wait for transient failures.
//!
//! Mirrors the submission/fetch retry policy: a fixed number of attempts,
//! a fixed wait between them, and retry only when the caller classifies
//! the error as transient. Terminal errors are returned on first sight.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Retry policy: attempt count and wait between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    /// Fixed wait between attempts.
    pub wait: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, wait: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            wait,
        }
    }

    /// Runs `op` until it succeeds, fails terminally, or attempts are
    /// exhausted. `is_transient` decides whether an error is retryable.
    pub async fn run<T, E, F, Fut, P>(&self, mut op: F, is_transient: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.attempts && is_transient(&e) => {
                    warn!(attempt, error = %e, "transient failure, retrying");
                    tokio::time::sleep(self.wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
