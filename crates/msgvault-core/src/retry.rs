//! Bounded exponential backoff for chunk operations

use crate::{CoreError, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Retry bound and backoff schedule for one chunk
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_backoff: Duration,
    /// Upper bound on any single delay
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Policy with a custom bound and initial delay
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            ..Default::default()
        }
    }

    /// Delay after `failures` consecutive failures (1-based), doubling each time
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// Run `op` for chunk `index` until it succeeds, fails permanently, or
    /// exhausts the attempt bound.
    ///
    /// Retryable failures that exhaust the bound become
    /// [`CoreError::ChunkTransfer`]; permanent failures are returned as is.
    /// Cancellation interrupts the backoff sleep.
    pub async fn run<T, F, Fut>(&self, index: u32, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !err.is_retryable() {
                return Err(err);
            }
            if attempt >= self.max_attempts {
                return Err(CoreError::ChunkTransfer {
                    index,
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            let delay = self.backoff(attempt);
            warn!(chunk = index, attempt, ?delay, error = %err, "Chunk operation failed, retrying");
            tokio::select! {
                _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
