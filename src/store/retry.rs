//! Bounded exponential backoff for store calls
//!
//! Only errors classified by [`StoreError::is_transient`] are retried. The
//! delay doubles per attempt up to a cap, plus up to half again as random
//! jitter, and every sleep gives way to cancellation.

use crate::config::RetryConfig;
use crate::store::StoreError;
use crate::Cancelled;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Bounded exponential backoff with jitter for store round-trips
///
/// Only errors classified by [`StoreError::is_transient`] are retried. The
/// delay before attempt `n + 1` is `initial * 2^(n - 1)`, capped at `max`,
/// plus up to half of that again as jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff,
        }
    }

    /// Single attempt, no retries
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the attempt following attempt number `attempt` (1-based), without jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Runs `operation` until it succeeds, fails permanently, exhausts the
    /// attempt budget, or `cancel` fires
    ///
    /// # Arguments
    ///
    /// * `cancel` - Aborts both the attempt in flight and the backoff sleep
    /// * `what` - Operation description for retry logs
    /// * `operation` - Produces a fresh attempt each time it is called
    ///
    /// # Errors
    ///
    /// The last attempt's error, or `StoreError::Cancelled`.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        what: &str,
        mut operation: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 1;
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(Cancelled.into()),
                result = operation() => result,
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => e,
                Err(e) => {
                    if attempt > 1 {
                        tracing::warn!("{} failed after {} attempts: {}", what, attempt, e);
                    }
                    return Err(e);
                }
            };

            let backoff = self.backoff(attempt);
            let jitter_ms = (backoff.as_millis() / 2) as u64;
            let jitter = Duration::from_millis(rand::rng().random_range(0..=jitter_ms));
            tracing::warn!(
                "{} failed (attempt {}/{}): {}, retrying in {:?}",
                what,
                attempt,
                self.max_attempts,
                err,
                backoff + jitter
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(Cancelled.into()),
                _ = tokio::time::sleep(backoff + jitter) => {}
            }
            attempt += 1;
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}
