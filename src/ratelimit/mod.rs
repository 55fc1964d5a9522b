//! Token-bucket rate limiting
//!
//! A [`RateLimiter`] answers "may I proceed now" by blocking the caller until
//! its next token is released. The fixed-rate variant has a burst size of
//! one: callers are released at least `interval` apart no matter how many
//! tasks share the limiter. Every wait observes a [`CancellationToken`].

use crate::Cancelled;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Builds a fresh limiter per transport so each one is paced independently
pub type LimiterFactory = Arc<dyn Fn() -> RateLimiter + Send + Sync>;

/// Blocking token bucket with burst size 1
#[derive(Debug)]
pub struct RateLimiter {
    /// Minimum spacing between releases; `None` means unlimited
    interval: Option<Duration>,

    /// Earliest instant the next token may be released
    next: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// A limiter that never blocks
    pub fn unlimited() -> Self {
        Self {
            interval: None,
            next: Mutex::new(None),
        }
    }

    /// A limiter releasing one token every `interval`
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval: Some(interval),
            next: Mutex::new(None),
        }
    }

    /// A limiter releasing `rate` tokens per second
    ///
    /// Rates that do not describe a finite interval (zero, negative, NaN)
    /// fall back to unlimited; configuration validation rejects them earlier.
    pub fn per_second(rate: f64) -> Self {
        match Duration::try_from_secs_f64(1.0 / rate) {
            Ok(interval) if rate > 0.0 => Self::with_interval(interval),
            _ => Self::unlimited(),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.interval.is_none()
    }

    /// Blocks until the next token is available and returns its release time
    ///
    /// Each call reserves the next free slot before sleeping, so concurrent
    /// callers are released strictly in reservation order. A cancelled call
    /// forfeits its slot.
    ///
    /// # Arguments
    ///
    /// * `cancel` - Unblocks the wait immediately when cancelled
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] if `cancel` fires before the token is released.
    pub async fn take(&self, cancel: &CancellationToken) -> Result<Instant, Cancelled> {
        let Some(interval) = self.interval else {
            return Ok(Instant::now());
        };

        let release = {
            let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            let release = match *next {
                Some(slot) if slot > now => slot,
                _ => now,
            };
            *next = Some(release + interval);
            release
        };

        if release <= Instant::now() {
            return Ok(release);
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(Cancelled),
            _ = tokio::time::sleep_until(release) => Ok(release),
        }
    }

    /// Takes `tokens` tokens back to back
    ///
    /// Used as a penalty after the remote side signals overload.
    pub async fn penalize(&self, tokens: u32, cancel: &CancellationToken) -> Result<(), Cancelled> {
        for _ in 0..tokens {
            self.take(cancel).await?;
        }
        Ok(())
    }
}

/// Factory producing unlimited limiters
pub fn unlimited_factory() -> LimiterFactory {
    Arc::new(RateLimiter::unlimited)
}

/// Factory producing limiters of `rate` requests per second
pub fn per_second_factory(rate: f64) -> LimiterFactory {
    Arc::new(move || RateLimiter::per_second(rate))
}
