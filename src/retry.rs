//! Exponential backoff for idempotent upstream calls.
//!
//! Only the model listing goes through here. Chat completions are never
//! retried: a stream that already produced client-visible output cannot be
//! replayed.
//!
//! ```rust,no_run
//! use thinking_relay::retry::{retry_transient, RetryPolicy};
//! use std::time::Duration;
//!
//! # async fn example() -> thinking_relay::Result<()> {
//! let policy = RetryPolicy::default().with_initial_delay(Duration::from_millis(200));
//! let value = retry_transient(&policy, "GET /models", || async {
//!     Ok::<_, thinking_relay::Error>(42)
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;

/// Backoff schedule.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Growth factor applied per retry
    pub multiplier: f64,
    /// Fraction of the delay randomized around its nominal value (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `retry` (0-based), capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64 * self.multiplier.powi(retry as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);

        let spread = capped * self.jitter;
        let offset = rand::random::<f64>() * spread - spread / 2.0;

        Duration::from_millis((capped + offset).max(0.0) as u64)
    }
}

/// Whether an upstream failure is worth retrying.
///
/// Network-level failures, 429 and 5xx are transient. Client errors, bad
/// payloads and everything outside the upstream client are not.
pub fn is_transient(error: &Error) -> bool {
    match error {
        Error::Http(e) => !(e.is_decode() || e.is_builder()),
        Error::UpstreamStatus { status, .. } => *status == 429 || (500..600).contains(status),
        _ => false,
    }
}

/// Run `operation` until it succeeds, fails permanently, or the policy is
/// exhausted. Returns the last error in the latter two cases.
pub async fn retry_transient<F, Fut, T>(policy: &RetryPolicy, label: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts && is_transient(&e) => {
                let delay = policy.delay_for(attempt - 1);
                log::warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    label,
                    attempt,
                    attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
