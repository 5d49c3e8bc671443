//! Backoff controller
//!
//! Wraps a single contact's send with bounded exponential retry. This is a
//! pure, context-free helper: it knows nothing about broadcasts or
//! contacts, only "do this send, retry this way". Permanent errors
//! short-circuit the remaining attempts.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::channel::SendError;

/// Retry policy for one send attempt sequence.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Additional attempts after the first try
    pub max_retries: u32,
    /// Base delay in seconds; attempt n sleeps base * 2^n before retrying
    pub base_seconds: u64,
    /// Upper bound on any single delay
    pub max_seconds: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_seconds: 1,
            max_seconds: 60,
        }
    }
}

impl BackoffPolicy {
    /// Delay slept after a failed attempt (1s, 2s, 4s for attempts 0,1,2
    /// under the defaults), capped at `max_seconds`. A rate-limit hint from
    /// the provider takes precedence when it is larger.
    pub fn delay_for_attempt(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        let exp = self
            .base_seconds
            .saturating_mul(1u64 << attempt.min(32))
            .min(self.max_seconds);
        let seconds = match retry_after_secs {
            Some(hint) => exp.max(hint).min(self.max_seconds),
            None => exp,
        };
        Duration::from_secs(seconds)
    }
}

/// Run `operation` with the given policy, retrying retryable failures up to
/// the attempt cap. Returns the last error once all attempts are exhausted
/// or the first permanent error immediately.
pub async fn send_with_backoff<T, F, Fut>(
    policy: &BackoffPolicy,
    mut operation: F,
) -> Result<T, SendError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, SendError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if !error.is_retryable() {
                    debug!(attempt, error = %error, "Permanent send error; not retrying");
                    return Err(error);
                }
                if attempt >= policy.max_retries {
                    return Err(error);
                }

                let retry_after = match &error.kind {
                    crate::channel::SendErrorKind::RateLimited { retry_after_secs } => {
                        *retry_after_secs
                    }
                    _ => None,
                };
                let delay = policy.delay_for_attempt(attempt, retry_after);
                warn!(
                    attempt,
                    delay_secs = delay.as_secs(),
                    error = %error,
                    "Send attempt failed; backing off"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
