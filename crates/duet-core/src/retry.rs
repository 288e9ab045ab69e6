//! Bounded retry with exponential backoff around provider calls.
//!
//! All provider failures are treated uniformly: rate limits, network
//! errors, and malformed responses retry the same way, and only the final
//! error message is preserved for diagnosis.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Base delay; attempt `n` waits `2^n * base`
    pub base: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base: Duration::from_secs(1),
        }
    }
}

impl BackoffConfig {
    /// Delay before retry `attempt` (1-based): 2s then 4s with defaults
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Outcome of an exhausted or interrupted retry loop
#[derive(Debug, Error)]
pub enum RetryError {
    /// Every attempt failed; carries the last underlying error verbatim
    #[error("gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    /// The caller cancelled while waiting or between attempts
    #[error("cancelled")]
    Cancelled,
}

/// Wraps provider calls with bounded retries and exponential delay.
pub struct RetrySupervisor {
    config: BackoffConfig,
}

impl RetrySupervisor {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// Run `op` until it succeeds, retrying up to `max_retries` times with
    /// exponential delay. `on_retry` is invoked before each delay so callers
    /// can surface progress to viewers. Cancellation short-circuits any
    /// outstanding delay.
    pub async fn invoke<T, E, F, Fut>(
        &self,
        mut op: F,
        cancel: &CancellationToken,
        mut on_retry: impl FnMut(u32, Duration),
    ) -> std::result::Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if cancel.is_cancelled() {
                        return Err(RetryError::Cancelled);
                    }
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            last_error: e.to_string(),
                        });
                    }
                    let delay = self.config.delay_for_attempt(attempt);
                    tracing::warn!(
                        "provider call failed (attempt {}): {}; retrying in {:?}",
                        attempt,
                        e,
                        delay
                    );
                    on_retry(attempt, delay);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}
