//! Bounded retry with exponential backoff, shared by every outbound call.
//!
//! The policy is plain data; each call site decides which errors are worth
//! retrying. State lives on the stack of a single [`RetryPolicy::execute`]
//! call, so there is no backoff memory between calls.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Serializable retry settings as they appear in config files.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 2000,
            backoff_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    backoff_multiplier: f64,
}

struct RetryState {
    attempt: u32,
    current_delay: Duration,
}

impl RetryPolicy {
    /// `max_attempts` is clamped to at least 1; `1` disables retrying.
    pub fn new(max_attempts: u32, initial_delay: Duration, backoff_multiplier: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            backoff_multiplier: if backoff_multiplier.is_finite() && backoff_multiplier > 0.0 {
                backoff_multiplier
            } else {
                1.0
            },
        }
    }

    #[cfg(test)]
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, 1.0)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay slept after failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        self.initial_delay
            .mul_f64(self.backoff_multiplier.powi(exponent))
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error, or
    /// attempts run out. On exhaustion the last error is returned unchanged.
    pub async fn execute<T, E, F, Fut, R>(
        &self,
        label: &str,
        mut operation: F,
        is_retryable: R,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: Display,
    {
        let mut state = RetryState {
            attempt: 1,
            current_delay: self.delay_after(1),
        };

        loop {
            debug!("{}: attempt {}/{}", label, state.attempt, self.max_attempts);

            match operation().await {
                Ok(value) => {
                    if state.attempt > 1 {
                        info!("{}: succeeded on attempt {}", label, state.attempt);
                    }
                    return Ok(value);
                }
                Err(err) if !is_retryable(&err) => {
                    debug!(
                        "{}: non-retryable failure on attempt {}: {}",
                        label, state.attempt, err
                    );
                    return Err(err);
                }
                Err(err) if state.attempt >= self.max_attempts => {
                    warn!(
                        "{}: giving up after {} attempts: {}",
                        label, state.attempt, err
                    );
                    return Err(err);
                }
                Err(err) => {
                    warn!(
                        "{}: attempt {}/{} failed: {}. Retrying in {:?}",
                        label, state.attempt, self.max_attempts, err, state.current_delay
                    );
                    tokio::time::sleep(state.current_delay).await;
                    state.attempt += 1;
                    state.current_delay = self.delay_after(state.attempt);
                }
            }
        }
    }
}

impl From<RetrySettings> for RetryPolicy {
    fn from(settings: RetrySettings) -> Self {
        Self::new(
            settings.max_attempts,
            Duration::from_millis(settings.initial_delay_ms),
            settings.backoff_multiplier,
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetrySettings::default().into()
    }
}
