//! # Retry Policies
//!
//! Exponential backoff for workflow steps. Two classes exist: `fast` for
//! local, deterministic steps and `agent` for stage-backed steps that talk
//! to slow external services.

use super::ActivityExecutor;
use crate::constants::retry;
use crate::error::ActivityError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff schedule and attempt budget for one call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub maximum_interval: Duration,
    pub backoff_coefficient: f64,
    /// Total attempts, including the first
    pub maximum_attempts: u32,
    /// Add up to 10% random jitter to each delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fast()
    }
}

impl RetryPolicy {
    /// 1s initial, 10s cap, 3 attempts
    pub fn fast() -> Self {
        Self {
            initial_interval: retry::FAST_INITIAL_INTERVAL,
            maximum_interval: retry::FAST_MAXIMUM_INTERVAL,
            backoff_coefficient: retry::BACKOFF_COEFFICIENT,
            maximum_attempts: retry::FAST_MAXIMUM_ATTEMPTS,
            jitter: false,
        }
    }

    /// 2s initial, 30s cap, 3 attempts
    pub fn agent() -> Self {
        Self {
            initial_interval: retry::AGENT_INITIAL_INTERVAL,
            maximum_interval: retry::AGENT_MAXIMUM_INTERVAL,
            backoff_coefficient: retry::BACKOFF_COEFFICIENT,
            maximum_attempts: retry::AGENT_MAXIMUM_ATTEMPTS,
            jitter: false,
        }
    }

    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            initial_interval: Duration::ZERO,
            maximum_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            maximum_attempts: 1,
            jitter: false,
        }
    }

    pub fn with_maximum_attempts(mut self, attempts: u32) -> Self {
        self.maximum_attempts = attempts.max(1);
        self
    }

    pub fn with_intervals(mut self, initial: Duration, maximum: Duration) -> Self {
        self.initial_interval = initial;
        self.maximum_interval = maximum.max(initial);
        self
    }

    /// Delay before retrying after failed attempt `attempt` (1-based).
    /// Computed in seconds and clamped before converting back, so any
    /// coefficient or attempt count yields at most `maximum_interval`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let maximum = self.maximum_interval.as_secs_f64();
        let factor = self.backoff_coefficient.max(1.0).powi(exponent);

        let mut seconds = self.initial_interval.as_secs_f64() * factor;
        if !seconds.is_finite() || seconds > maximum {
            seconds = maximum;
        }
        if self.jitter {
            seconds = (seconds * (1.0 + fastrand::f64() * 0.1)).min(maximum);
        }

        Duration::try_from_secs_f64(seconds)
            .map(|delay| delay.min(self.maximum_interval))
            .unwrap_or(self.maximum_interval)
    }
}

/// Result of a retried call plus the attempts it took
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, ActivityError>,
    pub attempts: u32,
}

impl<T> RetryOutcome<T> {
    pub fn into_result(self) -> Result<T, ActivityError> {
        self.result
    }
}

/// Call `operation` through `executor` until it succeeds, fails with a
/// non-retryable kind, or the policy's attempts are exhausted
pub async fn run_with_retry<T, F, Fut>(
    executor: &ActivityExecutor,
    policy: &RetryPolicy,
    name: &str,
    timeout: Duration,
    mut operation: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ActivityError>>,
{
    let maximum_attempts = policy.maximum_attempts.max(1);
    let mut attempt = 1;

    loop {
        match executor.run(name, operation(attempt), timeout).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(activity = %name, attempt = attempt, "Succeeded after retry");
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                };
            }
            Err(error) if !error.is_retryable() || attempt >= maximum_attempts => {
                if error.is_retryable() {
                    warn!(
                        activity = %name,
                        attempts = attempt,
                        kind = %error.kind,
                        "🔁 Retries exhausted"
                    );
                }
                return RetryOutcome {
                    result: Err(error),
                    attempts: attempt,
                };
            }
            Err(error) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    activity = %name,
                    attempt = attempt,
                    maximum_attempts = maximum_attempts,
                    kind = %error.kind,
                    delay_ms = delay.as_millis() as u64,
                    "🔁 Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
