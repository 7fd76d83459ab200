//! # Activity Executor
//!
//! Every stage, step and compensation call goes through [`ActivityExecutor::run`],
//! which bounds it with a timeout and turns every failure mode (error,
//! timeout, panic) into an [`ActivityError`] tagged with the activity name.

use crate::constants::MAX_STAGE_TIMEOUT;
use crate::error::ActivityError;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Bounded, panic-safe call wrapper
#[derive(Debug, Clone)]
pub struct ActivityExecutor {
    /// Ceiling applied to every requested timeout
    max_timeout: Duration,
}

impl Default for ActivityExecutor {
    fn default() -> Self {
        Self::new(MAX_STAGE_TIMEOUT)
    }
}

impl ActivityExecutor {
    pub fn new(max_timeout: Duration) -> Self {
        Self { max_timeout }
    }

    pub fn max_timeout(&self) -> Duration {
        self.max_timeout
    }

    /// Run `future` under `timeout`
    ///
    /// Errors raised by the call keep their kind and are re-tagged with
    /// `name`; expiry yields `TIMEOUT`; a panic yields `INTERNAL`.
    pub async fn run<T, F>(&self, name: &str, future: F, timeout: Duration) -> Result<T, ActivityError>
    where
        F: Future<Output = Result<T, ActivityError>>,
    {
        let timeout = timeout.min(self.max_timeout);
        let started = Instant::now();

        let outcome = tokio::time::timeout(timeout, AssertUnwindSafe(future).catch_unwind()).await;

        match outcome {
            Ok(Ok(Ok(value))) => {
                debug!(
                    activity = %name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Activity completed"
                );
                Ok(value)
            }
            Ok(Ok(Err(error))) => Err(error.with_activity(name)),
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                warn!(activity = %name, panic = %message, "⚠️ Activity panicked");
                Err(ActivityError::internal(name, format!("panicked: {message}")))
            }
            Err(_) => {
                warn!(
                    activity = %name,
                    timeout_ms = timeout.as_millis() as u64,
                    "⏰ Activity timed out"
                );
                Err(ActivityError::timeout(name, timeout))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
