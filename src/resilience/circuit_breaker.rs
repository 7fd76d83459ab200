//! # Circuit Breaker Implementation
//!
//! Per-stage consecutive-failure gate. The breaker is open exactly when the
//! consecutive error count has reached the threshold; one success or an
//! operator reset closes it and zeroes the count. There is no half-open
//! probing: an open stage stays skipped until it is reset.

use crate::resilience::CircuitBreakerMetrics;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls are allowed through
    Closed,
    /// Calls are skipped without executing
    Open,
}

/// Consecutive-failure breaker for one stage
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Stage name for logging and metrics
    name: String,

    failure_threshold: u32,

    consecutive_failures: AtomicU32,

    /// How many times this breaker has opened since startup
    times_opened: AtomicU64,

    last_opened_at: Mutex<Option<DateTime<Utc>>>,

    last_reset_at: Mutex<Option<DateTime<Utc>>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32) -> Self {
        let name = name.into();
        debug!(
            component = %name,
            failure_threshold = failure_threshold,
            "🛡️ Circuit breaker initialized"
        );

        Self {
            name,
            failure_threshold: failure_threshold.max(1),
            consecutive_failures: AtomicU32::new(0),
            times_opened: AtomicU64::new(0),
            last_opened_at: Mutex::new(None),
            last_reset_at: Mutex::new(None),
        }
    }

    pub fn state(&self) -> CircuitState {
        if self.is_open() {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    pub fn is_open(&self) -> bool {
        self.consecutive_failures.load(Ordering::Acquire) >= self.failure_threshold
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Record a failed call. Returns `true` when this error opened the circuit.
    pub fn record_error(&self) -> bool {
        let count = self
            .consecutive_failures
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1);

        if count == self.failure_threshold {
            self.times_opened.fetch_add(1, Ordering::Relaxed);
            *self.last_opened_at.lock() = Some(Utc::now());
            error!(
                component = %self.name,
                consecutive_failures = count,
                failure_threshold = self.failure_threshold,
                "🔴 Circuit breaker opened (stage will be skipped)"
            );
            true
        } else {
            debug!(
                component = %self.name,
                consecutive_failures = count,
                failure_threshold = self.failure_threshold,
                "Stage error recorded"
            );
            false
        }
    }

    /// Record a successful call. Returns `true` when this success closed an open circuit.
    pub fn record_success(&self) -> bool {
        let previous = self.consecutive_failures.swap(0, Ordering::AcqRel);
        let was_open = previous >= self.failure_threshold;
        if was_open {
            info!(
                component = %self.name,
                "🟢 Circuit breaker closed (recovered)"
            );
        }
        was_open
    }

    /// Operator reset: unconditionally close and zero the counter
    pub fn reset(&self) {
        let previous = self.consecutive_failures.swap(0, Ordering::AcqRel);
        *self.last_reset_at.lock() = Some(Utc::now());
        warn!(
            component = %self.name,
            previous_failures = previous,
            "🚨 Circuit breaker reset by operator"
        );
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            component: self.name.clone(),
            current_state: self.state(),
            consecutive_failures: self.consecutive_failures(),
            failure_threshold: self.failure_threshold,
            times_opened: self.times_opened.load(Ordering::Relaxed),
            last_opened_at: *self.last_opened_at.lock(),
            last_reset_at: *self.last_reset_at.lock(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
