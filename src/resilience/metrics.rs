//! # Circuit Breaker Metrics
//!
//! Point-in-time snapshots of breaker state for operator health queries.

use crate::resilience::CircuitState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metrics for a single circuit breaker instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    pub component: String,

    pub current_state: CircuitState,

    /// Current consecutive failure count
    pub consecutive_failures: u32,

    pub failure_threshold: u32,

    /// Number of closed-to-open transitions since startup
    pub times_opened: u64,

    pub last_opened_at: Option<DateTime<Utc>>,

    pub last_reset_at: Option<DateTime<Utc>>,
}

impl CircuitBreakerMetrics {
    pub fn is_open(&self) -> bool {
        self.current_state == CircuitState::Open
    }
}
