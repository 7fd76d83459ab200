//! # Stage Types
//!
//! The fixed interface every analysis stage implements, plus the descriptor
//! the registry keeps for it.

use crate::error::ActivityError;
use crate::resilience::CircuitBreakerMetrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

/// A single analysis stage
///
/// Implementations own the analytic content (prompts, external calls); the
/// engine only sees `process(input) -> output`.
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Run the stage against its projected input
    async fn process(&self, input: Value) -> Result<Value, ActivityError>;

    /// Build this stage's input from the raw transaction and the results
    /// produced so far in the current run.
    ///
    /// The default hands over the raw input plus the outputs of declared
    /// dependencies that are already available.
    fn project_input(
        &self,
        descriptor: &StageDescriptor,
        raw_input: &Value,
        prior_results: &HashMap<String, Value>,
    ) -> Value {
        default_projection(descriptor, raw_input, prior_results)
    }
}

/// Raw input plus the available outputs of the stage's dependencies
pub fn default_projection(
    descriptor: &StageDescriptor,
    raw_input: &Value,
    prior_results: &HashMap<String, Value>,
) -> Value {
    let upstream: Map<String, Value> = descriptor
        .dependencies
        .iter()
        .filter_map(|dep| prior_results.get(dep).map(|out| (dep.clone(), out.clone())))
        .collect();

    json!({
        "stage": descriptor.id,
        "transaction": raw_input,
        "upstream": upstream,
    })
}

/// Stage health as seen by operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Healthy,
    /// Recent errors, breaker still closed
    Degraded,
    /// Breaker open
    Unavailable,
    /// Registered but not yet called
    #[default]
    Initializing,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::Initializing => write!(f, "initializing"),
        }
    }
}

/// Live call counters for one stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageCounters {
    pub total_calls: u64,
    pub total_errors: u64,
    pub average_latency_ms: f64,
    pub last_called_at: Option<DateTime<Utc>>,
}

impl StageCounters {
    pub fn record(&mut self, success: bool, latency: Duration) {
        self.total_calls += 1;
        if !success {
            self.total_errors += 1;
        }
        let latency_ms = latency.as_secs_f64() * 1000.0;
        self.average_latency_ms += (latency_ms - self.average_latency_ms) / self.total_calls as f64;
        self.last_called_at = Some(Utc::now());
    }

    pub fn error_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.total_errors as f64 / self.total_calls as f64
        }
    }
}

/// Registry entry describing a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDescriptor {
    pub id: String,
    pub capabilities: BTreeSet<String>,
    /// Advisory: consumed by input projection, not by scheduling
    pub dependencies: BTreeSet<String>,
    pub status: StageStatus,
    pub counters: StageCounters,
    /// Overrides the default call timeout
    pub timeout: Option<Duration>,
    /// Overrides the default breaker threshold
    pub failure_threshold: Option<u32>,
}

impl StageDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capabilities: BTreeSet::new(),
            dependencies: BTreeSet::new(),
            status: StageStatus::Initializing,
            counters: StageCounters::default(),
            timeout: None,
            failure_threshold: None,
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }
}

/// Operator-facing health snapshot for one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageHealthReport {
    pub stage: String,
    pub status: StageStatus,
    pub total_calls: u64,
    pub total_errors: u64,
    pub error_rate: f64,
    pub average_latency_ms: f64,
    pub last_called_at: Option<DateTime<Utc>>,
    pub breaker: CircuitBreakerMetrics,
}
