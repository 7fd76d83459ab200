//! # Agentflow Configuration System
//!
//! Typed configuration for the orchestration engine, loaded from an optional
//! TOML file plus `AGENTFLOW__`-prefixed environment overrides.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use agentflow_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load_from_file("config/agentflow.toml")?;
//! let timeout = manager.config().execution.stage_timeout();
//! let threshold = manager.config().circuit_breaker.failure_threshold;
//! # Ok(())
//! # }
//! ```
//!
//! All durations are expressed in milliseconds in the file.

pub mod error;
pub mod loader;

use crate::constants::{self, retry, worker, workflow};
use crate::execution::RetryPolicy;
use crate::orchestration::PhaseDefinition;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentflowConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub execution: ExecutionConfig,
    pub retry: RetryConfig,
    /// Declared stages, in registration order
    pub stages: Vec<StageConfig>,
    /// Ordered phase plan for the orchestrator
    pub phases: Vec<PhaseDefinition>,
    pub worker: WorkerConfig,
    pub workflow: WorkflowConfig,
}

/// Circuit breaker settings shared by every stage without an override
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive errors before the breaker opens
    pub failure_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: constants::DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

/// Stage and step call execution settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub stage_timeout_ms: u64,
    pub max_stage_timeout_ms: u64,
    /// Attempts per stage call inside one orchestration run
    pub orchestrator_attempts: u32,
}

impl ExecutionConfig {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }

    pub fn max_stage_timeout(&self) -> Duration {
        Duration::from_millis(self.max_stage_timeout_ms)
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            stage_timeout_ms: constants::DEFAULT_STAGE_TIMEOUT.as_millis() as u64,
            max_stage_timeout_ms: constants::MAX_STAGE_TIMEOUT.as_millis() as u64,
            orchestrator_attempts: constants::DEFAULT_ORCHESTRATOR_ATTEMPTS,
        }
    }
}

/// Retry policy classes for workflow steps
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub fast: RetryPolicyConfig,
    pub agent: RetryPolicyConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            fast: RetryPolicyConfig {
                initial_interval_ms: retry::FAST_INITIAL_INTERVAL.as_millis() as u64,
                maximum_interval_ms: retry::FAST_MAXIMUM_INTERVAL.as_millis() as u64,
                backoff_coefficient: retry::BACKOFF_COEFFICIENT,
                maximum_attempts: retry::FAST_MAXIMUM_ATTEMPTS,
                jitter: false,
            },
            agent: RetryPolicyConfig {
                initial_interval_ms: retry::AGENT_INITIAL_INTERVAL.as_millis() as u64,
                maximum_interval_ms: retry::AGENT_MAXIMUM_INTERVAL.as_millis() as u64,
                backoff_coefficient: retry::BACKOFF_COEFFICIENT,
                maximum_attempts: retry::AGENT_MAXIMUM_ATTEMPTS,
                jitter: false,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryPolicyConfig {
    pub initial_interval_ms: u64,
    pub maximum_interval_ms: u64,
    pub backoff_coefficient: f64,
    pub maximum_attempts: u32,
    #[serde(default)]
    pub jitter: bool,
}

impl RetryPolicyConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(self.initial_interval_ms),
            maximum_interval: Duration::from_millis(self.maximum_interval_ms),
            backoff_coefficient: self.backoff_coefficient,
            maximum_attempts: self.maximum_attempts,
            jitter: self.jitter,
        }
    }

    fn validate(&self, class: &str) -> ConfigResult<()> {
        if self.maximum_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                format!("retry.{class}.maximum_attempts"),
                self.maximum_attempts,
                "must be greater than 0",
            ));
        }
        if !(1.0..=retry::MAX_BACKOFF_COEFFICIENT).contains(&self.backoff_coefficient) {
            return Err(ConfigurationError::invalid_value(
                format!("retry.{class}.backoff_coefficient"),
                self.backoff_coefficient,
                format!("must be within [1.0, {}]", retry::MAX_BACKOFF_COEFFICIENT),
            ));
        }
        if self.maximum_interval_ms < self.initial_interval_ms {
            return Err(ConfigurationError::invalid_value(
                format!("retry.{class}.maximum_interval_ms"),
                self.maximum_interval_ms,
                "must not be below initial_interval_ms",
            ));
        }
        Ok(())
    }
}

/// One declared stage
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StageConfig {
    pub id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Per-stage timeout override
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Per-stage breaker threshold override
    #[serde(default)]
    pub failure_threshold: Option<u32>,
}

/// Task queue worker settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub queue_name: String,
    pub batch_size: usize,
    pub visibility_timeout_seconds: u64,
    pub poll_interval_ms: u64,
    pub max_concurrent: usize,
    /// Outcomes kept for lookup by correlation id
    pub max_recorded_outcomes: usize,
}

impl WorkerConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_name: worker::DEFAULT_QUEUE_NAME.to_string(),
            batch_size: worker::DEFAULT_BATCH_SIZE,
            visibility_timeout_seconds: worker::DEFAULT_VISIBILITY_TIMEOUT_SECONDS,
            poll_interval_ms: worker::DEFAULT_POLL_INTERVAL_MS,
            max_concurrent: worker::DEFAULT_MAX_CONCURRENT,
            max_recorded_outcomes: worker::DEFAULT_MAX_RECORDED_OUTCOMES,
        }
    }
}

/// Durable workflow ownership and retention
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Lease on an instance held by the driver executing it
    pub claim_lease_ms: u64,
    /// Terminal instances are purged from the journal after this long
    pub journal_retention_seconds: u64,
    /// Terminal snapshots are evicted from the tracker after this long
    pub tracker_retention_seconds: u64,
}

impl WorkflowConfig {
    pub fn claim_lease(&self) -> Duration {
        Duration::from_millis(self.claim_lease_ms)
    }

    pub fn journal_retention(&self) -> Duration {
        Duration::from_secs(self.journal_retention_seconds)
    }

    pub fn tracker_retention(&self) -> Duration {
        Duration::from_secs(self.tracker_retention_seconds)
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            claim_lease_ms: workflow::DEFAULT_CLAIM_LEASE.as_millis() as u64,
            journal_retention_seconds: workflow::DEFAULT_JOURNAL_RETENTION.as_secs(),
            tracker_retention_seconds: workflow::DEFAULT_TRACKER_RETENTION.as_secs(),
        }
    }
}

impl AgentflowConfig {
    /// Validate thresholds, retry classes and the phase plan
    pub fn validate(&self) -> ConfigResult<()> {
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigurationError::invalid_value(
                "circuit_breaker.failure_threshold",
                0,
                "must be greater than 0",
            ));
        }

        if self.execution.stage_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "execution.stage_timeout_ms",
                0,
                "must be greater than 0",
            ));
        }

        if self.execution.stage_timeout_ms > self.execution.max_stage_timeout_ms {
            return Err(ConfigurationError::invalid_value(
                "execution.stage_timeout_ms",
                self.execution.stage_timeout_ms,
                "must not exceed execution.max_stage_timeout_ms",
            ));
        }

        if self.execution.orchestrator_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "execution.orchestrator_attempts",
                0,
                "must be greater than 0",
            ));
        }

        self.retry.fast.validate("fast")?;
        self.retry.agent.validate("agent")?;

        if self.worker.batch_size == 0 || self.worker.max_concurrent == 0 {
            return Err(ConfigurationError::ValidationError {
                error: "worker.batch_size and worker.max_concurrent must be greater than 0"
                    .to_string(),
            });
        }

        if self.worker.max_recorded_outcomes == 0 {
            return Err(ConfigurationError::invalid_value(
                "worker.max_recorded_outcomes",
                0,
                "must be greater than 0",
            ));
        }

        if self.workflow.claim_lease_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "workflow.claim_lease_ms",
                0,
                "must be greater than 0",
            ));
        }

        // A purged terminal record lets a redelivered message run the instance again
        if self.workflow.journal_retention_seconds < self.worker.visibility_timeout_seconds {
            return Err(ConfigurationError::invalid_value(
                "workflow.journal_retention_seconds",
                self.workflow.journal_retention_seconds,
                "must not be below worker.visibility_timeout_seconds",
            ));
        }

        let mut declared = HashSet::new();
        for stage in &self.stages {
            if stage.id.trim().is_empty() {
                return Err(ConfigurationError::MissingRequiredField {
                    field: "id".to_string(),
                    context: "stages".to_string(),
                });
            }
            if !declared.insert(stage.id.as_str()) {
                return Err(ConfigurationError::invalid_value(
                    "stages.id",
                    &stage.id,
                    "stage declared twice",
                ));
            }
            if stage.failure_threshold == Some(0) {
                return Err(ConfigurationError::invalid_value(
                    format!("stages.{}.failure_threshold", stage.id),
                    0,
                    "must be greater than 0",
                ));
            }
            if let Some(timeout_ms) = stage.timeout_ms {
                if timeout_ms == 0 || timeout_ms > self.execution.max_stage_timeout_ms {
                    return Err(ConfigurationError::invalid_value(
                        format!("stages.{}.timeout_ms", stage.id),
                        timeout_ms,
                        "must be within (0, execution.max_stage_timeout_ms]",
                    ));
                }
            }
        }

        let mut phase_names = HashSet::new();
        let mut owner: HashMap<&str, &str> = HashMap::new();
        for phase in &self.phases {
            if !phase_names.insert(phase.name.as_str()) {
                return Err(ConfigurationError::invalid_value(
                    "phases.name",
                    &phase.name,
                    "phase declared twice",
                ));
            }
            for stage in &phase.stages {
                if !declared.contains(stage.as_str()) {
                    return Err(ConfigurationError::UnknownStage {
                        phase: phase.name.clone(),
                        stage: stage.clone(),
                    });
                }
                if let Some(first) = owner.insert(stage.as_str(), phase.name.as_str()) {
                    return Err(ConfigurationError::DuplicatePhaseMember {
                        stage: stage.clone(),
                        first: first.to_string(),
                        second: phase.name.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Effective timeout for a stage, honoring its override
    pub fn stage_timeout(&self, stage_id: &str) -> Duration {
        self.stages
            .iter()
            .find(|s| s.id == stage_id)
            .and_then(|s| s.timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.execution.stage_timeout())
    }
}
