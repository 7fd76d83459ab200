//! # Stage Registry
//!
//! Process-wide catalogue of the fixed stage set. Built once at startup and
//! shared by reference (`Arc<StageRegistry>`) with the orchestrator, the
//! workflow and the operator console.
//!
//! Each stage lives in its own slot with its own lock and breaker, so
//! outcome recording never serializes unrelated stages.

use super::stage::{StageDescriptor, StageHandler, StageHealthReport, StageStatus};
use crate::config::AgentflowConfig;
use crate::constants::DEFAULT_FAILURE_THRESHOLD;
use crate::error::{AgentflowError, Result};
use crate::logging::log_stage_operation;
use crate::resilience::CircuitBreaker;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

struct StageSlot {
    handler: RwLock<Arc<dyn StageHandler>>,
    descriptor: Mutex<StageDescriptor>,
    breaker: CircuitBreaker,
}

/// Registry of stages, their handlers, counters and breakers
pub struct StageRegistry {
    stages: DashMap<String, Arc<StageSlot>>,
    /// Registration order, for stable listings
    order: RwLock<Vec<String>>,
    default_failure_threshold: u32,
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistry")
            .field("stages", &*self.order.read())
            .field("default_failure_threshold", &self.default_failure_threshold)
            .finish()
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD)
    }
}

impl StageRegistry {
    pub fn new(default_failure_threshold: u32) -> Self {
        Self {
            stages: DashMap::new(),
            order: RwLock::new(Vec::new()),
            default_failure_threshold: default_failure_threshold.max(1),
        }
    }

    /// Build the registry for the stages declared in configuration
    ///
    /// Every declared stage must have a handler; handlers for undeclared ids
    /// are rejected so the stage set stays closed.
    pub fn from_config(
        config: &AgentflowConfig,
        mut handlers: HashMap<String, Arc<dyn StageHandler>>,
    ) -> Result<Self> {
        let registry = Self::new(config.circuit_breaker.failure_threshold);

        for stage in &config.stages {
            let handler = handlers
                .remove(&stage.id)
                .ok_or_else(|| AgentflowError::UnknownStage(format!("no handler for {}", stage.id)))?;

            let mut descriptor = StageDescriptor::new(&stage.id)
                .with_capabilities(stage.capabilities.iter().cloned())
                .with_dependencies(stage.dependencies.iter().cloned());
            descriptor.timeout = stage.timeout_ms.map(Duration::from_millis);
            descriptor.failure_threshold = stage.failure_threshold;

            registry.register(descriptor, handler);
        }

        if let Some(extra) = handlers.keys().next() {
            return Err(AgentflowError::UnknownStage(format!(
                "handler supplied for undeclared stage {extra}"
            )));
        }

        Ok(registry)
    }

    /// Register a stage. Re-registering an existing id replaces its metadata
    /// and handler but keeps live counters and breaker state.
    pub fn register(&self, descriptor: StageDescriptor, handler: Arc<dyn StageHandler>) {
        let id = descriptor.id.clone();

        if let Some(slot) = self.stages.get(&id) {
            *slot.handler.write() = handler;
            let mut current = slot.descriptor.lock();
            current.capabilities = descriptor.capabilities;
            current.dependencies = descriptor.dependencies;
            current.timeout = descriptor.timeout;
            if descriptor.failure_threshold.is_some()
                && descriptor.failure_threshold != current.failure_threshold
            {
                warn!(
                    stage = %id,
                    "Breaker threshold change ignored on re-registration"
                );
            }
            debug!(stage = %id, "Stage re-registered, counters preserved");
            return;
        }

        let threshold = descriptor
            .failure_threshold
            .unwrap_or(self.default_failure_threshold);
        let slot = Arc::new(StageSlot {
            handler: RwLock::new(handler),
            breaker: CircuitBreaker::new(id.clone(), threshold),
            descriptor: Mutex::new(StageDescriptor {
                status: StageStatus::Initializing,
                ..descriptor
            }),
        });

        self.stages.insert(id.clone(), slot);
        self.order.write().push(id.clone());
        log_stage_operation("register", &id, "registered", None);
    }

    fn slot(&self, id: &str) -> Result<Arc<StageSlot>> {
        self.stages
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| AgentflowError::UnknownStage(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.stages.contains_key(id)
    }

    /// Snapshot of one stage's descriptor
    pub fn get(&self, id: &str) -> Result<StageDescriptor> {
        Ok(self.slot(id)?.descriptor.lock().clone())
    }

    /// Snapshots of every stage in registration order
    pub fn list(&self) -> Vec<StageDescriptor> {
        self.order
            .read()
            .iter()
            .filter_map(|id| self.get(id).ok())
            .collect()
    }

    pub fn stage_ids(&self) -> Vec<String> {
        self.order.read().clone()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn handler(&self, id: &str) -> Result<Arc<dyn StageHandler>> {
        Ok(Arc::clone(&*self.slot(id)?.handler.read()))
    }

    /// Call timeout for a stage, falling back to `default`
    pub fn timeout_for(&self, id: &str, default: Duration) -> Duration {
        self.slot(id)
            .ok()
            .and_then(|slot| slot.descriptor.lock().timeout)
            .unwrap_or(default)
    }

    /// Whether the stage's breaker is open; unknown stages report closed
    pub fn is_open(&self, id: &str) -> bool {
        self.stages
            .get(id)
            .map(|slot| slot.breaker.is_open())
            .unwrap_or(false)
    }

    /// Record one call outcome: update counters, forward to the breaker and
    /// derive the stage status
    pub fn record_outcome(&self, id: &str, success: bool, latency: Duration) -> Result<()> {
        let slot = self.slot(id)?;
        let mut descriptor = slot.descriptor.lock();
        descriptor.counters.record(success, latency);

        descriptor.status = if success {
            slot.breaker.record_success();
            StageStatus::Healthy
        } else {
            slot.breaker.record_error();
            if slot.breaker.is_open() {
                StageStatus::Unavailable
            } else {
                StageStatus::Degraded
            }
        };

        Ok(())
    }

    pub fn record_success(&self, id: &str, latency: Duration) -> Result<()> {
        self.record_outcome(id, true, latency)
    }

    pub fn record_error(&self, id: &str, latency: Duration) -> Result<()> {
        self.record_outcome(id, false, latency)
    }

    /// Operator action: close the stage's breaker and mark it healthy
    pub fn reset_breaker(&self, id: &str) -> Result<()> {
        let slot = self.slot(id)?;
        let mut descriptor = slot.descriptor.lock();
        slot.breaker.reset();
        descriptor.status = StageStatus::Healthy;
        log_stage_operation("reset_breaker", id, "closed", Some("operator reset"));
        Ok(())
    }

    pub fn health(&self, id: &str) -> Result<StageHealthReport> {
        let slot = self.slot(id)?;
        let descriptor = slot.descriptor.lock();
        Ok(StageHealthReport {
            stage: descriptor.id.clone(),
            status: descriptor.status,
            total_calls: descriptor.counters.total_calls,
            total_errors: descriptor.counters.total_errors,
            error_rate: descriptor.counters.error_rate(),
            average_latency_ms: descriptor.counters.average_latency_ms,
            last_called_at: descriptor.counters.last_called_at,
            breaker: slot.breaker.metrics(),
        })
    }

    pub fn health_all(&self) -> Vec<StageHealthReport> {
        self.order
            .read()
            .iter()
            .filter_map(|id| self.health(id).ok())
            .collect()
    }
}
