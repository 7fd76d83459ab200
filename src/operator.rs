//! # Operator Console
//!
//! Read-mostly operator surface: per-stage health, manual breaker reset and
//! per-workflow-instance status.

use crate::error::Result;
use crate::registry::{StageHealthReport, StageRegistry};
use crate::workflow::{WorkflowInstanceSnapshot, WorkflowTracker};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct OperatorConsole {
    registry: Arc<StageRegistry>,
    tracker: Arc<WorkflowTracker>,
}

impl OperatorConsole {
    pub fn new(registry: Arc<StageRegistry>, tracker: Arc<WorkflowTracker>) -> Self {
        Self { registry, tracker }
    }

    pub fn stage_health(&self, stage: &str) -> Result<StageHealthReport> {
        self.registry.health(stage)
    }

    pub fn all_stage_health(&self) -> Vec<StageHealthReport> {
        self.registry.health_all()
    }

    /// Stages whose breaker is currently open
    pub fn open_circuits(&self) -> Vec<String> {
        self.registry
            .stage_ids()
            .into_iter()
            .filter(|id| self.registry.is_open(id))
            .collect()
    }

    pub fn reset_breaker(&self, stage: &str) -> Result<()> {
        self.registry.reset_breaker(stage)
    }

    pub fn workflow_status(&self, workflow_id: Uuid) -> Option<WorkflowInstanceSnapshot> {
        self.tracker.get(workflow_id)
    }

    pub fn active_workflows(&self) -> Vec<WorkflowInstanceSnapshot> {
        self.tracker
            .list()
            .into_iter()
            .filter(|s| !s.status.is_terminal())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ActivityError;
    use crate::registry::{StageDescriptor, StageHandler, StageStatus};
    use crate::resilience::CircuitState;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::time::Duration;

    struct Noop;

    #[async_trait]
    impl StageHandler for Noop {
        async fn process(&self, input: Value) -> std::result::Result<Value, ActivityError> {
            Ok(input)
        }
    }

    #[test]
    fn test_health_and_reset() {
        let registry = Arc::new(StageRegistry::new(2));
        registry.register(StageDescriptor::new("coding"), Arc::new(Noop));
        let console = OperatorConsole::new(Arc::clone(&registry), Arc::new(WorkflowTracker::new()));

        registry.record_error("coding", Duration::from_millis(3)).unwrap();
        registry.record_error("coding", Duration::from_millis(3)).unwrap();

        let health = console.stage_health("coding").unwrap();
        assert_eq!(health.status, StageStatus::Unavailable);
        assert_eq!(health.breaker.current_state, CircuitState::Open);
        assert_eq!(console.open_circuits(), vec!["coding".to_string()]);

        console.reset_breaker("coding").unwrap();
        assert!(console.open_circuits().is_empty());
        assert!(console.stage_health("ghost").is_err());
        assert!(console.workflow_status(Uuid::new_v4()).is_none());
    }
}
