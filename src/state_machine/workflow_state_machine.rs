use super::{events::WorkflowEvent, states::WorkflowStatus};
use crate::error::{AgentflowError, Result};
use tracing::debug;
use uuid::Uuid;

/// In-process state machine for one workflow instance
///
/// Enforces `INITIALIZING -> RUNNING(step=k) -> {COMPLETED | ABORTED | FAILED}`
/// with `k` incrementing by exactly one per step.
#[derive(Debug, Clone)]
pub struct WorkflowStateMachine {
    workflow_id: Uuid,
    status: WorkflowStatus,
    current_step: Option<String>,
    step_number: usize,
}

impl WorkflowStateMachine {
    pub fn new(workflow_id: Uuid) -> Self {
        Self {
            workflow_id,
            status: WorkflowStatus::Initializing,
            current_step: None,
            step_number: 0,
        }
    }

    pub fn status(&self) -> WorkflowStatus {
        self.status
    }

    pub fn current_step(&self) -> Option<&str> {
        self.current_step.as_deref()
    }

    pub fn step_number(&self) -> usize {
        self.step_number
    }

    /// Apply an event, returning the new status
    pub fn transition(&mut self, event: WorkflowEvent) -> Result<WorkflowStatus> {
        let target = self.determine_target_state(&event)?;

        if let WorkflowEvent::BeginStep { step, step_number } = &event {
            self.current_step = Some(step.clone());
            self.step_number = *step_number;
        }

        debug!(
            workflow_id = %self.workflow_id,
            from = %self.status,
            to = %target,
            event = event.event_name(),
            step_number = self.step_number,
            "Workflow state transition"
        );

        self.status = target;
        Ok(target)
    }

    fn determine_target_state(&self, event: &WorkflowEvent) -> Result<WorkflowStatus> {
        let target = match (self.status, event) {
            (WorkflowStatus::Initializing, WorkflowEvent::BeginStep { step_number, .. })
                if *step_number == 1 =>
            {
                WorkflowStatus::Running
            }
            (WorkflowStatus::Running, WorkflowEvent::BeginStep { step_number, .. })
                if *step_number == self.step_number + 1 =>
            {
                WorkflowStatus::Running
            }
            (WorkflowStatus::Running, WorkflowEvent::Complete) => WorkflowStatus::Completed,
            // Validation can reject before the first step has started
            (WorkflowStatus::Initializing | WorkflowStatus::Running, WorkflowEvent::Abort { .. }) => {
                WorkflowStatus::Aborted
            }
            (WorkflowStatus::Initializing | WorkflowStatus::Running, WorkflowEvent::Fail { .. }) => {
                WorkflowStatus::Failed
            }
            (from_state, _) => {
                return Err(AgentflowError::InvalidTransition {
                    from: format!("{from_state}(step={})", self.step_number),
                    event: format!("{event:?}"),
                })
            }
        };

        Ok(target)
    }
}
