// State machine module for workflow instances
//
// Enforces the lifecycle of a SAGA workflow instance: one step at a time,
// strictly increasing step numbers, and terminal states that accept no events.

pub mod events;
pub mod states;
pub mod workflow_state_machine;

pub use events::WorkflowEvent;
pub use states::WorkflowStatus;
pub use workflow_state_machine::WorkflowStateMachine;
