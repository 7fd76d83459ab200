use serde::{Deserialize, Serialize};

/// Events driving a workflow instance through its lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// Begin the step at the given 1-based position
    BeginStep { step: String, step_number: usize },
    /// Final step succeeded
    Complete,
    /// Validation or security decision stopped the workflow
    Abort { reason: String },
    /// Unexpected error or exhausted retries
    Fail { reason: String },
}

impl WorkflowEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::BeginStep { .. } => "begin_step",
            Self::Complete => "complete",
            Self::Abort { .. } => "abort",
            Self::Fail { .. } => "fail",
        }
    }
}
