//! Task queue message payloads.

use crate::orchestration::OrchestrationRequest;
use crate::workflow::Transaction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Work request carried by the task queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskQueueMessage {
    /// Drive (or re-drive) a workflow instance
    ExecuteWorkflow {
        workflow_id: Uuid,
        transaction: Transaction,
    },
    /// Run the phased orchestrator once
    ExecuteOrchestration {
        request_id: Uuid,
        request: OrchestrationRequest,
    },
}

impl TaskQueueMessage {
    pub fn workflow(transaction: Transaction) -> Self {
        Self::ExecuteWorkflow {
            workflow_id: Uuid::new_v4(),
            transaction,
        }
    }

    pub fn orchestration(request: OrchestrationRequest) -> Self {
        Self::ExecuteOrchestration {
            request_id: Uuid::new_v4(),
            request,
        }
    }

    /// Id under which the outcome is recorded
    pub fn correlation_id(&self) -> Uuid {
        match self {
            Self::ExecuteWorkflow { workflow_id, .. } => *workflow_id,
            Self::ExecuteOrchestration { request_id, .. } => *request_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExecuteWorkflow { .. } => "execute_workflow",
            Self::ExecuteOrchestration { .. } => "execute_orchestration",
        }
    }
}

/// A message claimed from a queue
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub msg_id: i64,
    pub message: TaskQueueMessage,
    /// Deliveries so far, including this one
    pub read_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tagged_serde() {
        let message = TaskQueueMessage::workflow(Transaction::new("tx-1").with_field("note", "x"));
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "execute_workflow");
        assert_eq!(value["transaction"]["id"], "tx-1");

        let back: TaskQueueMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back.correlation_id(), message.correlation_id());

        let orchestration: TaskQueueMessage = serde_json::from_value(json!({
            "type": "execute_orchestration",
            "request_id": Uuid::nil(),
            "request": {"input": {"id": "tx-2"}},
        }))
        .unwrap();
        assert_eq!(orchestration.kind(), "execute_orchestration");
    }
}
