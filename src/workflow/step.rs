//! # Workflow Steps
//!
//! The interface a SAGA step implements, and the context and output it
//! exchanges with the workflow.

use super::transaction::Transaction;
use crate::error::ActivityError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Which retry policy a step runs under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryClass {
    /// Local, deterministic work
    Fast,
    /// Calls into an analysis stage
    Agent,
}

impl fmt::Display for RetryClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fast => write!(f, "fast"),
            Self::Agent => write!(f, "agent"),
        }
    }
}

/// What a step hands back to the workflow
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    pub output: Value,
    /// Resource created by the step, handed to its compensation
    pub resource_id: Option<String>,
    /// Triggers the non-fatal attention hook
    pub requires_attention: bool,
    /// When set the workflow stops and unwinds; the step is not committed
    pub security_flag: Option<String>,
}

impl StepOutput {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            ..Default::default()
        }
    }

    pub fn with_resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_attention(mut self) -> Self {
        self.requires_attention = true;
        self
    }

    pub fn with_security_flag(mut self, reason: impl Into<String>) -> Self {
        self.security_flag = Some(reason.into());
        self
    }
}

/// Read-only view of the instance handed to each step attempt
#[derive(Debug, Clone)]
pub struct StepContext {
    pub workflow_id: Uuid,
    pub transaction: Arc<Transaction>,
    /// 1-based
    pub step_number: usize,
    /// 1-based attempt under the step's retry policy
    pub attempt: u32,
    /// Outputs of the steps completed so far, by step name
    pub outputs: Arc<HashMap<String, Value>>,
}

/// One transactional step of a durable workflow
#[async_trait]
pub trait WorkflowStep: Send + Sync {
    fn name(&self) -> &str;

    fn retry_class(&self) -> RetryClass;

    /// Compensation action pushed onto the log when the step succeeds
    fn compensation(&self) -> Option<&str> {
        None
    }

    /// Overrides the workflow's default step timeout
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn execute(&self, ctx: &StepContext) -> Result<StepOutput, ActivityError>;
}

/// Per-step record in a workflow result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step: String,
    pub step_number: usize,
    pub output: Value,
    pub attempts: u32,
    /// Taken from the journal instead of executed
    pub replayed: bool,
}
