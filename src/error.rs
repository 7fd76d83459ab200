//! # Error Types
//!
//! Tagged error values for the orchestration and workflow engine. Every call
//! failure is an [`ActivityError`] carrying an explicit [`ErrorKind`];
//! business logic branches on the kind, never on the error's type.

use crate::config::ConfigurationError;
use crate::state_machine::WorkflowStatus;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Failure taxonomy shared by the orchestrator and the workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Call exceeded its timeout (transient)
    Timeout,
    /// Call returned an error or panicked (transient)
    Internal,
    /// Input rejected; never retried
    Validation,
    /// A security flag was raised; never retried
    SecurityThreat,
    /// A stage in a critical phase failed
    CriticalStageFailure,
    /// Stage skipped because its breaker is open
    Unavailable,
    /// In-flight call cancelled after a sibling failed in a critical phase
    Cancelled,
    /// Workflow instance is held by another driver; nothing was executed
    InProgress,
}

impl ErrorKind {
    /// Transient failures are absorbed by retry policies
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Internal)
    }

    pub fn is_retryable(&self) -> bool {
        self.is_transient()
    }

    /// Broad category used in logs and operator reports
    pub fn category(&self) -> &'static str {
        match self {
            Self::Timeout | Self::Internal => "TRANSIENT",
            Self::Validation => "VALIDATION",
            Self::SecurityThreat => "SECURITY_THREAT",
            Self::CriticalStageFailure => "CRITICAL_STAGE_FAILURE",
            Self::Unavailable => "UNAVAILABLE",
            Self::Cancelled => "CANCELLED",
            Self::InProgress => "IN_PROGRESS",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "TIMEOUT"),
            Self::Internal => write!(f, "INTERNAL"),
            Self::Validation => write!(f, "VALIDATION"),
            Self::SecurityThreat => write!(f, "SECURITY_THREAT"),
            Self::CriticalStageFailure => write!(f, "CRITICAL_STAGE_FAILURE"),
            Self::Unavailable => write!(f, "UNAVAILABLE"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::InProgress => write!(f, "IN_PROGRESS"),
        }
    }
}

/// Uniform failure of one stage, step or compensation call
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind} in {activity}: {message}")]
pub struct ActivityError {
    /// Name of the stage, step or compensation that failed
    pub activity: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl ActivityError {
    pub fn new(activity: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            activity: activity.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(activity: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::new(
            activity,
            ErrorKind::Timeout,
            format!("timed out after {}ms", timeout.as_millis()),
        )
    }

    pub fn internal(activity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(activity, ErrorKind::Internal, message)
    }

    pub fn validation(activity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(activity, ErrorKind::Validation, message)
    }

    pub fn security_threat(activity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(activity, ErrorKind::SecurityThreat, message)
    }

    pub fn cancelled(activity: impl Into<String>) -> Self {
        Self::new(
            activity,
            ErrorKind::Cancelled,
            "cancelled after a critical-phase failure",
        )
    }

    /// Re-tag an error raised inside a wrapped call with the caller's name
    pub fn with_activity(mut self, activity: impl Into<String>) -> Self {
        let activity = activity.into();
        if self.activity != activity {
            self.message = format!("{}: {}", self.activity, self.message);
            self.activity = activity;
        }
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Outcome of unwinding a compensation log
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationReport {
    /// Actions invoked, in the order they ran
    pub attempted: Vec<String>,
    pub succeeded: usize,
    /// Compensations that failed; the unwind continued past each of them
    pub failures: Vec<ActivityError>,
}

impl CompensationReport {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

/// Typed terminal failure of a workflow instance
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("workflow {workflow_id} {status} at step {step_number} ({failed_step}): {kind}: {message}")]
pub struct WorkflowError {
    pub workflow_id: Uuid,
    pub transaction_id: String,
    /// Name of the step that failed
    pub failed_step: String,
    /// 1-based position of the failed step
    pub step_number: usize,
    pub kind: ErrorKind,
    /// Terminal status, `Aborted` or `Failed`; `Running` when the instance
    /// is held by another driver
    pub status: WorkflowStatus,
    pub message: String,
    pub attempts: u32,
    pub compensation: CompensationReport,
}

impl WorkflowError {
    /// The instance was not driven because another driver holds it
    pub fn is_in_progress(&self) -> bool {
        self.kind == ErrorKind::InProgress
    }
}

/// Crate-level error
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AgentflowError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("Unknown stage: {0}")]
    UnknownStage(String),
    #[error("Invalid phase plan: {0}")]
    InvalidPhasePlan(String),
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),
    #[error("Invalid state transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },
    #[error("Queue error: {0}")]
    Queue(String),
    #[error("Journal error: {0}")]
    Journal(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Workflow error: {0}")]
    Workflow(Box<WorkflowError>),
    #[error("Activity error: {0}")]
    Activity(#[from] ActivityError),
}

impl From<serde_json::Error> for AgentflowError {
    fn from(error: serde_json::Error) -> Self {
        AgentflowError::Serialization(error.to_string())
    }
}

impl From<WorkflowError> for AgentflowError {
    fn from(error: WorkflowError) -> Self {
        AgentflowError::Workflow(Box::new(error))
    }
}

pub type Result<T> = std::result::Result<T, AgentflowError>;
