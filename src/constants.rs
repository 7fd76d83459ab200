//! # System Constants
//!
//! Defaults and event names that define the operational boundaries of the
//! orchestration engine. Every default here can be overridden through
//! [`crate::config::AgentflowConfig`].

use std::time::Duration;

/// Consecutive errors after which a stage's breaker opens
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Per-call timeout applied to stage and step invocations
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound for any per-stage timeout override
pub const MAX_STAGE_TIMEOUT: Duration = Duration::from_secs(600);

/// Attempts per stage call inside one orchestration run
pub const DEFAULT_ORCHESTRATOR_ATTEMPTS: u32 = 1;

/// Retry classes for workflow steps
pub mod retry {
    use std::time::Duration;

    pub const FAST_INITIAL_INTERVAL: Duration = Duration::from_secs(1);
    pub const FAST_MAXIMUM_INTERVAL: Duration = Duration::from_secs(10);
    pub const FAST_MAXIMUM_ATTEMPTS: u32 = 3;

    pub const AGENT_INITIAL_INTERVAL: Duration = Duration::from_secs(2);
    pub const AGENT_MAXIMUM_INTERVAL: Duration = Duration::from_secs(30);
    pub const AGENT_MAXIMUM_ATTEMPTS: u32 = 3;

    pub const BACKOFF_COEFFICIENT: f64 = 2.0;
    /// Largest coefficient a configured retry class may use
    pub const MAX_BACKOFF_COEFFICIENT: f64 = 10.0;
}

/// Durable workflow instance ownership and bookkeeping
pub mod workflow {
    use std::time::Duration;

    /// How long a driver's claim on an instance lasts without renewal.
    /// Renewed at every executed step.
    pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(600);

    /// Terminal instances older than this are purged from the journal.
    /// Must exceed the longest redelivery window of the task queue.
    pub const DEFAULT_JOURNAL_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

    /// Terminal snapshots older than this are evicted from the tracker
    pub const DEFAULT_TRACKER_RETENTION: Duration = Duration::from_secs(60 * 60);
}

/// Task queue worker defaults
pub mod worker {
    pub const DEFAULT_QUEUE_NAME: &str = "agentflow_tasks";
    pub const DEFAULT_BATCH_SIZE: usize = 10;
    pub const DEFAULT_VISIBILITY_TIMEOUT_SECONDS: u64 = 300;
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 250;
    pub const DEFAULT_MAX_CONCURRENT: usize = 8;
    /// Per-message outcomes kept for lookup; the oldest are evicted first
    pub const DEFAULT_MAX_RECORDED_OUTCOMES: usize = 10_000;
}

/// Structured log event names
pub mod events {
    pub const ORCHESTRATION_STARTED: &str = "orchestration.started";
    pub const ORCHESTRATION_COMPLETED: &str = "orchestration.completed";
    pub const PHASE_STARTED: &str = "phase.started";
    pub const PHASE_ABORTED: &str = "phase.aborted";
    pub const STAGE_SUCCEEDED: &str = "stage.succeeded";
    pub const STAGE_FAILED: &str = "stage.failed";
    pub const STAGE_SKIPPED: &str = "stage.skipped";

    pub const WORKFLOW_STARTED: &str = "workflow.started";
    pub const WORKFLOW_STEP_COMPLETED: &str = "workflow.step_completed";
    pub const WORKFLOW_STEP_REPLAYED: &str = "workflow.step_replayed";
    pub const WORKFLOW_STEP_FAILED: &str = "workflow.step_failed";
    pub const WORKFLOW_COMPENSATING: &str = "workflow.compensating";
    pub const WORKFLOW_COMPLETED: &str = "workflow.completed";
    pub const WORKFLOW_TERMINATED: &str = "workflow.terminated";
    pub const WORKFLOW_IN_PROGRESS: &str = "workflow.in_progress";
}
