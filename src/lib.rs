#![allow(clippy::doc_markdown)] // Allow technical terms like SAGA, JoinSet in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Agentflow Core
//!
//! Orchestration and durable-workflow engine for a fixed set of independent,
//! unreliable analysis stages that run against one business transaction.
//!
//! ## Overview
//!
//! Two execution paths share one stage registry and its circuit breakers:
//!
//! - **Phased orchestration**: stages are grouped into ordered phases; each
//!   phase fans out concurrently and joins before the next starts. A failure
//!   in a critical phase aborts the run; other failures yield a partial
//!   result.
//! - **Durable workflows**: a SAGA over a subset of stages, strictly
//!   sequential, with retry classes per step, a compensation log unwound in
//!   reverse on failure, and journal replay on re-drive.
//!
//! ## Module Organization
//!
//! - [`registry`] - Stage catalogue, handlers, counters and health
//! - [`resilience`] - Per-stage consecutive-failure circuit breakers
//! - [`execution`] - Timeout/panic-safe call wrapper and retry policies
//! - [`orchestration`] - Phase plan and the phased orchestrator
//! - [`workflow`] - SAGA workflow, compensation, journal and pipeline steps
//! - [`state_machine`] - Workflow instance lifecycle
//! - [`messaging`] - Task queue abstraction
//! - [`worker`] - Queue-driven execution
//! - [`operator`] - Operator health and reset surface
//! - [`config`] - Configuration loading and validation
//! - [`logging`] - Structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use agentflow_core::orchestration::{PhaseDefinition, PhasePlan, PhasedOrchestrator};
//! use agentflow_core::registry::{StageDescriptor, StageHandler, StageRegistry};
//! use agentflow_core::ActivityError;
//! use async_trait::async_trait;
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! struct Intake;
//!
//! #[async_trait]
//! impl StageHandler for Intake {
//!     async fn process(&self, input: Value) -> Result<Value, ActivityError> {
//!         Ok(json!({"normalized": input["transaction"]}))
//!     }
//! }
//!
//! # async fn example() -> agentflow_core::Result<()> {
//! let registry = Arc::new(StageRegistry::default());
//! registry.register(StageDescriptor::new("intake"), Arc::new(Intake));
//!
//! let plan = PhasePlan::new(vec![PhaseDefinition::critical("screen", ["intake"])], &registry)?;
//! let run = PhasedOrchestrator::new(registry, plan)
//!     .process_input(json!({"id": "tx-1", "note": "annual visit"}))
//!     .await;
//!
//! println!("{}: {} of {} stages succeeded", run.status, run.agents_succeeded, run.agents_called);
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod config;
pub mod constants;
pub mod error;
pub mod execution;
pub mod logging;
pub mod messaging;
pub mod operator;
pub mod orchestration;
pub mod registry;
pub mod resilience;
pub mod state_machine;
pub mod worker;
pub mod workflow;

pub use bootstrap::{AgentflowCore, WorkerHandle};
pub use config::{AgentflowConfig, ConfigManager, ConfigurationError};
pub use error::{
    ActivityError, AgentflowError, CompensationReport, ErrorKind, Result, WorkflowError,
};
pub use execution::{ActivityExecutor, RetryPolicy};
pub use messaging::{InMemoryTaskQueue, TaskQueue, TaskQueueMessage};
pub use operator::OperatorConsole;
pub use orchestration::{
    OrchestrationRequest, OrchestrationRun, PhaseDefinition, PhasePlan, PhasedOrchestrator,
    RunStatus,
};
pub use registry::{StageDescriptor, StageHandler, StageRegistry, StageStatus};
pub use resilience::{CircuitBreaker, CircuitState};
pub use state_machine::WorkflowStatus;
pub use worker::TaskQueueWorker;
pub use workflow::{DurableWorkflow, Transaction, WorkflowBuilder, WorkflowResult};
