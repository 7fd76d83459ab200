//! # Durable Workflows
//!
//! SAGA-style sequential execution of a subset of stages as transactional
//! steps, with automatic compensating rollback and journal-based replay.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use agentflow_core::registry::StageRegistry;
//! use agentflow_core::workflow::{StageStep, Transaction, WorkflowBuilder};
//! use std::sync::Arc;
//!
//! # async fn example(registry: Arc<StageRegistry>) -> agentflow_core::Result<()> {
//! let workflow = WorkflowBuilder::new("claims_review")
//!     .validation()
//!     .stage_step(StageStep::new("risk", Arc::clone(&registry)).with_attention_field("high_risk"))
//!     .build()?;
//!
//! let tx = Transaction::new("tx-42").with_field("note", "follow-up visit");
//! match workflow.run(tx).await {
//!     Ok(result) => println!("completed {} steps", result.steps.len()),
//!     Err(e) => println!("{} at {}: {}", e.status, e.failed_step, e.kind),
//! }
//! # Ok(())
//! # }
//! ```

pub mod compensation;
pub mod journal;
pub mod pipeline;
pub mod saga;
pub mod step;
pub mod tracker;
pub mod transaction;

pub use compensation::{CompensationEntry, CompensationHandler, CompensationHandlers, CompensationLog};
pub use journal::{InMemoryWorkflowJournal, JournalEntry, TerminalRecord, WorkflowJournal};
pub use pipeline::{
    AttentionHandler, PersistStep, PersistenceSink, RemoveRecordCompensation, StageStep,
    TransactionValidationStep, WorkflowBuilder, REMOVE_RECORD,
};
pub use saga::{DurableWorkflow, WorkflowOutcome, WorkflowResult};
pub use step::{RetryClass, StepContext, StepOutput, StepResult, WorkflowStep};
pub use tracker::{WorkflowInstanceSnapshot, WorkflowTracker};
pub use transaction::Transaction;
