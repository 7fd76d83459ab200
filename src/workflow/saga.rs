//! # Durable Workflow (SAGA)
//!
//! Runs steps strictly in sequence. Each committed step may push a
//! compensating action; when a step cannot complete, the log is unwound in
//! reverse before the typed terminal error is returned.
//!
//! ```text
//! INITIALIZING → RUNNING(1) → RUNNING(2) → … → COMPLETED
//!                     └──────────┴── failure ──→ unwind ──→ ABORTED | FAILED
//! ```
//!
//! Every committed step is journaled before the next one starts; a result
//! the journal will not accept stops the instance and is compensated with
//! the rest. [`DurableWorkflow::resume`] replays the journal instead of
//! re-executing, and a terminal instance is never driven again.
//!
//! Only one driver executes an instance at a time. A driver claims the
//! instance in the journal before running anything, renews the claim at each
//! executed step and releases it when done. A concurrent re-drive returns an
//! `IN_PROGRESS` error without executing.

use super::compensation::{CompensationEntry, CompensationHandlers, CompensationLog};
use super::journal::{JournalEntry, TerminalRecord, WorkflowJournal};
use super::pipeline::AttentionHandler;
use super::step::{RetryClass, StepContext, StepOutput, StepResult, WorkflowStep};
use super::tracker::WorkflowTracker;
use super::transaction::Transaction;
use crate::constants::events;
use crate::error::{ActivityError, CompensationReport, ErrorKind, WorkflowError};
use crate::execution::{run_with_retry, ActivityExecutor, RetryPolicy};
use crate::logging::{log_error, log_workflow_operation};
use crate::state_machine::{WorkflowEvent, WorkflowStateMachine, WorkflowStatus};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Successful outcome of a workflow instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow_id: Uuid,
    pub transaction_id: String,
    pub status: WorkflowStatus,
    pub steps: Vec<StepResult>,
    /// Steps whose output triggered the attention hook
    pub attention_raised: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl WorkflowResult {
    pub fn output_of(&self, step: &str) -> Option<&Value> {
        self.steps.iter().find(|s| s.step == step).map(|s| &s.output)
    }
}

pub type WorkflowOutcome = Result<WorkflowResult, WorkflowError>;

/// Sequential SAGA workflow over a fixed list of steps
pub struct DurableWorkflow {
    pub(crate) name: String,
    pub(crate) steps: Vec<Arc<dyn WorkflowStep>>,
    pub(crate) compensations: CompensationHandlers,
    pub(crate) attention: Option<Arc<dyn AttentionHandler>>,
    pub(crate) executor: ActivityExecutor,
    pub(crate) fast_policy: RetryPolicy,
    pub(crate) agent_policy: RetryPolicy,
    pub(crate) step_timeout: Duration,
    pub(crate) claim_lease: Duration,
    /// Terminal outcomes the journal refused; kept until a write succeeds
    pub(crate) unrecorded: DashMap<Uuid, WorkflowOutcome>,
    pub(crate) journal: Arc<dyn WorkflowJournal>,
    pub(crate) tracker: Arc<WorkflowTracker>,
}

impl std::fmt::Debug for DurableWorkflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableWorkflow")
            .field("name", &self.name)
            .field("steps", &self.step_names())
            .field("compensations", &self.compensations.keys().collect::<Vec<_>>())
            .field("step_timeout", &self.step_timeout)
            .field("claim_lease", &self.claim_lease)
            .finish()
    }
}

/// Where a failed instance stopped
struct Failure {
    step: String,
    step_number: usize,
    error: ActivityError,
    attempts: u32,
    status: WorkflowStatus,
}

impl DurableWorkflow {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn tracker(&self) -> &Arc<WorkflowTracker> {
        &self.tracker
    }

    pub fn journal(&self) -> &Arc<dyn WorkflowJournal> {
        &self.journal
    }

    /// Start a new instance for `transaction`
    pub async fn run(&self, transaction: Transaction) -> WorkflowOutcome {
        self.run_with_id(Uuid::new_v4(), transaction).await
    }

    /// Start an instance under a caller-chosen id
    pub async fn run_with_id(&self, workflow_id: Uuid, transaction: Transaction) -> WorkflowOutcome {
        self.resume(workflow_id, transaction).await
    }

    /// Re-drive an instance. Journaled steps are replayed, not executed;
    /// a terminal instance reports its recorded outcome. While another
    /// driver holds the instance this returns an `IN_PROGRESS` error.
    #[instrument(skip(self, transaction), fields(workflow = %self.name, transaction_id = %transaction.id))]
    pub async fn resume(&self, workflow_id: Uuid, transaction: Transaction) -> WorkflowOutcome {
        if let Some(outcome) = self.retry_unrecorded(workflow_id).await {
            return outcome;
        }

        let owner = Uuid::new_v4();
        match self.journal.try_claim(workflow_id, owner, self.claim_lease).await {
            Ok(true) => {}
            Ok(false) => return Err(self.in_progress(workflow_id, &transaction)),
            Err(e) => {
                return Err(self.bare_error(
                    workflow_id,
                    &transaction,
                    ActivityError::internal("journal", e.to_string()),
                ))
            }
        }

        let outcome = self.resume_claimed(workflow_id, owner, transaction).await;
        if let Err(e) = self.journal.release(workflow_id, owner).await {
            // The lease expires on its own
            log_error("workflow", "release_claim", &e.to_string(), None);
        }
        outcome
    }

    async fn resume_claimed(&self, workflow_id: Uuid, owner: Uuid, transaction: Transaction) -> WorkflowOutcome {
        match self.journal.terminal_status(workflow_id).await {
            Ok(Some(record)) => {
                info!(
                    workflow_id = %workflow_id,
                    status = %record.status,
                    "Instance already terminal, not re-executing"
                );
                return match (record.result, record.error) {
                    (Some(result), _) => Ok(result),
                    (None, Some(error)) => Err(error),
                    (None, None) => Err(self.bare_error(
                        workflow_id,
                        &transaction,
                        ActivityError::internal(&self.name, "terminal record has no outcome"),
                    )),
                };
            }
            Ok(None) => {}
            Err(e) => {
                return Err(self.bare_error(
                    workflow_id,
                    &transaction,
                    ActivityError::internal("journal", e.to_string()),
                ))
            }
        }

        let replay = match self.journal.completed_steps(workflow_id).await {
            Ok(entries) => entries,
            Err(e) => {
                return Err(self.bare_error(
                    workflow_id,
                    &transaction,
                    ActivityError::internal("journal", e.to_string()),
                ))
            }
        };

        self.drive(workflow_id, owner, Arc::new(transaction), replay).await
    }

    async fn drive(
        &self,
        workflow_id: Uuid,
        owner: Uuid,
        transaction: Arc<Transaction>,
        replay: Vec<JournalEntry>,
    ) -> WorkflowOutcome {
        let started_at = Utc::now();
        let mut machine = WorkflowStateMachine::new(workflow_id);
        let mut log = CompensationLog::new();
        let mut outputs: HashMap<String, Value> = HashMap::new();
        let mut steps = Vec::with_capacity(self.steps.len());
        let mut attention_raised = Vec::new();
        let mut replay: HashMap<usize, JournalEntry> =
            replay.into_iter().map(|e| (e.step_number, e)).collect();

        self.tracker.start(workflow_id, &transaction.id);
        log_workflow_operation(
            events::WORKFLOW_STARTED,
            workflow_id,
            None,
            "initializing",
            Some(&self.name),
        );

        for (index, step) in self.steps.iter().enumerate() {
            let step_number = index + 1;
            let name = step.name().to_string();

            if let Err(e) = machine.transition(WorkflowEvent::BeginStep {
                step: name.clone(),
                step_number,
            }) {
                let failure = Failure {
                    step: name.clone(),
                    step_number,
                    error: ActivityError::internal(&name, e.to_string()),
                    attempts: 0,
                    status: WorkflowStatus::Failed,
                };
                return Err(self
                    .terminate(workflow_id, &transaction, &mut machine, &mut log, failure)
                    .await);
            }
            self.tracker.step_started(workflow_id, &name, step_number, log.len());

            if let Some(entry) = replay.remove(&step_number).filter(|e| e.step == name) {
                debug!(
                    workflow_id = %workflow_id,
                    step = %name,
                    step_number = step_number,
                    event = events::WORKFLOW_STEP_REPLAYED,
                    "Replaying journaled step"
                );
                if let Some(compensation) = entry.compensation {
                    log.push(compensation);
                }
                outputs.insert(name.clone(), entry.output.output.clone());
                steps.push(StepResult {
                    step: name,
                    step_number,
                    output: entry.output.output,
                    attempts: entry.attempts,
                    replayed: true,
                });
                self.tracker.pending_changed(workflow_id, log.len());
                continue;
            }

            match self.journal.try_claim(workflow_id, owner, self.claim_lease).await {
                Ok(true) => {}
                Ok(false) => {
                    // Another driver took over after our lease lapsed and
                    // now owns the compensation log
                    warn!(
                        workflow_id = %workflow_id,
                        step = %name,
                        "Claim lost to another driver, stopping without unwinding"
                    );
                    return Err(self.in_progress(workflow_id, &transaction));
                }
                Err(e) => warn!(
                    workflow_id = %workflow_id,
                    step = %name,
                    error = %e,
                    "Claim renewal failed, continuing on the current lease"
                ),
            }

            let ctx = StepContext {
                workflow_id,
                transaction: Arc::clone(&transaction),
                step_number,
                attempt: 1,
                outputs: Arc::new(outputs.clone()),
            };

            let policy = match step.retry_class() {
                RetryClass::Fast => &self.fast_policy,
                RetryClass::Agent => &self.agent_policy,
            };
            let timeout = step.timeout().unwrap_or(self.step_timeout);

            let outcome = run_with_retry(&self.executor, policy, &name, timeout, |attempt| {
                let ctx = StepContext {
                    attempt,
                    ..ctx.clone()
                };
                let step = Arc::clone(step);
                async move { step.execute(&ctx).await }
            })
            .await;
            let attempts = outcome.attempts;

            let output = match outcome.result {
                Ok(output) => output,
                Err(error) => {
                    let status = terminal_status_for(&error);
                    let failure = Failure {
                        step: name,
                        step_number,
                        error,
                        attempts,
                        status,
                    };
                    return Err(self
                        .terminate(workflow_id, &transaction, &mut machine, &mut log, failure)
                        .await);
                }
            };

            if let Some(reason) = output.security_flag.clone() {
                let failure = Failure {
                    step: name.clone(),
                    step_number,
                    error: ActivityError::security_threat(&name, reason),
                    attempts,
                    status: WorkflowStatus::Aborted,
                };
                return Err(self
                    .terminate(workflow_id, &transaction, &mut machine, &mut log, failure)
                    .await);
            }

            let compensation = step.compensation().map(|action| CompensationEntry {
                action: action.to_string(),
                resource_id: output.resource_id.clone(),
                step: name.clone(),
                step_number,
            });

            let entry = JournalEntry {
                step: name.clone(),
                step_number,
                output: output.clone(),
                attempts,
                compensation: compensation.clone(),
                recorded_at: Utc::now(),
            };
            let journaled = self
                .journal_write("journal.record_step", |journal| {
                    let entry = entry.clone();
                    async move { journal.record_step(workflow_id, entry).await }
                })
                .await;

            // The step's effect exists whether or not it was journaled
            if let Some(entry) = compensation {
                log.push(entry);
                self.tracker.pending_changed(workflow_id, log.len());
            }

            if let Err(error) = journaled {
                log_error("workflow", "record_step", &error.message, Some(&name));
                let failure = Failure {
                    step: name.clone(),
                    step_number,
                    error: ActivityError::internal(
                        &name,
                        format!("step result not journaled: {}", error.message),
                    ),
                    attempts,
                    status: WorkflowStatus::Failed,
                };
                return Err(self
                    .terminate(workflow_id, &transaction, &mut machine, &mut log, failure)
                    .await);
            }

            info!(
                workflow_id = %workflow_id,
                step = %name,
                step_number = step_number,
                attempts = attempts,
                pending_compensations = log.len(),
                event = events::WORKFLOW_STEP_COMPLETED,
                "✅ Workflow step completed"
            );

            if output.requires_attention {
                self.raise_attention(workflow_id, &name, &output).await;
                attention_raised.push(name.clone());
            }

            outputs.insert(name.clone(), output.output.clone());
            steps.push(StepResult {
                step: name,
                step_number,
                output: output.output,
                attempts,
                replayed: false,
            });
        }

        log.clear();
        if let Err(e) = machine.transition(WorkflowEvent::Complete) {
            warn!(workflow_id = %workflow_id, error = %e, "Completion transition rejected");
        }

        let completed_at = Utc::now();
        let result = WorkflowResult {
            workflow_id,
            transaction_id: transaction.id.clone(),
            status: WorkflowStatus::Completed,
            steps,
            attention_raised,
            started_at,
            completed_at,
            duration_ms: (completed_at - started_at).num_milliseconds().max(0) as u64,
        };

        self.record_terminal(workflow_id, &Ok(result.clone())).await;
        self.tracker.finished(workflow_id, WorkflowStatus::Completed, None);
        log_workflow_operation(
            events::WORKFLOW_COMPLETED,
            workflow_id,
            None,
            "completed",
            Some(&format!("{} steps", result.steps.len())),
        );

        Ok(result)
    }

    /// Attention is a side effect only: its failure never fails the instance
    async fn raise_attention(&self, workflow_id: Uuid, step: &str, output: &StepOutput) {
        let Some(handler) = &self.attention else {
            debug!(workflow_id = %workflow_id, step = %step, "No attention handler configured");
            return;
        };

        let activity = format!("{step}.attention");
        match self
            .executor
            .run(
                &activity,
                handler.on_attention(workflow_id, step, &output.output),
                self.step_timeout,
            )
            .await
        {
            Ok(()) => info!(workflow_id = %workflow_id, step = %step, "🚩 Attention raised"),
            Err(e) => warn!(
                workflow_id = %workflow_id,
                step = %step,
                kind = %e.kind,
                "Attention hook failed, continuing"
            ),
        }
    }

    /// Unwind, move to the terminal state and build the typed error
    async fn terminate(
        &self,
        workflow_id: Uuid,
        transaction: &Transaction,
        machine: &mut WorkflowStateMachine,
        log: &mut CompensationLog,
        failure: Failure,
    ) -> WorkflowError {
        error!(
            workflow_id = %workflow_id,
            step = %failure.step,
            step_number = failure.step_number,
            kind = %failure.error.kind,
            attempts = failure.attempts,
            error = %failure.error.message,
            event = events::WORKFLOW_STEP_FAILED,
            "❌ Workflow step failed"
        );

        let compensation = if log.is_empty() {
            CompensationReport::default()
        } else {
            info!(
                workflow_id = %workflow_id,
                pending = log.len(),
                event = events::WORKFLOW_COMPENSATING,
                "↩️ Unwinding compensation log"
            );
            log.unwind(workflow_id, &self.compensations, &self.executor, self.step_timeout)
                .await
        };

        let event = match failure.status {
            WorkflowStatus::Aborted => WorkflowEvent::Abort {
                reason: failure.error.message.clone(),
            },
            _ => WorkflowEvent::Fail {
                reason: failure.error.message.clone(),
            },
        };
        if let Err(e) = machine.transition(event) {
            warn!(workflow_id = %workflow_id, error = %e, "Terminal transition rejected");
        }

        let error = WorkflowError {
            workflow_id,
            transaction_id: transaction.id.clone(),
            failed_step: failure.step,
            step_number: failure.step_number,
            kind: failure.error.kind,
            status: failure.status,
            message: failure.error.message,
            attempts: failure.attempts,
            compensation,
        };

        self.record_terminal(workflow_id, &Err(error.clone())).await;
        self.tracker.finished(
            workflow_id,
            error.status,
            Some((error.failed_step.as_str(), error.kind)),
        );
        log_workflow_operation(
            events::WORKFLOW_TERMINATED,
            workflow_id,
            Some(&error.failed_step),
            &error.status.to_string(),
            Some(error.kind.category()),
        );

        error
    }

    /// Write to the journal under the fast retry class
    async fn journal_write<F, Fut>(&self, operation: &str, write: F) -> Result<(), ActivityError>
    where
        F: Fn(Arc<dyn WorkflowJournal>) -> Fut,
        Fut: Future<Output = crate::error::Result<()>>,
    {
        run_with_retry(
            &self.executor,
            &self.fast_policy,
            operation,
            self.step_timeout,
            |_| {
                let write = write(Arc::clone(&self.journal));
                async move {
                    write
                        .await
                        .map_err(|e| ActivityError::internal("journal", e.to_string()))
                }
            },
        )
        .await
        .into_result()
    }

    /// Journal a terminal outcome. When the journal refuses it the outcome
    /// is held in memory, so a re-drive reports it instead of executing the
    /// instance again.
    async fn record_terminal(&self, workflow_id: Uuid, outcome: &WorkflowOutcome) -> bool {
        let record = match outcome {
            Ok(result) => TerminalRecord::completed(result.clone()),
            Err(error) => TerminalRecord::failed(error.clone()),
        };

        let written = self
            .journal_write("journal.record_terminal", |journal| {
                let record = record.clone();
                async move { journal.record_terminal(workflow_id, record).await }
            })
            .await;

        match written {
            Ok(()) => true,
            Err(e) => {
                log_error("workflow", "record_terminal", &e.message, None);
                self.unrecorded.insert(workflow_id, outcome.clone());
                false
            }
        }
    }

    /// Outcome of an instance whose terminal record is still unwritten;
    /// the write is retried first
    async fn retry_unrecorded(&self, workflow_id: Uuid) -> Option<WorkflowOutcome> {
        let outcome = self.unrecorded.get(&workflow_id).map(|o| o.value().clone())?;
        if self.record_terminal(workflow_id, &outcome).await {
            self.unrecorded.remove(&workflow_id);
        }
        Some(outcome)
    }

    fn in_progress(&self, workflow_id: Uuid, transaction: &Transaction) -> WorkflowError {
        info!(
            workflow_id = %workflow_id,
            event = events::WORKFLOW_IN_PROGRESS,
            "Instance held by another driver, not executing"
        );
        WorkflowError {
            workflow_id,
            transaction_id: transaction.id.clone(),
            failed_step: self.name.clone(),
            step_number: 0,
            kind: ErrorKind::InProgress,
            status: WorkflowStatus::Running,
            message: "instance is being driven by another owner".to_string(),
            attempts: 0,
            compensation: CompensationReport::default(),
        }
    }

    /// Failure raised before any step ran
    fn bare_error(&self, workflow_id: Uuid, transaction: &Transaction, error: ActivityError) -> WorkflowError {
        WorkflowError {
            workflow_id,
            transaction_id: transaction.id.clone(),
            failed_step: error.activity.clone(),
            step_number: 0,
            kind: error.kind,
            status: WorkflowStatus::Failed,
            message: error.message,
            attempts: 0,
            compensation: CompensationReport::default(),
        }
    }
}

/// Validation failures abort; every other raised error fails the instance
fn terminal_status_for(error: &ActivityError) -> WorkflowStatus {
    match error.kind {
        ErrorKind::Validation => WorkflowStatus::Aborted,
        _ => WorkflowStatus::Failed,
    }
}
