//! # Standard Transactional Pipeline
//!
//! Building blocks for the usual workflow shape: validate the transaction,
//! run a sequence of stage-backed steps, persist the bundle. Also the
//! [`WorkflowBuilder`] that assembles any [`DurableWorkflow`].

use super::compensation::{CompensationEntry, CompensationHandler, CompensationHandlers};
use super::journal::{InMemoryWorkflowJournal, WorkflowJournal};
use super::saga::DurableWorkflow;
use super::step::{RetryClass, StepContext, StepOutput, WorkflowStep};
use super::tracker::WorkflowTracker;
use crate::config::AgentflowConfig;
use crate::constants::{workflow, DEFAULT_STAGE_TIMEOUT};
use crate::error::{ActivityError, AgentflowError, ErrorKind, Result};
use crate::execution::{ActivityExecutor, RetryPolicy};
use crate::registry::StageRegistry;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

/// Compensation action registered by [`PersistStep`]
pub const REMOVE_RECORD: &str = "remove_record";

/// Slack between a stage's own timeout and the enclosing step timeout, so
/// the stage outcome is always recorded before the step is cut off
const STAGE_STEP_GRACE: Duration = Duration::from_secs(1);

/// Final storage for the analysis bundle
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Store `bundle`, returning the record id
    async fn store(&self, bundle: Value) -> std::result::Result<String, ActivityError>;

    async fn remove(&self, record_id: &str) -> std::result::Result<(), ActivityError>;
}

/// Non-fatal side effect run when a step's output needs attention
#[async_trait]
pub trait AttentionHandler: Send + Sync {
    async fn on_attention(
        &self,
        workflow_id: Uuid,
        step: &str,
        output: &Value,
    ) -> std::result::Result<(), ActivityError>;
}

/// Step 1 of the standard pipeline: reject transactions without an id or
/// content
#[derive(Debug, Clone, Default)]
pub struct TransactionValidationStep;

#[async_trait]
impl WorkflowStep for TransactionValidationStep {
    fn name(&self) -> &str {
        "validate_transaction"
    }

    fn retry_class(&self) -> RetryClass {
        RetryClass::Fast
    }

    async fn execute(&self, ctx: &StepContext) -> std::result::Result<StepOutput, ActivityError> {
        ctx.transaction.validate()?;
        let fields: Vec<&String> = ctx.transaction.content_fields().map(|(k, _)| k).collect();
        Ok(StepOutput::new(json!({
            "transaction_id": ctx.transaction.id,
            "content_fields": fields,
        })))
    }
}

/// A step that runs one registry stage
///
/// Shares the stage's breaker with the orchestrator: an open breaker fails
/// the step with `UNAVAILABLE`, and every call outcome is recorded.
pub struct StageStep {
    stage: String,
    registry: Arc<StageRegistry>,
    executor: ActivityExecutor,
    default_timeout: Duration,
    security_flag_field: Option<String>,
    attention_field: Option<String>,
    compensation: Option<String>,
}

impl std::fmt::Debug for StageStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageStep")
            .field("stage", &self.stage)
            .field("security_flag_field", &self.security_flag_field)
            .field("attention_field", &self.attention_field)
            .field("compensation", &self.compensation)
            .finish()
    }
}

impl StageStep {
    pub fn new(stage: impl Into<String>, registry: Arc<StageRegistry>) -> Self {
        Self {
            stage: stage.into(),
            registry,
            executor: ActivityExecutor::default(),
            default_timeout: DEFAULT_STAGE_TIMEOUT,
            security_flag_field: None,
            attention_field: None,
            compensation: None,
        }
    }

    /// Output field that, when truthy, marks the result as a security threat
    pub fn with_security_flag_field(mut self, field: impl Into<String>) -> Self {
        self.security_flag_field = Some(field.into());
        self
    }

    /// Output field that, when truthy, triggers the attention hook
    pub fn with_attention_field(mut self, field: impl Into<String>) -> Self {
        self.attention_field = Some(field.into());
        self
    }

    pub fn with_compensation(mut self, action: impl Into<String>) -> Self {
        self.compensation = Some(action.into());
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_executor(mut self, executor: ActivityExecutor) -> Self {
        self.executor = executor;
        self
    }

    /// The stage's own timeout, kept below the executor ceiling minus the
    /// grace so the enclosing step timeout never cuts the stage off first
    fn stage_timeout(&self) -> Duration {
        let ceiling = self.executor.max_timeout();
        let grace = STAGE_STEP_GRACE.min(ceiling / 2);
        self.registry
            .timeout_for(&self.stage, self.default_timeout)
            .min(ceiling - grace)
    }
}

#[async_trait]
impl WorkflowStep for StageStep {
    fn name(&self) -> &str {
        &self.stage
    }

    fn retry_class(&self) -> RetryClass {
        RetryClass::Agent
    }

    fn compensation(&self) -> Option<&str> {
        self.compensation.as_deref()
    }

    fn timeout(&self) -> Option<Duration> {
        let ceiling = self.executor.max_timeout();
        Some((self.stage_timeout() + STAGE_STEP_GRACE.min(ceiling / 2)).min(ceiling))
    }

    async fn execute(&self, ctx: &StepContext) -> std::result::Result<StepOutput, ActivityError> {
        if self.registry.is_open(&self.stage) {
            return Err(ActivityError::new(
                &self.stage,
                ErrorKind::Unavailable,
                "circuit open",
            ));
        }

        let to_activity = |e: AgentflowError| ActivityError::internal(&self.stage, e.to_string());
        let handler = self.registry.handler(&self.stage).map_err(to_activity)?;
        let descriptor = self.registry.get(&self.stage).map_err(to_activity)?;
        let input = handler.project_input(&descriptor, &ctx.transaction.to_value(), &ctx.outputs);

        let started = Instant::now();
        let result = self
            .executor
            .run(&self.stage, handler.process(input), self.stage_timeout())
            .await;
        if let Err(e) = self
            .registry
            .record_outcome(&self.stage, result.is_ok(), started.elapsed())
        {
            debug!(stage = %self.stage, error = %e, "Stage outcome not recorded");
        }

        let output = result?;
        let mut step_output = StepOutput::new(output.clone());

        if let Some(field) = &self.security_flag_field {
            if is_truthy(output.get(field)) {
                step_output = step_output.with_security_flag(format!(
                    "{} raised {field}",
                    self.stage
                ));
            }
        }
        if let Some(field) = &self.attention_field {
            if is_truthy(output.get(field)) {
                step_output = step_output.with_attention();
            }
        }

        Ok(step_output)
    }
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => !s.is_empty() && !s.eq_ignore_ascii_case("false"),
        Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(map)) => !map.is_empty(),
        Some(Value::Null) | None => false,
    }
}

/// Final step: store every prior output as one bundle
pub struct PersistStep {
    sink: Arc<dyn PersistenceSink>,
}

impl PersistStep {
    pub const NAME: &'static str = "persist_results";

    pub fn new(sink: Arc<dyn PersistenceSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl WorkflowStep for PersistStep {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn retry_class(&self) -> RetryClass {
        RetryClass::Fast
    }

    fn compensation(&self) -> Option<&str> {
        Some(REMOVE_RECORD)
    }

    async fn execute(&self, ctx: &StepContext) -> std::result::Result<StepOutput, ActivityError> {
        let bundle = json!({
            "workflow_id": ctx.workflow_id,
            "transaction_id": ctx.transaction.id,
            "outputs": ctx.outputs.as_ref(),
        });
        let record_id = self.sink.store(bundle).await?;
        Ok(StepOutput::new(json!({ "record_id": record_id })).with_resource(record_id))
    }
}

/// Compensation for [`PersistStep`]: remove the stored record
pub struct RemoveRecordCompensation {
    sink: Arc<dyn PersistenceSink>,
}

impl RemoveRecordCompensation {
    pub fn new(sink: Arc<dyn PersistenceSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl CompensationHandler for RemoveRecordCompensation {
    async fn compensate(
        &self,
        _workflow_id: Uuid,
        entry: &CompensationEntry,
    ) -> std::result::Result<(), ActivityError> {
        match &entry.resource_id {
            Some(record_id) => self.sink.remove(record_id).await,
            None => Err(ActivityError::internal(
                REMOVE_RECORD,
                "no record id to remove",
            )),
        }
    }
}

/// A step waiting for [`WorkflowBuilder::build`]. Stage steps pick up the
/// builder's final step timeout and executor there, whatever order the
/// builder methods were called in.
enum PendingStep {
    Ready(Arc<dyn WorkflowStep>),
    Stage(StageStep),
}

/// Assembles a [`DurableWorkflow`]
pub struct WorkflowBuilder {
    name: String,
    steps: Vec<PendingStep>,
    compensations: CompensationHandlers,
    attention: Option<Arc<dyn AttentionHandler>>,
    executor: ActivityExecutor,
    fast_policy: RetryPolicy,
    agent_policy: RetryPolicy,
    step_timeout: Duration,
    claim_lease: Duration,
    journal: Option<Arc<dyn WorkflowJournal>>,
    tracker: Option<Arc<WorkflowTracker>>,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            compensations: CompensationHandlers::new(),
            attention: None,
            executor: ActivityExecutor::default(),
            fast_policy: RetryPolicy::fast(),
            agent_policy: RetryPolicy::agent(),
            step_timeout: DEFAULT_STAGE_TIMEOUT,
            claim_lease: workflow::DEFAULT_CLAIM_LEASE,
            journal: None,
            tracker: None,
        }
    }

    /// Builder seeded with the configured retry classes and timeouts
    pub fn from_config(name: impl Into<String>, config: &AgentflowConfig) -> Self {
        Self::new(name)
            .executor(ActivityExecutor::new(config.execution.max_stage_timeout()))
            .retry_policies(config.retry.fast.to_policy(), config.retry.agent.to_policy())
            .step_timeout(config.execution.stage_timeout())
            .claim_lease(config.workflow.claim_lease())
    }

    pub fn step(mut self, step: Arc<dyn WorkflowStep>) -> Self {
        self.steps.push(PendingStep::Ready(step));
        self
    }

    pub fn validation(self) -> Self {
        self.step(Arc::new(TransactionValidationStep))
    }

    /// Append a stage step. Its default timeout and executor are taken
    /// from the builder when the workflow is built.
    pub fn stage_step(mut self, step: StageStep) -> Self {
        self.steps.push(PendingStep::Stage(step));
        self
    }

    /// Append the persistence step and register its compensation
    pub fn persist(self, sink: Arc<dyn PersistenceSink>) -> Self {
        self.compensation(REMOVE_RECORD, Arc::new(RemoveRecordCompensation::new(Arc::clone(&sink))))
            .step(Arc::new(PersistStep::new(sink)))
    }

    pub fn compensation(mut self, action: impl Into<String>, handler: Arc<dyn CompensationHandler>) -> Self {
        self.compensations.insert(action.into(), handler);
        self
    }

    pub fn attention_handler(mut self, handler: Arc<dyn AttentionHandler>) -> Self {
        self.attention = Some(handler);
        self
    }

    pub fn executor(mut self, executor: ActivityExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn retry_policies(mut self, fast: RetryPolicy, agent: RetryPolicy) -> Self {
        self.fast_policy = fast;
        self.agent_policy = agent;
        self
    }

    pub fn step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Lease a driver holds on an instance while executing it
    pub fn claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    pub fn journal(mut self, journal: Arc<dyn WorkflowJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn tracker(mut self, tracker: Arc<WorkflowTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Requires at least one step, unique step names, and a handler for
    /// every compensation action a step declares
    pub fn build(self) -> Result<DurableWorkflow> {
        if self.steps.is_empty() {
            return Err(AgentflowError::InvalidWorkflow(format!(
                "workflow {} has no steps",
                self.name
            )));
        }

        let steps: Vec<Arc<dyn WorkflowStep>> = self
            .steps
            .into_iter()
            .map(|pending| match pending {
                PendingStep::Ready(step) => step,
                PendingStep::Stage(step) => Arc::new(
                    step.with_default_timeout(self.step_timeout)
                        .with_executor(self.executor.clone()),
                ),
            })
            .collect();

        let mut names = HashSet::new();
        for step in &steps {
            if !names.insert(step.name()) {
                return Err(AgentflowError::InvalidWorkflow(format!(
                    "workflow {} declares step {} twice",
                    self.name,
                    step.name()
                )));
            }
            if let Some(action) = step.compensation() {
                if !self.compensations.contains_key(action) {
                    return Err(AgentflowError::InvalidWorkflow(format!(
                        "workflow {}: no handler for compensation {action} of step {}",
                        self.name,
                        step.name()
                    )));
                }
            }
        }

        Ok(DurableWorkflow {
            name: self.name,
            steps,
            compensations: self.compensations,
            attention: self.attention,
            executor: self.executor,
            fast_policy: self.fast_policy,
            agent_policy: self.agent_policy,
            step_timeout: self.step_timeout,
            claim_lease: self.claim_lease,
            unrecorded: DashMap::new(),
            journal: self
                .journal
                .unwrap_or_else(|| Arc::new(InMemoryWorkflowJournal::new())),
            tracker: self.tracker.unwrap_or_default(),
        })
    }
}
