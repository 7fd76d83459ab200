//! Shared test doubles for the integration suites: scripted stages,
//! recording workflow steps and compensators, and an in-memory sink.

#![allow(dead_code)]

use agentflow_core::orchestration::{PhaseDefinition, PhasePlan, PhasedOrchestrator};
use agentflow_core::registry::{StageDescriptor, StageHandler, StageRegistry};
use agentflow_core::workflow::{
    AttentionHandler, CompensationEntry, CompensationHandler, PersistenceSink, RetryClass,
    StepContext, StepOutput, WorkflowStep,
};
use agentflow_core::{ActivityError, ErrorKind, RetryPolicy};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_test_writer()
        .try_init();
}

/// How a scripted stage answers each call
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    Fail(ErrorKind),
    /// Sleep, then succeed; exceeds short timeouts
    Sleep(Duration),
    /// Fail the first `n` calls, then succeed
    FailTimes(usize),
    Panic,
}

/// Stage whose behavior is fixed at construction and whose calls are counted
#[derive(Debug)]
pub struct ScriptedStage {
    pub id: String,
    behavior: Mutex<Behavior>,
    calls: AtomicUsize,
}

impl ScriptedStage {
    pub fn new(id: &str, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            behavior: Mutex::new(behavior),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn ok(id: &str) -> Arc<Self> {
        Self::new(id, Behavior::Succeed)
    }

    pub fn failing(id: &str) -> Arc<Self> {
        Self::new(id, Behavior::Fail(ErrorKind::Internal))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock() = behavior;
    }
}

#[async_trait]
impl StageHandler for ScriptedStage {
    async fn process(&self, input: Value) -> Result<Value, ActivityError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let behavior = self.behavior.lock().clone();
        match behavior {
            Behavior::Succeed => Ok(json!({"stage": self.id, "call": call, "input": input})),
            Behavior::Fail(kind) => Err(ActivityError::new(&self.id, kind, "scripted failure")),
            Behavior::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Ok(json!({"stage": self.id, "slept_ms": duration.as_millis() as u64}))
            }
            Behavior::FailTimes(n) if call <= n => {
                Err(ActivityError::internal(&self.id, format!("transient failure {call}")))
            }
            Behavior::FailTimes(_) => Ok(json!({"stage": self.id, "call": call})),
            Behavior::Panic => panic!("scripted panic in {}", self.id),
        }
    }
}

/// Registry holding every given stage under `threshold`
pub fn registry_with(stages: &[Arc<ScriptedStage>], threshold: u32) -> Arc<StageRegistry> {
    let registry = Arc::new(StageRegistry::new(threshold));
    for stage in stages {
        registry.register(StageDescriptor::new(&stage.id), Arc::clone(stage) as Arc<dyn StageHandler>);
    }
    registry
}

pub fn orchestrator_for(
    registry: &Arc<StageRegistry>,
    phases: Vec<PhaseDefinition>,
) -> PhasedOrchestrator {
    let plan = PhasePlan::new(phases, registry).expect("valid phase plan");
    PhasedOrchestrator::new(Arc::clone(registry), plan)
}

/// Millisecond-scale retries so real-time tests stay quick
pub fn quick_policy(attempts: u32) -> RetryPolicy {
    RetryPolicy::fast()
        .with_intervals(Duration::from_millis(1), Duration::from_millis(5))
        .with_maximum_attempts(attempts)
}

/// Order in which steps and compensations ran, shared across doubles
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter_map(|e| e.strip_prefix(prefix).map(str::to_string))
            .collect()
    }
}

/// Workflow step with a fixed answer, registering `undo` as its compensation
pub struct RecordingStep {
    name: String,
    result: Result<StepOutput, ActivityError>,
    compensation: Option<String>,
    class: RetryClass,
    fail_first: usize,
    executions: AtomicUsize,
    log: CallLog,
}

impl RecordingStep {
    pub fn ok(name: &str, log: &CallLog) -> Self {
        Self {
            name: name.to_string(),
            result: Ok(StepOutput::new(json!({"step": name})).with_resource(format!("res-{name}"))),
            compensation: Some("undo".to_string()),
            class: RetryClass::Fast,
            fail_first: 0,
            executions: AtomicUsize::new(0),
            log: log.clone(),
        }
    }

    pub fn failing(name: &str, error: ActivityError, log: &CallLog) -> Self {
        Self {
            result: Err(error),
            ..Self::ok(name, log)
        }
    }

    pub fn returning(name: &str, output: StepOutput, log: &CallLog) -> Self {
        Self {
            result: Ok(output),
            ..Self::ok(name, log)
        }
    }

    /// Fail with a transient error on the first `n` executions
    pub fn flaky(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    pub fn without_compensation(mut self) -> Self {
        self.compensation = None;
        self
    }

    pub fn agent(mut self) -> Self {
        self.class = RetryClass::Agent;
        self
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkflowStep for RecordingStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn retry_class(&self) -> RetryClass {
        self.class
    }

    fn compensation(&self) -> Option<&str> {
        self.compensation.as_deref()
    }

    async fn execute(&self, ctx: &StepContext) -> Result<StepOutput, ActivityError> {
        let n = self.executions.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.push(format!("exec:{}#{}", self.name, ctx.attempt));
        if n <= self.fail_first {
            return Err(ActivityError::internal(&self.name, "flaky"));
        }
        self.result.clone()
    }
}

/// Compensator that records which step it undid
pub struct RecordingCompensator {
    log: CallLog,
    fail_for: Option<String>,
}

impl RecordingCompensator {
    pub fn new(log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            log: log.clone(),
            fail_for: None,
        })
    }

    /// Fails when undoing `step`, succeeds for every other entry
    pub fn failing_for(step: &str, log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            log: log.clone(),
            fail_for: Some(step.to_string()),
        })
    }
}

#[async_trait]
impl CompensationHandler for RecordingCompensator {
    async fn compensate(&self, _workflow_id: Uuid, entry: &CompensationEntry) -> Result<(), ActivityError> {
        self.log.push(format!("undo:{}", entry.step));
        if self.fail_for.as_deref() == Some(entry.step.as_str()) {
            return Err(ActivityError::internal("undo", "compensation failed"));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemorySink {
    pub records: Mutex<HashMap<String, Value>>,
    pub removed: Mutex<Vec<String>>,
    fail_store: bool,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail_store: true,
            ..Self::default()
        })
    }
}

#[async_trait]
impl PersistenceSink for MemorySink {
    async fn store(&self, bundle: Value) -> Result<String, ActivityError> {
        if self.fail_store {
            return Err(ActivityError::validation("store", "bundle rejected"));
        }
        let id = format!("rec-{}", self.records.lock().len() + 1);
        self.records.lock().insert(id.clone(), bundle);
        Ok(id)
    }

    async fn remove(&self, record_id: &str) -> Result<(), ActivityError> {
        self.records.lock().remove(record_id);
        self.removed.lock().push(record_id.to_string());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingAttention {
    pub raised: Mutex<Vec<(Uuid, String)>>,
    fail: bool,
}

impl RecordingAttention {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }
}

#[async_trait]
impl AttentionHandler for RecordingAttention {
    async fn on_attention(&self, workflow_id: Uuid, step: &str, _output: &Value) -> Result<(), ActivityError> {
        self.raised.lock().push((workflow_id, step.to_string()));
        if self.fail {
            return Err(ActivityError::internal("attention", "notifier down"));
        }
        Ok(())
    }
}
