//! Durable workflow behavior: compensation ordering, retry classes, journal
//! replay and the standard validate/analyze/persist pipeline.

mod common;

use agentflow_core::registry::{StageDescriptor, StageHandler, StageRegistry};
use agentflow_core::workflow::{
    CompensationEntry, InMemoryWorkflowJournal, JournalEntry, PersistStep, StageStep, StepOutput,
    TerminalRecord, WorkflowBuilder, WorkflowJournal, WorkflowStep, REMOVE_RECORD,
};
use agentflow_core::{ActivityError, AgentflowError, ErrorKind, Transaction, WorkflowStatus};
use async_trait::async_trait;
use chrono::Utc;
use common::{
    init_test_logging, quick_policy, registry_with, Behavior, CallLog, MemorySink,
    RecordingAttention, RecordingCompensator, RecordingStep, ScriptedStage,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn tx(id: &str) -> Transaction {
    Transaction::new(id)
        .with_field("note", "patient seen for follow-up")
        .with_field("amount", 120.5)
}

/// Stage answering every call with the same output
struct FixedStage(Value);

#[async_trait]
impl StageHandler for FixedStage {
    async fn process(&self, _input: Value) -> Result<Value, ActivityError> {
        Ok(self.0.clone())
    }
}

fn registry_of(stages: &[(&str, Value)]) -> Arc<StageRegistry> {
    let registry = Arc::new(StageRegistry::new(3));
    for (id, output) in stages {
        registry.register(StageDescriptor::new(*id), Arc::new(FixedStage(output.clone())));
    }
    registry
}

#[tokio::test]
async fn test_security_threat_unwinds_completed_steps_in_reverse() {
    init_test_logging();
    let log = CallLog::default();

    let mut builder = WorkflowBuilder::new("ten_steps")
        .compensation("undo", RecordingCompensator::new(&log))
        .retry_policies(quick_policy(3), quick_policy(3));
    let mut steps = Vec::new();
    for n in 1..=10 {
        let name = format!("s{n}");
        let step = if n == 6 {
            RecordingStep::failing(
                &name,
                ActivityError::security_threat(&name, "exfiltration attempt"),
                &log,
            )
        } else {
            RecordingStep::ok(&name, &log)
        };
        let step = Arc::new(step);
        steps.push(Arc::clone(&step));
        builder = builder.step(step);
    }
    let workflow = builder.build().unwrap();

    let err = workflow.run(tx("tx-b")).await.unwrap_err();

    assert_eq!(err.status, WorkflowStatus::Failed);
    assert_eq!(err.kind, ErrorKind::SecurityThreat);
    assert_eq!(err.step_number, 6);
    assert_eq!(err.failed_step, "s6");
    assert_eq!(err.attempts, 1, "security threats are never retried");

    assert_eq!(log.with_prefix("undo:"), vec!["s5", "s4", "s3", "s2", "s1"]);
    assert_eq!(err.compensation.succeeded, 5);
    assert_eq!(err.compensation.failed(), 0);
    assert!(steps[6..].iter().all(|s| s.executions() == 0));

    let snapshot = workflow.tracker().get(err.workflow_id).unwrap();
    assert_eq!(snapshot.status, WorkflowStatus::Failed);
    assert_eq!(snapshot.failed_step.as_deref(), Some("s6"));
    assert_eq!(snapshot.error_kind, Some(ErrorKind::SecurityThreat));
}

#[tokio::test]
async fn test_failing_compensation_does_not_stop_unwind() {
    init_test_logging();
    let log = CallLog::default();

    let workflow = WorkflowBuilder::new("unwind")
        .compensation("undo", RecordingCompensator::failing_for("s2", &log))
        .retry_policies(quick_policy(1), quick_policy(1))
        .step(Arc::new(RecordingStep::ok("s1", &log)))
        .step(Arc::new(RecordingStep::ok("s2", &log)))
        .step(Arc::new(RecordingStep::ok("s3", &log)))
        .step(Arc::new(RecordingStep::failing(
            "s4",
            ActivityError::internal("s4", "downstream 500"),
            &log,
        )))
        .build()
        .unwrap();

    let err = workflow.run(tx("tx-u")).await.unwrap_err();

    assert_eq!(err.status, WorkflowStatus::Failed);
    assert_eq!(log.with_prefix("undo:"), vec!["s3", "s2", "s1"]);
    assert_eq!(err.compensation.attempted.len(), 3);
    assert_eq!(err.compensation.succeeded, 2);
    assert_eq!(err.compensation.failed(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried_with_backoff() {
    init_test_logging();
    let log = CallLog::default();
    let flaky = Arc::new(RecordingStep::ok("flaky", &log).without_compensation().flaky(2));

    let workflow = WorkflowBuilder::new("retries")
        .step(Arc::clone(&flaky) as Arc<dyn WorkflowStep>)
        .build()
        .unwrap();

    let result = workflow.run(tx("tx-r")).await.unwrap();

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.steps[0].attempts, 3);
    assert_eq!(flaky.executions(), 3);
    assert_eq!(
        log.with_prefix("exec:"),
        vec!["flaky#1", "flaky#2", "flaky#3"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_fail_and_compensate() {
    init_test_logging();
    let log = CallLog::default();

    let workflow = WorkflowBuilder::new("exhausts")
        .compensation("undo", RecordingCompensator::new(&log))
        .step(Arc::new(RecordingStep::ok("reserve", &log)))
        .step(Arc::new(RecordingStep::ok("charge", &log).agent().flaky(10)))
        .build()
        .unwrap();

    let err = workflow.run(tx("tx-e")).await.unwrap_err();

    assert_eq!(err.status, WorkflowStatus::Failed);
    assert_eq!(err.kind, ErrorKind::Internal);
    assert_eq!(err.failed_step, "charge");
    assert_eq!(err.attempts, 3);
    assert_eq!(log.with_prefix("undo:"), vec!["reserve"]);
}

#[tokio::test]
async fn test_resume_replays_journaled_steps_without_executing() {
    init_test_logging();
    let log = CallLog::default();
    let journal = Arc::new(InMemoryWorkflowJournal::new());
    let workflow_id = Uuid::new_v4();

    // Steps 1 and 2 committed before the previous worker went away
    for (n, name) in [(1usize, "s1"), (2, "s2")] {
        journal
            .record_step(
                workflow_id,
                JournalEntry {
                    step: name.to_string(),
                    step_number: n,
                    output: StepOutput::new(json!({"step": name, "from": "journal"})),
                    attempts: 1,
                    compensation: Some(CompensationEntry {
                        action: "undo".to_string(),
                        resource_id: Some(format!("res-{name}")),
                        step: name.to_string(),
                        step_number: n,
                    }),
                    recorded_at: Utc::now(),
                },
            )
            .await
            .unwrap();
    }

    let s1 = Arc::new(RecordingStep::ok("s1", &log));
    let s2 = Arc::new(RecordingStep::ok("s2", &log));
    let s3 = Arc::new(RecordingStep::ok("s3", &log));
    let workflow = WorkflowBuilder::new("resumable")
        .compensation("undo", RecordingCompensator::new(&log))
        .journal(Arc::clone(&journal) as Arc<dyn WorkflowJournal>)
        .step(Arc::clone(&s1) as Arc<dyn WorkflowStep>)
        .step(Arc::clone(&s2) as Arc<dyn WorkflowStep>)
        .step(Arc::clone(&s3) as Arc<dyn WorkflowStep>)
        .build()
        .unwrap();

    let result = workflow.resume(workflow_id, tx("tx-j")).await.unwrap();

    assert_eq!(s1.executions() + s2.executions(), 0);
    assert_eq!(s3.executions(), 1);
    assert!(result.steps[0].replayed && result.steps[1].replayed);
    assert!(!result.steps[2].replayed);
    assert_eq!(result.output_of("s1"), Some(&json!({"step": "s1", "from": "journal"})));

    assert_eq!(journal.completed_steps(workflow_id).await.unwrap().len(), 3);
    let terminal = journal.terminal_status(workflow_id).await.unwrap().unwrap();
    assert_eq!(terminal.status, WorkflowStatus::Completed);

    // A second re-drive reports the recorded outcome and runs nothing
    let again = workflow.resume(workflow_id, tx("tx-j")).await.unwrap();
    assert_eq!(again, result);
    assert_eq!(s3.executions(), 1);
}

#[tokio::test]
async fn test_failure_after_resume_unwinds_replayed_steps_too() {
    init_test_logging();
    let log = CallLog::default();
    let journal = Arc::new(InMemoryWorkflowJournal::new());
    let workflow_id = Uuid::new_v4();

    journal
        .record_step(
            workflow_id,
            JournalEntry {
                step: "reserve".to_string(),
                step_number: 1,
                output: StepOutput::new(json!({})),
                attempts: 2,
                compensation: Some(CompensationEntry {
                    action: "undo".to_string(),
                    resource_id: Some("hold-1".to_string()),
                    step: "reserve".to_string(),
                    step_number: 1,
                }),
                recorded_at: Utc::now(),
            },
        )
        .await
        .unwrap();

    let workflow = WorkflowBuilder::new("resume_then_fail")
        .compensation("undo", RecordingCompensator::new(&log))
        .journal(Arc::clone(&journal) as Arc<dyn WorkflowJournal>)
        .retry_policies(quick_policy(1), quick_policy(1))
        .step(Arc::new(RecordingStep::ok("reserve", &log)))
        .step(Arc::new(RecordingStep::ok("label", &log)))
        .step(Arc::new(RecordingStep::failing(
            "ship",
            ActivityError::validation("ship", "address rejected"),
            &log,
        )))
        .build()
        .unwrap();

    let err = workflow.resume(workflow_id, tx("tx-rf")).await.unwrap_err();

    assert_eq!(err.status, WorkflowStatus::Aborted);
    assert_eq!(log.with_prefix("undo:"), vec!["label", "reserve"]);
    assert!(!log.entries().contains(&"exec:reserve#1".to_string()));
}

#[tokio::test]
async fn test_standard_pipeline_persists_and_raises_attention() {
    init_test_logging();
    let registry = registry_of(&[
        ("risk", json!({"score": 0.91, "high_risk": true})),
        ("coding", json!({"codes": ["99213"]})),
    ]);
    let sink = MemorySink::new();
    let attention = RecordingAttention::new();

    let workflow = WorkflowBuilder::new("claims_review")
        .validation()
        .stage_step(StageStep::new("risk", Arc::clone(&registry)).with_attention_field("high_risk"))
        .stage_step(StageStep::new("coding", Arc::clone(&registry)).with_attention_field("high_risk"))
        .persist(sink.clone())
        .attention_handler(attention.clone())
        .build()
        .unwrap();

    let result = workflow.run(tx("tx-s")).await.unwrap();

    assert_eq!(
        result.steps.iter().map(|s| s.step.as_str()).collect::<Vec<_>>(),
        vec!["validate_transaction", "risk", "coding", PersistStep::NAME]
    );
    assert_eq!(result.attention_raised, vec!["risk".to_string()]);
    assert_eq!(attention.raised.lock().len(), 1);

    let record_id = result.output_of(PersistStep::NAME).unwrap()["record_id"]
        .as_str()
        .unwrap()
        .to_string();
    let records = sink.records.lock();
    let bundle = &records[&record_id];
    assert_eq!(bundle["transaction_id"], "tx-s");
    assert_eq!(bundle["outputs"]["coding"]["codes"][0], "99213");

    assert_eq!(registry.health("risk").unwrap().total_calls, 1);
}

#[tokio::test]
async fn test_attention_failure_is_not_fatal() {
    init_test_logging();
    let registry = registry_of(&[("risk", json!({"high_risk": "yes"}))]);

    let workflow = WorkflowBuilder::new("noisy")
        .stage_step(StageStep::new("risk", Arc::clone(&registry)).with_attention_field("high_risk"))
        .attention_handler(RecordingAttention::failing())
        .build()
        .unwrap();

    let result = workflow.run(tx("tx-n")).await.unwrap();
    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.attention_raised, vec!["risk".to_string()]);
}

#[tokio::test]
async fn test_invalid_transaction_aborts_before_any_stage() {
    init_test_logging();
    let registry = registry_of(&[("risk", json!({}))]);
    let sink = MemorySink::new();

    let workflow = WorkflowBuilder::new("claims_review")
        .validation()
        .stage_step(StageStep::new("risk", Arc::clone(&registry)))
        .persist(sink.clone())
        .build()
        .unwrap();

    let err = workflow.run(Transaction::new("tx-empty")).await.unwrap_err();

    assert_eq!(err.status, WorkflowStatus::Aborted);
    assert_eq!(err.kind, ErrorKind::Validation);
    assert_eq!(err.step_number, 1);
    assert_eq!(registry.health("risk").unwrap().total_calls, 0);
    assert!(sink.records.lock().is_empty());
}

#[tokio::test]
async fn test_flagged_stage_output_aborts_workflow() {
    init_test_logging();
    let registry = registry_of(&[
        ("screen", json!({"injection_detected": true})),
        ("coding", json!({})),
    ]);
    let sink = MemorySink::new();

    let workflow = WorkflowBuilder::new("guarded")
        .validation()
        .stage_step(
            StageStep::new("screen", Arc::clone(&registry))
                .with_security_flag_field("injection_detected"),
        )
        .stage_step(StageStep::new("coding", Arc::clone(&registry)))
        .persist(sink.clone())
        .build()
        .unwrap();

    let err = workflow.run(tx("tx-i")).await.unwrap_err();

    assert_eq!(err.status, WorkflowStatus::Aborted);
    assert_eq!(err.kind, ErrorKind::SecurityThreat);
    assert_eq!(err.failed_step, "screen");
    assert_eq!(registry.health("coding").unwrap().total_calls, 0);
    assert!(sink.records.lock().is_empty());
}

#[tokio::test]
async fn test_persist_is_undone_when_a_later_step_fails() {
    init_test_logging();
    let log = CallLog::default();
    let sink = MemorySink::new();

    let workflow = WorkflowBuilder::new("persist_then_notify")
        .retry_policies(quick_policy(1), quick_policy(1))
        .persist(sink.clone())
        .step(Arc::new(
            RecordingStep::failing("notify", ActivityError::validation("notify", "no recipient"), &log)
                .without_compensation(),
        ))
        .build()
        .unwrap();

    let err = workflow.run(tx("tx-pn")).await.unwrap_err();

    assert_eq!(err.compensation.attempted, vec![REMOVE_RECORD.to_string()]);
    assert_eq!(*sink.removed.lock(), vec!["rec-1".to_string()]);
    assert!(sink.records.lock().is_empty());
}

#[tokio::test]
async fn test_open_breaker_fails_stage_step_as_unavailable() {
    init_test_logging();
    let registry = registry_of(&[("risk", json!({}))]);
    for _ in 0..3 {
        registry.record_error("risk", std::time::Duration::from_millis(1)).unwrap();
    }

    let workflow = WorkflowBuilder::new("gated")
        .stage_step(StageStep::new("risk", Arc::clone(&registry)))
        .build()
        .unwrap();

    let err = workflow.run(tx("tx-o")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Unavailable);
    assert_eq!(err.status, WorkflowStatus::Failed);
    assert_eq!(err.attempts, 1);
}

#[test]
fn test_builder_rejects_inconsistent_workflows() {
    let log = CallLog::default();

    let missing_handler = WorkflowBuilder::new("no_undo")
        .step(Arc::new(RecordingStep::ok("s1", &log)))
        .build();
    assert!(matches!(missing_handler, Err(AgentflowError::InvalidWorkflow(_))));

    let duplicate = WorkflowBuilder::new("dupes")
        .step(Arc::new(RecordingStep::ok("s1", &log).without_compensation()))
        .step(Arc::new(RecordingStep::ok("s1", &log).without_compensation()))
        .build();
    assert!(matches!(duplicate, Err(AgentflowError::InvalidWorkflow(_))));

    assert!(matches!(
        WorkflowBuilder::new("empty").build(),
        Err(AgentflowError::InvalidWorkflow(_))
    ));
}

/// Journal that refuses every write; reads and claims still work
#[derive(Default)]
struct UnwritableJournal {
    inner: InMemoryWorkflowJournal,
    refused_writes: AtomicUsize,
}

impl UnwritableJournal {
    fn refuse(&self) -> agentflow_core::error::Result<()> {
        self.refused_writes.fetch_add(1, Ordering::SeqCst);
        Err(AgentflowError::Journal("store offline".to_string()))
    }
}

#[async_trait]
impl WorkflowJournal for UnwritableJournal {
    async fn record_step(&self, _workflow_id: Uuid, _entry: JournalEntry) -> agentflow_core::error::Result<()> {
        self.refuse()
    }

    async fn completed_steps(&self, workflow_id: Uuid) -> agentflow_core::error::Result<Vec<JournalEntry>> {
        self.inner.completed_steps(workflow_id).await
    }

    async fn record_terminal(&self, _workflow_id: Uuid, _record: TerminalRecord) -> agentflow_core::error::Result<()> {
        self.refuse()
    }

    async fn terminal_status(&self, workflow_id: Uuid) -> agentflow_core::error::Result<Option<TerminalRecord>> {
        self.inner.terminal_status(workflow_id).await
    }

    async fn try_claim(&self, workflow_id: Uuid, owner: Uuid, lease: Duration) -> agentflow_core::error::Result<bool> {
        self.inner.try_claim(workflow_id, owner, lease).await
    }

    async fn release(&self, workflow_id: Uuid, owner: Uuid) -> agentflow_core::error::Result<()> {
        self.inner.release(workflow_id, owner).await
    }
}

#[tokio::test]
async fn test_unjournaled_step_stops_the_instance_and_is_undone() {
    init_test_logging();
    let log = CallLog::default();
    let journal = Arc::new(UnwritableJournal::default());
    let charge = Arc::new(RecordingStep::ok("charge", &log));
    let notify = Arc::new(RecordingStep::ok("notify", &log));

    let workflow = WorkflowBuilder::new("billing")
        .journal(Arc::clone(&journal) as Arc<dyn WorkflowJournal>)
        .compensation("undo", RecordingCompensator::new(&log))
        .retry_policies(quick_policy(2), quick_policy(2))
        .step(Arc::clone(&charge) as Arc<dyn WorkflowStep>)
        .step(Arc::clone(&notify) as Arc<dyn WorkflowStep>)
        .build()
        .unwrap();

    let id = Uuid::new_v4();
    let err = workflow.run_with_id(id, tx("tx-j")).await.unwrap_err();

    assert_eq!(err.failed_step, "charge");
    assert_eq!(err.step_number, 1);
    assert_eq!(err.kind, ErrorKind::Internal);
    assert_eq!(err.status, WorkflowStatus::Failed);
    assert!(err.message.contains("not journaled"));
    assert_eq!(notify.executions(), 0, "next step must not start");
    assert_eq!(log.with_prefix("undo:"), vec!["charge"]);
    // Step write and terminal write, each retried once
    assert_eq!(journal.refused_writes.load(Ordering::SeqCst), 4);

    // Nothing reached the journal, yet a re-drive reports the outcome
    // instead of charging again
    let again = workflow.resume(id, tx("tx-j")).await.unwrap_err();
    assert_eq!(again, err);
    assert_eq!(charge.executions(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_redrive_does_not_execute_twice() {
    init_test_logging();
    let stage = ScriptedStage::new("charge", Behavior::Sleep(Duration::from_millis(200)));
    let registry = registry_with(&[stage.clone()], 3);

    let workflow = WorkflowBuilder::new("billing")
        .retry_policies(quick_policy(1), quick_policy(1))
        .stage_step(StageStep::new("charge", Arc::clone(&registry)))
        .build()
        .unwrap();

    let id = Uuid::new_v4();
    let (first, second) = tokio::join!(
        workflow.run_with_id(id, tx("tx-c")),
        workflow.resume(id, tx("tx-c")),
    );

    let result = first.unwrap();
    assert_eq!(result.status, WorkflowStatus::Completed);
    let held = second.unwrap_err();
    assert!(held.is_in_progress());
    assert_eq!(held.status, WorkflowStatus::Running);
    assert_eq!(held.attempts, 0);
    assert_eq!(stage.calls(), 1);

    // Once the first driver is done the instance reports its outcome
    let after = workflow.resume(id, tx("tx-c")).await.unwrap();
    assert_eq!(after, result);
    assert_eq!(stage.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_step_timeout_set_after_stage_step_applies() {
    init_test_logging();
    let stage = ScriptedStage::new("risk", Behavior::Sleep(Duration::from_secs(10)));
    let registry = registry_with(&[stage.clone()], 3);

    let workflow = WorkflowBuilder::new("bounded")
        .stage_step(StageStep::new("risk", Arc::clone(&registry)))
        .retry_policies(quick_policy(1), quick_policy(1))
        .step_timeout(Duration::from_secs(1))
        .build()
        .unwrap();

    let err = workflow.run(tx("tx-t")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);
    assert_eq!(err.failed_step, "risk");
    // The stage's own timeout fired, so the outcome reached its breaker
    assert_eq!(registry.health("risk").unwrap().total_calls, 1);
}
