//! Queue-driven execution through a fully bootstrapped engine.

mod common;

use agentflow_core::config::StageConfig;
use agentflow_core::worker::ProcessedOutcome;
use agentflow_core::workflow::{StageStep, WorkflowStep};
use agentflow_core::{
    AgentflowConfig, AgentflowCore, OrchestrationRequest, PhaseDefinition, RunStatus,
    StageHandler, TaskQueueMessage, Transaction, WorkflowStatus,
};
use common::{init_test_logging, quick_policy, CallLog, RecordingStep, ScriptedStage};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn stage_config(id: &str) -> StageConfig {
    StageConfig {
        id: id.to_string(),
        capabilities: vec![],
        dependencies: vec![],
        timeout_ms: None,
        failure_threshold: None,
    }
}

struct Engine {
    core: AgentflowCore,
    intake: Arc<ScriptedStage>,
    risk: Arc<ScriptedStage>,
}

fn engine() -> Engine {
    let intake = ScriptedStage::ok("intake");
    let risk = ScriptedStage::ok("risk");

    let mut config = AgentflowConfig {
        stages: vec![stage_config("intake"), stage_config("risk")],
        phases: vec![
            PhaseDefinition::critical("screen", ["intake"]),
            PhaseDefinition::non_critical("analyze", ["risk"]),
        ],
        ..Default::default()
    };
    config.worker.poll_interval_ms = 10;

    let handlers: HashMap<String, Arc<dyn StageHandler>> = HashMap::from([
        ("intake".to_string(), Arc::clone(&intake) as Arc<dyn StageHandler>),
        ("risk".to_string(), Arc::clone(&risk) as Arc<dyn StageHandler>),
    ]);

    Engine {
        core: AgentflowCore::new(config, handlers).unwrap(),
        intake,
        risk,
    }
}

fn tx(id: &str) -> Transaction {
    Transaction::new(id).with_field("note", "annual physical")
}

#[tokio::test]
async fn test_worker_runs_orchestration_messages() {
    init_test_logging();
    let engine = engine();
    let worker = engine.core.worker(None);

    let message = TaskQueueMessage::orchestration(OrchestrationRequest::new(json!({"id": "tx-1"})));
    engine.core.queue().send(worker.queue_name(), &message).await.unwrap();

    assert_eq!(worker.process_batch().await.unwrap(), 1);

    match worker.outcome(message.correlation_id()) {
        Some(ProcessedOutcome::Orchestration(run)) => {
            assert_eq!(run.status, RunStatus::Completed);
            assert_eq!(run.agents_called, 2);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(engine.core.queue().len(worker.queue_name()).await.unwrap(), 0);
    assert_eq!(engine.intake.calls(), 1);
    assert_eq!(engine.risk.calls(), 1);
}

#[tokio::test]
async fn test_worker_drives_workflows_and_tracks_status() {
    init_test_logging();
    let engine = engine();
    let workflow = Arc::new(
        engine
            .core
            .workflow_builder("claims_review")
            .retry_policies(quick_policy(2), quick_policy(2))
            .validation()
            .stage_step(StageStep::new("risk", Arc::clone(engine.core.registry())))
            .build()
            .unwrap(),
    );
    let worker = engine.core.worker(Some(workflow));

    let message = TaskQueueMessage::workflow(tx("tx-2"));
    engine.core.queue().send(worker.queue_name(), &message).await.unwrap();
    worker.process_batch().await.unwrap();

    match worker.outcome(message.correlation_id()) {
        Some(ProcessedOutcome::Workflow(outcome)) => {
            let result = (*outcome).unwrap();
            assert_eq!(result.status, WorkflowStatus::Completed);
            assert_eq!(result.transaction_id, "tx-2");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    let console = engine.core.operator_console();
    let snapshot = console.workflow_status(message.correlation_id()).unwrap();
    assert_eq!(snapshot.status, WorkflowStatus::Completed);
    assert!(console.active_workflows().is_empty());
    assert_eq!(console.stage_health("risk").unwrap().total_calls, 1);
}

#[tokio::test]
async fn test_unacked_message_is_redelivered_after_visibility_timeout() {
    init_test_logging();
    let engine = engine();
    let worker = engine.core.worker(None);
    let queue = engine.core.queue();

    let message = TaskQueueMessage::orchestration(OrchestrationRequest::new(json!({"id": "tx-3"})));
    queue.send(worker.queue_name(), &message).await.unwrap();

    // A consumer claims the message and dies without acking
    let claimed = queue
        .receive(worker.queue_name(), 10, Duration::from_millis(30))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(worker.process_batch().await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(60)).await;

    assert_eq!(worker.process_batch().await.unwrap(), 1);
    assert!(matches!(
        worker.outcome(message.correlation_id()),
        Some(ProcessedOutcome::Orchestration(_))
    ));
    assert_eq!(queue.len(worker.queue_name()).await.unwrap(), 0);
    assert_eq!(worker.stats().received, 1);
}

#[tokio::test]
async fn test_duplicate_delivery_does_not_re_execute_workflow() {
    init_test_logging();
    let engine = engine();
    let log = CallLog::default();
    let side_effect = Arc::new(RecordingStep::ok("charge_card", &log).without_compensation());

    let workflow = Arc::new(
        engine
            .core
            .workflow_builder("billing")
            .retry_policies(quick_policy(1), quick_policy(1))
            .step(Arc::clone(&side_effect) as Arc<dyn WorkflowStep>)
            .build()
            .unwrap(),
    );
    let worker = engine.core.worker(Some(workflow));

    let message = TaskQueueMessage::workflow(tx("tx-4"));
    for _ in 0..2 {
        engine.core.queue().send(worker.queue_name(), &message).await.unwrap();
        worker.process_batch().await.unwrap();
    }

    assert_eq!(side_effect.executions(), 1);
    assert!(matches!(
        worker.outcome(message.correlation_id()),
        Some(ProcessedOutcome::Workflow(outcome)) if outcome.is_ok()
    ));
    assert_eq!(worker.stats().processed, 2);
}

#[tokio::test]
async fn test_workflow_message_without_workflow_is_rejected() {
    init_test_logging();
    let engine = engine();
    let worker = engine.core.worker(None);

    let message = TaskQueueMessage::workflow(tx("tx-5"));
    engine.core.queue().send(worker.queue_name(), &message).await.unwrap();
    worker.process_batch().await.unwrap();

    assert!(matches!(
        worker.outcome(message.correlation_id()),
        Some(ProcessedOutcome::Rejected(reason)) if reason.contains("execute_workflow")
    ));
}

#[tokio::test]
async fn test_spawned_worker_processes_until_stopped() {
    init_test_logging();
    let engine = engine();
    let mut handle = engine.core.start_worker(None);
    assert!(handle.is_running());

    let message = TaskQueueMessage::orchestration(OrchestrationRequest::new(json!({"id": "tx-6"})));
    engine.core.queue().send(handle.worker.queue_name(), &message).await.unwrap();

    let mut outcome = None;
    for _ in 0..200 {
        outcome = handle.worker.outcome(message.correlation_id());
        if outcome.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(matches!(outcome, Some(ProcessedOutcome::Orchestration(_))));

    handle.stop().await.unwrap();
    assert!(!handle.is_running());
}
