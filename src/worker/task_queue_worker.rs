//! # Task Queue Worker
//!
//! Pulls execution requests off the task queue and drives the orchestrator
//! or the durable workflow. A message is acked only after its outcome has
//! been recorded; work lost mid-flight is redelivered after the visibility
//! timeout and re-driven through the workflow journal.
//!
//! A workflow message whose instance is already being driven elsewhere is
//! left unacked and comes back after the visibility timeout, by which time
//! the other driver has usually recorded the terminal outcome. On shutdown,
//! messages claimed but not yet started are handed back to the queue.

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::messaging::{QueuedMessage, TaskQueue, TaskQueueMessage};
use crate::orchestration::{OrchestrationRun, PhasedOrchestrator};
use crate::workflow::{DurableWorkflow, WorkflowOutcome};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Recorded result of one processed message
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessedOutcome {
    Workflow(Box<WorkflowOutcome>),
    Orchestration(Box<OrchestrationRun>),
    /// No component configured for the message kind
    Rejected(String),
}

impl ProcessedOutcome {
    fn is_in_progress(&self) -> bool {
        match self {
            Self::Workflow(outcome) => matches!(&**outcome, Err(e) if e.is_in_progress()),
            _ => false,
        }
    }
}

/// Worker counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub received: u64,
    pub processed: u64,
    /// Left for redelivery because another driver held the instance
    pub deferred: u64,
    /// Handed back to the queue unprocessed at shutdown
    pub released: u64,
    pub ack_failures: u64,
}

/// Outcomes by correlation id, bounded; the oldest are evicted first
#[derive(Debug)]
struct OutcomeStore {
    outcomes: DashMap<Uuid, ProcessedOutcome>,
    order: Mutex<VecDeque<Uuid>>,
    capacity: usize,
}

impl OutcomeStore {
    fn new(capacity: usize) -> Self {
        Self {
            outcomes: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    fn insert(&self, id: Uuid, outcome: ProcessedOutcome) {
        let mut order = self.order.lock();
        if self.outcomes.insert(id, outcome).is_none() {
            order.push_back(id);
        }
        while order.len() > self.capacity {
            if let Some(evicted) = order.pop_front() {
                self.outcomes.remove(&evicted);
            }
        }
    }

    fn get(&self, id: Uuid) -> Option<ProcessedOutcome> {
        self.outcomes.get(&id).map(|o| o.value().clone())
    }

    fn len(&self) -> usize {
        self.outcomes.len()
    }
}

pub struct TaskQueueWorker {
    queue: Arc<dyn TaskQueue>,
    config: WorkerConfig,
    orchestrator: Option<Arc<PhasedOrchestrator>>,
    workflow: Option<Arc<DurableWorkflow>>,
    outcomes: Arc<OutcomeStore>,
    semaphore: Arc<Semaphore>,
    /// Set once shutdown is requested; unstarted messages are released
    stopping: AtomicBool,
    received: AtomicU64,
    processed: Arc<AtomicU64>,
    deferred: Arc<AtomicU64>,
    released: AtomicU64,
    ack_failures: Arc<AtomicU64>,
}

impl std::fmt::Debug for TaskQueueWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueueWorker")
            .field("config", &self.config)
            .field("has_orchestrator", &self.orchestrator.is_some())
            .field("has_workflow", &self.workflow.is_some())
            .field("stats", &self.stats())
            .finish()
    }
}

impl TaskQueueWorker {
    pub fn new(queue: Arc<dyn TaskQueue>, config: WorkerConfig) -> Self {
        let permits = config.max_concurrent.max(1);
        let max_recorded_outcomes = config.max_recorded_outcomes;
        Self {
            queue,
            config,
            orchestrator: None,
            workflow: None,
            outcomes: Arc::new(OutcomeStore::new(max_recorded_outcomes)),
            semaphore: Arc::new(Semaphore::new(permits)),
            stopping: AtomicBool::new(false),
            received: AtomicU64::new(0),
            processed: Arc::new(AtomicU64::new(0)),
            deferred: Arc::new(AtomicU64::new(0)),
            released: AtomicU64::new(0),
            ack_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_orchestrator(mut self, orchestrator: Arc<PhasedOrchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub fn with_workflow(mut self, workflow: Arc<DurableWorkflow>) -> Self {
        self.workflow = Some(workflow);
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.config.queue_name
    }

    /// Outcome recorded for a workflow id or orchestration request id.
    /// Only the most recent `max_recorded_outcomes` are kept.
    pub fn outcome(&self, id: Uuid) -> Option<ProcessedOutcome> {
        self.outcomes.get(id)
    }

    pub fn recorded_outcomes(&self) -> usize {
        self.outcomes.len()
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            received: self.received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
        }
    }

    /// Poll until `shutdown` fires. Messages already running finish before
    /// return; claimed messages not yet started are released to the queue.
    pub async fn run(&self, mut shutdown: oneshot::Receiver<()>) -> Result<()> {
        info!(
            queue = %self.config.queue_name,
            max_concurrent = self.config.max_concurrent,
            "🚀 Task queue worker started"
        );
        self.stopping.store(false, Ordering::SeqCst);

        loop {
            let batch = self.process_batch();
            tokio::pin!(batch);

            let mut stop = false;
            let handled = tokio::select! {
                handled = &mut batch => handled,
                _ = &mut shutdown => {
                    info!(queue = %self.config.queue_name, "Shutdown requested, draining in-flight messages");
                    self.stopping.store(true, Ordering::SeqCst);
                    stop = true;
                    batch.await
                }
            };
            if stop {
                if let Err(e) = handled {
                    error!(queue = %self.config.queue_name, error = %e, "❌ Batch failed during shutdown");
                }
                break;
            }

            match handled {
                Ok(0) => {
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(self.config.poll_interval()) => {}
                    }
                }
                Ok(count) => debug!(count = count, "Batch processed"),
                Err(e) => {
                    error!(queue = %self.config.queue_name, error = %e, "❌ Failed to receive batch");
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(self.config.poll_interval()) => {}
                    }
                }
            }
        }

        info!(queue = %self.config.queue_name, "🛑 Task queue worker stopped");
        Ok(())
    }

    /// Claim one batch and process it to completion. Returns the number of
    /// messages claimed.
    ///
    /// Once shutdown is requested the messages still waiting for a permit
    /// are nacked so another worker can take them at once.
    #[instrument(skip(self), fields(queue = %self.config.queue_name))]
    pub async fn process_batch(&self) -> Result<usize> {
        let messages = self
            .queue
            .receive(
                &self.config.queue_name,
                self.config.batch_size,
                self.config.visibility_timeout(),
            )
            .await?;

        let count = messages.len();
        self.received.fetch_add(count as u64, Ordering::Relaxed);

        let mut tasks = JoinSet::new();
        let mut messages = messages.into_iter();
        while let Some(queued) = messages.next() {
            let permit = Arc::clone(&self.semaphore)
                .acquire_owned()
                .await
                .map_err(|e| crate::error::AgentflowError::Queue(e.to_string()))?;

            if self.stopping.load(Ordering::SeqCst) {
                drop(permit);
                self.release(std::iter::once(queued).chain(messages.by_ref()))
                    .await;
                break;
            }

            let queue = Arc::clone(&self.queue);
            let queue_name = self.config.queue_name.clone();
            let orchestrator = self.orchestrator.clone();
            let workflow = self.workflow.clone();
            let outcomes = Arc::clone(&self.outcomes);
            let processed = Arc::clone(&self.processed);
            let deferred = Arc::clone(&self.deferred);
            let ack_failures = Arc::clone(&self.ack_failures);

            tasks.spawn(async move {
                let _permit = permit;
                let msg_id = queued.msg_id;
                let (id, outcome) = handle_message(queued, orchestrator, workflow).await;

                if outcome.is_in_progress() {
                    deferred.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        msg_id = msg_id,
                        workflow_id = %id,
                        "Instance held by another driver, leaving message for redelivery"
                    );
                    return;
                }

                outcomes.insert(id, outcome);
                processed.fetch_add(1, Ordering::Relaxed);

                if let Err(e) = queue.ack(&queue_name, msg_id).await {
                    ack_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(msg_id = msg_id, error = %e, "Ack failed, message will be redelivered");
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Message task ended abnormally");
            }
        }

        Ok(count)
    }

    /// Hand unstarted messages back to the queue
    async fn release(&self, messages: impl Iterator<Item = QueuedMessage>) {
        for queued in messages {
            match self.queue.nack(&self.config.queue_name, queued.msg_id).await {
                Ok(()) => {
                    self.released.fetch_add(1, Ordering::Relaxed);
                    debug!(msg_id = queued.msg_id, "Released unstarted message");
                }
                Err(e) => warn!(
                    msg_id = queued.msg_id,
                    error = %e,
                    "Release failed, message returns after its visibility timeout"
                ),
            }
        }
    }
}

async fn handle_message(
    queued: QueuedMessage,
    orchestrator: Option<Arc<PhasedOrchestrator>>,
    workflow: Option<Arc<DurableWorkflow>>,
) -> (Uuid, ProcessedOutcome) {
    let id = queued.message.correlation_id();
    if queued.read_count > 1 {
        info!(
            msg_id = queued.msg_id,
            correlation_id = %id,
            read_count = queued.read_count,
            "🔁 Redelivered message, re-driving"
        );
    }

    let outcome = match (queued.message, orchestrator, workflow) {
        (TaskQueueMessage::ExecuteWorkflow { workflow_id, transaction }, _, Some(workflow)) => {
            ProcessedOutcome::Workflow(Box::new(workflow.resume(workflow_id, transaction).await))
        }
        (TaskQueueMessage::ExecuteOrchestration { request, .. }, Some(orchestrator), _) => {
            ProcessedOutcome::Orchestration(Box::new(orchestrator.process(request).await))
        }
        (message, _, _) => {
            let reason = format!("no handler configured for {}", message.kind());
            warn!(correlation_id = %id, reason = %reason, "Rejecting message");
            ProcessedOutcome::Rejected(reason)
        }
    };

    (id, outcome)
}
