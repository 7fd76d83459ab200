//! # Engine Bootstrap
//!
//! Wires the registry, orchestrator, workflow journal, tracker and queue
//! worker together from one [`AgentflowConfig`].

use crate::config::{AgentflowConfig, ConfigManager};
use crate::error::{AgentflowError, Result};
use crate::messaging::{InMemoryTaskQueue, TaskQueue};
use crate::operator::OperatorConsole;
use crate::orchestration::PhasedOrchestrator;
use crate::registry::{StageHandler, StageRegistry};
use crate::worker::TaskQueueWorker;
use crate::workflow::{
    DurableWorkflow, InMemoryWorkflowJournal, WorkflowBuilder, WorkflowJournal, WorkflowTracker,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Shared engine components
pub struct AgentflowCore {
    config: Arc<AgentflowConfig>,
    registry: Arc<StageRegistry>,
    orchestrator: Arc<PhasedOrchestrator>,
    journal: Arc<dyn WorkflowJournal>,
    tracker: Arc<WorkflowTracker>,
    queue: Arc<dyn TaskQueue>,
}

impl std::fmt::Debug for AgentflowCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentflowCore")
            .field("stages", &self.registry.stage_ids())
            .field("phases", &self.orchestrator.plan().len())
            .finish()
    }
}

impl AgentflowCore {
    /// Validate `config` and build every component with in-memory journal
    /// and queue. The journal purges terminal instances after
    /// `workflow.journal_retention_seconds`.
    pub fn new(
        config: AgentflowConfig,
        handlers: HashMap<String, Arc<dyn StageHandler>>,
    ) -> Result<Self> {
        let journal = InMemoryWorkflowJournal::with_retention(config.workflow.journal_retention());
        Self::with_backends(
            config,
            handlers,
            Arc::new(journal),
            Arc::new(InMemoryTaskQueue::new()),
        )
    }

    pub fn from_config_manager(
        manager: &ConfigManager,
        handlers: HashMap<String, Arc<dyn StageHandler>>,
    ) -> Result<Self> {
        info!(environment = %manager.environment(), "🔧 BOOTSTRAP: Loading engine from configuration");
        Self::new(manager.config().clone(), handlers)
    }

    pub fn with_backends(
        config: AgentflowConfig,
        handlers: HashMap<String, Arc<dyn StageHandler>>,
        journal: Arc<dyn WorkflowJournal>,
        queue: Arc<dyn TaskQueue>,
    ) -> Result<Self> {
        config.validate().map_err(AgentflowError::from)?;

        let registry = Arc::new(StageRegistry::from_config(&config, handlers)?);
        let orchestrator = Arc::new(PhasedOrchestrator::from_config(&config, Arc::clone(&registry))?);

        info!(
            stages = registry.len(),
            phases = orchestrator.plan().len(),
            "✅ BOOTSTRAP: Engine components ready"
        );

        let tracker = Arc::new(WorkflowTracker::with_retention(config.workflow.tracker_retention()));

        Ok(Self {
            config: Arc::new(config),
            registry,
            orchestrator,
            journal,
            tracker,
            queue,
        })
    }

    pub fn config(&self) -> &AgentflowConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<StageRegistry> {
        &self.registry
    }

    pub fn orchestrator(&self) -> &Arc<PhasedOrchestrator> {
        &self.orchestrator
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    pub fn tracker(&self) -> &Arc<WorkflowTracker> {
        &self.tracker
    }

    /// Workflow builder sharing this engine's journal, tracker and
    /// configured retry classes
    pub fn workflow_builder(&self, name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::from_config(name, &self.config)
            .journal(Arc::clone(&self.journal))
            .tracker(Arc::clone(&self.tracker))
    }

    pub fn operator_console(&self) -> OperatorConsole {
        OperatorConsole::new(Arc::clone(&self.registry), Arc::clone(&self.tracker))
    }

    pub fn worker(&self, workflow: Option<Arc<DurableWorkflow>>) -> TaskQueueWorker {
        let worker = TaskQueueWorker::new(Arc::clone(&self.queue), self.config.worker.clone())
            .with_orchestrator(Arc::clone(&self.orchestrator));
        match workflow {
            Some(workflow) => worker.with_workflow(workflow),
            None => worker,
        }
    }

    /// Spawn a worker loop; the returned handle stops it
    pub fn start_worker(&self, workflow: Option<Arc<DurableWorkflow>>) -> WorkerHandle {
        let worker = Arc::new(self.worker(workflow));
        let (shutdown_sender, shutdown_receiver) = oneshot::channel();
        let task = tokio::spawn({
            let worker = Arc::clone(&worker);
            async move { worker.run(shutdown_receiver).await }
        });

        WorkerHandle {
            worker,
            shutdown_sender: Some(shutdown_sender),
            task: Some(task),
        }
    }
}

/// Lifecycle handle for a spawned worker
pub struct WorkerHandle {
    pub worker: Arc<TaskQueueWorker>,
    shutdown_sender: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<()>>>,
}

impl WorkerHandle {
    pub fn is_running(&self) -> bool {
        self.shutdown_sender.is_some()
    }

    /// Signal shutdown and wait for in-flight messages
    pub async fn stop(&mut self) -> Result<()> {
        match self.shutdown_sender.take() {
            Some(sender) => {
                if sender.send(()).is_err() {
                    warn!("Worker already exited before shutdown signal");
                }
                info!("🛑 Worker shutdown requested");
            }
            None => {
                warn!("Worker already stopped");
                return Ok(());
            }
        }

        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| AgentflowError::Queue(format!("worker task failed: {e}")))?,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageConfig;
    use crate::orchestration::PhaseDefinition;

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = AgentflowConfig {
            phases: vec![PhaseDefinition::critical("screen", ["ghost"])],
            ..Default::default()
        };
        assert!(matches!(
            AgentflowCore::new(config, HashMap::new()),
            Err(AgentflowError::Configuration(_))
        ));
    }

    #[test]
    fn test_missing_handler_is_rejected() {
        let config = AgentflowConfig {
            stages: vec![StageConfig {
                id: "intake".to_string(),
                capabilities: vec![],
                dependencies: vec![],
                timeout_ms: None,
                failure_threshold: None,
            }],
            ..Default::default()
        };
        assert!(matches!(
            AgentflowCore::new(config, HashMap::new()),
            Err(AgentflowError::UnknownStage(_))
        ));
    }
}
