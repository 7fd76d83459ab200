//! # Phased Orchestrator
//!
//! Runs the phase plan against one input. Each phase's eligible stages are
//! launched together on a [`JoinSet`] and joined before the next phase
//! starts. A failure inside a critical phase cancels the phase's remaining
//! calls and ends the run.
//!
//! The orchestrator never returns an error for stage-level failures; every
//! outcome lands in the [`OrchestrationRun`].

use super::phases::{PhaseDefinition, PhasePlan};
use super::types::{OrchestrationRequest, OrchestrationRun};
use crate::config::AgentflowConfig;
use crate::constants::{events, DEFAULT_STAGE_TIMEOUT};
use crate::error::{ActivityError, ErrorKind, Result};
use crate::execution::{run_with_retry, ActivityExecutor, RetryPolicy};
use crate::registry::StageRegistry;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

type StageCallResult = (String, std::result::Result<Value, ActivityError>, Duration);

/// Phased, partially parallel stage scheduler
#[derive(Debug, Clone)]
pub struct PhasedOrchestrator {
    registry: Arc<StageRegistry>,
    executor: ActivityExecutor,
    plan: Arc<PhasePlan>,
    default_timeout: Duration,
    /// Retries inside one run; one breaker outcome is recorded per stage
    retry_policy: RetryPolicy,
}

impl PhasedOrchestrator {
    pub fn new(registry: Arc<StageRegistry>, plan: PhasePlan) -> Self {
        Self {
            registry,
            executor: ActivityExecutor::default(),
            plan: Arc::new(plan),
            default_timeout: DEFAULT_STAGE_TIMEOUT,
            retry_policy: RetryPolicy::none(),
        }
    }

    pub fn from_config(config: &AgentflowConfig, registry: Arc<StageRegistry>) -> Result<Self> {
        let plan = PhasePlan::from_config(config, &registry)?;
        let retry_policy = config
            .retry
            .fast
            .to_policy()
            .with_maximum_attempts(config.execution.orchestrator_attempts);

        Ok(Self::new(registry, plan)
            .with_executor(ActivityExecutor::new(config.execution.max_stage_timeout()))
            .with_default_timeout(config.execution.stage_timeout())
            .with_retry_policy(retry_policy))
    }

    pub fn with_executor(mut self, executor: ActivityExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn plan(&self) -> &PhasePlan {
        &self.plan
    }

    pub fn registry(&self) -> &Arc<StageRegistry> {
        &self.registry
    }

    /// Run every phase in order against `input` with no stage filters
    pub async fn process_input(&self, input: Value) -> OrchestrationRun {
        self.process(OrchestrationRequest::new(input)).await
    }

    #[instrument(skip(self, request), fields(phases = self.plan.len()))]
    pub async fn process(&self, request: OrchestrationRequest) -> OrchestrationRun {
        let mut run = OrchestrationRun::start(request.input.clone());
        info!(
            run_id = %run.id,
            event = events::ORCHESTRATION_STARTED,
            "🚀 Orchestration run started"
        );

        for phase in self.plan.phases() {
            let effective = self.effective_stages(phase, &request, &mut run);
            if effective.is_empty() {
                debug!(run_id = %run.id, phase = %phase.name, "Phase has no eligible stages");
                continue;
            }

            run.phases_executed += 1;
            let aborted = self.execute_phase(phase, effective, &mut run).await;
            if aborted {
                break;
            }
        }

        run.finish();
        info!(
            run_id = %run.id,
            status = %run.status,
            agents_called = run.agents_called,
            agents_succeeded = run.agents_succeeded,
            agents_failed = run.agents_failed,
            skipped = run.skipped.len(),
            phases_executed = run.phases_executed,
            duration_ms = run.duration_ms,
            event = events::ORCHESTRATION_COMPLETED,
            "🏁 Orchestration run finished"
        );
        run
    }

    /// Members admitted by the request filters, minus open-breaker stages,
    /// which are recorded as skipped
    fn effective_stages(
        &self,
        phase: &PhaseDefinition,
        request: &OrchestrationRequest,
        run: &mut OrchestrationRun,
    ) -> Vec<String> {
        let mut effective = Vec::with_capacity(phase.stages.len());
        for stage in phase.stages.iter().filter(|s| request.admits(s)) {
            if self.registry.is_open(stage) {
                warn!(
                    run_id = %run.id,
                    phase = %phase.name,
                    stage = %stage,
                    kind = %ErrorKind::Unavailable,
                    event = events::STAGE_SKIPPED,
                    "⏭️ Stage skipped, circuit open"
                );
                run.skipped.push(stage.clone());
            } else {
                effective.push(stage.clone());
            }
        }
        effective
    }

    /// Launch one phase and join it. Returns `true` when the run must stop.
    async fn execute_phase(
        &self,
        phase: &PhaseDefinition,
        stages: Vec<String>,
        run: &mut OrchestrationRun,
    ) -> bool {
        info!(
            run_id = %run.id,
            phase = %phase.name,
            critical = phase.critical,
            stages = stages.len(),
            event = events::PHASE_STARTED,
            "▶️ Phase started"
        );

        let mut join_set: JoinSet<StageCallResult> = JoinSet::new();
        let mut pending: HashSet<String> = HashSet::with_capacity(stages.len());

        // Inputs are projected before any call of this phase starts, so
        // siblings never see each other's results.
        for stage in stages {
            let (handler, descriptor) = match (self.registry.handler(&stage), self.registry.get(&stage)) {
                (Ok(handler), Ok(descriptor)) => (handler, descriptor),
                (Err(e), _) | (_, Err(e)) => {
                    run.record_failure(
                        stage.clone(),
                        ActivityError::internal(&stage, e.to_string()),
                    );
                    continue;
                }
            };

            let input = handler.project_input(&descriptor, &run.input, &run.results);
            let timeout = self.registry.timeout_for(&stage, self.default_timeout);
            let executor = self.executor.clone();
            let policy = self.retry_policy.clone();

            pending.insert(stage.clone());
            join_set.spawn(async move {
                let started = Instant::now();
                let outcome = run_with_retry(&executor, &policy, &stage, timeout, |_| {
                    let handler = Arc::clone(&handler);
                    let input = input.clone();
                    async move { handler.process(input).await }
                })
                .await;
                (stage, outcome.result, started.elapsed())
            });
        }

        let mut critical_failures = Vec::new();

        while let Some(joined) = join_set.join_next().await {
            let Ok((stage, result, latency)) = joined else {
                continue;
            };
            // Once the phase is aborting, siblings that still report are
            // cancelled: their outcome never reaches the breaker or counters
            if !critical_failures.is_empty() {
                continue;
            }
            pending.remove(&stage);
            self.record(&stage, result, latency, run, &phase.name, &mut critical_failures, phase.critical);

            if !critical_failures.is_empty() {
                join_set.abort_all();
            }
        }

        // Anything still pending was cancelled or lost before reporting
        let cancelled = !critical_failures.is_empty();
        for stage in pending {
            let error = if cancelled {
                ActivityError::cancelled(&stage)
            } else {
                ActivityError::internal(&stage, "stage task ended without reporting")
            };
            debug!(run_id = %run.id, stage = %stage, kind = %error.kind, "Stage did not report");
            run.record_failure(stage, error);
        }

        if cancelled {
            let reason = ActivityError::new(
                &phase.name,
                ErrorKind::CriticalStageFailure,
                format!("critical stage failure: {}", critical_failures.join(", ")),
            );
            error!(
                run_id = %run.id,
                phase = %phase.name,
                failed_stages = ?critical_failures,
                event = events::PHASE_ABORTED,
                "🛑 Critical phase failed, aborting run"
            );
            run.aborted_phase = Some(phase.name.clone());
            run.abort_reason = Some(reason);
        }

        cancelled
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        stage: &str,
        result: std::result::Result<Value, ActivityError>,
        latency: Duration,
        run: &mut OrchestrationRun,
        phase: &str,
        critical_failures: &mut Vec<String>,
        critical: bool,
    ) {
        let success = result.is_ok();
        if let Err(e) = self.registry.record_outcome(stage, success, latency) {
            warn!(stage = %stage, error = %e, "Failed to record stage outcome");
        }

        match result {
            Ok(output) => {
                debug!(
                    run_id = %run.id,
                    phase = %phase,
                    stage = %stage,
                    latency_ms = latency.as_millis() as u64,
                    event = events::STAGE_SUCCEEDED,
                    "✅ Stage succeeded"
                );
                run.record_success(stage.to_string(), output);
            }
            Err(error) => {
                warn!(
                    run_id = %run.id,
                    phase = %phase,
                    stage = %stage,
                    kind = %error.kind,
                    error = %error.message,
                    event = events::STAGE_FAILED,
                    "❌ Stage failed"
                );
                run.record_failure(stage.to_string(), error);
                if critical {
                    critical_failures.push(stage.to_string());
                }
            }
        }
    }
}
