//! Live status of workflow instances for operator queries.

use crate::error::ErrorKind;
use crate::state_machine::WorkflowStatus;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Point-in-time view of one workflow instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstanceSnapshot {
    pub workflow_id: Uuid,
    pub transaction_id: String,
    pub status: WorkflowStatus,
    pub current_step: Option<String>,
    pub step_number: usize,
    pub pending_compensations: usize,
    pub failed_step: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct WorkflowTracker {
    instances: DashMap<Uuid, WorkflowInstanceSnapshot>,
    /// Terminal snapshots older than this are evicted when an instance finishes
    retention: Option<chrono::Duration>,
}

impl WorkflowTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            retention: chrono::Duration::from_std(retention).ok(),
            ..Self::default()
        }
    }

    /// Evict terminal snapshots last updated before `cutoff`. Active
    /// instances are never evicted.
    pub fn evict_terminal_before(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.instances.len();
        self.instances
            .retain(|_, snapshot| !snapshot.status.is_terminal() || snapshot.updated_at >= cutoff);
        before.saturating_sub(self.instances.len())
    }

    /// Start tracking an instance; an existing snapshot is reset to
    /// `Initializing` and keeps its start time
    pub fn start(&self, workflow_id: Uuid, transaction_id: &str) {
        let now = Utc::now();
        let started_at = self
            .instances
            .get(&workflow_id)
            .map(|s| s.started_at)
            .unwrap_or(now);

        self.instances.insert(
            workflow_id,
            WorkflowInstanceSnapshot {
                workflow_id,
                transaction_id: transaction_id.to_string(),
                status: WorkflowStatus::Initializing,
                current_step: None,
                step_number: 0,
                pending_compensations: 0,
                failed_step: None,
                error_kind: None,
                started_at,
                updated_at: now,
            },
        );
    }

    pub fn step_started(&self, workflow_id: Uuid, step: &str, step_number: usize, pending: usize) {
        self.update(workflow_id, |snapshot| {
            snapshot.status = WorkflowStatus::Running;
            snapshot.current_step = Some(step.to_string());
            snapshot.step_number = step_number;
            snapshot.pending_compensations = pending;
        });
    }

    pub fn pending_changed(&self, workflow_id: Uuid, pending: usize) {
        self.update(workflow_id, |snapshot| snapshot.pending_compensations = pending);
    }

    pub fn finished(&self, workflow_id: Uuid, status: WorkflowStatus, failure: Option<(&str, ErrorKind)>) {
        self.update(workflow_id, |snapshot| {
            snapshot.status = status;
            snapshot.pending_compensations = 0;
            if let Some((step, kind)) = failure {
                snapshot.failed_step = Some(step.to_string());
                snapshot.error_kind = Some(kind);
            }
        });

        if let Some(cutoff) = self.retention.and_then(|r| Utc::now().checked_sub_signed(r)) {
            self.evict_terminal_before(cutoff);
        }
    }

    fn update(&self, workflow_id: Uuid, apply: impl FnOnce(&mut WorkflowInstanceSnapshot)) {
        if let Some(mut snapshot) = self.instances.get_mut(&workflow_id) {
            apply(&mut snapshot);
            snapshot.updated_at = Utc::now();
        }
    }

    pub fn get(&self, workflow_id: Uuid) -> Option<WorkflowInstanceSnapshot> {
        self.instances.get(&workflow_id).map(|s| s.value().clone())
    }

    pub fn list(&self) -> Vec<WorkflowInstanceSnapshot> {
        let mut all: Vec<_> = self.instances.iter().map(|s| s.value().clone()).collect();
        all.sort_by_key(|s| s.started_at);
        all
    }

    pub fn active_count(&self) -> usize {
        self.instances
            .iter()
            .filter(|s| !s.status.is_terminal())
            .count()
    }
}
