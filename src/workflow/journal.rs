//! # Workflow Journal
//!
//! Durable record of completed steps and terminal outcomes. Re-driving an
//! instance replays journaled steps instead of executing them again, so a
//! side-effecting step runs at most once per instance.
//!
//! The journal also arbitrates ownership: a driver must hold an instance's
//! claim before executing any of its steps. Claims are leases, so a claim
//! left behind by a crashed driver expires instead of blocking the
//! instance forever.

use super::compensation::CompensationEntry;
use super::saga::WorkflowResult;
use super::step::StepOutput;
use crate::error::{Result, WorkflowError};
use crate::state_machine::WorkflowStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// A step that completed and committed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub step: String,
    pub step_number: usize,
    pub output: StepOutput,
    pub attempts: u32,
    pub compensation: Option<CompensationEntry>,
    pub recorded_at: DateTime<Utc>,
}

/// Final outcome of an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalRecord {
    pub status: WorkflowStatus,
    pub result: Option<WorkflowResult>,
    pub error: Option<WorkflowError>,
    pub recorded_at: DateTime<Utc>,
}

impl TerminalRecord {
    pub fn completed(result: WorkflowResult) -> Self {
        Self {
            status: WorkflowStatus::Completed,
            result: Some(result),
            error: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn failed(error: WorkflowError) -> Self {
        Self {
            status: error.status,
            result: None,
            error: Some(error),
            recorded_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait WorkflowJournal: Send + Sync {
    async fn record_step(&self, workflow_id: Uuid, entry: JournalEntry) -> Result<()>;

    /// Completed steps in step order
    async fn completed_steps(&self, workflow_id: Uuid) -> Result<Vec<JournalEntry>>;

    async fn record_terminal(&self, workflow_id: Uuid, record: TerminalRecord) -> Result<()>;

    async fn terminal_status(&self, workflow_id: Uuid) -> Result<Option<TerminalRecord>>;

    /// Take or renew the claim on an instance for `lease`. Returns `false`
    /// while another owner holds an unexpired claim.
    async fn try_claim(&self, workflow_id: Uuid, owner: Uuid, lease: Duration) -> Result<bool>;

    /// Drop a claim held by `owner`; other owners' claims are left alone
    async fn release(&self, workflow_id: Uuid, owner: Uuid) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct Claim {
    owner: Uuid,
    expires_at: DateTime<Utc>,
}

/// Process-local journal
#[derive(Debug, Default)]
pub struct InMemoryWorkflowJournal {
    steps: DashMap<Uuid, Vec<JournalEntry>>,
    terminals: DashMap<Uuid, TerminalRecord>,
    claims: DashMap<Uuid, Claim>,
    /// Terminal instances older than this are purged on the next terminal write
    retention: Option<chrono::Duration>,
}

impl InMemoryWorkflowJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Journal that purges terminal instances once they are older than
    /// `retention`. Keep it above the queue's redelivery window, or a late
    /// duplicate finds no terminal record and runs the instance again.
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            retention: chrono::Duration::from_std(retention).ok(),
            ..Self::default()
        }
    }

    pub fn instance_count(&self) -> usize {
        self.steps.len().max(self.terminals.len())
    }

    /// Drop every terminal instance recorded before `cutoff`, steps included.
    /// Returns how many instances were purged.
    pub fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut purged = Vec::new();
        self.terminals.retain(|id, record| {
            let keep = record.recorded_at >= cutoff;
            if !keep {
                purged.push(*id);
            }
            keep
        });
        for id in &purged {
            self.steps.remove(id);
            self.claims.remove(id);
        }
        if !purged.is_empty() {
            debug!(purged = purged.len(), "Purged terminal workflow instances");
        }
        purged.len()
    }
}

fn lease_expiry(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|lease| now.checked_add_signed(lease))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
impl WorkflowJournal for InMemoryWorkflowJournal {
    async fn record_step(&self, workflow_id: Uuid, entry: JournalEntry) -> Result<()> {
        let mut steps = self.steps.entry(workflow_id).or_default();
        // Re-recording a step number replaces the earlier entry
        steps.retain(|existing| existing.step_number != entry.step_number);
        steps.push(entry);
        steps.sort_by_key(|e| e.step_number);
        Ok(())
    }

    async fn completed_steps(&self, workflow_id: Uuid) -> Result<Vec<JournalEntry>> {
        Ok(self
            .steps
            .get(&workflow_id)
            .map(|steps| steps.value().clone())
            .unwrap_or_default())
    }

    async fn record_terminal(&self, workflow_id: Uuid, record: TerminalRecord) -> Result<()> {
        let recorded_at = record.recorded_at;
        self.terminals.insert(workflow_id, record);
        if let Some(cutoff) = self.retention.and_then(|r| recorded_at.checked_sub_signed(r)) {
            self.purge_terminal_before(cutoff);
        }
        Ok(())
    }

    async fn terminal_status(&self, workflow_id: Uuid) -> Result<Option<TerminalRecord>> {
        Ok(self.terminals.get(&workflow_id).map(|r| r.value().clone()))
    }

    async fn try_claim(&self, workflow_id: Uuid, owner: Uuid, lease: Duration) -> Result<bool> {
        let now = Utc::now();
        let claim = Claim {
            owner,
            expires_at: lease_expiry(now, lease),
        };

        match self.claims.entry(workflow_id) {
            Entry::Occupied(mut held) => {
                let current = *held.get();
                if current.owner == owner || current.expires_at <= now {
                    held.insert(claim);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(free) => {
                free.insert(claim);
                Ok(true)
            }
        }
    }

    async fn release(&self, workflow_id: Uuid, owner: Uuid) -> Result<()> {
        self.claims.remove_if(&workflow_id, |_, claim| claim.owner == owner);
        Ok(())
    }
}
