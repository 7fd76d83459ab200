//! # Compensation Log
//!
//! Append-only log of compensating actions, unwound back to front when a
//! workflow cannot complete. A failing compensation is logged and the
//! unwind moves on to the next entry.

use crate::error::{ActivityError, CompensationReport};
use crate::execution::ActivityExecutor;
use crate::logging::log_error;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// One pending compensation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationEntry {
    pub action: String,
    pub resource_id: Option<String>,
    /// Step that pushed the entry
    pub step: String,
    pub step_number: usize,
}

/// Undoes the effect of one completed step
#[async_trait]
pub trait CompensationHandler: Send + Sync {
    async fn compensate(&self, workflow_id: Uuid, entry: &CompensationEntry) -> Result<(), ActivityError>;
}

pub type CompensationHandlers = HashMap<String, Arc<dyn CompensationHandler>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompensationLog {
    entries: Vec<CompensationEntry>,
}

impl CompensationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: CompensationEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[CompensationEntry] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Run every compensation in reverse insertion order, draining the log
    pub async fn unwind(
        &mut self,
        workflow_id: Uuid,
        handlers: &CompensationHandlers,
        executor: &ActivityExecutor,
        timeout: Duration,
    ) -> CompensationReport {
        let mut report = CompensationReport::default();

        while let Some(entry) = self.entries.pop() {
            report.attempted.push(entry.action.clone());

            let outcome = match handlers.get(&entry.action) {
                Some(handler) => {
                    executor
                        .run(&entry.action, handler.compensate(workflow_id, &entry), timeout)
                        .await
                }
                None => Err(ActivityError::internal(
                    &entry.action,
                    "no compensation handler registered",
                )),
            };

            match outcome {
                Ok(()) => {
                    info!(
                        workflow_id = %workflow_id,
                        action = %entry.action,
                        step = %entry.step,
                        resource_id = ?entry.resource_id,
                        "↩️ Compensation applied"
                    );
                    report.succeeded += 1;
                }
                Err(error) => {
                    warn!(
                        workflow_id = %workflow_id,
                        action = %entry.action,
                        step = %entry.step,
                        kind = %error.kind,
                        "Compensation failed, continuing unwind"
                    );
                    log_error(
                        "compensation",
                        &entry.action,
                        &error.to_string(),
                        Some(&workflow_id.to_string()),
                    );
                    report.failures.push(error);
                }
            }
        }

        report
    }
}
