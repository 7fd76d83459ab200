//! # Orchestration Types
//!
//! Request and result records for a single orchestration run.

use crate::error::ActivityError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use uuid::Uuid;

/// Input plus optional stage filters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationRequest {
    pub input: Value,
    /// When set, only these stages are eligible
    #[serde(default)]
    pub include: Option<BTreeSet<String>>,
    #[serde(default)]
    pub exclude: BTreeSet<String>,
}

impl OrchestrationRequest {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            include: None,
            exclude: BTreeSet::new(),
        }
    }

    pub fn include<I, S>(mut self, stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include = Some(stages.into_iter().map(Into::into).collect());
        self
    }

    pub fn exclude<I, S>(mut self, stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude = stages.into_iter().map(Into::into).collect();
        self
    }

    /// Whether the filters admit `stage`
    pub fn admits(&self, stage: &str) -> bool {
        !self.exclude.contains(stage)
            && self
                .include
                .as_ref()
                .map_or(true, |include| include.contains(stage))
    }
}

/// Final status of an orchestration run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every called stage succeeded
    Completed,
    /// Some non-critical stage failed
    Partial,
    /// A critical phase failed
    Aborted,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Partial => write!(f, "partial"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Structured result of one orchestration run; not persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationRun {
    pub id: Uuid,
    pub input: Value,
    pub results: HashMap<String, Value>,
    pub errors: HashMap<String, ActivityError>,
    /// Stages passed over because their breaker was open
    pub skipped: Vec<String>,
    pub agents_called: usize,
    pub agents_succeeded: usize,
    pub agents_failed: usize,
    pub phases_executed: usize,
    pub status: RunStatus,
    pub aborted_phase: Option<String>,
    /// `CRITICAL_STAGE_FAILURE` describing the abort, when aborted
    pub abort_reason: Option<ActivityError>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl OrchestrationRun {
    pub(crate) fn start(input: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            input,
            results: HashMap::new(),
            errors: HashMap::new(),
            skipped: Vec::new(),
            agents_called: 0,
            agents_succeeded: 0,
            agents_failed: 0,
            phases_executed: 0,
            status: RunStatus::Completed,
            aborted_phase: None,
            abort_reason: None,
            started_at: now,
            completed_at: now,
            duration_ms: 0,
        }
    }

    pub(crate) fn record_success(&mut self, stage: String, output: Value) {
        self.agents_called += 1;
        self.agents_succeeded += 1;
        self.results.insert(stage, output);
    }

    pub(crate) fn record_failure(&mut self, stage: String, error: ActivityError) {
        self.agents_called += 1;
        self.agents_failed += 1;
        self.errors.insert(stage, error);
    }

    pub(crate) fn finish(&mut self) {
        self.status = if self.aborted_phase.is_some() {
            RunStatus::Aborted
        } else if self.agents_failed == 0 {
            RunStatus::Completed
        } else {
            RunStatus::Partial
        };
        self.completed_at = Utc::now();
        self.duration_ms = (self.completed_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64;
    }

    pub fn is_aborted(&self) -> bool {
        self.status == RunStatus::Aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filters() {
        let request = OrchestrationRequest::new(json!({}))
            .include(["intake", "risk"])
            .exclude(["risk"]);

        assert!(request.admits("intake"));
        assert!(!request.admits("risk"));
        assert!(!request.admits("coding"));
        assert!(OrchestrationRequest::new(json!({})).admits("coding"));
    }

    #[test]
    fn test_finish_derives_status() {
        let mut run = OrchestrationRun::start(json!({}));
        run.record_success("intake".into(), json!(1));
        run.finish();
        assert_eq!(run.status, RunStatus::Completed);

        run.record_failure("risk".into(), ActivityError::internal("risk", "down"));
        run.finish();
        assert_eq!(run.status, RunStatus::Partial);
        assert_eq!(run.agents_called, run.agents_succeeded + run.agents_failed);

        run.aborted_phase = Some("screen".into());
        run.finish();
        assert_eq!(run.status, RunStatus::Aborted);
    }
}
