//! # Phase Plan
//!
//! Ordered groups of stages. Phases run one after another; members of a
//! phase run concurrently. A failure in a `critical` phase stops the run.

use crate::config::AgentflowConfig;
use crate::error::{AgentflowError, Result};
use crate::registry::StageRegistry;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// One phase: a name, its member stages and whether failure is fatal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseDefinition {
    pub name: String,
    pub stages: Vec<String>,
    #[serde(default)]
    pub critical: bool,
}

impl PhaseDefinition {
    pub fn new<I, S>(name: impl Into<String>, stages: I, critical: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            stages: stages.into_iter().map(Into::into).collect(),
            critical,
        }
    }

    pub fn critical<I, S>(name: impl Into<String>, stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(name, stages, true)
    }

    pub fn non_critical<I, S>(name: impl Into<String>, stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(name, stages, false)
    }
}

/// Validated, immutable phase ordering
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PhasePlan {
    phases: Vec<PhaseDefinition>,
}

impl PhasePlan {
    /// Validate `phases` against the registry: every member must be
    /// registered, and no stage or phase name may appear twice
    pub fn new(phases: Vec<PhaseDefinition>, registry: &StageRegistry) -> Result<Self> {
        let mut names = HashSet::new();
        let mut owner: HashMap<&str, &str> = HashMap::new();

        for phase in &phases {
            if !names.insert(phase.name.as_str()) {
                return Err(AgentflowError::InvalidPhasePlan(format!(
                    "phase {} declared twice",
                    phase.name
                )));
            }
            for stage in &phase.stages {
                if !registry.contains(stage) {
                    return Err(AgentflowError::UnknownStage(format!(
                        "{stage} (phase {})",
                        phase.name
                    )));
                }
                if let Some(first) = owner.insert(stage.as_str(), phase.name.as_str()) {
                    return Err(AgentflowError::InvalidPhasePlan(format!(
                        "stage {stage} appears in phases {first} and {}",
                        phase.name
                    )));
                }
            }
        }

        Ok(Self { phases })
    }

    pub fn from_config(config: &AgentflowConfig, registry: &StageRegistry) -> Result<Self> {
        Self::new(config.phases.clone(), registry)
    }

    pub fn phases(&self) -> &[PhaseDefinition] {
        &self.phases
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// Phase containing `stage`, if any
    pub fn phase_of(&self, stage: &str) -> Option<&PhaseDefinition> {
        self.phases
            .iter()
            .find(|phase| phase.stages.iter().any(|s| s == stage))
    }
}
