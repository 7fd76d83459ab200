//! # Orchestration
//!
//! Phased fan-out/fan-in scheduling of the stage set.
//!
//! ```text
//! phase 1 (critical)   ┌─ intake ─┐
//!                      └─ fraud  ─┘ ── barrier ── abort on failure
//! phase 2              ┌─ risk   ─┐
//!                      ├─ coding ─┤ ── barrier
//!                      └─ policy ─┘
//! ```

pub mod orchestrator;
pub mod phases;
pub mod types;

pub use orchestrator::PhasedOrchestrator;
pub use phases::{PhaseDefinition, PhasePlan};
pub use types::{OrchestrationRequest, OrchestrationRun, RunStatus};
