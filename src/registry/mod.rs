//! # Registry Infrastructure
//!
//! The closed set of analysis stages, resolved once at construction time to
//! the fixed [`StageHandler`] interface.
//!
//! ```text
//! StageRegistry
//! ├── StageDescriptor   (capabilities, dependencies, status, counters)
//! ├── StageHandler      (process(input) -> output)
//! └── CircuitBreaker    (one per stage)
//! ```

pub mod stage;
pub mod stage_registry;

pub use stage::{
    default_projection, StageCounters, StageDescriptor, StageHandler, StageHealthReport,
    StageStatus,
};
pub use stage_registry::StageRegistry;
