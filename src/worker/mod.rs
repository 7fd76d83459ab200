//! Queue-driven execution of workflows and orchestration runs.

pub mod task_queue_worker;

pub use task_queue_worker::{ProcessedOutcome, TaskQueueWorker, WorkerStats};
