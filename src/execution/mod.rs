//! # Execution
//!
//! Bounded call execution shared by the orchestrator and the workflow:
//! [`ActivityExecutor`] for timeouts and error translation, [`RetryPolicy`]
//! and [`run_with_retry`] for backoff.

pub mod activity;
pub mod retry;

pub use activity::ActivityExecutor;
pub use retry::{run_with_retry, RetryOutcome, RetryPolicy};
