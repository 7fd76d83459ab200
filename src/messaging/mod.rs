//! # Messaging
//!
//! Durable task queue abstraction feeding the worker: workflow and
//! orchestration execution requests with at-least-once delivery.

pub mod message;
pub mod queue;

pub use message::{QueuedMessage, TaskQueueMessage};
pub use queue::{InMemoryTaskQueue, TaskQueue};
