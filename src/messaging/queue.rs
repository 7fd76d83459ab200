//! # Task Queue
//!
//! At-least-once queue abstraction. A received message stays invisible for
//! the visibility timeout; unless it is acked before then, it is delivered
//! again.

use super::message::{QueuedMessage, TaskQueueMessage};
use crate::error::{AgentflowError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn send(&self, queue: &str, message: &TaskQueueMessage) -> Result<i64>;

    /// Claim up to `limit` visible messages for `visibility`
    async fn receive(&self, queue: &str, limit: usize, visibility: Duration) -> Result<Vec<QueuedMessage>>;

    /// Delete a processed message
    async fn ack(&self, queue: &str, msg_id: i64) -> Result<()>;

    /// Make a claimed message visible again immediately
    async fn nack(&self, queue: &str, msg_id: i64) -> Result<()>;

    /// Messages in the queue, claimed or not
    async fn len(&self, queue: &str) -> Result<usize>;
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: i64,
    content: Value,
    enqueued_at: DateTime<Utc>,
    visible_at: Option<DateTime<Utc>>,
    read_count: u32,
}

#[derive(Debug, Default)]
struct InMemoryQueue {
    messages: VecDeque<StoredMessage>,
    next_id: i64,
}

/// Process-local queue with visibility-timeout redelivery
#[derive(Debug, Default)]
pub struct InMemoryTaskQueue {
    queues: tokio::sync::Mutex<HashMap<String, InMemoryQueue>>,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)))
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn send(&self, queue: &str, message: &TaskQueueMessage) -> Result<i64> {
        let content = serde_json::to_value(message)?;
        let mut queues = self.queues.lock().await;
        let queue = queues.entry(queue.to_string()).or_default();

        queue.next_id += 1;
        let id = queue.next_id;
        queue.messages.push_back(StoredMessage {
            id,
            content,
            enqueued_at: Utc::now(),
            visible_at: None,
            read_count: 0,
        });
        debug!(msg_id = id, kind = message.kind(), "📨 Message enqueued");
        Ok(id)
    }

    async fn receive(&self, queue_name: &str, limit: usize, visibility: Duration) -> Result<Vec<QueuedMessage>> {
        let mut queues = self.queues.lock().await;
        let queue = queues.entry(queue_name.to_string()).or_default();

        let now = Utc::now();
        let invisible_until = now + to_chrono(visibility);
        let mut claimed = Vec::new();
        let mut poisoned = Vec::new();

        for stored in queue.messages.iter_mut() {
            if claimed.len() >= limit {
                break;
            }
            let available = stored.visible_at.map_or(true, |at| at <= now);
            if !available {
                continue;
            }

            match serde_json::from_value::<TaskQueueMessage>(stored.content.clone()) {
                Ok(message) => {
                    stored.visible_at = Some(invisible_until);
                    stored.read_count += 1;
                    claimed.push(QueuedMessage {
                        msg_id: stored.id,
                        message,
                        read_count: stored.read_count,
                        enqueued_at: stored.enqueued_at,
                    });
                }
                Err(e) => {
                    warn!(queue = %queue_name, msg_id = stored.id, error = %e, "Dropping malformed message");
                    poisoned.push(stored.id);
                }
            }
        }

        if !poisoned.is_empty() {
            queue.messages.retain(|m| !poisoned.contains(&m.id));
        }

        Ok(claimed)
    }

    async fn ack(&self, queue_name: &str, msg_id: i64) -> Result<()> {
        let mut queues = self.queues.lock().await;
        let queue = queues
            .get_mut(queue_name)
            .ok_or_else(|| AgentflowError::Queue(format!("unknown queue {queue_name}")))?;

        let before = queue.messages.len();
        queue.messages.retain(|m| m.id != msg_id);
        if queue.messages.len() == before {
            return Err(AgentflowError::Queue(format!(
                "message {msg_id} not found in {queue_name}"
            )));
        }
        Ok(())
    }

    async fn nack(&self, queue_name: &str, msg_id: i64) -> Result<()> {
        let mut queues = self.queues.lock().await;
        let message = queues
            .get_mut(queue_name)
            .and_then(|q| q.messages.iter_mut().find(|m| m.id == msg_id))
            .ok_or_else(|| {
                AgentflowError::Queue(format!("message {msg_id} not found in {queue_name}"))
            })?;
        message.visible_at = None;
        Ok(())
    }

    async fn len(&self, queue_name: &str) -> Result<usize> {
        let queues = self.queues.lock().await;
        Ok(queues.get(queue_name).map_or(0, |q| q.messages.len()))
    }
}
