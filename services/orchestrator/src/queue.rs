//! Work Queue contract.
//!
//! Message delivery between the orchestrator and node agents, and from
//! agents back into the reconciler. The contract is deliberately weak —
//! at-least-once delivery, no ordering guarantee — because that is all the
//! state machines require: every handler is idempotent by construction, so
//! duplicates and reorderings are harmless.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use fleet_id::MachineId;
use serde::Serialize;
use thiserror::Error;

/// The queue the reconciler consumes agent reports from.
pub const NODE_EVENTS_QUEUE: &str = "node-events";

/// The per-node queue an agent consumes commands from.
pub fn node_command_queue(machine_id: MachineId) -> String {
    format!("node-{}", machine_id)
}

/// Queue operation errors.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("queue backend error: {0}")]
    Backend(String),
}

/// At-least-once, best-effort-ordered message delivery.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueue a message. Delivery may duplicate; it never silently drops.
    async fn enqueue(&self, queue: &str, body: serde_json::Value) -> Result<(), QueueError>;

    /// Pop one message if available. Consumers that fail to process a
    /// message re-enqueue it themselves.
    async fn dequeue(&self, queue: &str) -> Result<Option<serde_json::Value>, QueueError>;

    /// Number of messages currently waiting.
    async fn pending(&self, queue: &str) -> Result<usize, QueueError>;
}

/// Serializes and enqueues a typed message.
pub async fn enqueue_message<T: Serialize + Sync>(
    queue: &dyn WorkQueue,
    name: &str,
    message: &T,
) -> Result<(), QueueError> {
    queue.enqueue(name, serde_json::to_value(message)?).await
}

/// In-memory queue for tests and dev mode.
#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<HashMap<String, VecDeque<serde_json::Value>>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn enqueue(&self, queue: &str, body: serde_json::Value) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entry(queue.to_string()).or_default().push_back(body);
        Ok(())
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<serde_json::Value>, QueueError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.get_mut(queue).and_then(|q| q.pop_front()))
    }

    async fn pending(&self, queue: &str) -> Result<usize, QueueError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.get(queue).map(|q| q.len()).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_within_queue() {
        let queue = MemoryQueue::new();
        queue
            .enqueue("q", serde_json::json!({"n": 1}))
            .await
            .unwrap();
        queue
            .enqueue("q", serde_json::json!({"n": 2}))
            .await
            .unwrap();

        assert_eq!(queue.pending("q").await.unwrap(), 2);
        assert_eq!(
            queue.dequeue("q").await.unwrap(),
            Some(serde_json::json!({"n": 1}))
        );
        assert_eq!(
            queue.dequeue("q").await.unwrap(),
            Some(serde_json::json!({"n": 2}))
        );
        assert_eq!(queue.dequeue("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_queues_are_isolated() {
        let queue = MemoryQueue::new();
        queue.enqueue("a", serde_json::json!(1)).await.unwrap();
        assert_eq!(queue.dequeue("b").await.unwrap(), None);
        assert_eq!(queue.pending("a").await.unwrap(), 1);
    }

    #[test]
    fn test_node_command_queue_name() {
        let machine_id = MachineId::new();
        let name = node_command_queue(machine_id);
        assert!(name.starts_with("node-"));
        assert!(name.contains(&machine_id.to_string()));
    }
}
