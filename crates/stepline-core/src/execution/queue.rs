//! Dispatch queue: hand-off of execution IDs from producers (idempotency
//! guard, reconciler, delayed retries) to worker loops.
//!
//! Delivery is at-least-once and unordered across executions. Duplicate
//! deliveries are harmless because a worker must win `claim_execution`
//! before touching a record.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

/// Errors from dispatch queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("dispatch queue closed")]
    Closed,

    #[error("dispatch queue backend error: {0}")]
    Backend(String),
}

/// Queue of execution IDs awaiting a worker.
pub trait DispatchQueue: Send + Sync {
    /// Make `execution_id` available to workers now.
    fn enqueue(&self, execution_id: Uuid) -> impl Future<Output = Result<(), QueueError>> + Send;

    /// Make `execution_id` available to workers once `delay` has elapsed.
    fn enqueue_after(
        &self,
        execution_id: Uuid,
        delay: Duration,
    ) -> impl Future<Output = Result<(), QueueError>> + Send;

    /// Wait for the next available execution ID.
    ///
    /// Returns `Ok(None)` when the queue can never yield another item.
    fn dequeue(&self) -> impl Future<Output = Result<Option<Uuid>, QueueError>> + Send;
}

/// Process-local queue over a tokio channel.
///
/// Not durable on its own: pair it with the reconciler, which re-enqueues
/// executions stranded by a restart.
#[derive(Clone)]
pub struct InMemoryDispatchQueue {
    sender: mpsc::UnboundedSender<Uuid>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Uuid>>>,
}

impl Default for InMemoryDispatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDispatchQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }
}

impl DispatchQueue for InMemoryDispatchQueue {
    async fn enqueue(&self, execution_id: Uuid) -> Result<(), QueueError> {
        self.sender
            .send(execution_id)
            .map_err(|_| QueueError::Closed)
    }

    async fn enqueue_after(&self, execution_id: Uuid, delay: Duration) -> Result<(), QueueError> {
        if delay.is_zero() {
            return self.enqueue(execution_id).await;
        }
        let sender = self.sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if sender.send(execution_id).is_err() {
                tracing::debug!(execution_id = %execution_id, "queue closed before delayed enqueue");
            }
        });
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Uuid>, QueueError> {
        // Workers contend on the receiver lock; only one waits on recv at a time.
        let mut receiver = self.receiver.lock().await;
        Ok(receiver.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_delivery() {
        let queue = InMemoryDispatchQueue::new();
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        queue.enqueue(a).await.unwrap();
        queue.enqueue(b).await.unwrap();
        assert_eq!(queue.dequeue().await.unwrap(), Some(a));
        assert_eq!(queue.dequeue().await.unwrap(), Some(b));
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_after_delays_delivery() {
        let queue = InMemoryDispatchQueue::new();
        let id = Uuid::now_v7();
        queue
            .enqueue_after(id, Duration::from_secs(5))
            .await
            .unwrap();

        let early = tokio::time::timeout(Duration::from_secs(4), queue.dequeue()).await;
        assert!(early.is_err());

        let got = tokio::time::timeout(Duration::from_secs(2), queue.dequeue())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Some(id));
    }

    #[tokio::test]
    async fn test_clones_share_the_channel() {
        let producer = InMemoryDispatchQueue::new();
        let consumer = producer.clone();
        let id = Uuid::now_v7();
        producer.enqueue(id).await.unwrap();
        assert_eq!(consumer.dequeue().await.unwrap(), Some(id));
    }
}
