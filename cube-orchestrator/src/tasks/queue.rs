//! Task queues

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

use super::{QUEUES, TaskMessage};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    #[error("unknown task: {0}")]
    UnknownTask(String),
}

/// Transport delivering task messages to workers
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn push(&self, queue: &str, message: TaskMessage) -> Result<(), QueueError>;
}

#[derive(Default)]
struct LocalQueue {
    messages: Mutex<VecDeque<TaskMessage>>,
    notify: Notify,
}

impl LocalQueue {
    fn messages(&self) -> MutexGuard<'_, VecDeque<TaskMessage>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process FIFO queues, one per queue name
pub struct LocalTaskQueue {
    queues: HashMap<String, LocalQueue>,
}

impl LocalTaskQueue {
    pub fn new(names: &[&str]) -> Self {
        let queues = names
            .iter()
            .map(|name| (name.to_string(), LocalQueue::default()))
            .collect();
        Self { queues }
    }

    /// Queues `main1`, `main2` and `periodic`
    pub fn standard() -> Self {
        Self::new(&QUEUES)
    }

    fn queue(&self, name: &str) -> Result<&LocalQueue, QueueError> {
        self.queues
            .get(name)
            .ok_or_else(|| QueueError::UnknownQueue(name.to_string()))
    }

    /// Take the oldest message without waiting
    pub fn pop(&self, queue: &str) -> Option<TaskMessage> {
        self.queue(queue).ok()?.messages().pop_front()
    }

    /// Wait for the next message; `None` for an unknown queue
    pub async fn next(&self, queue: &str) -> Option<TaskMessage> {
        let q = self.queue(queue).ok()?;
        loop {
            let message = q.messages().pop_front();
            if message.is_some() {
                return message;
            }
            q.notify.notified().await;
        }
    }

    /// Snapshot of the waiting messages
    pub fn pending(&self, queue: &str) -> Vec<TaskMessage> {
        self.queue(queue)
            .map(|q| q.messages().iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, queue: &str) -> usize {
        self.queue(queue).map(|q| q.messages().len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.queues.values().all(|q| q.messages().is_empty())
    }
}

#[async_trait]
impl TaskQueue for LocalTaskQueue {
    async fn push(&self, queue: &str, message: TaskMessage) -> Result<(), QueueError> {
        let q = self.queue(queue)?;
        debug!("Queued {} ({}) on {}", message.name, message.id, queue);
        q.messages().push_back(message);
        q.notify.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{MAIN1_QUEUE, PERIODIC_QUEUE, TaskArgs};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_per_queue() {
        let queue = LocalTaskQueue::standard();
        queue
            .push(MAIN1_QUEUE, TaskMessage::new("a", TaskArgs::None))
            .await
            .unwrap();
        queue
            .push(MAIN1_QUEUE, TaskMessage::new("b", TaskArgs::None))
            .await
            .unwrap();

        assert_eq!(queue.len(MAIN1_QUEUE), 2);
        assert_eq!(queue.len(PERIODIC_QUEUE), 0);
        assert_eq!(queue.pop(MAIN1_QUEUE).unwrap().name, "a");
        assert_eq!(queue.pop(MAIN1_QUEUE).unwrap().name, "b");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_queue() {
        let queue = LocalTaskQueue::standard();
        let err = queue
            .push("celery", TaskMessage::new("a", TaskArgs::None))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::UnknownQueue(name) if name == "celery"));
        assert!(queue.next("celery").await.is_none());
    }

    #[tokio::test]
    async fn test_next_wakes_on_push() {
        let queue = Arc::new(LocalTaskQueue::standard());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next(MAIN1_QUEUE).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue
            .push(MAIN1_QUEUE, TaskMessage::new("late", TaskArgs::None))
            .await
            .unwrap();

        let message = waiter.await.unwrap().unwrap();
        assert_eq!(message.name, "late");
    }
}
