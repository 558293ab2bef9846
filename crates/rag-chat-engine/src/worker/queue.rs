use std::collections::VecDeque;

use tokio::sync::Mutex;
use uuid::Uuid;

/// In-process ingestion job queue keyed by document id. Duplicate ids
/// are dropped while queued; capacity is bounded.
pub struct JobQueue {
    queue: Mutex<VecDeque<Uuid>>,
    capacity: usize,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Returns false when the id is already queued or the queue is full.
    pub async fn enqueue(&self, document_id: Uuid) -> bool {
        let mut queue = self.queue.lock().await;

        if queue.iter().any(|id| *id == document_id) {
            return false;
        }
        if queue.len() >= self.capacity {
            return false;
        }

        queue.push_back(document_id);
        true
    }

    pub async fn dequeue(&self) -> Option<Uuid> {
        let mut queue = self.queue.lock().await;
        queue.pop_front()
    }

    pub async fn len(&self) -> usize {
        let queue = self.queue.lock().await;
        queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
