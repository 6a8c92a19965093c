//! Concurrency cap for one service.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Named bulkhead preset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkheadPolicy {
    pub max_concurrency: usize,
    pub max_queue: usize,
}

impl Default for BulkheadPolicy {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            max_queue: 100,
        }
    }
}

/// Rejection when both the concurrency slots and the queue are full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadRejected {
    pub max_concurrency: usize,
    pub queued: usize,
}

/// Semaphore-backed bulkhead with a bounded wait queue
#[derive(Debug)]
pub struct Bulkhead {
    policy: BulkheadPolicy,
    permits: Arc<Semaphore>,
    waiting: AtomicUsize,
}

impl Bulkhead {
    pub fn new(policy: BulkheadPolicy) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(policy.max_concurrency)),
            waiting: AtomicUsize::new(0),
            policy,
        }
    }

    pub fn policy(&self) -> &BulkheadPolicy {
        &self.policy
    }

    /// Calls currently holding a permit
    pub fn in_flight(&self) -> usize {
        self.policy.max_concurrency - self.permits.available_permits()
    }

    /// Acquire a slot, waiting in the queue if one is free
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadRejected> {
        if let Ok(permit) = self.permits.clone().try_acquire_owned() {
            return Ok(permit);
        }

        let queued = self.waiting.fetch_add(1, Ordering::SeqCst);
        let slot = QueueSlot(&self.waiting);
        if queued >= self.policy.max_queue {
            return Err(BulkheadRejected {
                max_concurrency: self.policy.max_concurrency,
                queued,
            });
        }

        // the slot is released even if this future is dropped while waiting
        let permit = self.permits.clone().acquire_owned().await;
        drop(slot);

        // the semaphore is never closed
        permit.map_err(|_| BulkheadRejected {
            max_concurrency: self.policy.max_concurrency,
            queued,
        })
    }
}

/// Place in the wait queue, given back on drop
struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_when_queue_full() {
        let bulkhead = Arc::new(Bulkhead::new(BulkheadPolicy {
            max_concurrency: 1,
            max_queue: 1,
        }));

        let held = bulkhead.acquire().await.unwrap();
        assert_eq!(bulkhead.in_flight(), 1);

        // one waiter fits in the queue
        let waiter = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move { bulkhead.acquire().await.is_ok() })
        };
        tokio::task::yield_now().await;
        while bulkhead.waiting.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let rejected = bulkhead.acquire().await;
        assert!(rejected.is_err());

        drop(held);
        assert!(waiter.await.unwrap());
        assert_eq!(bulkhead.waiting.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dropped_waiter_frees_queue_slot() {
        let bulkhead = Bulkhead::new(BulkheadPolicy {
            max_concurrency: 1,
            max_queue: 1,
        });

        let held = bulkhead.acquire().await.unwrap();
        let gave_up = tokio::time::timeout(
            std::time::Duration::from_millis(10),
            bulkhead.acquire(),
        )
        .await;
        assert!(gave_up.is_err());
        assert_eq!(bulkhead.waiting.load(Ordering::SeqCst), 0);

        // the queue has room again
        drop(held);
        let _held = bulkhead.acquire().await.unwrap();
        let waited = tokio::time::timeout(
            std::time::Duration::from_millis(10),
            bulkhead.acquire(),
        )
        .await;
        assert!(waited.is_err(), "should wait in the queue, not be rejected");
    }
}
