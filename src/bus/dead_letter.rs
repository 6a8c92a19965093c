//! Bounded dead-letter queue.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::Event;

/// An event whose delivery exhausted its retries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub event: Event,

    /// Terminal delivery error
    pub error: String,

    /// Subscription whose handler failed
    pub subscription_id: Option<Uuid>,

    pub added_at: DateTime<Utc>,

    /// Sweeps that tried and failed to redeliver this event
    #[serde(default)]
    pub redelivery_attempts: u32,
}

impl DeadLetterEntry {
    pub fn new(event: Event, error: String, subscription_id: Option<Uuid>) -> Self {
        Self {
            event,
            error,
            subscription_id,
            added_at: Utc::now(),
            redelivery_attempts: 0,
        }
    }
}

/// Dead-lettered events in arrival order, at most one entry per event id
#[derive(Debug)]
pub struct DeadLetterQueue {
    capacity: usize,
    entries: VecDeque<DeadLetterEntry>,
}

impl DeadLetterQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::new(),
        }
    }

    /// Add an entry. Returns false if the event id is already queued.
    pub fn push(&mut self, entry: DeadLetterEntry) -> bool {
        if self.contains(entry.event.id) {
            return false;
        }

        self.entries.push_back(entry);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
        true
    }

    pub fn contains(&self, event_id: Uuid) -> bool {
        self.entries.iter().any(|e| e.event.id == event_id)
    }

    pub fn remove(&mut self, event_id: Uuid) -> Option<DeadLetterEntry> {
        let idx = self.entries.iter().position(|e| e.event.id == event_id)?;
        self.entries.remove(idx)
    }

    /// Record a failed redelivery for an entry
    pub fn mark_failed(&mut self, event_id: Uuid, error: String) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.event.id == event_id) {
            entry.redelivery_attempts += 1;
            entry.error = error;
        }
    }

    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Payload;

    fn entry(event: &Event) -> DeadLetterEntry {
        DeadLetterEntry::new(event.clone(), "boom".to_string(), None)
    }

    #[test]
    fn test_dedupes_by_event_id() {
        let mut dlq = DeadLetterQueue::new(10);
        let event = Event::new("x", Payload::new());

        assert!(dlq.push(entry(&event)));
        assert!(!dlq.push(entry(&event.next_attempt())));
        assert_eq!(dlq.len(), 1);
    }

    #[test]
    fn test_evicts_oldest_past_capacity() {
        let mut dlq = DeadLetterQueue::new(2);
        let events: Vec<Event> = (0..3).map(|_| Event::new("x", Payload::new())).collect();
        for event in &events {
            dlq.push(entry(event));
        }

        assert_eq!(dlq.len(), 2);
        assert!(!dlq.contains(events[0].id));
        assert_eq!(dlq.entries()[0].event.id, events[1].id);
    }

    #[test]
    fn test_mark_failed_and_remove() {
        let mut dlq = DeadLetterQueue::new(10);
        let event = Event::new("x", Payload::new());
        dlq.push(entry(&event));

        dlq.mark_failed(event.id, "still failing".to_string());
        assert_eq!(dlq.entries()[0].redelivery_attempts, 1);
        assert_eq!(dlq.entries()[0].error, "still failing");

        assert!(dlq.remove(event.id).is_some());
        assert!(dlq.is_empty());
    }
}
