//! Bounded dead-letter queue for operations that exhausted their retries.

use super::retry::RetryAttemptRecord;
use crate::classify::Classification;
use crate::events::now_ms;
use std::collections::VecDeque;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct DeadLetterEntry<P> {
    pub id: String,
    pub operation: String,
    pub batch_index: Option<usize>,
    pub payload: P,
    pub error: String,
    pub classification: Option<Classification>,
    pub attempts: u32,
    pub history: Vec<RetryAttemptRecord>,
    pub created_at_ms: u64,
}

impl<P> DeadLetterEntry<P> {
    pub fn new(operation: impl Into<String>, payload: P, error: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            operation: operation.into(),
            batch_index: None,
            payload,
            error: error.into(),
            classification: None,
            attempts: 0,
            history: Vec::new(),
            created_at_ms: now_ms(),
        }
    }

    /// Build an entry from a runtime error, copying the retry history when present.
    pub fn from_error(operation: impl Into<String>, payload: P, err: &crate::Error) -> Self {
        let mut entry = Self::new(operation, payload, err.to_string());
        if let crate::Error::RetryExhausted {
            attempts,
            history,
            classification,
            ..
        } = err
        {
            entry.attempts = *attempts;
            entry.history = history.clone();
            entry.classification = Some(classification.clone());
        }
        entry
    }

    pub fn with_batch_index(mut self, index: usize) -> Self {
        self.batch_index = Some(index);
        self
    }
}

/// FIFO store with a hard capacity; the oldest entry is evicted when full.
pub struct DeadLetterQueue<P> {
    capacity: usize,
    entries: Mutex<VecDeque<DeadLetterEntry<P>>>,
    evicted: Mutex<u64>,
}

impl<P: Clone> DeadLetterQueue<P> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
            evicted: Mutex::new(0),
        }
    }

    /// Returns the evicted entry, if the queue was full.
    pub fn push(&self, entry: DeadLetterEntry<P>) -> Option<DeadLetterEntry<P>> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.push_back(entry);
        if entries.len() > self.capacity {
            let dropped = entries.pop_front();
            if let Some(ref d) = dropped {
                tracing::warn!(operation = %d.operation, id = %d.id, "dead-letter queue full, evicting oldest");
                *self.evicted.lock().unwrap_or_else(|p| p.into_inner()) += 1;
            }
            return dropped;
        }
        None
    }

    /// Take every entry for reprocessing.
    pub fn drain(&self) -> Vec<DeadLetterEntry<P>> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect()
    }

    pub fn snapshot(&self) -> Vec<DeadLetterEntry<P>> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evicted_count(&self) -> u64 {
        *self.evicted.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_eviction() {
        let q: DeadLetterQueue<u32> = DeadLetterQueue::new(2);
        assert!(q.push(DeadLetterEntry::new("op", 1, "e1")).is_none());
        assert!(q.push(DeadLetterEntry::new("op", 2, "e2")).is_none());
        let evicted = q.push(DeadLetterEntry::new("op", 3, "e3")).unwrap();
        assert_eq!(evicted.payload, 1);
        assert_eq!(q.len(), 2);
        assert_eq!(q.evicted_count(), 1);
    }

    #[test]
    fn test_drain_empties_queue() {
        let q: DeadLetterQueue<&str> = DeadLetterQueue::new(10);
        q.push(DeadLetterEntry::new("op", "a", "boom").with_batch_index(4));
        let drained = q.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].batch_index, Some(4));
        assert!(q.is_empty());
    }

    #[test]
    fn test_from_error_copies_history() {
        let err = crate::Error::RetryExhausted {
            operation: "op".into(),
            attempts: 3,
            history: vec![],
            classification: Classification::new(crate::classify::ErrorCategory::Network),
            last_error: "reset".into(),
        };
        let entry = DeadLetterEntry::from_error("op", (), &err);
        assert_eq!(entry.attempts, 3);
        assert!(entry.classification.is_some());
    }
}
