//! Bounded dead-letter store.

use std::collections::VecDeque;
use tracing::debug;

use super::types::DeadLetterEntry;

/// FIFO of alerts that exhausted their retries.
///
/// Holds at most `capacity` entries; pushing beyond that drops the oldest.
/// Entries are only inspected, never retried.
#[derive(Debug)]
pub struct DeadLetterStore {
    capacity: usize,
    entries: VecDeque<DeadLetterEntry>,
}

impl DeadLetterStore {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, entry: DeadLetterEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                debug!(key = %evicted.key, "Dead-letter store full, evicted oldest entry");
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy of every entry, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries.iter().cloned().collect()
    }
}
