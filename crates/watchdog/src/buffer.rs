//! Per-process log ring buffers.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Bounded recent-output store keyed by process id.
///
/// Each buffer is a strict FIFO ring: appends go to the tail and the head is
/// evicted once `capacity` is exceeded. Buffers are created on first append.
pub struct LogBufferStore {
    capacity: usize,
    buffers: Mutex<HashMap<u32, VecDeque<String>>>,
}

impl LogBufferStore {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Append a line to a process buffer, evicting the oldest when full.
    pub fn append(&self, process_id: u32, line: impl Into<String>) {
        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        let buffer = buffers
            .entry(process_id)
            .or_insert_with(|| VecDeque::with_capacity(self.capacity));
        buffer.push_back(line.into());
        while buffer.len() > self.capacity {
            buffer.pop_front();
        }
    }

    /// Copy of a process buffer, oldest first. Empty if none exists.
    #[must_use]
    pub fn snapshot(&self, process_id: u32) -> Vec<String> {
        self.tail(process_id, self.capacity)
    }

    /// Copy of the last `n` lines of a process buffer, oldest first.
    #[must_use]
    pub fn tail(&self, process_id: u32, n: usize) -> Vec<String> {
        let buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        buffers.get(&process_id).map_or_else(Vec::new, |buffer| {
            let skip = buffer.len().saturating_sub(n);
            buffer.iter().skip(skip).cloned().collect()
        })
    }

    /// Drop a process buffer entirely.
    pub fn evict(&self, process_id: u32) -> bool {
        let removed = self
            .buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&process_id)
            .is_some();
        if removed {
            debug!(process_id, "Evicted log buffer");
        }
        removed
    }

    /// Number of processes with a buffer.
    #[must_use]
    pub fn process_count(&self) -> usize {
        self.buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
