use std::collections::VecDeque;

use serde_json::Value;

/// Fixed-capacity ring of session replay frames.
///
/// Pushing past capacity evicts the oldest frame.
#[derive(Debug, Clone)]
pub struct ReplayBuffer {
    frames: VecDeque<Value>,
    capacity: usize,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, frame: Value) {
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    /// Copies the current frames, oldest first.
    pub fn snapshot(&self) -> Vec<Value> {
        self.frames.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
