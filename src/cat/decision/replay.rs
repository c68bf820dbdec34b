use std::collections::VecDeque;

use rand::seq::index;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// One transition observed after a graded response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experience {
    pub state: Vec<f64>,
    pub reward: f64,
    pub next_state: Vec<f64>,
    pub terminal: bool,
}

/// Fixed-capacity FIFO of experiences; pushing into a full buffer evicts the
/// oldest entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayBuffer {
    capacity: usize,
    entries: VecDeque<Experience>,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Rebuild from persisted entries (oldest first), keeping the newest
    /// `capacity` of them.
    pub fn from_entries(capacity: usize, entries: Vec<Experience>) -> Self {
        let mut buffer = Self::new(capacity);
        for entry in entries {
            buffer.push(entry);
        }
        buffer
    }

    pub fn push(&mut self, experience: Experience) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(experience);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &Experience> {
        self.entries.iter()
    }

    /// Sample `batch_size` distinct entries, or all of them if fewer exist.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R, batch_size: usize) -> Vec<&Experience> {
        let amount = batch_size.min(self.entries.len());
        index::sample(rng, self.entries.len(), amount)
            .into_iter()
            .filter_map(|i| self.entries.get(i))
            .collect()
    }

    pub fn to_vec(&self) -> Vec<Experience> {
        self.entries.iter().cloned().collect()
    }
}
