//! Duplicate delivery suppression
//!
//! The transport may deliver a sample more than once. [`RecentMessages`]
//! remembers the last `capacity` `(sender, message id)` pairs and evicts in
//! arrival order.

use std::collections::{HashSet, VecDeque};

/// Bounded FIFO cache of recently seen messages
#[derive(Debug, Clone)]
pub struct RecentMessages {
    capacity: usize,
    order: VecDeque<(String, String)>,
    seen: HashSet<(String, String)>,
}

impl RecentMessages {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Record a message; returns `false` if it was already seen
    pub fn check_and_insert(&mut self, from_node_id: &str, message_id: &str) -> bool {
        let key = (from_node_id.to_string(), message_id.to_string());
        if self.seen.contains(&key) {
            return false;
        }

        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        true
    }

    pub fn contains(&self, from_node_id: &str, message_id: &str) -> bool {
        self.seen
            .contains(&(from_node_id.to_string(), message_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
