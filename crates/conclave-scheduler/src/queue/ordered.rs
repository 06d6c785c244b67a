//! Indexed priority queue for waiting requests.
//!
//! Entries are kept in a `BTreeMap` ordered by (priority desc, created_at asc,
//! arrival sequence asc) with a side index from request ID to key, so the head,
//! the tail, and any arbitrary entry can all be removed in O(log n).

use super::request::Priority;
use chrono::{DateTime, Utc};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, HashMap};

/// Ordering key for a waiting request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueKey {
    priority: Reverse<Priority>,
    created_at: DateTime<Utc>,
    seq: u64,
}

impl QueueKey {
    /// Priority of the entry.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority.0
    }

    /// Creation time of the entry.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // Smaller key = admitted first
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Waiting requests of one category.
#[derive(Debug, Default)]
pub struct OrderedQueue {
    entries: BTreeMap<QueueKey, String>,
    index: HashMap<String, QueueKey>,
    next_seq: u64,
}

impl OrderedQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a request. Returns `false` if the ID is already queued.
    pub fn push(&mut self, id: &str, priority: Priority, created_at: DateTime<Utc>) -> bool {
        if self.index.contains_key(id) {
            return false;
        }
        let key = QueueKey { priority: Reverse(priority), created_at, seq: self.next_seq };
        self.next_seq += 1;
        self.entries.insert(key, id.to_string());
        self.index.insert(id.to_string(), key);
        true
    }

    /// The request that would be admitted next.
    #[must_use]
    pub fn peek(&self) -> Option<(&QueueKey, &str)> {
        self.entries.first_key_value().map(|(k, id)| (k, id.as_str()))
    }

    /// Removes and returns the head.
    pub fn pop(&mut self) -> Option<String> {
        let (_, id) = self.entries.pop_first()?;
        self.index.remove(&id);
        Some(id)
    }

    /// The entry that would be evicted first: lowest priority, newest arrival.
    #[must_use]
    pub fn lowest(&self) -> Option<(&QueueKey, &str)> {
        self.entries.last_key_value().map(|(k, id)| (k, id.as_str()))
    }

    /// Removes an arbitrary request. Returns `true` if it was queued.
    pub fn remove(&mut self, id: &str) -> bool {
        match self.index.remove(id) {
            Some(key) => self.entries.remove(&key).is_some(),
            None => false,
        }
    }

    /// Whether a request is queued.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Number of queued requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// IDs of requests created strictly before `cutoff`, in queue order.
    #[must_use]
    pub fn created_before(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(key, _)| key.created_at < cutoff)
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// IDs in admission order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.values().map(String::as_str)
    }
}
