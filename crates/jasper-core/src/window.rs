//! Recent-value window.
//!
//! A FIFO of values this instance has recently applied or pushed, bounded by
//! length and/or age. Poll reconciliation uses it to tell "a replica caught up
//! to a value we already wrote" apart from "a replica diverged". It is a
//! heuristic oracle only, never a source of truth.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry<V> {
    at: Instant,
    value: V,
}

/// Length- and age-bounded window of recently seen values.
#[derive(Debug, Clone)]
pub struct RecentValues<V> {
    entries: VecDeque<Entry<V>>,
    max_len: Option<usize>,
    max_age: Option<Duration>,
}

impl<V: PartialEq> RecentValues<V> {
    /// Create a window. `None` leaves that dimension unbounded.
    pub fn new(max_len: Option<usize>, max_age: Option<Duration>) -> Self {
        Self {
            entries: VecDeque::new(),
            max_len,
            max_age,
        }
    }

    /// Record a value. Amortized O(1).
    pub fn push(&mut self, value: V) {
        if self.max_len == Some(0) {
            return;
        }
        let now = Instant::now();
        self.evict_expired_at(now);
        self.entries.push_back(Entry { at: now, value });

        if let Some(max_len) = self.max_len {
            while self.entries.len() > max_len {
                self.entries.pop_front();
            }
        }
    }

    /// Whether `value` was recorded and has not aged out.
    pub fn contains(&self, value: &V) -> bool {
        let now = Instant::now();
        self.entries
            .iter()
            .rev()
            .take_while(|entry| !self.is_expired(entry, now))
            .any(|entry| entry.value == *value)
    }

    /// Drop every entry older than the age bound.
    pub fn evict_expired(&mut self) {
        self.evict_expired_at(Instant::now());
    }

    /// Change the bounds; takes effect on the next push.
    pub fn set_bounds(&mut self, max_len: Option<usize>, max_age: Option<Duration>) {
        self.max_len = max_len;
        self.max_age = max_age;
    }

    /// Number of stored entries, expired ones included until evicted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn is_expired(&self, entry: &Entry<V>, now: Instant) -> bool {
        match self.max_age {
            Some(max_age) => now.duration_since(entry.at) > max_age,
            None => false,
        }
    }

    fn evict_expired_at(&mut self, now: Instant) {
        // Entries are in insertion order, so expired ones sit at the front.
        while let Some(front) = self.entries.front() {
            if self.is_expired(front, now) {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }
}
