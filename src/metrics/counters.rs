use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Per-key monotonic counters.
///
/// Keys are created on first increment. `DashMap::entry` makes concurrent
/// first writers for the same key agree on a single counter, and the
/// counter itself is an atomic so increments never take a shard write lock
/// once the key exists.
#[derive(Debug, Default)]
pub struct CounterTable {
    counters: DashMap<String, AtomicU64>,
}

impl CounterTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, key: &str) {
        self.increment_by(key, 1);
    }

    pub fn increment_by(&self, key: &str, amount: u64) {
        // Fast path: existing key, shared shard lock only
        if let Some(counter) = self.counters.get(key) {
            counter.fetch_add(amount, Ordering::SeqCst);
            return;
        }
        self.counters
            .entry(key.to_owned())
            .or_default()
            .fetch_add(amount, Ordering::SeqCst);
    }

    /// Current value; unknown keys read as zero.
    pub fn get(&self, key: &str) -> u64 {
        self.counters
            .get(key)
            .map_or(0, |c| c.load(Ordering::SeqCst))
    }

    /// Sum over every key.
    pub fn total(&self) -> u64 {
        self.counters
            .iter()
            .map(|c| c.value().load(Ordering::SeqCst))
            .sum()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.counters.contains_key(key)
    }

    /// Number of distinct keys ever seen (survives `reset`).
    pub fn key_count(&self) -> usize {
        self.counters.len()
    }

    /// Keys whose counter is currently above zero.
    pub fn active_keys(&self) -> Vec<String> {
        self.counters
            .iter()
            .filter(|c| c.value().load(Ordering::SeqCst) > 0)
            .map(|c| c.key().clone())
            .collect()
    }

    /// Zero every counter. Keys stay registered.
    pub fn reset(&self) {
        for counter in self.counters.iter() {
            counter.value().store(0, Ordering::SeqCst);
        }
    }
}
