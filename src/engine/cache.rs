use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};

use super::SensorCell;

#[derive(Clone)]
pub struct CacheEntry {
    pub ts: DateTime<Utc>,
    pub step_id: u64,
    pub state: HashMap<u64, SensorCell>,
}

/// Bounded most-recent buffer of state snapshots, used to restore state for
/// a seek or step-backward without always having to rebuild from scratch.
pub struct StateCache {
    capacity: usize,
    entries: VecDeque<CacheEntry>,
}

impl StateCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn insert(&mut self, ts: DateTime<Utc>, step_id: u64, state: HashMap<u64, SensorCell>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(CacheEntry { ts, step_id, state });
    }

    pub fn get_exact(&self, ts: DateTime<Utc>) -> Option<&CacheEntry> {
        self.entries.iter().rev().find(|e| e.ts == ts)
    }

    /// Latest entry with `ts <= target`, scanning newest-to-oldest.
    pub fn get_le(&self, target: DateTime<Utc>) -> Option<&CacheEntry> {
        self.entries.iter().rev().find(|e| e.ts <= target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn evicts_oldest_past_capacity() {
        let mut cache = StateCache::new(2);
        cache.insert(ts(0), 0, HashMap::new());
        cache.insert(ts(1), 1, HashMap::new());
        cache.insert(ts(2), 2, HashMap::new());
        assert!(cache.get_exact(ts(0)).is_none());
        assert!(cache.get_exact(ts(2)).is_some());
    }

    #[test]
    fn get_le_returns_latest_not_after_target() {
        let mut cache = StateCache::new(4);
        cache.insert(ts(0), 0, HashMap::new());
        cache.insert(ts(2), 1, HashMap::new());
        cache.insert(ts(4), 2, HashMap::new());
        let entry = cache.get_le(ts(3)).unwrap();
        assert_eq!(entry.step_id, 1);
    }
}
