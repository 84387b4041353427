//! Time-indexed activity records
//!
//! A one-to-one key → timestamp map with an ordered index for range
//! queries. Ties on time are broken by key order so every query is
//! deterministic.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::Hash;

/// Key → last-activity time, queryable by time range
#[derive(Debug, Clone)]
pub struct Timeline<K> {
    times: HashMap<K, u64>,
    index: BTreeMap<u64, BTreeSet<K>>,
}

impl<K> Default for Timeline<K> {
    fn default() -> Self {
        Self {
            times: HashMap::new(),
            index: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Hash + Clone> Timeline<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `key` to `time`, replacing any previous mapping.
    pub fn set_time(&mut self, key: K, time: u64) {
        self.unset_time(&key);
        self.index.entry(time).or_default().insert(key.clone());
        self.times.insert(key, time);
    }

    /// Remove the mapping for `key`, returning its time if it had one.
    pub fn unset_time(&mut self, key: &K) -> Option<u64> {
        let time = self.times.remove(key)?;
        if let Some(keys) = self.index.get_mut(&time) {
            keys.remove(key);
            if keys.is_empty() {
                self.index.remove(&time);
            }
        }
        Some(time)
    }

    pub fn time_of(&self, key: &K) -> Option<u64> {
        self.times.get(key).copied()
    }

    /// Entry with the greatest time (greatest key among ties).
    pub fn most_recent(&self) -> Option<(u64, K)> {
        let (time, keys) = self.index.last_key_value()?;
        keys.last().map(|key| (*time, key.clone()))
    }

    /// Keys with time ≥ `since`, ascending by `(time, key)`.
    pub fn events_since(&self, since: u64) -> Vec<K> {
        self.index
            .range(since..)
            .flat_map(|(_, keys)| keys.iter().cloned())
            .collect()
    }

    /// Number of keys with time ≥ `since`
    pub fn count_since(&self, since: u64) -> usize {
        self.index.range(since..).map(|(_, keys)| keys.len()).sum()
    }

    /// Drop every key for which `keep` returns false.
    pub fn retain(&mut self, mut keep: impl FnMut(&K) -> bool) -> usize {
        let dropped: Vec<K> = self.times.keys().filter(|k| !keep(k)).cloned().collect();
        for key in &dropped {
            self.unset_time(key);
        }
        dropped.len()
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_replaces_previous_time() {
        let mut timeline = Timeline::new();
        timeline.set_time("a", 10);
        timeline.set_time("a", 20);

        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline.time_of(&"a"), Some(20));
        assert!(timeline.events_since(11).contains(&"a"));
        assert_eq!(timeline.events_since(0), vec!["a"]);
    }

    #[test]
    fn test_unset() {
        let mut timeline = Timeline::new();
        timeline.set_time("a", 10);

        assert_eq!(timeline.unset_time(&"a"), Some(10));
        assert_eq!(timeline.unset_time(&"a"), None);
        assert_eq!(timeline.unset_time(&"missing"), None);
        assert!(timeline.is_empty());
        assert_eq!(timeline.most_recent(), None);
    }

    #[test]
    fn test_most_recent() {
        let mut timeline = Timeline::new();
        assert_eq!(timeline.most_recent(), None);

        timeline.set_time("b", 30);
        timeline.set_time("a", 30);
        timeline.set_time("c", 5);
        assert_eq!(timeline.most_recent(), Some((30, "b")));

        timeline.set_time("c", 31);
        assert_eq!(timeline.most_recent(), Some((31, "c")));
    }

    #[test]
    fn test_events_since_is_exact_and_ordered() {
        let mut timeline = Timeline::new();
        timeline.set_time("late", 50);
        timeline.set_time("b", 20);
        timeline.set_time("a", 20);
        timeline.set_time("early", 10);

        assert_eq!(timeline.events_since(20), vec!["a", "b", "late"]);
        assert_eq!(timeline.events_since(21), vec!["late"]);
        assert_eq!(timeline.events_since(51), Vec::<&str>::new());
        assert_eq!(timeline.count_since(20), 3);
    }

    #[test]
    fn test_retain() {
        let mut timeline = Timeline::new();
        timeline.set_time(1u8, 10);
        timeline.set_time(2u8, 20);
        timeline.set_time(3u8, 30);

        assert_eq!(timeline.retain(|k| *k != 2), 1);
        assert_eq!(timeline.events_since(0), vec![1, 3]);
    }
}
