//! Per-item expiration.
//!
//! Semantics are lazy: an expired item is *observed* on access (reads treat
//! it as missing) and physically removed by the sweep at writer entry or by
//! the next write touching it. The index keeps a timestamp-ordered view so
//! the sweep costs O(due count), not O(total items).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn unix_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Expiration table: `(collection, id) -> absolute expiry`.
#[derive(Debug, Default)]
pub struct ExpireIndex {
    entries: HashMap<(String, String), u64>,
    by_time: BTreeMap<u64, HashSet<(String, String)>>,
}

impl ExpireIndex {
    pub fn new() -> Self {
        ExpireIndex::default()
    }

    /// Set or replace the expiry for an item.
    pub fn set(&mut self, key: &str, id: &str, at: SystemTime) {
        let entry = (key.to_string(), id.to_string());
        let millis = unix_millis(at);
        if let Some(old) = self.entries.insert(entry.clone(), millis) {
            self.remove_from_time(old, &entry);
        }
        self.by_time.entry(millis).or_default().insert(entry);
    }

    /// Clear the expiry for an item. Returns whether one was set.
    pub fn clear(&mut self, key: &str, id: &str) -> bool {
        let entry = (key.to_string(), id.to_string());
        match self.entries.remove(&entry) {
            Some(millis) => {
                self.remove_from_time(millis, &entry);
                true
            }
            None => false,
        }
    }

    /// Clear every expiry under a collection key (DROP, FLUSHDB, RENAME).
    pub fn clear_key(&mut self, key: &str) {
        let doomed: Vec<(String, String)> = self
            .entries
            .keys()
            .filter(|(k, _)| k == key)
            .cloned()
            .collect();
        for entry in doomed {
            let millis = self.entries.remove(&entry).expect("entry exists");
            self.remove_from_time(millis, &entry);
        }
    }

    pub fn clear_all(&mut self) {
        self.entries.clear();
        self.by_time.clear();
    }

    /// Remaining time to live, if an expiry is set.
    pub fn ttl(&self, key: &str, id: &str, now: SystemTime) -> Option<Duration> {
        let millis = *self.entries.get(&(key.to_string(), id.to_string()))?;
        let now_millis = unix_millis(now);
        Some(Duration::from_millis(millis.saturating_sub(now_millis)))
    }

    /// Whether the item is past its expiry.
    pub fn has_expired(&self, key: &str, id: &str, now: SystemTime) -> bool {
        match self.entries.get(&(key.to_string(), id.to_string())) {
            Some(&millis) => unix_millis(now) >= millis,
            None => false,
        }
    }

    /// Pop every entry due at or before `now`.
    pub fn sweep_due(&mut self, now: SystemTime) -> Vec<(String, String)> {
        let now_millis = unix_millis(now);
        let due_times: Vec<u64> = self
            .by_time
            .range(..=now_millis)
            .map(|(&t, _)| t)
            .collect();
        let mut due = Vec::new();
        for t in due_times {
            if let Some(entries) = self.by_time.remove(&t) {
                for entry in entries {
                    self.entries.remove(&entry);
                    due.push(entry);
                }
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove_from_time(&mut self, millis: u64, entry: &(String, String)) {
        if let Some(set) = self.by_time.get_mut(&millis) {
            set.remove(entry);
            if set.is_empty() {
                self.by_time.remove(&millis);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(base: SystemTime, secs: f64) -> SystemTime {
        base + Duration::from_millis((secs * 1000.0) as u64)
    }

    #[test]
    fn test_set_and_observe() {
        let base = SystemTime::now();
        let mut ex = ExpireIndex::new();
        ex.set("fleet", "truck1", at(base, 1.0));
        assert!(!ex.has_expired("fleet", "truck1", at(base, 0.25)));
        assert!(ex.has_expired("fleet", "truck1", at(base, 1.25)));
        assert!(!ex.has_expired("fleet", "other", at(base, 9.0)));
    }

    #[test]
    fn test_ttl_values() {
        let base = SystemTime::now();
        let mut ex = ExpireIndex::new();
        ex.set("fleet", "truck1", at(base, 10.0));
        let ttl = ex.ttl("fleet", "truck1", at(base, 4.0)).unwrap();
        assert!((ttl.as_secs_f64() - 6.0).abs() < 0.01);
        assert!(ex.ttl("fleet", "nope", base).is_none());
    }

    #[test]
    fn test_clear_and_replace() {
        let base = SystemTime::now();
        let mut ex = ExpireIndex::new();
        ex.set("fleet", "truck1", at(base, 1.0));
        ex.set("fleet", "truck1", at(base, 5.0)); // replace
        assert!(!ex.has_expired("fleet", "truck1", at(base, 2.0)));
        assert!(ex.clear("fleet", "truck1"));
        assert!(!ex.clear("fleet", "truck1"));
        assert!(ex.is_empty());
    }

    #[test]
    fn test_sweep_due() {
        let base = SystemTime::now();
        let mut ex = ExpireIndex::new();
        ex.set("a", "1", at(base, 1.0));
        ex.set("a", "2", at(base, 2.0));
        ex.set("b", "3", at(base, 10.0));
        let mut due = ex.sweep_due(at(base, 5.0));
        due.sort();
        assert_eq!(
            due,
            vec![
                ("a".to_string(), "1".to_string()),
                ("a".to_string(), "2".to_string())
            ]
        );
        assert_eq!(ex.len(), 1);
        assert!(ex.sweep_due(at(base, 5.0)).is_empty());
    }

    #[test]
    fn test_clear_key() {
        let base = SystemTime::now();
        let mut ex = ExpireIndex::new();
        ex.set("a", "1", at(base, 1.0));
        ex.set("a", "2", at(base, 1.0));
        ex.set("b", "1", at(base, 1.0));
        ex.clear_key("a");
        assert_eq!(ex.len(), 1);
        assert!(ex.has_expired("b", "1", at(base, 2.0)));
    }
}
