//! Bounded LRU table
//!
//! Keys are fingerprints. Each slot carries a logical access stamp taken
//! from a counter that increases on every access, so "least recently used"
//! is always a single, well-defined entry. Eviction scans for the smallest
//! stamp; tables are small (hundreds of entries) and eviction only happens
//! on insertion of a new key at capacity.

use std::collections::HashMap;

struct Slot<V> {
    value: V,
    last_accessed: u64,
}

/// Fixed-capacity least-recently-used table
pub struct LruTable<V> {
    slots: HashMap<String, Slot<V>>,
    max_size: usize,
    stamp: u64,
    evictions: u64,
}

impl<V> LruTable<V> {
    /// Create a table holding at most `max_size` entries (minimum 1)
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            slots: HashMap::with_capacity(max_size),
            max_size,
            stamp: 0,
            evictions: 0,
        }
    }

    #[inline]
    fn next_stamp(&mut self) -> u64 {
        self.stamp += 1;
        self.stamp
    }

    /// Get a value, marking it most recently used
    pub fn get(&mut self, key: &str) -> Option<&V> {
        let stamp = self.next_stamp();
        self.slots.get_mut(key).map(|slot| {
            slot.last_accessed = stamp;
            &slot.value
        })
    }

    /// Get a value without touching its recency
    pub fn peek(&self, key: &str) -> Option<&V> {
        self.slots.get(key).map(|slot| &slot.value)
    }

    /// Insert or replace a value, marking it most recently used
    ///
    /// Returns the evicted entry when a new key had to make room. Replacing
    /// an existing key never evicts.
    pub fn insert(&mut self, key: String, value: V) -> Option<(String, V)> {
        let stamp = self.next_stamp();

        if let Some(slot) = self.slots.get_mut(&key) {
            slot.value = value;
            slot.last_accessed = stamp;
            return None;
        }

        let evicted = if self.slots.len() >= self.max_size {
            self.evict_oldest()
        } else {
            None
        };

        self.slots.insert(
            key,
            Slot {
                value,
                last_accessed: stamp,
            },
        );
        evicted
    }

    fn evict_oldest(&mut self) -> Option<(String, V)> {
        let oldest = self
            .slots
            .iter()
            .min_by_key(|(_, slot)| slot.last_accessed)
            .map(|(key, _)| key.clone())?;

        self.evictions += 1;
        self.slots
            .remove_entry(&oldest)
            .map(|(key, slot)| (key, slot.value))
    }

    /// Remove a key
    pub fn remove(&mut self, key: &str) -> Option<V> {
        self.slots.remove(key).map(|slot| slot.value)
    }

    /// Whether a key is present
    pub fn contains_key(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Capacity
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Entries evicted so far
    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_access_refreshes_entry() {
        let mut table = LruTable::new(2);
        table.insert("A".into(), 1);
        table.insert("B".into(), 2);
        assert_eq!(table.get("A"), Some(&1));

        let evicted = table.insert("C".into(), 3);
        assert_eq!(evicted, Some(("B".to_string(), 2)));
        assert!(table.contains_key("A"));
        assert!(table.contains_key("C"));
        assert_eq!(table.evictions(), 1);
    }

    #[test]
    fn test_replace_does_not_evict() {
        let mut table = LruTable::new(2);
        table.insert("A".into(), 1);
        table.insert("B".into(), 2);
        assert_eq!(table.insert("A".into(), 10), None);
        assert_eq!(table.len(), 2);
        assert_eq!(table.peek("A"), Some(&10));

        // Replacing refreshed A, so B goes first
        assert_eq!(table.insert("C".into(), 3).map(|(k, _)| k), Some("B".into()));
    }

    #[test]
    fn test_peek_does_not_refresh() {
        let mut table = LruTable::new(2);
        table.insert("A".into(), 1);
        table.insert("B".into(), 2);
        assert_eq!(table.peek("A"), Some(&1));
        assert_eq!(table.insert("C".into(), 3).map(|(k, _)| k), Some("A".into()));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut table = LruTable::new(0);
        assert_eq!(table.max_size(), 1);
        table.insert("A".into(), 1);
        table.insert("B".into(), 2);
        assert_eq!(table.len(), 1);
        assert!(table.contains_key("B"));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Get(u8),
        Insert(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..12).prop_map(Op::Get),
            (0u8..12).prop_map(Op::Insert),
        ]
    }

    proptest! {
        #[test]
        fn prop_matches_reference_model(cap in 1usize..6, ops in proptest::collection::vec(op(), 0..200)) {
            let mut table = LruTable::new(cap);
            // Most recently used at the back
            let mut model: Vec<u8> = Vec::new();

            for op in ops {
                match op {
                    Op::Get(k) => {
                        let hit = table.get(&k.to_string()).is_some();
                        let pos = model.iter().position(|&m| m == k);
                        prop_assert_eq!(hit, pos.is_some());
                        if let Some(pos) = pos {
                            model.remove(pos);
                            model.push(k);
                        }
                    }
                    Op::Insert(k) => {
                        let evicted = table.insert(k.to_string(), k).map(|(key, _)| key);
                        let expected = if let Some(pos) = model.iter().position(|&m| m == k) {
                            model.remove(pos);
                            None
                        } else if model.len() == cap {
                            Some(model.remove(0).to_string())
                        } else {
                            None
                        };
                        model.push(k);
                        prop_assert_eq!(evicted, expected);
                    }
                }
                prop_assert!(table.len() <= cap);
                prop_assert_eq!(table.len(), model.len());
            }
        }
    }
}
