//! Memory Tier
//!
//! Process-wide map from namespaced key to entry. Shared by every
//! [`TieredCache`](super::TieredCache) built from the same context. Lookups
//! never suspend; expired entries are dropped when a lookup finds them.
//!
//! Removals are tracked by an epoch so a durable read that started before a
//! `remove` or `clear_all` cannot copy the deleted record back into memory.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::entry::{CacheEntry, ErasedValue};
use crate::clock::Timestamp;

/// Result of probing the memory tier
pub(crate) enum MemoryLookup {
    /// Present and unexpired
    Hit(CacheEntry<ErasedValue>),
    /// Present but expired; it has been removed
    Expired,
    /// Not present
    Absent,
}

/// Outcome of copying a durable hit into the memory tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Repopulate {
    /// The entry was inserted
    Inserted,
    /// A live entry was already present and was kept
    Occupied,
    /// A removal started after the durable read began; nothing was inserted
    Stale,
}

/// Removal epoch observed before a durable read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RemovalEpoch(u64);

/// Marks a removal in progress; ends it when dropped
pub(crate) struct RemovalGuard<'a> {
    tier: &'a MemoryTier,
}

impl Drop for RemovalGuard<'_> {
    fn drop(&mut self) {
        self.tier.epoch.fetch_add(1, Ordering::SeqCst);
        self.tier.removals_in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Shared in-memory tier
#[derive(Default)]
pub struct MemoryTier {
    entries: DashMap<String, CacheEntry<ErasedValue>>,
    epoch: AtomicU64,
    removals_in_flight: AtomicUsize,
}

impl MemoryTier {
    /// Create an empty memory tier
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lookup(&self, key: &str, now: Timestamp) -> MemoryLookup {
        // Clone out so the shard lock is released before any removal.
        let found = self.entries.get(key).map(|e| e.value().clone());

        match found {
            Some(entry) if !entry.is_expired_at(now) => MemoryLookup::Hit(entry),
            Some(_) => {
                // A concurrent set may have replaced it with a live entry.
                self.entries.remove_if(key, |_, e| e.is_expired_at(now));
                MemoryLookup::Expired
            }
            None => MemoryLookup::Absent,
        }
    }

    pub(crate) fn insert(&self, key: String, entry: CacheEntry<ErasedValue>) {
        self.entries.insert(key, entry);
    }

    /// Epoch to hand back to [`MemoryTier::repopulate`] after a durable read
    pub(crate) fn removal_epoch(&self) -> RemovalEpoch {
        RemovalEpoch(self.epoch.load(Ordering::SeqCst))
    }

    /// Start a removal that spans the durable tier
    ///
    /// Durable hits are not copied into memory while the guard is alive, nor
    /// afterwards by reads that began before it was dropped.
    pub(crate) fn begin_removal(&self) -> RemovalGuard<'_> {
        self.removals_in_flight.fetch_add(1, Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        RemovalGuard { tier: self }
    }

    /// Copy a durable hit into memory unless a live entry is present or a
    /// removal has started since `seen` was taken
    pub(crate) fn repopulate(
        &self,
        key: String,
        entry: CacheEntry<ErasedValue>,
        now: Timestamp,
        seen: RemovalEpoch,
    ) -> Repopulate {
        // Checked under the shard lock; a removal bumps the epoch before it
        // takes the same lock to delete.
        let stale = || {
            self.removals_in_flight.load(Ordering::SeqCst) > 0
                || self.epoch.load(Ordering::SeqCst) != seen.0
        };
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_expired_at(now) {
                    Repopulate::Occupied
                } else if stale() {
                    occupied.remove();
                    Repopulate::Stale
                } else {
                    occupied.insert(entry);
                    Repopulate::Inserted
                }
            }
            Entry::Vacant(vacant) => {
                if stale() {
                    Repopulate::Stale
                } else {
                    vacant.insert(entry);
                    Repopulate::Inserted
                }
            }
        }
    }

    pub(crate) fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every key starting with `prefix`; returns how many were removed
    pub(crate) fn remove_prefix(&self, prefix: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|k, _| !k.starts_with(prefix));
        before.saturating_sub(self.entries.len())
    }

    /// Live keys starting with `prefix`
    pub(crate) fn keys_with_prefix(&self, prefix: &str, now: Timestamp) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && !e.value().is_expired_at(now))
            .map(|e| e.key().clone())
            .collect()
    }

    /// Number of physically present entries (expired ones included)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the tier is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(value: &'static str, now: Timestamp, ttl_ms: u64) -> CacheEntry<ErasedValue> {
        CacheEntry::new(value, now, Duration::from_millis(ttl_ms)).erase()
    }

    #[test]
    fn test_lookup_removes_expired() {
        let tier = MemoryTier::new();
        tier.insert("ns:a".into(), entry("a", 0, 100));

        assert!(matches!(tier.lookup("ns:a", 50), MemoryLookup::Hit(_)));
        assert!(matches!(tier.lookup("ns:a", 100), MemoryLookup::Expired));
        assert!(matches!(tier.lookup("ns:a", 100), MemoryLookup::Absent));
        assert!(tier.is_empty());
    }

    #[test]
    fn test_repopulate_keeps_live_entry() {
        let tier = MemoryTier::new();
        tier.insert("ns:a".into(), entry("newer", 0, 100));
        let seen = tier.removal_epoch();

        assert_eq!(
            tier.repopulate("ns:a".into(), entry("older", 0, 100), 10, seen),
            Repopulate::Occupied
        );
        match tier.lookup("ns:a", 10) {
            MemoryLookup::Hit(e) => assert_eq!(e.downcast::<&'static str>(), Some("newer")),
            _ => panic!("expected hit"),
        }

        // An expired occupant is replaceable
        assert_eq!(
            tier.repopulate("ns:a".into(), entry("fresh", 200, 100), 200, seen),
            Repopulate::Inserted
        );
    }

    #[test]
    fn test_repopulate_after_removal_is_stale() {
        let tier = MemoryTier::new();
        let seen = tier.removal_epoch();

        {
            let _removal = tier.begin_removal();
            tier.remove("ns:a");
            // Still in progress: even a read that started now is refused
            let during = tier.removal_epoch();
            assert_eq!(
                tier.repopulate("ns:a".into(), entry("old", 0, 100), 10, during),
                Repopulate::Stale
            );
        }

        assert_eq!(
            tier.repopulate("ns:a".into(), entry("old", 0, 100), 10, seen),
            Repopulate::Stale
        );
        assert!(tier.is_empty());

        let fresh = tier.removal_epoch();
        assert_eq!(
            tier.repopulate("ns:a".into(), entry("new", 0, 100), 10, fresh),
            Repopulate::Inserted
        );
        assert_eq!(
            tier.repopulate("ns:a".into(), entry("other", 0, 100), 10, fresh),
            Repopulate::Occupied
        );
    }

    #[test]
    fn test_remove_prefix_leaves_other_namespaces() {
        let tier = MemoryTier::new();
        tier.insert("a:1".into(), entry("x", 0, 100));
        tier.insert("a:2".into(), entry("x", 0, 100));
        tier.insert("b:1".into(), entry("x", 0, 100));

        assert_eq!(tier.remove_prefix("a:"), 2);
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.keys_with_prefix("b:", 0), vec!["b:1"]);
    }
}
