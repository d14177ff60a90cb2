//! Cache Entry Types

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{duration_millis, Timestamp};

/// Type-erased value held by the shared memory tier
pub(crate) type ErasedValue = Arc<dyn Any + Send + Sync>;

/// A cached value with its storage and expiry timestamps
///
/// Entries are replaced wholesale on every `set`; nothing mutates an entry
/// after construction. `expires_at > stored_at` always holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry<V> {
    value: V,
    stored_at: Timestamp,
    expires_at: Timestamp,
}

impl<V> CacheEntry<V> {
    /// Create an entry stored at `now` that lives for `ttl`
    ///
    /// A zero TTL is clamped to one millisecond.
    pub fn new(value: V, now: Timestamp, ttl: Duration) -> Self {
        let ttl_ms = duration_millis(ttl).max(1);
        Self {
            value,
            stored_at: now,
            expires_at: now.saturating_add(ttl_ms).max(now.saturating_add(1)),
        }
    }

    /// Rebuild an entry from persisted timestamps
    pub(crate) fn from_parts(value: V, stored_at: Timestamp, expires_at: Timestamp) -> Self {
        Self {
            value,
            stored_at,
            expires_at,
        }
    }

    /// Get the value
    #[inline]
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Consume the entry, returning the value
    pub fn into_value(self) -> V {
        self.value
    }

    /// When the entry was stored (epoch millis)
    #[inline]
    pub fn stored_at(&self) -> Timestamp {
        self.stored_at
    }

    /// When the entry expires (epoch millis)
    #[inline]
    pub fn expires_at(&self) -> Timestamp {
        self.expires_at
    }

    /// Whether the entry is logically absent at `now`
    #[inline]
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    /// Time left before expiry
    pub fn remaining(&self, now: Timestamp) -> Duration {
        Duration::from_millis(self.expires_at.saturating_sub(now))
    }

    /// Transform the value, keeping the timestamps
    pub fn map<U>(self, f: impl FnOnce(V) -> U) -> CacheEntry<U> {
        CacheEntry {
            value: f(self.value),
            stored_at: self.stored_at,
            expires_at: self.expires_at,
        }
    }
}

impl<V: Send + Sync + 'static> CacheEntry<V> {
    /// Erase the value type for the shared memory tier
    pub(crate) fn erase(self) -> CacheEntry<ErasedValue> {
        self.map(|v| Arc::new(v) as ErasedValue)
    }
}

impl CacheEntry<ErasedValue> {
    /// Recover a typed copy of the value, if the type matches
    pub(crate) fn downcast<V: Clone + 'static>(&self) -> Option<V> {
        self.value.downcast_ref::<V>().cloned()
    }
}
