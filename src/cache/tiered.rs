//! Tiered Cache - memory tier over a durable store
//!
//! Reads check the memory tier first and only fall back to the durable tier
//! on a miss, repopulating memory on a durable hit. Writes land in memory
//! synchronously and reach the durable tier through the context's ordered
//! background writer.
//!
//! Storage trouble never reaches the caller: failures are logged, counted
//! and turned into misses or memory-only entries.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::entry::{CacheEntry, ErasedValue};
use super::memory::{MemoryLookup, Repopulate};
use super::metrics::{CacheStats, CacheStatsSnapshot};
use super::writer::DurableOp;
use crate::clock::Timestamp;
use crate::context::CacheContext;
use crate::error::{Error, Result};
use crate::store::{codec, StoredRecord};
use crate::{DEFAULT_NAMESPACE, DEFAULT_TTL};

/// Separator between namespace and key in durable keys
pub const NAMESPACE_SEPARATOR: char = ':';

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Namespace owning this cache's keys
    pub namespace: String,
    /// TTL applied when `set` is given none
    #[serde(with = "crate::config::duration_millis", rename = "default_ttl_ms")]
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            default_ttl: DEFAULT_TTL,
        }
    }
}

impl CacheConfig {
    /// Config for a namespace with the default TTL
    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    /// Set the default TTL
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Check the namespace can be used as a key prefix
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::Config("cache namespace must not be empty".into()));
        }
        if self.namespace.contains(NAMESPACE_SEPARATOR) {
            return Err(Error::Config(format!(
                "cache namespace '{}' must not contain '{}'",
                self.namespace, NAMESPACE_SEPARATOR
            )));
        }
        if self.default_ttl.is_zero() {
            return Err(Error::Config("default TTL must be positive".into()));
        }
        Ok(())
    }
}

/// Namespaced two-tier cache
///
/// Cheap to clone; clones share statistics. Separate caches on the same
/// namespace share entries through the context's memory tier.
#[derive(Clone)]
pub struct TieredCache {
    ctx: CacheContext,
    namespace: Arc<str>,
    prefix: Arc<str>,
    default_ttl: Duration,
    stats: Arc<CacheStats>,
}

impl TieredCache {
    pub(crate) fn new(ctx: CacheContext, config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let prefix = format!("{}{}", config.namespace, NAMESPACE_SEPARATOR);

        Ok(Self {
            ctx,
            namespace: Arc::from(config.namespace),
            prefix: Arc::from(prefix),
            default_ttl: config.default_ttl,
            stats: Arc::new(CacheStats::new()),
        })
    }

    /// Namespace of this cache
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// TTL used when `set` is given none
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn durable_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Store `value` under `key` for `ttl` (default TTL when `None`)
    ///
    /// The memory tier is updated before this returns; the durable write is
    /// queued. Never fails: if the value cannot be encoded or the writer is
    /// stopped, the key is cached in memory only.
    pub fn set<V>(&self, key: &str, value: V, ttl: Option<Duration>)
    where
        V: Serialize + Send + Sync + 'static,
    {
        let durable_key = self.durable_key(key);
        let entry = CacheEntry::new(value, self.ctx.now(), ttl.unwrap_or(self.default_ttl));
        self.stats.record_write();

        match codec::encode(entry.stored_at(), entry.expires_at(), entry.value()) {
            Ok(data) => {
                let op = DurableOp::Put {
                    key: durable_key.clone(),
                    data,
                };
                if let Err(e) = self.ctx.writer().submit(op) {
                    self.stats.record_storage_failure();
                    warn!(key = %durable_key, "Durable write not queued, caching in memory only: {}", e);
                }
            }
            Err(e) => {
                self.stats.record_storage_failure();
                warn!(key = %durable_key, "Value not serializable, caching in memory only: {}", e);
            }
        }

        self.ctx.memory().insert(durable_key, entry.erase());
    }

    /// Look up `key` in the memory tier only
    ///
    /// Never suspends. Expired entries found here are removed.
    pub fn get_memory<V>(&self, key: &str) -> Option<V>
    where
        V: Clone + Send + Sync + 'static,
    {
        let durable_key = self.durable_key(key);
        self.get_memory_inner(&durable_key, key)
    }

    fn get_memory_inner<V>(&self, durable_key: &str, key: &str) -> Option<V>
    where
        V: Clone + Send + Sync + 'static,
    {
        match self.ctx.memory().lookup(durable_key, self.ctx.now()) {
            MemoryLookup::Hit(entry) => self.typed_hit(&entry, key),
            MemoryLookup::Expired => {
                self.stats.record_expiration();
                self.stats.record_memory_miss();
                None
            }
            MemoryLookup::Absent => {
                self.stats.record_memory_miss();
                None
            }
        }
    }

    fn typed_hit<V>(&self, entry: &CacheEntry<ErasedValue>, key: &str) -> Option<V>
    where
        V: Clone + 'static,
    {
        match entry.downcast::<V>() {
            Some(value) => {
                self.stats.record_memory_hit();
                Some(value)
            }
            None => {
                self.stats.record_type_mismatch();
                warn!(key = %key, namespace = %self.namespace, "Cached value has a different type");
                None
            }
        }
    }

    /// Look up `key`, consulting the durable tier on a memory miss
    ///
    /// A memory hit returns without awaiting anything. A durable hit is
    /// copied into the memory tier with its original expiry.
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn get<V>(&self, key: &str) -> Option<V>
    where
        V: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let durable_key = self.durable_key(key);

        // A live entry of another type is newer than anything durable; do not
        // let the durable copy override it.
        match self.ctx.memory().lookup(&durable_key, self.ctx.now()) {
            MemoryLookup::Hit(entry) => return self.typed_hit(&entry, key),
            MemoryLookup::Expired => {
                self.stats.record_expiration();
                self.stats.record_memory_miss();
            }
            MemoryLookup::Absent => self.stats.record_memory_miss(),
        }

        let seen = self.ctx.memory().removal_epoch();
        let entry = self.read_durable::<V>(&durable_key).await?;

        match self.ctx.memory().repopulate(
            durable_key.clone(),
            entry.clone().erase(),
            self.ctx.now(),
            seen,
        ) {
            Repopulate::Inserted => {
                debug!(key = %key, "Durable hit, memory tier repopulated");
                Some(entry.into_value())
            }
            // A set landed while the durable read was in flight.
            Repopulate::Occupied => self.get_memory_inner(&durable_key, key),
            // The read predates a removal; answer it but do not cache it.
            Repopulate::Stale => {
                debug!(key = %key, "Durable hit predates a removal, not cached");
                Some(entry.into_value())
            }
        }
    }

    async fn read_durable<V>(&self, durable_key: &str) -> Option<CacheEntry<V>>
    where
        V: DeserializeOwned,
    {
        let raw = match self.ctx.store().get_raw(durable_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.stats.record_durable_miss();
                return None;
            }
            Err(e) => {
                self.stats.record_storage_failure();
                self.stats.record_durable_miss();
                warn!(key = %durable_key, "Durable read failed, treating as miss: {}", e);
                return None;
            }
        };

        let record = match StoredRecord::decode(durable_key, &raw) {
            Ok(record) => record,
            Err(e) => {
                self.stats.record_corrupt_record();
                self.stats.record_durable_miss();
                warn!(key = %durable_key, "Deleting corrupt durable record: {}", e);
                self.evict_durable(durable_key, raw);
                return None;
            }
        };

        if record.is_expired_at(self.ctx.now()) {
            self.stats.record_expiration();
            self.stats.record_durable_miss();
            debug!(key = %durable_key, "Durable record expired");
            self.evict_durable(durable_key, raw);
            return None;
        }

        match record.into_typed::<V>() {
            Ok(typed) => {
                self.stats.record_durable_hit();
                Some(CacheEntry::from_parts(
                    typed.value,
                    typed.stored_at,
                    typed.expires_at,
                ))
            }
            Err(e) => {
                self.stats.record_type_mismatch();
                self.stats.record_durable_miss();
                warn!(key = %durable_key, "Durable value does not decode as requested type: {}", e);
                None
            }
        }
    }

    fn evict_durable(&self, durable_key: &str, observed: bytes::Bytes) {
        let op = DurableOp::Evict {
            key: durable_key.to_string(),
            observed,
        };
        if let Err(e) = self.ctx.writer().submit(op) {
            warn!(key = %durable_key, "Durable eviction not queued: {}", e);
        }
    }

    /// Whether `get` would currently find `key`, whatever its type
    pub async fn contains(&self, key: &str) -> bool {
        let durable_key = self.durable_key(key);
        let now = self.ctx.now();

        match self.ctx.memory().lookup(&durable_key, now) {
            MemoryLookup::Hit(_) => return true,
            MemoryLookup::Expired | MemoryLookup::Absent => {}
        }

        self.is_live_durable(&durable_key, now).await
    }

    async fn is_live_durable(&self, durable_key: &str, now: Timestamp) -> bool {
        match self.ctx.store().get_raw(durable_key).await {
            Ok(Some(raw)) => StoredRecord::decode(durable_key, &raw)
                .map(|record| !record.is_expired_at(now))
                .unwrap_or(false),
            Ok(None) => false,
            Err(e) => {
                warn!(key = %durable_key, "Durable read failed: {}", e);
                false
            }
        }
    }

    /// Delete `key` from both tiers; a no-op if absent
    ///
    /// Once the writer has stopped the durable record is deleted directly.
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn remove(&self, key: &str) {
        let durable_key = self.durable_key(key);
        let _removal = self.ctx.memory().begin_removal();
        self.ctx.memory().remove(&durable_key);

        let result = match self.ctx.writer().remove(durable_key.clone()).await {
            Err(Error::WriterStopped) => {
                self.ctx.store().remove_raw(&durable_key).await.map(drop)
            }
            other => other,
        };
        if let Err(e) = result {
            self.stats.record_storage_failure();
            warn!(key = %key, "Durable delete not applied: {}", e);
        }
    }

    /// Delete every key in this namespace from both tiers
    ///
    /// Keys of other namespaces sharing the store are untouched. Returns the
    /// number of durable records removed.
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn clear_all(&self) -> usize {
        let _removal = self.ctx.memory().begin_removal();
        let from_memory = self.ctx.memory().remove_prefix(&self.prefix);

        let result = match self.ctx.writer().remove_prefix(self.prefix.to_string()).await {
            Err(Error::WriterStopped) => self.remove_prefix_direct().await,
            other => other,
        };
        match result {
            Ok(from_durable) => {
                debug!(from_memory, from_durable, "Namespace cleared");
                from_durable
            }
            Err(e) => {
                self.stats.record_storage_failure();
                warn!("Durable clear not applied: {}", e);
                0
            }
        }
    }

    async fn remove_prefix_direct(&self) -> Result<usize> {
        let store = self.ctx.store();
        let mut removed = 0;
        for key in store.list_keys(&self.prefix).await? {
            if store.remove_raw(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Live keys of this namespace across both tiers, without the prefix
    ///
    /// Durable records are decoded so expired or corrupt ones are left out;
    /// they are deleted the next time `get` reads them.
    pub async fn keys(&self) -> Vec<String> {
        let now = self.ctx.now();
        let mut keys = self.ctx.memory().keys_with_prefix(&self.prefix, now);

        match self.ctx.store().list_keys(&self.prefix).await {
            Ok(durable) => {
                for key in durable {
                    if self.is_live_durable(&key, now).await {
                        keys.push(key);
                    }
                }
            }
            Err(e) => warn!(namespace = %self.namespace, "Durable key listing failed: {}", e),
        }

        let mut keys: Vec<String> = keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&*self.prefix).map(str::to_string))
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Get a statistics snapshot
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Wait until all queued durable writes have been applied
    pub async fn flush(&self) {
        if let Err(e) = self.ctx.writer().flush().await {
            warn!("Durable flush failed: {}", e);
        }
    }
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("namespace", &self.namespace)
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
