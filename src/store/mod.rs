//! Durable Store Adapter
//!
//! Byte-level key/value persistence underneath the tiered cache. A store has
//! no notion of expiry; TTL bookkeeping lives in the record envelope defined
//! by [`codec`] and is enforced by the cache.
//!
//! # Backends
//!
//! - [`InMemoryStore`] - DashMap-backed, for tests and ephemeral sessions
//! - [`FileStore`] - one file per key under a directory, survives restarts
//!
//! A store may be shared by several cache namespaces. Every namespace only
//! touches keys under its own prefix, so `list_keys(prefix)` is the one
//! enumeration primitive a backend needs.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

pub mod codec;
mod file;
mod memory;

pub use codec::{StoredRecord, RECORD_VERSION};
pub use file::FileStore;
pub use memory::InMemoryStore;

/// Durable key/value storage backend
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Read the raw bytes stored under `key`
    async fn get_raw(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store raw bytes under `key`, replacing any previous value
    async fn set_raw(&self, key: &str, data: Bytes) -> Result<()>;

    /// Remove `key`; returns whether something was removed
    async fn remove_raw(&self, key: &str) -> Result<bool>;

    /// List every stored key starting with `prefix`
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Get storage statistics
    fn stats(&self) -> DurableStoreStats;
}

/// Durable store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DurableStoreStats {
    /// Total records stored
    pub object_count: u64,
    /// Total bytes stored
    pub total_bytes: u64,
    /// Read operations
    pub reads: u64,
    /// Write operations
    pub writes: u64,
    /// Delete operations
    pub deletes: u64,
    /// Key listings
    pub listings: u64,
}
