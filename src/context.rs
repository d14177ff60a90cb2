//! Cache Context
//!
//! Owns the process-wide pieces every cache shares: the durable store, the
//! memory tier, the wall clock and the background durable writer. Create one
//! at startup inside a Tokio runtime, hand clones to whatever needs a cache,
//! and call [`CacheContext::shutdown`] before exit so queued writes land.

use std::sync::Arc;

use tracing::info;

use crate::cache::{CacheConfig, DurableWriter, MemoryTier, TieredCache, WriterStats};
use crate::clock::{Clock, SystemClock, Timestamp};
use crate::error::Result;
use crate::store::{DurableStore, InMemoryStore};

struct Shared {
    store: Arc<dyn DurableStore>,
    memory: MemoryTier,
    clock: Arc<dyn Clock>,
    writer: DurableWriter,
}

/// Shared state behind every [`TieredCache`]
///
/// Cheap to clone; clones refer to the same tiers.
#[derive(Clone)]
pub struct CacheContext {
    shared: Arc<Shared>,
}

impl CacheContext {
    /// Create a context over `store` using the system clock
    ///
    /// Must be called within a Tokio runtime: the durable writer task is
    /// spawned here.
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    /// Create a context with an explicit clock
    pub fn with_clock(store: Arc<dyn DurableStore>, clock: Arc<dyn Clock>) -> Self {
        let writer = DurableWriter::spawn(store.clone());
        info!("Cache context initialized");

        Self {
            shared: Arc::new(Shared {
                store,
                memory: MemoryTier::new(),
                clock,
                writer,
            }),
        }
    }

    /// Create a context over a fresh in-memory store
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStore::new()))
    }

    /// Create a cache for a namespace
    pub fn cache(&self, config: CacheConfig) -> Result<TieredCache> {
        TieredCache::new(self.clone(), config)
    }

    /// Get the durable store
    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.shared.store
    }

    /// Get the shared memory tier
    pub fn memory(&self) -> &MemoryTier {
        &self.shared.memory
    }

    /// Get the durable writer
    pub fn writer(&self) -> &DurableWriter {
        &self.shared.writer
    }

    /// Current wall-clock time in epoch millis
    pub fn now(&self) -> Timestamp {
        self.shared.clock.now_millis()
    }

    /// Get durable writer statistics
    pub fn writer_stats(&self) -> WriterStats {
        self.shared.writer.stats()
    }

    /// Wait until all queued durable operations have been applied
    pub async fn flush(&self) -> Result<()> {
        self.shared.writer.flush().await
    }

    /// Drain queued durable writes and stop the writer
    ///
    /// Caches keep working afterwards. New writes stay in memory only, while
    /// `remove` and `clear_all` delete durable records directly.
    pub async fn shutdown(&self) {
        self.shared.writer.shutdown().await;
        info!("Cache context shut down");
    }
}

impl std::fmt::Debug for CacheContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheContext")
            .field("memory_entries", &self.shared.memory.len())
            .field("writer_running", &self.shared.writer.is_running())
            .finish()
    }
}
