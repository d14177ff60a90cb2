//! Two-Tiered Cache System
//!
//! A fast memory tier in front of a durable store, with TTL expiry.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          TieredCache (per namespace)                      │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  Memory Tier (shared)            │  Durable Tier (shared)                 │
//! │  ┌────────────────────────────┐  │  ┌───────────────────────────────┐     │
//! │  │ DashMap<key, CacheEntry>   │  │  │ DurableStore (file, in-memory)│     │
//! │  │ sync reads, no capacity    │  │  │ JSON record envelope          │     │
//! │  └────────────────────────────┘  │  └───────────────────────────────┘     │
//! │         ▲           │            │               ▲                        │
//! │         │ repopulate│ set        │               │ ordered writes         │
//! │         └───────────┴────────────┴──── DurableWriter task ────────────────│
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - `expires_at > stored_at` for every entry; `now >= expires_at` is a miss
//! - Memory-tier hits never await
//! - Durable writes from one context apply in submission order
//! - A durable copy never overrides a live memory entry
//! - Storage failures never reach the caller

mod entry;
mod memory;
mod metrics;
mod tiered;
mod writer;

pub use entry::CacheEntry;
pub use memory::MemoryTier;
pub use metrics::{CacheStats, CacheStatsSnapshot};
pub use tiered::{CacheConfig, TieredCache, NAMESPACE_SEPARATOR};
pub use writer::{DurableWriter, WriterStats};
