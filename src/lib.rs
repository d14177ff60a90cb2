//! Larder - Tiered Caching and Call-Coalescing Layer
//!
//! A client-side performance layer that keeps expensive or remote data close
//! at hand and decides when updates are allowed to travel.
//!
//! # Architecture
//!
//! ```text
//!            ┌───────────────────────────────────────────────┐
//!  callers ─▶│ Call Coalescer (debounce / throttle / batch)  │
//!            └───────────────┬───────────────────────────────┘
//!                            ▼
//!  ┌──────────────────┐   ┌──────────────────────────────────┐
//!  │ Result Memoizer  │   │ Tiered Cache                     │
//!  │ (LRU, no TTL)    │   │ memory tier ─▶ durable tier (TTL)│
//!  └──────────────────┘   └───────────────┬──────────────────┘
//!                                         ▼
//!                            ┌────────────────────────┐
//!                            │ Durable Store Adapter  │
//!                            └────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Two-tier cache with TTL expiry
//! - [`clock`] - Wall-clock abstraction for TTL arithmetic
//! - [`coalesce`] - Debounce, throttle and batch primitives
//! - [`config`] - YAML configuration
//! - [`context`] - Shared tiers and the durable writer
//! - [`error`] - Error types
//! - [`location`] - Timeout-bounded geolocation with fallback
//! - [`memo`] - LRU memoization of pure functions
//! - [`store`] - Durable store adapters and the record format

use std::time::Duration;

pub mod cache;
pub mod clock;
pub mod coalesce;
pub mod config;
pub mod context;
pub mod error;
pub mod location;
pub mod memo;
pub mod store;

// Re-export commonly used types
pub use cache::{CacheConfig, CacheEntry, CacheStatsSnapshot, TieredCache};
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use coalesce::{BatchCollector, CoalescerState, DebounceMode, Debouncer, Throttle};
pub use config::LarderConfig;
pub use context::CacheContext;
pub use error::{Error, Result};
pub use location::{Coordinate, LocationConfig, LocationFix, LocationService, LocationSource};
pub use memo::{memoize, MemoConfig, Memoizer};
pub use store::{DurableStore, FileStore, InMemoryStore};

/// Time-to-live applied when a write does not name one
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Namespace used when none is configured
pub const DEFAULT_NAMESPACE: &str = "larder";
