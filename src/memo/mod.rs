//! Result Memoizer
//!
//! Wraps a pure function so repeat calls with the same arguments skip the
//! computation. Results are keyed by a fingerprint of the arguments and kept
//! in a bounded [`LruTable`]; there is no expiry, since a pure function's
//! result never goes stale. Memory is the only bound.
//!
//! The default fingerprint is the JSON serialization of the arguments.
//! Supply a custom one when structural equality is the wrong hit criterion,
//! e.g. rounding coordinates before comparing them.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{Error, Result};

mod lru;

pub use lru::LruTable;

/// Default maximum number of memoized results
pub const DEFAULT_MEMO_SIZE: usize = 100;

/// Memoizer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoConfig {
    /// Maximum number of cached results
    pub max_size: usize,
}

impl Default for MemoConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MEMO_SIZE,
        }
    }
}

impl MemoConfig {
    /// Check the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::Config("memo max_size must be at least 1".into()));
        }
        Ok(())
    }
}

/// Memoizer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoStats {
    /// Calls answered from the table
    pub hits: u64,
    /// Calls that ran the function
    pub misses: u64,
    /// Entries evicted to make room
    pub evictions: u64,
    /// Current number of entries
    pub size: usize,
}

/// A memoized pure function
pub struct Memoizer<A: ?Sized, R> {
    func: Box<dyn Fn(&A) -> R + Send + Sync>,
    fingerprint: Box<dyn Fn(&A) -> Result<String> + Send + Sync>,
    table: Mutex<LruTable<R>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Memoize `func` with the default fingerprint
pub fn memoize<A, R, F>(func: F, max_size: usize) -> Memoizer<A, R>
where
    A: Serialize + ?Sized,
    R: Clone,
    F: Fn(&A) -> R + Send + Sync + 'static,
{
    Memoizer::new(func, max_size)
}

impl<A: ?Sized, R: Clone> Memoizer<A, R> {
    /// Memoize `func`, fingerprinting arguments by JSON serialization
    pub fn new<F>(func: F, max_size: usize) -> Self
    where
        A: Serialize,
        F: Fn(&A) -> R + Send + Sync + 'static,
    {
        Self::build(
            Box::new(func),
            Box::new(|args: &A| {
                serde_json::to_string(args).map_err(|e| Error::Fingerprint(e.to_string()))
            }),
            max_size,
        )
    }

    /// Memoize `func` with the default fingerprint, sized from `config`
    pub fn from_config<F>(func: F, config: &MemoConfig) -> Result<Self>
    where
        A: Serialize,
        F: Fn(&A) -> R + Send + Sync + 'static,
    {
        config.validate()?;
        Ok(Self::new(func, config.max_size))
    }

    /// Memoize `func` with a caller-supplied fingerprint
    pub fn with_fingerprint<F, P>(func: F, fingerprint: P, max_size: usize) -> Self
    where
        F: Fn(&A) -> R + Send + Sync + 'static,
        P: Fn(&A) -> String + Send + Sync + 'static,
    {
        Self::build(
            Box::new(func),
            Box::new(move |args: &A| Ok(fingerprint(args))),
            max_size,
        )
    }

    fn build(
        func: Box<dyn Fn(&A) -> R + Send + Sync>,
        fingerprint: Box<dyn Fn(&A) -> Result<String> + Send + Sync>,
        max_size: usize,
    ) -> Self {
        Self {
            func,
            fingerprint,
            table: Mutex::new(LruTable::new(max_size)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Call the function, reusing a cached result for a known fingerprint
    ///
    /// Only fails when the arguments cannot be fingerprinted.
    pub fn call(&self, args: &A) -> Result<R> {
        let key = (self.fingerprint)(args)?;

        if let Some(value) = self.table.lock().get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value.clone());
        }

        // Computed without the lock held; a concurrent caller with the same
        // fingerprint may compute too, and the last insert wins.
        self.misses.fetch_add(1, Ordering::Relaxed);
        let value = (self.func)(args);

        if let Some((evicted, _)) = self.table.lock().insert(key, value.clone()) {
            trace!(fingerprint = %evicted, "Evicted memoized result");
        }
        Ok(value)
    }

    /// Empty the table; later calls recompute
    pub fn clear_cache(&self) {
        self.table.lock().clear();
    }

    /// Number of cached results
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    /// Maximum number of cached results
    pub fn max_size(&self) -> usize {
        self.table.lock().max_size()
    }

    /// Get memoizer statistics
    pub fn stats(&self) -> MemoStats {
        let table = self.table.lock();
        MemoStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: table.evictions(),
            size: table.len(),
        }
    }
}

impl<A: ?Sized, R> std::fmt::Debug for Memoizer<A, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memoizer")
            .field("hits", &self.hits.load(Ordering::Relaxed))
            .field("misses", &self.misses.load(Ordering::Relaxed))
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
