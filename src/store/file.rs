//! File-backed durable store
//!
//! Each key becomes one file under the root directory, its name the
//! percent-encoded key plus a `.rec` suffix. Writes go to a temporary file
//! first and are renamed into place so a crash never leaves a half-written
//! record under the real name.
//!
//! Record count and size are taken from a directory scan when the store is
//! opened and kept up to date by this handle's own writes and deletes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tracing::{debug, instrument};

use super::{DurableStore, DurableStoreStats};
use crate::error::{Error, Result};

const RECORD_SUFFIX: &str = ".rec";
const TEMP_SUFFIX: &str = ".tmp";

/// Durable store persisting records as files in a directory
pub struct FileStore {
    root: PathBuf,
    object_count: AtomicU64,
    total_bytes: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    listings: AtomicU64,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        let mut object_count = 0;
        let mut total_bytes = 0;
        let mut dir = fs::read_dir(&root).await?;
        while let Some(entry) = dir.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if Self::key_from_file_name(name).is_some() {
                    object_count += 1;
                    total_bytes += entry.metadata().await?.len();
                }
            }
        }
        debug!(root = %root.display(), object_count, total_bytes, "Opened file store");

        Ok(Self {
            root,
            object_count: AtomicU64::new(object_count),
            total_bytes: AtomicU64::new(total_bytes),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            listings: AtomicU64::new(0),
        })
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root
            .join(format!("{}{}", urlencoding::encode(key), RECORD_SUFFIX))
    }

    fn key_from_file_name(name: &str) -> Option<String> {
        let encoded = name.strip_suffix(RECORD_SUFFIX)?;
        urlencoding::decode(encoded).ok().map(|k| k.into_owned())
    }

    /// Size of the record at `path`, `None` if there is none
    async fn record_len(path: &Path) -> Option<u64> {
        fs::metadata(path).await.ok().map(|m| m.len())
    }

    fn record_removed(&self, len: u64) {
        saturating_sub(&self.object_count, 1);
        saturating_sub(&self.total_bytes, len);
    }
}

fn saturating_sub(counter: &AtomicU64, by: u64) {
    // The closure always returns Some, so the update cannot fail.
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_sub(by))
    });
}

#[async_trait]
impl DurableStore for FileStore {
    #[instrument(skip(self), level = "trace")]
    async fn get_raw(&self, key: &str) -> Result<Option<Bytes>> {
        self.reads.fetch_add(1, Ordering::Relaxed);

        match fs::read(self.path_for(key)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::storage(key, e)),
        }
    }

    #[instrument(skip(self, data), fields(size = data.len()), level = "trace")]
    async fn set_raw(&self, key: &str, data: Bytes) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);

        let path = self.path_for(key);
        let mut temp = path.clone().into_os_string();
        temp.push(TEMP_SUFFIX);
        let temp = PathBuf::from(temp);
        let previous = Self::record_len(&path).await;

        fs::write(&temp, &data)
            .await
            .map_err(|e| Error::storage(key, e))?;
        fs::rename(&temp, &path)
            .await
            .map_err(|e| Error::storage(key, e))?;

        if let Some(len) = previous {
            self.record_removed(len);
        }
        self.object_count.fetch_add(1, Ordering::Relaxed);
        self.total_bytes
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    #[instrument(skip(self), level = "trace")]
    async fn remove_raw(&self, key: &str) -> Result<bool> {
        self.deletes.fetch_add(1, Ordering::Relaxed);

        let path = self.path_for(key);
        let previous = Self::record_len(&path).await;
        match fs::remove_file(&path).await {
            Ok(()) => {
                self.record_removed(previous.unwrap_or(0));
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::storage(key, e)),
        }
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.listings.fetch_add(1, Ordering::Relaxed);

        let mut dir = fs::read_dir(&self.root).await?;
        let mut keys = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(key) = Self::key_from_file_name(name) {
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn stats(&self) -> DurableStoreStats {
        DurableStoreStats {
            object_count: self.object_count.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            listings: self.listings.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_store_round_trip_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = FileStore::open(dir.path()).await.unwrap();
            store
                .set_raw("larder:vendor/42?x=1", Bytes::from_static(b"{}"))
                .await
                .unwrap();
        }

        let store = FileStore::open(dir.path()).await.unwrap();
        assert_eq!(
            store.get_raw("larder:vendor/42?x=1").await.unwrap(),
            Some(Bytes::from_static(b"{}"))
        );
        assert_eq!(
            store.list_keys("larder:").await.unwrap(),
            vec!["larder:vendor/42?x=1"]
        );
    }

    #[tokio::test]
    async fn test_file_store_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();

        store
            .set_raw("a:1", Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert!(store.remove_raw("a:1").await.unwrap());
        assert!(!store.remove_raw("a:1").await.unwrap());
        assert!(store.get_raw("a:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_list_filters_prefix_and_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();

        store.set_raw("a:1", Bytes::from_static(b"x")).await.unwrap();
        store.set_raw("b:1", Bytes::from_static(b"x")).await.unwrap();
        tokio::fs::write(dir.path().join("a%3A2.rec.tmp"), b"partial")
            .await
            .unwrap();

        assert_eq!(store.list_keys("a:").await.unwrap(), vec!["a:1"]);
        assert_eq!(store.stats().listings, 1);
    }

    #[tokio::test]
    async fn test_file_store_stats_track_records() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = FileStore::open(dir.path()).await.unwrap();
            store.set_raw("a:1", Bytes::from_static(b"xxxx")).await.unwrap();
            store.set_raw("a:2", Bytes::from_static(b"yy")).await.unwrap();
            // Overwrite replaces the old size
            store.set_raw("a:1", Bytes::from_static(b"z")).await.unwrap();

            let stats = store.stats();
            assert_eq!(stats.object_count, 2);
            assert_eq!(stats.total_bytes, 3);
        }

        // Counted again from the directory on reopen
        let store = FileStore::open(dir.path()).await.unwrap();
        assert_eq!(store.stats().object_count, 2);
        assert_eq!(store.stats().total_bytes, 3);

        assert!(store.remove_raw("a:2").await.unwrap());
        assert!(!store.remove_raw("a:2").await.unwrap());
        let stats = store.stats();
        assert_eq!(stats.object_count, 1);
        assert_eq!(stats.total_bytes, 1);
    }
}
