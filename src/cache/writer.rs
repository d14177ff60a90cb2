//! Durable Writer
//!
//! A single background task applies durable-tier operations in the order
//! they were submitted. `set` only enqueues, so the memory-tier path never
//! waits on storage; `remove` and `clear_all` enqueue and then wait for
//! their own operation to be applied, which keeps them ordered after every
//! earlier write to the same key.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::store::DurableStore;

/// Operation queued for the durable tier
pub(crate) enum DurableOp {
    /// Store record bytes
    Put { key: String, data: Bytes },
    /// Delete the record only if it still holds `observed`
    Evict { key: String, observed: Bytes },
    /// Delete the record
    Remove {
        key: String,
        done: oneshot::Sender<()>,
    },
    /// Delete every record under a prefix
    RemovePrefix {
        prefix: String,
        done: oneshot::Sender<usize>,
    },
    /// Signal once everything queued before it has been applied
    Flush(oneshot::Sender<()>),
}

/// Durable writer counters
#[derive(Debug, Default)]
struct WriterCounters {
    submitted: AtomicU64,
    applied: AtomicU64,
    failed: AtomicU64,
}

impl WriterCounters {
    fn record(&self, ok: bool) {
        if ok {
            self.applied.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Point-in-time writer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WriterStats {
    /// Operations accepted into the queue
    pub submitted: u64,
    /// Operations applied successfully
    pub applied: u64,
    /// Operations the store rejected
    pub failed: u64,
}

impl WriterStats {
    /// Operations still waiting in the queue
    pub fn pending(&self) -> u64 {
        self.submitted
            .saturating_sub(self.applied)
            .saturating_sub(self.failed)
    }
}

/// Handle to the background durable writer
pub struct DurableWriter {
    tx: Mutex<Option<mpsc::UnboundedSender<DurableOp>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<WriterCounters>,
}

impl DurableWriter {
    /// Spawn the writer task on the current Tokio runtime
    pub(crate) fn spawn(store: Arc<dyn DurableStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(WriterCounters::default());
        let handle = tokio::spawn(run(store, rx, counters.clone()));

        Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            counters,
        }
    }

    pub(crate) fn submit(&self, op: DurableOp) -> Result<()> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(Error::WriterStopped)?;
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        tx.send(op).map_err(|_| {
            self.counters.submitted.fetch_sub(1, Ordering::Relaxed);
            Error::WriterStopped
        })
    }

    /// Wait until every operation submitted so far has been applied
    pub async fn flush(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.submit(DurableOp::Flush(done))?;
        wait.await.map_err(|_| Error::WriterStopped)
    }

    pub(crate) async fn remove(&self, key: String) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.submit(DurableOp::Remove { key, done })?;
        wait.await.map_err(|_| Error::WriterStopped)
    }

    pub(crate) async fn remove_prefix(&self, prefix: String) -> Result<usize> {
        let (done, wait) = oneshot::channel();
        self.submit(DurableOp::RemovePrefix { prefix, done })?;
        wait.await.map_err(|_| Error::WriterStopped)
    }

    /// Whether the writer still accepts operations
    pub fn is_running(&self) -> bool {
        self.tx.lock().is_some()
    }

    /// Stop accepting operations, drain the queue and wait for the task
    pub async fn shutdown(&self) {
        // Dropping the sender ends the task once the queue is drained.
        self.tx.lock().take();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Durable writer task ended abnormally: {}", e);
            }
        }
    }

    /// Get writer statistics
    pub fn stats(&self) -> WriterStats {
        WriterStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            applied: self.counters.applied.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

impl Drop for DurableWriter {
    fn drop(&mut self) {
        self.tx.get_mut().take();
    }
}

async fn run(
    store: Arc<dyn DurableStore>,
    mut rx: mpsc::UnboundedReceiver<DurableOp>,
    counters: Arc<WriterCounters>,
) {
    debug!("Durable writer started");

    while let Some(op) = rx.recv().await {
        // Counters are updated before completion is signalled so a woken
        // waiter always observes its own operation in the stats.
        match op {
            DurableOp::Put { key, data } => {
                let ok = match store.set_raw(&key, data).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(key = %key, "Durable write failed, key stays memory-only: {}", e);
                        false
                    }
                };
                counters.record(ok);
            }
            DurableOp::Evict { key, observed } => {
                counters.record(evict(store.as_ref(), &key, &observed).await);
            }
            DurableOp::Remove { key, done } => {
                let ok = match store.remove_raw(&key).await {
                    Ok(_) => true,
                    Err(e) => {
                        warn!(key = %key, "Durable delete failed: {}", e);
                        false
                    }
                };
                counters.record(ok);
                let _ = done.send(());
            }
            DurableOp::RemovePrefix { prefix, done } => {
                let (removed, ok) = remove_prefix(store.as_ref(), &prefix).await;
                counters.record(ok);
                let _ = done.send(removed);
            }
            DurableOp::Flush(done) => {
                counters.record(true);
                let _ = done.send(());
            }
        }
    }

    info!("Durable writer stopped");
}

async fn evict(store: &dyn DurableStore, key: &str, observed: &Bytes) -> bool {
    match store.get_raw(key).await {
        Ok(Some(current)) if current == *observed => match store.remove_raw(key).await {
            Ok(_) => true,
            Err(e) => {
                warn!(key = %key, "Durable eviction failed: {}", e);
                false
            }
        },
        // Rewritten since it was read, or already gone
        Ok(_) => true,
        Err(e) => {
            warn!(key = %key, "Durable eviction read failed: {}", e);
            false
        }
    }
}

async fn remove_prefix(store: &dyn DurableStore, prefix: &str) -> (usize, bool) {
    let keys = match store.list_keys(prefix).await {
        Ok(keys) => keys,
        Err(e) => {
            warn!(prefix = %prefix, "Durable key listing failed: {}", e);
            return (0, false);
        }
    };

    let mut removed = 0;
    let mut ok = true;
    for key in keys {
        match store.remove_raw(&key).await {
            Ok(true) => removed += 1,
            Ok(false) => {}
            Err(e) => {
                warn!(key = %key, "Durable delete failed: {}", e);
                ok = false;
            }
        }
    }
    (removed, ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn test_operations_apply_in_order() {
        let store = Arc::new(InMemoryStore::new());
        let writer = DurableWriter::spawn(store.clone());

        writer
            .submit(DurableOp::Put {
                key: "ns:a".into(),
                data: Bytes::from_static(b"1"),
            })
            .unwrap();
        writer
            .submit(DurableOp::Put {
                key: "ns:a".into(),
                data: Bytes::from_static(b"2"),
            })
            .unwrap();
        writer.flush().await.unwrap();

        assert_eq!(
            store.get_raw("ns:a").await.unwrap(),
            Some(Bytes::from_static(b"2"))
        );

        writer.remove("ns:a".into()).await.unwrap();
        assert!(!store.contains_key("ns:a"));
    }

    #[tokio::test]
    async fn test_evict_skips_rewritten_record() {
        let store = Arc::new(InMemoryStore::new());
        store
            .set_raw("ns:a", Bytes::from_static(b"new"))
            .await
            .unwrap();
        let writer = DurableWriter::spawn(store.clone());

        writer
            .submit(DurableOp::Evict {
                key: "ns:a".into(),
                observed: Bytes::from_static(b"old"),
            })
            .unwrap();
        writer.flush().await.unwrap();
        assert!(store.contains_key("ns:a"));

        writer
            .submit(DurableOp::Evict {
                key: "ns:a".into(),
                observed: Bytes::from_static(b"new"),
            })
            .unwrap();
        writer.flush().await.unwrap();
        assert!(!store.contains_key("ns:a"));
    }

    #[tokio::test]
    async fn test_failed_writes_are_counted() {
        let store = Arc::new(InMemoryStore::new());
        store.set_fail_writes(true);
        let writer = DurableWriter::spawn(store.clone());

        writer
            .submit(DurableOp::Put {
                key: "ns:a".into(),
                data: Bytes::from_static(b"1"),
            })
            .unwrap();
        writer.flush().await.unwrap();

        let stats = writer.stats();
        assert_eq!(stats.submitted, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.applied, 1);
        assert_eq!(stats.pending(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let writer = DurableWriter::spawn(Arc::new(InMemoryStore::new()));
        assert!(writer.is_running());

        writer.shutdown().await;
        assert!(!writer.is_running());
        assert!(matches!(writer.flush().await, Err(Error::WriterStopped)));
    }
}
