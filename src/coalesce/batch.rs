//! Batch Collector
//!
//! Accumulates items and hands them to an asynchronous `process_batch` as
//! one batch, either as soon as `max_batch_size` items are queued or `delay`
//! after the first item of the batch arrived, whichever comes first.
//!
//! Batches are handed to a single dispatcher task and processed in order.
//! The queue is swapped out atomically with dispatch, so an item added while
//! `process_batch` is running always lands in the next batch.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{CoalescerState, TimerSlot};
use crate::error::{Error, Result};

enum Dispatch<T> {
    Batch(Vec<T>),
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct BatchCounters {
    dispatched: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    items: AtomicU64,
    cancelled_items: AtomicU64,
}

/// Point-in-time collector statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    /// Batches handed to the dispatcher
    pub dispatched: u64,
    /// Batches `process_batch` accepted
    pub processed: u64,
    /// Batches `process_batch` rejected
    pub failed: u64,
    /// Items across all dispatched batches
    pub items: u64,
    /// Items dropped by `cancel` or because the dispatcher had stopped
    pub cancelled_items: u64,
}

impl BatchStats {
    /// Batches dispatched but not yet finished
    pub fn in_flight(&self) -> u64 {
        self.dispatched
            .saturating_sub(self.processed)
            .saturating_sub(self.failed)
    }
}

struct Queue<T> {
    items: Vec<T>,
    timer: TimerSlot,
}

struct Shared<T> {
    queue: Mutex<Queue<T>>,
    tx: mpsc::UnboundedSender<Dispatch<T>>,
    counters: Arc<BatchCounters>,
}

impl<T> Shared<T> {
    /// Take the queued items and hand them to the dispatcher
    ///
    /// Must be called with the queue locked so the swap and the send are one
    /// step; the channel send never blocks.
    fn dispatch_locked(&self, queue: &mut Queue<T>) {
        queue.timer.disarm();
        if queue.items.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut queue.items);
        let size = batch.len();

        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(Dispatch::Batch(batch)).is_err() {
            self.counters.dispatched.fetch_sub(1, Ordering::Relaxed);
            self.counters
                .cancelled_items
                .fetch_add(size as u64, Ordering::Relaxed);
            warn!(size, "Batch dispatcher stopped, dropping batch");
            return;
        }
        self.counters.items.fetch_add(size as u64, Ordering::Relaxed);
    }
}

/// Groups items into batches for an asynchronous handler
pub struct BatchCollector<T> {
    shared: Arc<Shared<T>>,
    dispatcher: JoinHandle<()>,
    delay: Duration,
    max_batch_size: usize,
}

impl<T> BatchCollector<T>
where
    T: Send + 'static,
{
    /// Create a collector and spawn its dispatcher on the current runtime
    ///
    /// `max_batch_size` is clamped to at least 1.
    pub fn new<F, Fut>(delay: Duration, max_batch_size: usize, process_batch: F) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(BatchCounters::default());
        let dispatcher = tokio::spawn(run(process_batch, rx, counters.clone()));

        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue {
                    items: Vec::new(),
                    timer: TimerSlot::default(),
                }),
                tx,
                counters,
            }),
            dispatcher,
            delay,
            max_batch_size: max_batch_size.max(1),
        }
    }

    /// Queue an item
    pub fn add(&self, item: T) {
        let mut queue = self.shared.queue.lock();
        queue.items.push(item);

        if queue.items.len() >= self.max_batch_size {
            self.shared.dispatch_locked(&mut queue);
        } else if !queue.timer.is_armed() {
            let shared = self.shared.clone();
            let delay = self.delay;
            queue.timer.arm(move |generation| async move {
                tokio::time::sleep(delay).await;
                let mut queue = shared.queue.lock();
                if queue.timer.fire(generation) {
                    shared.dispatch_locked(&mut queue);
                }
            });
        }
    }

    /// Dispatch whatever is queued now and wait until every batch handed
    /// to the dispatcher so far has been processed
    pub async fn flush(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        {
            let mut queue = self.shared.queue.lock();
            self.shared.dispatch_locked(&mut queue);
            self.shared
                .tx
                .send(Dispatch::Flush(done))
                .map_err(|_| Error::DispatcherStopped)?;
        }
        wait.await.map_err(|_| Error::DispatcherStopped)
    }

    /// Drop queued items without dispatching them
    ///
    /// Batches already dispatched still run. Returns the number of items
    /// dropped.
    pub fn cancel(&self) -> usize {
        let mut queue = self.shared.queue.lock();
        queue.timer.disarm();
        let dropped = std::mem::take(&mut queue.items).len();
        self.shared
            .counters
            .cancelled_items
            .fetch_add(dropped as u64, Ordering::Relaxed);
        if dropped > 0 {
            debug!(dropped, "Cancelled pending batch");
        }
        dropped
    }

    /// Items waiting for the next batch
    pub fn pending_len(&self) -> usize {
        self.shared.queue.lock().items.len()
    }

    /// Current lifecycle state
    pub fn state(&self) -> CoalescerState {
        let queued = !self.shared.queue.lock().items.is_empty();
        if queued {
            CoalescerState::Pending
        } else if self.stats().in_flight() > 0 {
            CoalescerState::Released
        } else {
            CoalescerState::Idle
        }
    }

    /// Get collector statistics
    pub fn stats(&self) -> BatchStats {
        let c = &self.shared.counters;
        BatchStats {
            dispatched: c.dispatched.load(Ordering::Relaxed),
            processed: c.processed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            items: c.items.load(Ordering::Relaxed),
            cancelled_items: c.cancelled_items.load(Ordering::Relaxed),
        }
    }

    /// Maximum items per batch
    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Time a partial batch may wait
    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl<T> Drop for BatchCollector<T> {
    fn drop(&mut self) {
        // Batches already handed to the dispatcher still run; it exits once
        // the last sender is gone.
        let mut queue = self.shared.queue.lock();
        queue.timer.disarm();
        let dropped = std::mem::take(&mut queue.items).len();
        if dropped > 0 {
            debug!(dropped, "Batch collector dropped with pending items");
        }
    }
}

impl<T> std::fmt::Debug for BatchCollector<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCollector")
            .field("delay", &self.delay)
            .field("max_batch_size", &self.max_batch_size)
            .field("dispatcher_running", &!self.dispatcher.is_finished())
            .finish()
    }
}

async fn run<T, F, Fut>(
    process_batch: F,
    mut rx: mpsc::UnboundedReceiver<Dispatch<T>>,
    counters: Arc<BatchCounters>,
) where
    F: Fn(Vec<T>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    while let Some(dispatch) = rx.recv().await {
        match dispatch {
            Dispatch::Batch(batch) => {
                let size = batch.len();
                debug!(size, "Processing batch");
                match process_batch(batch).await {
                    Ok(()) => {
                        counters.processed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(size, "Batch processing failed: {}", e);
                    }
                }
            }
            Dispatch::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Batch dispatcher stopped");
}
