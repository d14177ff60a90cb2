//! Debouncer
//!
//! Releases a value only once the input has stopped changing for `delay`.
//! Every push resets the timer. In trailing mode the last value of a burst
//! is released when the burst goes quiet; in leading mode the first value is
//! released immediately and the rest of the burst is suppressed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::trace;

use super::{CoalescerState, TimerSlot};

/// Which value of a burst is released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebounceMode {
    /// Release the last value once the burst is quiet
    #[default]
    Trailing,
    /// Release the first value at once, suppress until quiet
    Leading,
}

struct Inner {
    timer: TimerSlot,
    state: CoalescerState,
}

struct Shared<T> {
    inner: Mutex<Inner>,
    release: Box<dyn Fn(T) + Send + Sync>,
    latest: watch::Sender<Option<T>>,
    releases: AtomicU64,
}

impl<T: Clone> Shared<T> {
    fn emit(&self, value: T) {
        self.releases.fetch_add(1, Ordering::Relaxed);
        self.latest.send_replace(Some(value.clone()));
        (self.release)(value);
    }
}

/// Debounced value stream
pub struct Debouncer<T> {
    shared: Arc<Shared<T>>,
    delay: Duration,
    mode: DebounceMode,
}

impl<T> Debouncer<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a debouncer that hands released values to `release`
    pub fn new<F>(delay: Duration, mode: DebounceMode, release: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let (latest, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    timer: TimerSlot::default(),
                    state: CoalescerState::Idle,
                }),
                release: Box::new(release),
                latest,
                releases: AtomicU64::new(0),
            }),
            delay,
            mode,
        }
    }

    /// Trailing-mode debouncer
    pub fn trailing<F>(delay: Duration, release: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self::new(delay, DebounceMode::Trailing, release)
    }

    /// Leading-mode debouncer
    pub fn leading<F>(delay: Duration, release: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self::new(delay, DebounceMode::Leading, release)
    }

    /// Feed a new value, restarting the quiet period
    pub fn push(&self, value: T) {
        match self.mode {
            DebounceMode::Trailing => self.push_trailing(value),
            DebounceMode::Leading => self.push_leading(value),
        }
    }

    fn push_trailing(&self, value: T) {
        let mut inner = self.shared.inner.lock();
        let shared = self.shared.clone();
        let delay = self.delay;

        // The timer owns its snapshot; later pushes never touch it.
        inner.timer.arm(move |generation| async move {
            tokio::time::sleep(delay).await;
            {
                let mut inner = shared.inner.lock();
                if !inner.timer.fire(generation) {
                    return;
                }
                inner.state = CoalescerState::Released;
            }
            trace!("Debounced value released");
            shared.emit(value);
        });
        inner.state = CoalescerState::Pending;
    }

    fn push_leading(&self, value: T) {
        let quiet = {
            let mut inner = self.shared.inner.lock();
            let quiet = !inner.timer.is_armed();
            let shared = self.shared.clone();
            let delay = self.delay;

            inner.timer.arm(move |generation| async move {
                tokio::time::sleep(delay).await;
                let mut inner = shared.inner.lock();
                if inner.timer.fire(generation) {
                    inner.state = CoalescerState::Released;
                }
            });
            inner.state = CoalescerState::Cooldown;
            quiet
        };

        if quiet {
            trace!("Leading value released");
            self.shared.emit(value);
        }
    }

    /// Discard any pending release
    ///
    /// Returns true if a timer was live.
    pub fn cancel(&self) -> bool {
        let mut inner = self.shared.inner.lock();
        inner.state = CoalescerState::Idle;
        inner.timer.disarm()
    }

    /// Whether a timer is live
    pub fn is_pending(&self) -> bool {
        self.shared.inner.lock().timer.is_armed()
    }

    /// Current lifecycle state
    pub fn state(&self) -> CoalescerState {
        self.shared.inner.lock().state
    }

    /// Observe the most recently released value
    pub fn subscribe(&self) -> watch::Receiver<Option<T>> {
        self.shared.latest.subscribe()
    }

    /// Number of values released so far
    pub fn releases(&self) -> u64 {
        self.shared.releases.load(Ordering::Relaxed)
    }

    /// Quiet period
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Release mode
    pub fn mode(&self) -> DebounceMode {
        self.mode
    }
}

impl<T> Drop for Debouncer<T> {
    fn drop(&mut self) {
        self.shared.inner.lock().timer.disarm();
    }
}

impl<T> std::fmt::Debug for Debouncer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debouncer")
            .field("delay", &self.delay)
            .field("mode", &self.mode)
            .field("state", &self.shared.inner.lock().state)
            .finish()
    }
}
