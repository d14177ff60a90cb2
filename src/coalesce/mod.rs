//! Call Coalescer
//!
//! Scheduling primitives that decide when an update may reach a cache or a
//! side-effecting call:
//!
//! - [`Debouncer`]: release a value only after input stops changing
//! - [`Throttle`]: bound the invocation rate of a callback
//! - [`BatchCollector`]: group items into one asynchronous dispatch
//!
//! All three share the [`CoalescerState`] lifecycle:
//!
//! ```text
//! Idle ──► Pending (timer armed) ──► Released (callback invoked) ──► Idle
//!                                        │
//!                 Throttle only:         └──► Cooldown (rate-limit window)
//! ```
//!
//! Timers are Tokio tasks, so every primitive must be used from within a
//! Tokio runtime. Each timer carries a generation number; rearming or
//! cancelling bumps the generation and aborts the task, and a timer that
//! wakes up with a stale generation does nothing. Dropping a primitive
//! cancels its timer. Callbacks are never invoked with a lock held.

use std::future::Future;

use serde::Serialize;
use tokio::task::JoinHandle;

mod batch;
mod debounce;
mod throttle;

pub use batch::{BatchCollector, BatchStats};
pub use debounce::{DebounceMode, Debouncer};
pub use throttle::Throttle;

/// Lifecycle state shared by the coalescing primitives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoalescerState {
    /// Nothing pending, no timer armed
    Idle,
    /// A timer is armed and will release pending work
    Pending,
    /// Work was released and nothing new is pending
    Released,
    /// Inside a rate-limit window with nothing pending
    Cooldown,
}

impl CoalescerState {
    /// Get state as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            CoalescerState::Idle => "idle",
            CoalescerState::Pending => "pending",
            CoalescerState::Released => "released",
            CoalescerState::Cooldown => "cooldown",
        }
    }
}

impl std::fmt::Display for CoalescerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// At most one live timer task, tagged with a generation
#[derive(Debug, Default)]
pub(crate) struct TimerSlot {
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl TimerSlot {
    /// Replace any live timer with the future built by `make`
    ///
    /// `make` receives the generation the new timer must present to
    /// [`TimerSlot::fire`].
    pub(crate) fn arm<F, Fut>(&mut self, make: F)
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.disarm();
        self.handle = Some(tokio::spawn(make(self.generation)));
    }

    /// Abort the live timer, if any
    pub(crate) fn disarm(&mut self) -> bool {
        self.generation = self.generation.wrapping_add(1);
        match self.handle.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Called by a timer task when it wakes up
    ///
    /// Returns false for a stale timer, which must then do nothing.
    pub(crate) fn fire(&mut self, generation: u64) -> bool {
        if self.handle.is_some() && self.generation == generation {
            // Detach rather than abort: the caller is this very task.
            self.handle = None;
            true
        } else {
            false
        }
    }

    /// Whether a timer is live
    pub(crate) fn is_armed(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        self.disarm();
    }
}
