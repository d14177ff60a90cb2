//! Throttle
//!
//! Bounds how often a callback runs. The first call in a window runs at
//! once and opens a window of `delay`; calls inside the window collapse into
//! one trailing call at the window's end carrying the last arguments seen.
//!
//! Every deadline is computed from the start of the current window, never
//! from the time of the call that scheduled it. A trailing call counts as an
//! invocation: a call arriving less than `delay` after it is deferred to
//! `delay` after the trailing call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::trace;

use super::{CoalescerState, TimerSlot};

struct Inner<A> {
    last_invoked: Option<Instant>,
    pending: Option<A>,
    timer: TimerSlot,
    state: CoalescerState,
}

struct Shared<A> {
    inner: Mutex<Inner<A>>,
    callback: Box<dyn Fn(A) + Send + Sync>,
    throttled: watch::Sender<bool>,
    invocations: AtomicU64,
}

impl<A> Shared<A> {
    fn invoke(&self, args: A) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        (self.callback)(args);
    }
}

/// Rate-limited callback
pub struct Throttle<A> {
    shared: Arc<Shared<A>>,
    delay: Duration,
}

impl<A> Throttle<A>
where
    A: Send + 'static,
{
    /// Throttle `callback` to at most one invocation per `delay`
    pub fn new<F>(delay: Duration, callback: F) -> Self
    where
        F: Fn(A) + Send + Sync + 'static,
    {
        let (throttled, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    last_invoked: None,
                    pending: None,
                    timer: TimerSlot::default(),
                    state: CoalescerState::Idle,
                }),
                callback: Box::new(callback),
                throttled,
                invocations: AtomicU64::new(0),
            }),
            delay,
        }
    }

    /// Call through the throttle
    pub fn call(&self, args: A) {
        let now = Instant::now();
        let immediate = {
            let mut inner = self.shared.inner.lock();

            if inner.timer.is_armed() {
                // Inside a window: the last arguments win
                inner.pending = Some(args);
                inner.state = CoalescerState::Pending;
                return;
            }

            let last_invoked = inner.last_invoked;
            match last_invoked {
                Some(last) if now < last + self.delay => {
                    inner.pending = Some(args);
                    inner.state = CoalescerState::Pending;
                    self.schedule_close(&mut inner, last + self.delay);
                    None
                }
                _ => {
                    inner.last_invoked = Some(now);
                    inner.state = CoalescerState::Cooldown;
                    self.schedule_close(&mut inner, now + self.delay);
                    Some(args)
                }
            }
        };

        self.shared.throttled.send_replace(true);
        if let Some(args) = immediate {
            trace!("Throttled call invoked immediately");
            self.shared.invoke(args);
        }
    }

    fn schedule_close(&self, inner: &mut Inner<A>, deadline: Instant) {
        let shared = self.shared.clone();
        inner.timer.arm(move |generation| async move {
            tokio::time::sleep_until(deadline).await;
            let trailing = {
                let mut inner = shared.inner.lock();
                if !inner.timer.fire(generation) {
                    return;
                }
                let trailing = inner.pending.take();
                if trailing.is_some() {
                    inner.last_invoked = Some(Instant::now());
                    inner.state = CoalescerState::Released;
                } else {
                    inner.state = CoalescerState::Idle;
                }
                trailing
            };

            shared.throttled.send_replace(false);
            if let Some(args) = trailing {
                trace!("Trailing call invoked");
                shared.invoke(args);
            }
        });
    }

    /// Whether the throttle is inside a window
    pub fn is_throttled(&self) -> bool {
        *self.shared.throttled.borrow()
    }

    /// Observe `is_throttled` transitions
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shared.throttled.subscribe()
    }

    /// Cancel the window timer and discard pending arguments
    ///
    /// The next call after a cancel runs immediately.
    pub fn cancel(&self) {
        {
            let mut inner = self.shared.inner.lock();
            inner.timer.disarm();
            inner.pending = None;
            inner.last_invoked = None;
            inner.state = CoalescerState::Idle;
        }
        self.shared.throttled.send_replace(false);
    }

    /// Current lifecycle state
    pub fn state(&self) -> CoalescerState {
        self.shared.inner.lock().state
    }

    /// Number of callback invocations so far
    pub fn invocations(&self) -> u64 {
        self.shared.invocations.load(Ordering::Relaxed)
    }

    /// Window length
    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl<A> Drop for Throttle<A> {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock();
        inner.timer.disarm();
        inner.pending = None;
    }
}

impl<A> std::fmt::Debug for Throttle<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttle")
            .field("delay", &self.delay)
            .field("state", &self.shared.inner.lock().state)
            .field("invocations", &self.shared.invocations.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    type Log = Arc<Mutex<Vec<(u32, Duration)>>>;

    fn recording_throttle(delay: Duration) -> (Log, Throttle<u32>) {
        let start = Instant::now();
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let throttle = Throttle::new(delay, move |v: u32| sink.lock().push((v, start.elapsed())));
        (log, throttle)
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[tokio::test(start_paused = true)]
    async fn test_trailing_call_carries_last_arguments() {
        let (log, throttle) = recording_throttle(ms(100));

        throttle.call(0);
        assert!(throttle.is_throttled());
        assert_eq!(throttle.state(), CoalescerState::Cooldown);

        sleep(ms(50)).await;
        throttle.call(50);
        assert_eq!(throttle.state(), CoalescerState::Pending);
        sleep(ms(40)).await;
        throttle.call(90);
        sleep(ms(5)).await;
        assert!(throttle.is_throttled());

        sleep(ms(10)).await;
        assert!(!throttle.is_throttled());

        let log = log.lock();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0], (0, Duration::ZERO));
        assert_eq!(log[1].0, 90);
        assert!(log[1].1 >= ms(100) && log[1].1 <= ms(101), "trailing at {:?}", log[1].1);
        assert_eq!(throttle.invocations(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_closes_without_pending_call() {
        let (log, throttle) = recording_throttle(ms(100));
        let mut rx = throttle.subscribe();

        throttle.call(1);
        assert!(*rx.borrow_and_update());

        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());
        assert_eq!(throttle.state(), CoalescerState::Idle);
        assert_eq!(log.lock().len(), 1);

        // Window is over, the next call runs at once
        throttle.call(2);
        assert_eq!(log.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_after_trailing_is_deferred() {
        let (log, throttle) = recording_throttle(ms(100));

        throttle.call(0);
        sleep(ms(50)).await;
        throttle.call(50);
        sleep(ms(70)).await;
        // Trailing call ran at t=100, so t=120 is inside its window
        throttle.call(120);
        assert_eq!(log.lock().len(), 2);
        assert!(throttle.is_throttled());

        sleep(ms(100)).await;
        let log = log.lock();
        assert_eq!(log.len(), 3);
        assert_eq!(log[2].0, 120);
        assert!(log[2].1 >= ms(200) && log[2].1 <= ms(201), "deferred to {:?}", log[2].1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_discards_pending_call() {
        let (log, throttle) = recording_throttle(ms(100));

        throttle.call(0);
        throttle.call(1);
        throttle.cancel();
        assert!(!throttle.is_throttled());
        assert_eq!(throttle.state(), CoalescerState::Idle);

        sleep(ms(200)).await;
        assert_eq!(log.lock().iter().map(|(v, _)| *v).collect::<Vec<_>>(), vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_discards_pending_call() {
        let (log, throttle) = recording_throttle(ms(100));
        throttle.call(0);
        throttle.call(1);
        drop(throttle);

        sleep(ms(200)).await;
        assert_eq!(log.lock().len(), 1);
    }
}
