//! Cooperative scheduling primitives
//!
//! The Bluetooth process thread is an ordinary `async fn`, but it is never
//! handed to an executor. The transport polls it exactly once per received
//! event (and once per idle poll request), so a wait point is simply an
//! `.await` on a future that re-evaluates its condition every time it is
//! polled. Side effects inside a condition therefore run once per pass until
//! the condition holds; the peripheral code relies on this to consume one
//! event per pass.
//!
//! # Architecture
//!
//! * [`Timer`]: millisecond deadline against a caller-supplied clock
//! * [`PollRequest`]: interrupt-safe "run the scheduler again soon" flag
//! * [`wait_until`] / [`wait_for`] / [`wait_ms`]: await helpers
//! * [`Latch`]: re-entrancy guard that turns a nested call into "pending"

use core::cell::Cell;
use core::future::poll_fn;
use core::task::Poll;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;

/// Millisecond timer measured against a free-running, wrapping clock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timer {
    start: u32,
    duration: u32,
}

impl Timer {
    /// Create a timer that expires `duration` ms after `now`
    #[must_use]
    pub const fn new(now: u32, duration: u32) -> Self {
        Self {
            start: now,
            duration,
        }
    }

    /// Restart the timer at `now` with a new duration
    pub fn set(&mut self, now: u32, duration: u32) {
        self.start = now;
        self.duration = duration;
    }

    /// Restart the timer at `now` keeping its duration
    pub fn extend(&mut self, now: u32) {
        self.start = now;
    }

    /// Whether at least `duration` ms have passed since the timer was set
    #[must_use]
    pub fn is_expired(&self, now: u32) -> bool {
        now.wrapping_sub(self.start) >= self.duration
    }

    /// Configured duration in ms
    #[must_use]
    pub const fn duration(&self) -> u32 {
        self.duration
    }
}

/// Coalescing request to run the scheduler again.
///
/// Safe to call from interrupt context. Any number of requests made before the
/// transport takes the flag count as one.
pub struct PollRequest {
    signal: Signal<CriticalSectionRawMutex, ()>,
}

impl PollRequest {
    /// Create a request flag that is not set
    #[must_use]
    pub const fn new() -> Self {
        Self {
            signal: Signal::new(),
        }
    }

    /// Ask for the scheduler to be run soon
    pub fn request(&self) {
        self.signal.signal(());
    }

    /// Clear the flag, returning whether it was set
    pub fn take(&self) -> bool {
        self.signal.try_take().is_some()
    }

    /// Whether a request is outstanding, without clearing it
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.signal.signaled()
    }

    /// Wait for the next request and clear it
    pub async fn wait(&self) {
        self.signal.wait().await;
    }
}

impl Default for PollRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide poll request used by the driver and by interrupt handlers
pub static POLL_REQUEST: PollRequest = PollRequest::new();

/// Request that the scheduler runs again soon. Idempotent.
pub fn request_poll() {
    POLL_REQUEST.request();
}

/// Await until `ready` returns true. It is evaluated once per poll.
pub async fn wait_until(mut ready: impl FnMut() -> bool) {
    poll_fn(|_| if ready() { Poll::Ready(()) } else { Poll::Pending }).await;
}

/// Await until `f` produces a value. It is evaluated once per poll.
pub async fn wait_for<T>(mut f: impl FnMut() -> Option<T>) -> T {
    poll_fn(|_| f().map_or(Poll::Pending, Poll::Ready)).await
}

/// Await until `duration` ms have passed on the clock read by `now`
pub async fn wait_ms(now: impl Fn() -> u32, duration: u32) {
    let timer = Timer::new(now(), duration);
    wait_until(|| timer.is_expired(now())).await;
}

/// Re-entrancy latch.
///
/// Some controller calls may synchronously call back into the driver. The
/// latch is set for the duration of such a call; a nested call finds it set
/// and is skipped instead of recursing.
#[derive(Debug, Default)]
pub struct Latch {
    busy: Cell<bool>,
}

impl Latch {
    /// Create an open latch
    #[must_use]
    pub const fn new() -> Self {
        Self {
            busy: Cell::new(false),
        }
    }

    /// Run `f` with the latch set. Returns `None` without running `f` if the
    /// latch is already set.
    pub fn call<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        if self.busy.replace(true) {
            return None;
        }
        let result = f();
        self.busy.set(false);
        Some(result)
    }

    /// Whether a guarded call is in progress
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.busy.get()
    }
}
