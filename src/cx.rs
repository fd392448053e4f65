//! The timed-cancel context for blocking operations.
//!
//! Every blocking operation in this crate accepts a [`Cx`]: the pair of an
//! optional deadline and an optional external [`CancelSignal`]. Both are
//! normalised into a single abort check — [`Cx::checkpoint`] — consulted at
//! every poll of a blocked wait, so a wait stops as soon as either fires.
//!
//! # Cancel Safety
//!
//! A context never holds resources itself. Aborting a wait through a `Cx`
//! leaves the primitive exactly as a release would: counters decremented,
//! queue positions vacated, and the next eligible waiter woken.
//!
//! # Example
//!
//! ```ignore
//! use keylock::{Cx, CancelSignal, Lock};
//! use std::time::Duration;
//!
//! let lock = Lock::new();
//! let signal = CancelSignal::new();
//!
//! // Wait at most 100ms, abortable through `signal`.
//! let cx = Cx::with_timeout(Duration::from_millis(100)).and_signal(&signal);
//! let guard = lock.lock(&cx).await?;
//! ```

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::Waker;
use std::time::{Duration, Instant};

use crate::error::{CancelReason, Error, Result};
use crate::timer;

/// An external cancellation signal shared between a canceller and any
/// number of blocked waits.
///
/// Cloning returns a handle to the same signal. Firing is one-shot: the
/// first [`cancel`](Self::cancel) wins and its reason is surfaced verbatim
/// to every wait aborted by the signal; later calls are no-ops.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    inner: Arc<SignalInner>,
}

#[derive(Debug, Default)]
struct SignalInner {
    /// Lock-free shadow of the fired state for read-heavy checks.
    fired: AtomicBool,
    state: Mutex<SignalState>,
}

#[derive(Debug, Default)]
struct SignalState {
    reason: Option<CancelReason>,
    wakers: SmallVec<[Waker; 4]>,
}

impl CancelSignal {
    /// Creates a new, unfired signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the signal with the default reason.
    pub fn cancel(&self) {
        self.cancel_with(CancelReason::default());
    }

    /// Fires the signal with the given reason.
    ///
    /// The reason propagates verbatim as the rejection reason of every
    /// wait blocked on this signal. Only the first call has any effect.
    pub fn cancel_with(&self, reason: CancelReason) {
        let wakers = {
            let mut state = self.inner.state.lock();
            if self.inner.fired.load(Ordering::Relaxed) {
                return;
            }
            state.reason = Some(reason);
            self.inner.fired.store(true, Ordering::Release);
            std::mem::take(&mut state.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
    }

    /// Returns true if the signal has fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }

    /// Returns the reason the signal fired with, if it has fired.
    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        if !self.is_cancelled() {
            return None;
        }
        self.inner.state.lock().reason.clone()
    }

    /// Registers a waker to be woken when the signal fires.
    ///
    /// Wakes immediately if the signal already fired; otherwise the waker
    /// is stored until the fire drains the list.
    pub(crate) fn register(&self, waker: &Waker) {
        let mut state = self.inner.state.lock();
        if self.inner.fired.load(Ordering::Relaxed) {
            drop(state);
            waker.wake_by_ref();
            return;
        }
        if let Some(existing) = state.wakers.iter_mut().find(|w| w.will_wake(waker)) {
            existing.clone_from(waker);
        } else {
            state.wakers.push(waker.clone());
        }
    }
}

/// The timed-cancel context accepted by every blocking operation.
///
/// A `Cx` composes an optional deadline with an optional [`CancelSignal`].
/// It is cheap to clone and carries no resources; the default context
/// never aborts.
#[derive(Debug, Clone, Default)]
pub struct Cx {
    deadline: Option<Instant>,
    signal: Option<CancelSignal>,
}

impl Cx {
    /// Creates a context that never aborts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context that aborts `timeout` from now.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now().checked_add(timeout),
            signal: None,
        }
    }

    /// Creates a context that aborts at the given instant.
    #[must_use]
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            signal: None,
        }
    }

    /// Creates a context aborted by the given signal.
    #[must_use]
    pub fn with_signal(signal: &CancelSignal) -> Self {
        Self {
            deadline: None,
            signal: Some(signal.clone()),
        }
    }

    /// Returns this context with its deadline set to `timeout` from now.
    #[must_use]
    pub fn and_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Instant::now().checked_add(timeout);
        self
    }

    /// Returns this context with its deadline set to the given instant.
    #[must_use]
    pub fn and_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Returns this context aborted additionally by the given signal.
    #[must_use]
    pub fn and_signal(mut self, signal: &CancelSignal) -> Self {
        self.signal = Some(signal.clone());
        self
    }

    /// Returns the deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the time remaining until the deadline, if any.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Returns true if the signal fired or the deadline passed.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.checkpoint().is_err()
    }

    /// Checks for abortion and returns the abort reason as an error.
    ///
    /// The signal takes precedence over the deadline, so a wait aborted by
    /// both in the same poll reports the signal's reason.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Cancelled`](crate::ErrorKind::Cancelled) if the signal
    /// fired, [`ErrorKind::DeadlineExceeded`](crate::ErrorKind::DeadlineExceeded)
    /// if the deadline passed.
    pub fn checkpoint(&self) -> Result<()> {
        if let Some(signal) = &self.signal {
            if signal.is_cancelled() {
                return Err(Error::cancelled(signal.reason().unwrap_or_default()));
            }
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::deadline_exceeded(deadline));
            }
        }
        Ok(())
    }

    /// Parks a waiter: arranges for `waker` to be woken when the signal
    /// fires or the deadline passes.
    ///
    /// Called by every primitive just before returning `Poll::Pending`.
    pub(crate) fn park(&self, waker: &Waker) {
        if let Some(signal) = &self.signal {
            signal.register(waker);
        }
        if let Some(deadline) = self.deadline {
            timer::wake_at(deadline, waker.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::CountingWaker;

    #[test]
    fn default_context_never_aborts() {
        let cx = Cx::new();
        assert!(cx.checkpoint().is_ok());
        assert!(!cx.is_cancelled());
        assert!(cx.deadline().is_none());
        assert!(cx.remaining().is_none());
    }

    #[test]
    fn fired_signal_aborts_with_reason() {
        let signal = CancelSignal::new();
        let cx = Cx::with_signal(&signal);
        assert!(cx.checkpoint().is_ok());

        signal.cancel_with(CancelReason::new("shutdown"));
        let err = cx.checkpoint().expect_err("should abort");
        assert!(err.is_cancelled());
        assert_eq!(err.cancel_reason().map(CancelReason::message), Some("shutdown"));
    }

    #[test]
    fn first_cancel_wins() {
        let signal = CancelSignal::new();
        signal.cancel_with(CancelReason::new("first"));
        signal.cancel_with(CancelReason::new("second"));
        assert_eq!(signal.reason().map(|r| r.message().to_string()), Some("first".into()));
    }

    #[test]
    fn past_deadline_aborts() {
        let cx = Cx::with_deadline(Instant::now() - Duration::from_millis(1));
        let err = cx.checkpoint().expect_err("should abort");
        assert!(err.is_timeout());
    }

    #[test]
    fn signal_takes_precedence_over_deadline() {
        let signal = CancelSignal::new();
        signal.cancel();
        let cx = Cx::with_deadline(Instant::now() - Duration::from_millis(1)).and_signal(&signal);
        let err = cx.checkpoint().expect_err("should abort");
        assert!(err.is_cancelled());
    }

    #[test]
    fn cancel_wakes_registered_waiters() {
        let counting = CountingWaker::new();
        let waker = counting.waker();
        let signal = CancelSignal::new();
        signal.register(&waker);
        assert_eq!(counting.count(), 0);

        signal.cancel();
        assert_eq!(counting.count(), 1);
    }

    #[test]
    fn register_after_fire_wakes_immediately() {
        let counting = CountingWaker::new();
        let waker = counting.waker();
        let signal = CancelSignal::new();
        signal.cancel();

        signal.register(&waker);
        assert_eq!(counting.count(), 1);
    }

    #[test]
    fn remaining_shrinks_toward_zero() {
        let cx = Cx::with_timeout(Duration::from_secs(60));
        let remaining = cx.remaining().expect("deadline set");
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(50));
    }
}
