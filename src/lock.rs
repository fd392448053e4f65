//! Mutual exclusion lock: a semaphore of limit 1.
//!
//! Unlike a data-bearing mutex, a [`Lock`] protects no value of its own;
//! it is a standalone exclusion primitive whose guard is the resource.
//! Waiters are admitted in strict FIFO order with cancel-aware waiting.
//!
//! Cloning a `Lock` returns a handle to the same underlying lock, so it
//! can be shared across tasks without an extra `Arc`.
//!
//! # Example
//!
//! ```ignore
//! use keylock::{Cx, Lock};
//!
//! let lock = Lock::new();
//! let guard = lock.lock(&Cx::new()).await?;
//! // critical section
//! guard.release();
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::cx::Cx;
use crate::error::Result;
use crate::semaphore::{
    OwnedAcquireFuture, OwnedSemaphorePermit, OwnedWaitForUnlockFuture, Semaphore,
};

/// A cancel-aware mutual exclusion lock.
#[derive(Debug, Clone)]
pub struct Lock {
    semaphore: Arc<Semaphore>,
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

impl Lock {
    /// Creates a new, unlocked lock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    /// Acquires the lock asynchronously.
    pub fn lock(&self, cx: &Cx) -> LockFuture {
        LockFuture {
            inner: OwnedSemaphorePermit::acquire(Arc::clone(&self.semaphore), cx, 1),
        }
    }

    /// Tries to acquire the lock without waiting.
    ///
    /// Refuses while any waiter queues, preserving FIFO order.
    pub fn try_lock(&self) -> Option<LockGuard> {
        OwnedSemaphorePermit::try_acquire(&self.semaphore, 1).map(|permit| LockGuard { permit })
    }

    /// Resolves when the lock is observably unlocked.
    ///
    /// The wait occupies a FIFO queue position but acquires nothing.
    pub fn wait_for_unlock(&self, cx: &Cx) -> LockWaitFuture {
        LockWaitFuture {
            inner: Semaphore::wait_for_unlock_owned(Arc::clone(&self.semaphore), cx, 1),
        }
    }

    /// Returns true if the lock is held or waited on.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.semaphore.is_locked()
    }

    /// Returns the number of holders plus queued waiters.
    #[must_use]
    pub fn count(&self) -> usize {
        self.semaphore.count()
    }

    /// Locks, runs `body`, and unlocks on every exit path.
    ///
    /// # Errors
    /// Propagates the acquisition error; `body` cannot fail through this
    /// wrapper.
    pub async fn with_f<T, F, Fut>(&self, cx: &Cx, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.lock(cx).await?;
        let value = body().await;
        drop(guard);
        Ok(value)
    }
}

/// Future returned by [`Lock::lock`].
#[derive(Debug)]
pub struct LockFuture {
    inner: OwnedAcquireFuture,
}

impl Future for LockFuture {
    type Output = Result<LockGuard>;

    fn poll(mut self: Pin<&mut Self>, task: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.inner).poll(task) {
            Poll::Ready(Ok(permit)) => Poll::Ready(Ok(LockGuard { permit })),
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Future returned by [`Lock::wait_for_unlock`].
#[derive(Debug)]
pub struct LockWaitFuture {
    inner: OwnedWaitForUnlockFuture,
}

impl Future for LockWaitFuture {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, task: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(task)
    }
}

/// A held lock, released on drop.
#[must_use = "the lock is released immediately if the guard is not held"]
#[derive(Debug)]
pub struct LockGuard {
    permit: OwnedSemaphorePermit,
}

impl LockGuard {
    /// Releases the lock explicitly.
    ///
    /// Equivalent to dropping the guard; consuming it makes a double
    /// release unrepresentable.
    pub fn release(self) {
        drop(self);
    }

    /// Returns the weight held through the underlying semaphore (always 1).
    #[must_use]
    pub fn weight(&self) -> usize {
        self.permit.weight()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cx::CancelSignal;
    use crate::test_util::{block_on, poll_once};

    #[test]
    fn lock_is_exclusive() {
        let cx = Cx::new();
        let lock = Lock::new();

        let mut fut1 = lock.lock(&cx);
        let g1 = poll_once(&mut fut1).expect("ready").expect("locked");
        assert!(lock.is_locked());

        let mut fut2 = lock.lock(&cx);
        assert!(poll_once(&mut fut2).is_none(), "second holder excluded");

        g1.release();
        let g2 = poll_once(&mut fut2).expect("ready").expect("locked");
        drop(g2);
        assert!(!lock.is_locked());
        assert_eq!(lock.count(), 0);
    }

    #[test]
    fn clone_is_a_handle_to_the_same_lock() {
        let cx = Cx::new();
        let lock = Lock::new();
        let alias = lock.clone();

        let guard = lock.try_lock().expect("free");
        let mut fut = alias.lock(&cx);
        assert!(poll_once(&mut fut).is_none());
        assert!(alias.is_locked());
        drop(guard);
        let g = poll_once(&mut fut).expect("ready").expect("locked");
        drop(g);
    }

    #[test]
    fn fifo_handoff_through_three_waiters() {
        let cx = Cx::new();
        let lock = Lock::new();
        let g0 = lock.try_lock().expect("free");

        let mut f1 = lock.lock(&cx);
        let mut f2 = lock.lock(&cx);
        let mut f3 = lock.lock(&cx);
        assert!(poll_once(&mut f1).is_none());
        assert!(poll_once(&mut f2).is_none());
        assert!(poll_once(&mut f3).is_none());

        drop(g0);
        let g1 = poll_once(&mut f1).expect("ready").expect("first");
        assert!(poll_once(&mut f2).is_none());
        drop(g1);
        let g2 = poll_once(&mut f2).expect("ready").expect("second");
        assert!(poll_once(&mut f3).is_none());
        drop(g2);
        let g3 = poll_once(&mut f3).expect("ready").expect("third");
        drop(g3);
        assert_eq!(lock.count(), 0);
    }

    #[test]
    fn try_lock_respects_waiters() {
        let cx = Cx::new();
        let lock = Lock::new();
        let guard = lock.try_lock().expect("free");

        let mut fut = lock.lock(&cx);
        assert!(poll_once(&mut fut).is_none());
        drop(guard);
        // The queued waiter has priority over a try_lock.
        assert!(lock.try_lock().is_none());
        let g = poll_once(&mut fut).expect("ready").expect("locked");
        drop(g);
    }

    #[test]
    fn wait_for_unlock_observes_release() {
        let cx = Cx::new();
        let lock = Lock::new();
        let guard = lock.try_lock().expect("free");

        let mut wait = lock.wait_for_unlock(&cx);
        assert!(poll_once(&mut wait).is_none());
        drop(guard);
        poll_once(&mut wait).expect("ready").expect("unlocked");
    }

    #[test]
    fn cancelled_waiter_leaves_lock_consistent() {
        let signal = CancelSignal::new();
        let cx = Cx::with_signal(&signal);
        let lock = Lock::new();
        let guard = lock.try_lock().expect("free");

        let mut fut = lock.lock(&cx);
        assert!(poll_once(&mut fut).is_none());
        assert_eq!(lock.count(), 2);

        signal.cancel();
        let err = poll_once(&mut fut).expect("ready").expect_err("cancelled");
        assert!(err.is_cancelled());
        assert_eq!(lock.count(), 1);
        drop(guard);
        assert_eq!(lock.count(), 0);
    }

    #[test]
    fn with_f_releases_on_panic() {
        let lock = Lock::new();
        let alias = lock.clone();

        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            block_on(alias.with_f(&Cx::new(), || async { panic!("body failed") }))
        }));
        assert!(panicked.is_err());
        assert!(!lock.is_locked(), "unwind released the lock");
    }

    #[test]
    fn with_f_returns_body_value() {
        let lock = Lock::new();
        let value = block_on(lock.with_f(&Cx::new(), || async { "done" })).expect("locked");
        assert_eq!(value, "done");
        assert_eq!(lock.count(), 0);
    }
}
