//! Internal broadcast event for cohort signalling.
//!
//! A generation-counted broadcast: [`Event::notify`] wakes every listener
//! registered before the call, and a [`Listen`] future created before a
//! notify resolves on the next poll after it. Used by the reader-writer
//! locks to let a reader cohort observe the leader's inner-lock
//! acquisition (or its failure) without holding any lock across the wait.

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, Waker};

#[derive(Debug, Clone, Default)]
pub(crate) struct Event {
    inner: Arc<EventInner>,
}

#[derive(Debug, Default)]
struct EventInner {
    generation: AtomicU64,
    wakers: Mutex<SmallVec<[Waker; 4]>>,
}

impl Event {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Wakes every current listener and advances the generation.
    pub(crate) fn notify(&self) {
        let wakers = {
            let mut wakers = self.inner.wakers.lock();
            // Bump under the waker lock so a listener that re-checks the
            // generation while registering cannot miss this notify.
            self.inner.generation.fetch_add(1, Ordering::Release);
            std::mem::take(&mut *wakers)
        };
        for waker in wakers {
            waker.wake();
        }
    }

    /// Returns a future resolving at the first notify after this call.
    pub(crate) fn listen(&self) -> Listen {
        Listen {
            inner: Arc::clone(&self.inner),
            start: self.inner.generation.load(Ordering::Acquire),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Listen {
    inner: Arc<EventInner>,
    start: u64,
}

impl Future for Listen {
    type Output = ();

    fn poll(self: Pin<&mut Self>, task: &mut Context<'_>) -> Poll<()> {
        if self.inner.generation.load(Ordering::Acquire) != self.start {
            return Poll::Ready(());
        }
        let mut wakers = self.inner.wakers.lock();
        // Re-check under the lock: a notify between the load above and
        // taking the lock would otherwise be lost.
        if self.inner.generation.load(Ordering::Acquire) != self.start {
            return Poll::Ready(());
        }
        if let Some(existing) = wakers.iter_mut().find(|w| w.will_wake(task.waker())) {
            existing.clone_from(task.waker());
        } else {
            wakers.push(task.waker().clone());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{CountingWaker, poll_once};

    #[test]
    fn listen_pends_until_notify() {
        let event = Event::new();
        let mut listen = event.listen();
        assert!(poll_once(&mut listen).is_none());

        event.notify();
        assert!(poll_once(&mut listen).is_some());
    }

    #[test]
    fn notify_wakes_registered_listener() {
        let event = Event::new();
        let counting = CountingWaker::new();
        let mut listen = event.listen();
        assert!(crate::test_util::poll_once_with_waker(&mut listen, &counting.waker()).is_none());

        event.notify();
        assert_eq!(counting.count(), 1);
    }

    #[test]
    fn listen_created_after_notify_pends() {
        let event = Event::new();
        event.notify();
        let mut listen = event.listen();
        assert!(poll_once(&mut listen).is_none());

        event.notify();
        assert!(poll_once(&mut listen).is_some());
    }
}
