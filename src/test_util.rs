//! Shared helpers for unit tests: manual polling without an executor.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll, Wake, Waker};

#[derive(Debug, Default)]
struct WakeCount(AtomicUsize);

impl Wake for WakeCount {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// A waker that counts how often it was woken.
#[derive(Debug, Default)]
pub(crate) struct CountingWaker(Arc<WakeCount>);

impl CountingWaker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn waker(&self) -> Waker {
        Waker::from(Arc::clone(&self.0))
    }

    pub(crate) fn count(&self) -> usize {
        self.0.0.load(Ordering::SeqCst)
    }
}

/// Polls a future once with a noop waker.
pub(crate) fn poll_once<F>(future: &mut F) -> Option<F::Output>
where
    F: Future + Unpin,
{
    poll_once_with_waker(future, &Waker::noop())
}

/// Polls a future once with the given waker.
pub(crate) fn poll_once_with_waker<F>(future: &mut F, waker: &Waker) -> Option<F::Output>
where
    F: Future + Unpin,
{
    let mut task = Context::from_waker(waker);
    match Pin::new(future).poll(&mut task) {
        Poll::Ready(value) => Some(value),
        Poll::Pending => None,
    }
}

/// Polls a future to completion by spinning.
pub(crate) fn poll_until_ready<F>(future: &mut F) -> F::Output
where
    F: Future + Unpin,
{
    let waker = Waker::noop();
    let mut task = Context::from_waker(waker);
    loop {
        match Pin::new(&mut *future).poll(&mut task) {
            Poll::Ready(value) => return value,
            Poll::Pending => std::thread::yield_now(),
        }
    }
}

/// Drives a future to completion on the current thread.
pub(crate) fn block_on<F: Future>(future: F) -> F::Output {
    let mut future = Box::pin(future);
    poll_until_ready(&mut future)
}
