//! Countdown rendezvous barrier built from a pre-acquired lock.
//!
//! The barrier holds an inner [`Lock`] from construction until the final
//! participant arrives; every waiter observes the release simultaneously
//! through the lock's unlock probe. Once tripped, further waits return
//! immediately.
//!
//! # Example
//!
//! ```ignore
//! use keylock::{Barrier, Cx};
//!
//! let barrier = Barrier::create(3).await;
//! // Two tasks pend in wait(); the third trips the barrier and all
//! // three resolve together.
//! barrier.wait(&Cx::new()).await?;
//! ```

use parking_lot::Mutex as ParkingMutex;
use std::sync::Arc;

use crate::cx::Cx;
use crate::error::Result;
use crate::lock::{Lock, LockGuard};

/// A countdown rendezvous barrier.
///
/// Cloning returns a handle to the same barrier.
#[derive(Debug, Clone)]
pub struct Barrier {
    shared: Arc<BarrierShared>,
}

#[derive(Debug)]
struct BarrierShared {
    lock: Lock,
    state: ParkingMutex<BarrierState>,
}

#[derive(Debug)]
struct BarrierState {
    /// Participants still to arrive.
    remaining: usize,
    /// The inner lock, held until the final arrival or `destroy`.
    guard: Option<LockGuard>,
}

impl Barrier {
    /// Creates a barrier for `count` participants.
    ///
    /// The factory is async because the inner lock is acquired at
    /// construction. A barrier for zero participants is created already
    /// tripped.
    pub async fn create(count: usize) -> Self {
        let lock = Lock::new();
        let guard = if count == 0 {
            None
        } else {
            // The lock is private and freshly constructed, so the
            // acquisition cannot block or fail.
            Some(lock.try_lock().expect("fresh barrier lock"))
        };
        Self {
            shared: Arc::new(BarrierShared {
                lock,
                state: ParkingMutex::new(BarrierState {
                    remaining: count,
                    guard,
                }),
            }),
        }
    }

    /// Waits for the rendezvous.
    ///
    /// Counts the caller as an arrival, trips the barrier when the count
    /// reaches zero, and otherwise blocks until the final arrival (or the
    /// context aborts). Returns immediately once tripped.
    pub async fn wait(&self, cx: &Cx) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.guard.is_none() {
                return Ok(());
            }
            state.remaining = state.remaining.saturating_sub(1);
            if state.remaining == 0 {
                let guard = state.guard.take();
                drop(state);
                tracing::trace!("barrier tripped");
                drop(guard);
                return Ok(());
            }
        }
        self.shared.lock.wait_for_unlock(cx).await
    }

    /// Force-releases the barrier.
    ///
    /// Every pending and future wait resolves immediately.
    pub fn destroy(&self) {
        let guard = self.shared.state.lock().guard.take();
        drop(guard);
    }

    /// Returns the number of participants still to arrive.
    #[must_use]
    pub fn count(&self) -> usize {
        self.shared.state.lock().remaining
    }

    /// Returns true once the barrier has released its waiters.
    #[must_use]
    pub fn is_tripped(&self) -> bool {
        self.shared.state.lock().guard.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cx::CancelSignal;
    use crate::test_util::{block_on, poll_once, poll_until_ready};

    #[test]
    fn all_waiters_release_on_final_arrival() {
        let cx = Cx::new();
        let barrier = block_on(Barrier::create(3));
        assert_eq!(barrier.count(), 3);
        assert!(!barrier.is_tripped());

        let mut w1 = Box::pin(barrier.wait(&cx));
        let mut w2 = Box::pin(barrier.wait(&cx));
        assert!(poll_once(&mut w1).is_none());
        assert!(poll_once(&mut w2).is_none());
        assert_eq!(barrier.count(), 1);

        // The third arrival trips the barrier without blocking.
        block_on(barrier.wait(&cx)).expect("final arrival");
        poll_until_ready(&mut w1).expect("first released");
        poll_until_ready(&mut w2).expect("second released");
        assert!(barrier.is_tripped());

        // A fourth wait resolves immediately.
        block_on(barrier.wait(&cx)).expect("after trip");
    }

    #[test]
    fn zero_count_barrier_is_born_tripped() {
        let cx = Cx::new();
        let barrier = block_on(Barrier::create(0));
        assert!(barrier.is_tripped());
        block_on(barrier.wait(&cx)).expect("immediate");
    }

    #[test]
    fn destroy_releases_pending_waiters() {
        let cx = Cx::new();
        let barrier = block_on(Barrier::create(2));
        let mut wait = Box::pin(barrier.wait(&cx));
        assert!(poll_once(&mut wait).is_none());

        barrier.destroy();
        poll_until_ready(&mut wait).expect("released by destroy");
        block_on(barrier.wait(&cx)).expect("immediate after destroy");
    }

    #[test]
    fn cancelled_wait_does_not_trip_the_barrier() {
        let signal = CancelSignal::new();
        let cancel_cx = Cx::with_signal(&signal);
        let cx = Cx::new();
        let barrier = block_on(Barrier::create(3));

        let mut wait = Box::pin(barrier.wait(&cancel_cx));
        assert!(poll_once(&mut wait).is_none());
        signal.cancel();
        let err = poll_until_ready(&mut wait).expect_err("cancelled");
        assert!(err.is_cancelled());
        drop(wait);

        // The cancelled waiter still counted as an arrival (its decrement
        // is not undone), so one more arrival trips the barrier.
        assert_eq!(barrier.count(), 1);
        block_on(barrier.wait(&cx)).expect("trips");
        assert!(barrier.is_tripped());
    }

    #[test]
    fn clone_shares_the_rendezvous() {
        let cx = Cx::new();
        let barrier = block_on(Barrier::create(2));
        let alias = barrier.clone();

        let mut wait = Box::pin(barrier.wait(&cx));
        assert!(poll_once(&mut wait).is_none());
        block_on(alias.wait(&cx)).expect("second arrival via alias");
        poll_until_ready(&mut wait).expect("released");
    }
}
