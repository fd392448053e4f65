//! Weighted, ordered semaphore with cancel-aware admission.
//!
//! The semaphore is the root primitive: every other lock in this crate is
//! layered on it. Each acquisition consumes an integer weight of the
//! semaphore's limit and returns it on release.
//!
//! # Queue discipline
//!
//! Waiters queue in one of two modes, fixed at construction:
//!
//! - **Unprioritised** (default): strict FIFO. A head-of-line waiter whose
//!   weight does not fit blocks every later waiter even if it would fit.
//!   This guarantees starvation-freedom.
//! - **Prioritised**: the queue is kept sorted by weight (stable, smallest
//!   first), so a small acquisition may overtake a large one. Concurrency
//!   improves; the large waiter may starve. This is an explicit trade.
//!
//! In both modes only the front waiter is ever admitted, and on every
//! release, admission, or abandoned wait the new front is woken if its
//! weight now fits.
//!
//! # Cancel Safety
//!
//! Admission waits are aborted by the context's deadline or signal, and by
//! dropping the acquire future. Either path vacates the queue position,
//! decrements `count` exactly as a release would, and wakes the next
//! eligible waiter.
//!
//! # Example
//!
//! ```ignore
//! use keylock::{Cx, Semaphore};
//!
//! let sem = Semaphore::new(4);
//!
//! // Consume 2 of the 4 weight units until the permit drops.
//! let permit = sem.acquire(&Cx::new(), 2).await?;
//! drop(permit);
//! ```

use parking_lot::Mutex as ParkingMutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll, Waker};

use crate::cx::Cx;
use crate::error::Result;

/// A weighted counting semaphore.
#[derive(Debug)]
pub struct Semaphore {
    /// Maximum admitted weight (immutable).
    limit: usize,
    /// Whether waiters queue sorted by weight instead of FIFO (immutable).
    priority: bool,
    /// Internal queue and counters.
    state: ParkingMutex<SemState>,
    /// Lock-free shadow of `count` for read-heavy diagnostics.
    count_shadow: AtomicUsize,
}

#[derive(Debug)]
struct SemState {
    /// Sum of weights of currently admitted holders.
    current_weight: usize,
    /// Number of admitted plus queued acquisitions.
    count: usize,
    /// Pending waiters; the front is the only admission candidate.
    waiters: VecDeque<Waiter>,
    /// Next waiter id for identity across polls.
    next_waiter_id: u64,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    weight: usize,
    /// Probes resolve when admission *could* proceed, without consuming
    /// weight or counting toward `count`.
    probe: bool,
    waker: Waker,
}

/// Per-future wait bookkeeping shared by all acquire/probe futures.
#[derive(Debug, Default)]
struct WaitSlot {
    id: Option<u64>,
    counted: bool,
}

fn front_eligible_waker(state: &SemState, limit: usize) -> Option<Waker> {
    state
        .waiters
        .front()
        .filter(|w| state.current_weight + w.weight <= limit)
        .map(|w| w.waker.clone())
}

fn abandon_locked(sem: &Semaphore, state: &mut SemState, slot: &mut WaitSlot) {
    if let Some(id) = slot.id.take() {
        if let Some(pos) = state.waiters.iter().position(|w| w.id == id) {
            state.waiters.remove(pos);
        }
    }
    if slot.counted {
        state.count -= 1;
        sem.count_shadow.store(state.count, Ordering::Relaxed);
        slot.counted = false;
    }
}

/// Removes an abandoned waiter and hands the baton to the new front.
fn abandon(sem: &Semaphore, slot: &mut WaitSlot) {
    if slot.id.is_none() && !slot.counted {
        return;
    }
    let next = {
        let mut state = sem.state.lock();
        abandon_locked(sem, &mut state, slot);
        front_eligible_waker(&state, sem.limit)
    };
    if let Some(waker) = next {
        waker.wake();
    }
}

/// Shared poll body for borrowed and owned acquire/probe futures.
fn poll_wait(
    sem: &Semaphore,
    slot: &mut WaitSlot,
    weight: usize,
    probe: bool,
    cx: &Cx,
    task: &mut Context<'_>,
) -> Poll<Result<()>> {
    if let Err(err) = cx.checkpoint() {
        abandon(sem, slot);
        return Poll::Ready(Err(err));
    }

    let mut state = sem.state.lock();

    let waiter_id = match slot.id {
        Some(id) => id,
        None => {
            let id = state.next_waiter_id;
            state.next_waiter_id = state.next_waiter_id.wrapping_add(1);
            if !probe {
                state.count += 1;
                sem.count_shadow.store(state.count, Ordering::Relaxed);
                slot.counted = true;
            }
            let pos = if sem.priority {
                // Stable ascending by weight: insert after the last waiter
                // with weight <= ours so equal weights keep arrival order.
                state
                    .waiters
                    .iter()
                    .position(|w| w.weight > weight)
                    .unwrap_or(state.waiters.len())
            } else {
                state.waiters.len()
            };
            state.waiters.insert(
                pos,
                Waiter {
                    id,
                    weight,
                    probe,
                    waker: task.waker().clone(),
                },
            );
            slot.id = Some(id);
            id
        }
    };

    let at_front = state.waiters.front().is_some_and(|w| w.id == waiter_id);
    if at_front && state.current_weight + weight <= sem.limit {
        state.waiters.pop_front();
        slot.id = None;
        if !probe {
            state.current_weight += weight;
            // The weight and count accounting now belong to the permit.
            slot.counted = false;
        }
        let next = front_eligible_waker(&state, sem.limit);
        drop(state);
        if let Some(waker) = next {
            waker.wake();
        }
        return Poll::Ready(Ok(()));
    }

    if let Some(existing) = state.waiters.iter_mut().find(|w| w.id == waiter_id) {
        if !existing.waker.will_wake(task.waker()) {
            existing.waker.clone_from(task.waker());
        }
    }
    drop(state);
    cx.park(task.waker());
    Poll::Pending
}

impl Semaphore {
    /// Creates an unprioritised semaphore with the given weight limit.
    ///
    /// # Panics
    /// Panics if `limit == 0`.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self::with_priority(limit, false)
    }

    /// Creates a semaphore, optionally with weight-prioritised queueing.
    ///
    /// # Panics
    /// Panics if `limit == 0`.
    #[must_use]
    pub fn with_priority(limit: usize, priority: bool) -> Self {
        assert!(limit >= 1, "semaphore limit must be at least 1");
        Self {
            limit,
            priority,
            state: ParkingMutex::new(SemState {
                current_weight: 0,
                count: 0,
                waiters: VecDeque::with_capacity(4),
                next_waiter_id: 0,
            }),
            count_shadow: AtomicUsize::new(0),
        }
    }

    /// Returns the weight limit.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Returns true if waiters queue sorted by weight.
    #[must_use]
    pub fn is_priority(&self) -> bool {
        self.priority
    }

    /// Returns the number of admitted plus queued acquisitions.
    #[must_use]
    pub fn count(&self) -> usize {
        // Relaxed: advisory diagnostic; the real count is lock-protected.
        self.count_shadow.load(Ordering::Relaxed)
    }

    /// Returns true if any acquisition is admitted or queued.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.count() > 0
    }

    /// Acquires `weight` units asynchronously.
    ///
    /// Admission happens only when the caller is at the queue front under
    /// the configured discipline and `weight` fits the remaining limit.
    ///
    /// # Panics
    /// Panics if `weight == 0` or `weight > limit`.
    pub fn acquire<'a, 'b>(&'a self, cx: &'b Cx, weight: usize) -> AcquireFuture<'a, 'b> {
        assert!(weight >= 1, "acquisition weight must be at least 1");
        assert!(
            weight <= self.limit,
            "acquisition weight exceeds semaphore limit"
        );
        AcquireFuture {
            semaphore: self,
            cx,
            weight,
            slot: WaitSlot::default(),
        }
    }

    /// Resolves when a hypothetical acquisition of `weight` could proceed.
    ///
    /// The probe occupies a queue position under the same discipline as an
    /// acquisition but consumes no weight and does not count toward
    /// [`count`](Self::count).
    ///
    /// # Panics
    /// Panics if `weight == 0` or `weight > limit`.
    pub fn wait_for_unlock<'a, 'b>(
        &'a self,
        cx: &'b Cx,
        weight: usize,
    ) -> WaitForUnlockFuture<'a, 'b> {
        assert!(weight >= 1, "probe weight must be at least 1");
        assert!(weight <= self.limit, "probe weight exceeds semaphore limit");
        WaitForUnlockFuture {
            semaphore: self,
            cx,
            weight,
            slot: WaitSlot::default(),
        }
    }

    /// Like [`wait_for_unlock`](Self::wait_for_unlock), detached from the
    /// semaphore's lifetime.
    pub fn wait_for_unlock_owned(
        semaphore: Arc<Semaphore>,
        cx: &Cx,
        weight: usize,
    ) -> OwnedWaitForUnlockFuture {
        assert!(weight >= 1, "probe weight must be at least 1");
        assert!(
            weight <= semaphore.limit,
            "probe weight exceeds semaphore limit"
        );
        OwnedWaitForUnlockFuture {
            semaphore,
            cx: cx.clone(),
            weight,
            slot: WaitSlot::default(),
        }
    }

    /// Tries to acquire `weight` units without waiting.
    ///
    /// Refuses while any waiter queues, preserving the queue discipline.
    ///
    /// # Panics
    /// Panics if `weight == 0` or `weight > limit`.
    pub fn try_acquire(&self, weight: usize) -> Option<SemaphorePermit<'_>> {
        assert!(weight >= 1, "acquisition weight must be at least 1");
        assert!(
            weight <= self.limit,
            "acquisition weight exceeds semaphore limit"
        );
        let mut state = self.state.lock();
        if !state.waiters.is_empty() || state.current_weight + weight > self.limit {
            return None;
        }
        state.current_weight += weight;
        state.count += 1;
        self.count_shadow.store(state.count, Ordering::Relaxed);
        Some(SemaphorePermit {
            semaphore: self,
            weight,
        })
    }

    /// Acquires, runs `body`, and releases on every exit path.
    ///
    /// # Errors
    /// Propagates the acquisition error; `body` cannot fail through this
    /// wrapper.
    pub async fn with_f<T, F, Fut>(&self, cx: &Cx, weight: usize, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let permit = self.acquire(cx, weight).await?;
        let value = body().await;
        drop(permit);
        Ok(value)
    }

    /// Returns weight and count on release; wakes the new front if it fits.
    pub(crate) fn release_weight(&self, weight: usize) {
        let next = {
            let mut state = self.state.lock();
            debug_assert!(state.current_weight >= weight, "release exceeds held weight");
            debug_assert!(state.count >= 1, "release without holder");
            state.current_weight -= weight;
            state.count -= 1;
            self.count_shadow.store(state.count, Ordering::Relaxed);
            front_eligible_waker(&state, self.limit)
        };
        if let Some(waker) = next {
            waker.wake();
        }
    }
}

/// Future returned by [`Semaphore::acquire`].
#[derive(Debug)]
pub struct AcquireFuture<'a, 'b> {
    semaphore: &'a Semaphore,
    cx: &'b Cx,
    weight: usize,
    slot: WaitSlot,
}

impl<'a> Future for AcquireFuture<'a, '_> {
    type Output = Result<SemaphorePermit<'a>>;

    fn poll(self: Pin<&mut Self>, task: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match poll_wait(this.semaphore, &mut this.slot, this.weight, false, this.cx, task) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(SemaphorePermit {
                semaphore: this.semaphore,
                weight: this.weight,
            })),
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for AcquireFuture<'_, '_> {
    fn drop(&mut self) {
        abandon(self.semaphore, &mut self.slot);
    }
}

/// Future returned by [`Semaphore::wait_for_unlock`].
#[derive(Debug)]
pub struct WaitForUnlockFuture<'a, 'b> {
    semaphore: &'a Semaphore,
    cx: &'b Cx,
    weight: usize,
    slot: WaitSlot,
}

impl Future for WaitForUnlockFuture<'_, '_> {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, task: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        poll_wait(this.semaphore, &mut this.slot, this.weight, true, this.cx, task)
    }
}

impl Drop for WaitForUnlockFuture<'_, '_> {
    fn drop(&mut self) {
        abandon(self.semaphore, &mut self.slot);
    }
}

/// Future returned by [`Semaphore::wait_for_unlock_owned`].
#[derive(Debug)]
pub struct OwnedWaitForUnlockFuture {
    semaphore: Arc<Semaphore>,
    cx: Cx,
    weight: usize,
    slot: WaitSlot,
}

impl Future for OwnedWaitForUnlockFuture {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, task: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let semaphore = Arc::clone(&this.semaphore);
        let cx = this.cx.clone();
        poll_wait(&semaphore, &mut this.slot, this.weight, true, &cx, task)
    }
}

impl Drop for OwnedWaitForUnlockFuture {
    fn drop(&mut self) {
        let semaphore = Arc::clone(&self.semaphore);
        abandon(&semaphore, &mut self.slot);
    }
}

/// A held acquisition, releasing its weight on drop.
#[must_use = "the weight is released immediately if the permit is not held"]
#[derive(Debug)]
pub struct SemaphorePermit<'a> {
    semaphore: &'a Semaphore,
    weight: usize,
}

impl SemaphorePermit<'_> {
    /// Returns the held weight.
    #[must_use]
    pub fn weight(&self) -> usize {
        self.weight
    }

    /// Releases the permit explicitly.
    ///
    /// Equivalent to dropping it; consuming the permit makes a double
    /// release unrepresentable.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.semaphore.release_weight(self.weight);
    }
}

/// An owned permit, detached from the semaphore's lifetime.
#[must_use = "the weight is released immediately if the permit is not held"]
#[derive(Debug)]
pub struct OwnedSemaphorePermit {
    semaphore: Arc<Semaphore>,
    weight: usize,
}

impl OwnedSemaphorePermit {
    /// Acquires an owned permit asynchronously.
    ///
    /// # Panics
    /// Panics if `weight == 0` or `weight > limit`.
    pub fn acquire(semaphore: Arc<Semaphore>, cx: &Cx, weight: usize) -> OwnedAcquireFuture {
        assert!(weight >= 1, "acquisition weight must be at least 1");
        assert!(
            weight <= semaphore.limit,
            "acquisition weight exceeds semaphore limit"
        );
        OwnedAcquireFuture {
            semaphore,
            cx: cx.clone(),
            weight,
            slot: WaitSlot::default(),
        }
    }

    /// Tries to acquire an owned permit without waiting.
    ///
    /// # Panics
    /// Panics if `weight == 0` or `weight > limit`.
    pub fn try_acquire(semaphore: &Arc<Semaphore>, weight: usize) -> Option<Self> {
        let permit = semaphore.try_acquire(weight)?;
        // Transfer the accounting to the owned permit.
        std::mem::forget(permit);
        Some(Self {
            semaphore: Arc::clone(semaphore),
            weight,
        })
    }

    /// Returns the held weight.
    #[must_use]
    pub fn weight(&self) -> usize {
        self.weight
    }

    /// Releases the permit explicitly.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for OwnedSemaphorePermit {
    fn drop(&mut self) {
        self.semaphore.release_weight(self.weight);
    }
}

/// Future returned by [`OwnedSemaphorePermit::acquire`].
#[derive(Debug)]
pub struct OwnedAcquireFuture {
    semaphore: Arc<Semaphore>,
    cx: Cx,
    weight: usize,
    slot: WaitSlot,
}

impl Future for OwnedAcquireFuture {
    type Output = Result<OwnedSemaphorePermit>;

    fn poll(self: Pin<&mut Self>, task: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let semaphore = Arc::clone(&this.semaphore);
        let cx = this.cx.clone();
        match poll_wait(&semaphore, &mut this.slot, this.weight, false, &cx, task) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(OwnedSemaphorePermit {
                semaphore,
                weight: this.weight,
            })),
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for OwnedAcquireFuture {
    fn drop(&mut self) {
        let semaphore = Arc::clone(&self.semaphore);
        abandon(&semaphore, &mut self.slot);
    }
}
