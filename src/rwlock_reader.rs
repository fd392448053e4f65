//! Read-preferring read-write lock built from two inner locks.
//!
//! Readers coordinate through a `readers_lock` (a mutex over the reader
//! bookkeeping) and hold a `writers_lock` (the write exclusion) as a
//! *cohort*: the first reader acquires the writers lock on behalf of all
//! concurrent readers and the last reader to leave hands it back. Writers
//! acquire the writers lock directly.
//!
//! # Preference
//!
//! Readers never wait for writers — only for the brief bookkeeping mutex —
//! so a steady stream of readers can starve writers. Use
//! [`RwLockWriter`](crate::rwlock_writer::RwLockWriter) when writers must
//! not starve.
//!
//! # Cohort leadership
//!
//! The first reader acquires the writers lock while still holding the
//! readers lock, so later readers cannot overtake the cohort formation.
//! If the leader's context expires before the acquisition completes and
//! other readers have already joined the cohort, leadership transfers: the
//! next reader retries the acquisition under its own context. A reader
//! waiting on an established cohort never fails.
//!
//! Cloning returns a handle to the same lock.

use parking_lot::Mutex as ParkingMutex;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::cx::Cx;
use crate::error::Result;
use crate::event::Event;
use crate::lock::{Lock, LockGuard};
use crate::lockable::LockType;

/// A read-preferring read-write lock.
#[derive(Debug, Clone, Default)]
pub struct RwLockReader {
    shared: Arc<ReaderShared>,
}

#[derive(Debug, Default)]
struct ReaderShared {
    /// Mutex over the reader bookkeeping and cohort formation.
    readers_lock: Lock,
    /// The write exclusion, held by writers or by the reader cohort.
    writers_lock: Lock,
    state: ParkingMutex<ReaderState>,
    cohort: ParkingMutex<CohortSlot>,
    /// Admitted plus queued writers.
    writer_count: AtomicUsize,
}

#[derive(Debug, Default)]
struct ReaderState {
    /// Admitted readers.
    readers: usize,
    /// Readers queued on the readers lock.
    readers_blocked: usize,
}

/// The reader cohort: present while `readers > 0`.
#[derive(Debug)]
struct Cohort {
    /// The writers lock held on behalf of all current readers.
    guard: Option<LockGuard>,
    /// True while some reader is acquiring the writers lock.
    leader_active: bool,
    /// Signalled on every cohort transition.
    event: Event,
}

#[derive(Debug, Default)]
struct CohortSlot {
    cohort: Option<Cohort>,
}

impl RwLockReader {
    /// Creates a new, unlocked read-write lock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires with the given lock type.
    pub async fn lock(&self, cx: &Cx, ty: LockType) -> Result<RwLockReaderGuard> {
        match ty {
            LockType::Read => self.read(cx).await,
            LockType::Write => self.write(cx).await,
        }
    }

    /// Acquires shared access.
    pub async fn read(&self, cx: &Cx) -> Result<RwLockReaderGuard> {
        let shared = Arc::clone(&self.shared);
        shared.state.lock().readers_blocked += 1;
        let bookkeeping = shared.readers_lock.lock(cx).await;
        let rguard = {
            let mut st = shared.state.lock();
            st.readers_blocked -= 1;
            match bookkeeping {
                Ok(guard) => guard,
                Err(err) => return Err(err),
            }
        };

        let claim = {
            let mut st = shared.state.lock();
            st.readers += 1;
            drop(st);
            let mut slot = shared.cohort.lock();
            match &mut slot.cohort {
                Some(cohort) if cohort.guard.is_some() || cohort.leader_active => false,
                Some(cohort) => {
                    cohort.leader_active = true;
                    true
                }
                None => {
                    slot.cohort = Some(Cohort {
                        guard: None,
                        leader_active: true,
                        event: Event::new(),
                    });
                    true
                }
            }
        };

        if claim {
            // Leader: take the write exclusion for the cohort while still
            // holding the readers lock, so later readers cannot overtake.
            let outcome = shared.writers_lock.lock(cx).await;
            drop(rguard);
            match outcome {
                Ok(wguard) => {
                    shared.install_cohort_guard(wguard);
                    Ok(RwLockReaderGuard {
                        shared,
                        ty: LockType::Read,
                        write_guard: None,
                    })
                }
                Err(err) => {
                    shared.retire_failed_leader();
                    Err(err)
                }
            }
        } else {
            drop(rguard);
            // Cohort member: wait for the leader's acquisition. The wait
            // ignores this reader's own context; ordering correctness is
            // what matters, and an established cohort must admit it.
            shared.join_cohort(cx).await?;
            Ok(RwLockReaderGuard {
                shared,
                ty: LockType::Read,
                write_guard: None,
            })
        }
    }

    /// Acquires exclusive access.
    pub async fn write(&self, cx: &Cx) -> Result<RwLockReaderGuard> {
        let shared = Arc::clone(&self.shared);
        shared.writer_count.fetch_add(1, Ordering::SeqCst);
        match shared.writers_lock.lock(cx).await {
            Ok(wguard) => Ok(RwLockReaderGuard {
                shared,
                ty: LockType::Write,
                write_guard: Some(wguard),
            }),
            Err(err) => {
                shared.writer_count.fetch_sub(1, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// Resolves when both inner locks are observably unlocked.
    pub async fn wait_for_unlock(&self, cx: &Cx) -> Result<()> {
        self.shared.writers_lock.wait_for_unlock(cx).await?;
        self.shared.readers_lock.wait_for_unlock(cx).await?;
        Ok(())
    }

    /// Returns true if either inner lock is held or waited on.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.shared.readers_lock.is_locked() || self.shared.writers_lock.is_locked()
    }

    /// Returns true if the reader side is active.
    #[must_use]
    pub fn is_read_locked(&self) -> bool {
        self.shared.readers_lock.is_locked() || self.shared.state.lock().readers > 0
    }

    /// Returns true if a writer holds the write exclusion.
    #[must_use]
    pub fn is_write_locked(&self) -> bool {
        self.shared.writers_lock.is_locked() && self.shared.state.lock().readers == 0
    }

    /// Returns admitted plus blocked readers.
    #[must_use]
    pub fn reader_count(&self) -> usize {
        let st = self.shared.state.lock();
        st.readers + st.readers_blocked
    }

    /// Returns admitted plus queued writers.
    #[must_use]
    pub fn writer_count(&self) -> usize {
        self.shared.writer_count.load(Ordering::SeqCst)
    }

    /// Returns readers plus writers, admitted or queued.
    #[must_use]
    pub fn count(&self) -> usize {
        self.reader_count() + self.writer_count()
    }

    /// Acquires shared access, runs `body`, and releases on every exit.
    ///
    /// # Errors
    /// Propagates the acquisition error; `body` cannot fail through this
    /// wrapper.
    pub async fn with_read<T, F, Fut>(&self, cx: &Cx, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.read(cx).await?;
        let value = body().await;
        drop(guard);
        Ok(value)
    }

    /// Acquires exclusive access, runs `body`, and releases on every exit.
    ///
    /// # Errors
    /// Propagates the acquisition error; `body` cannot fail through this
    /// wrapper.
    pub async fn with_write<T, F, Fut>(&self, cx: &Cx, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.write(cx).await?;
        let value = body().await;
        drop(guard);
        Ok(value)
    }
}

impl ReaderShared {
    fn install_cohort_guard(&self, wguard: LockGuard) {
        let event = {
            let mut slot = self.cohort.lock();
            let cohort = slot.cohort.as_mut().expect("cohort exists while readers > 0");
            cohort.guard = Some(wguard);
            cohort.leader_active = false;
            cohort.event.clone()
        };
        event.notify();
    }

    /// Undoes a failed leader acquisition: the reader leaves, and if other
    /// readers joined meanwhile, one of them is woken to claim leadership.
    fn retire_failed_leader(&self) {
        let event = {
            let mut st = self.state.lock();
            st.readers -= 1;
            let remaining = st.readers;
            drop(st);
            let mut slot = self.cohort.lock();
            if remaining == 0 {
                slot.cohort.take().map(|cohort| cohort.event)
            } else {
                let cohort = slot.cohort.as_mut().expect("cohort exists while readers > 0");
                cohort.leader_active = false;
                Some(cohort.event.clone())
            }
        };
        if let Some(event) = event {
            event.notify();
        }
    }

    /// Waits until the cohort holds its inner lock, claiming leadership if
    /// the previous leader retired without it.
    async fn join_cohort(&self, cx: &Cx) -> Result<()> {
        loop {
            enum Step {
                Done,
                Claim,
                Wait(crate::event::Listen),
            }
            let step = {
                let mut slot = self.cohort.lock();
                let cohort = slot.cohort.as_mut().expect("cohort exists while readers > 0");
                if cohort.guard.is_some() {
                    Step::Done
                } else if cohort.leader_active {
                    Step::Wait(cohort.event.listen())
                } else {
                    cohort.leader_active = true;
                    Step::Claim
                }
            };
            match step {
                Step::Done => return Ok(()),
                Step::Wait(listen) => listen.await,
                Step::Claim => match self.writers_lock.lock(cx).await {
                    Ok(wguard) => {
                        self.install_cohort_guard(wguard);
                        return Ok(());
                    }
                    Err(err) => {
                        self.retire_failed_leader();
                        return Err(err);
                    }
                },
            }
        }
    }

    fn release_read(&self) {
        let guard = {
            let mut st = self.state.lock();
            debug_assert!(st.readers >= 1, "read release without reader");
            st.readers -= 1;
            let remaining = st.readers;
            drop(st);
            if remaining == 0 {
                self.cohort.lock().cohort.take().and_then(|cohort| cohort.guard)
            } else {
                None
            }
        };
        // Dropping the cohort guard releases the write exclusion and wakes
        // the next writer.
        drop(guard);
    }
}

/// A held acquisition of a [`RwLockReader`], released on drop.
#[must_use = "the lock is released immediately if the guard is not held"]
#[derive(Debug)]
pub struct RwLockReaderGuard {
    shared: Arc<ReaderShared>,
    ty: LockType,
    write_guard: Option<LockGuard>,
}

impl RwLockReaderGuard {
    /// Returns the acquisition type.
    #[must_use]
    pub fn lock_type(&self) -> LockType {
        self.ty
    }

    /// Releases the acquisition explicitly.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for RwLockReaderGuard {
    fn drop(&mut self) {
        match self.ty {
            LockType::Read => self.shared.release_read(),
            LockType::Write => {
                self.write_guard.take();
                self.shared.writer_count.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}
