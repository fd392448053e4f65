//! Write-preferring read-write lock built from two inner locks.
//!
//! A writer takes the `writers_lock` and then the `readers_lock`; the
//! reader *cohort* holds only the `readers_lock`, and a new reader may
//! enter only while no writer is admitted or queued — otherwise it waits
//! for the writers lock to be observably unlocked before joining.
//!
//! # Preference
//!
//! Any queued writer gates new readers, so writers cannot starve under
//! read load; readers may starve under continuous write pressure. Use
//! [`RwLockReader`](crate::rwlock_reader::RwLockReader) for the opposite
//! trade.
//!
//! # Cohort leadership
//!
//! The first reader acquires the readers lock on behalf of the cohort.
//! Later readers wait for that acquisition without observing their own
//! context — a reader must not fail because the leader's context expired
//! first. If the leader retires without the lock, leadership transfers to
//! the next waiting reader, which retries under its own context.
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

/// A write-preferring read-write lock.
#[derive(Debug, Clone, Default)]
pub struct RwLockWriter {
    shared: Arc<WriterShared>,
}

#[derive(Debug, Default)]
struct WriterShared {
    /// Held by the reader cohort, and by writers after the writers lock.
    readers_lock: Lock,
    /// The writer gate: held by the admitted writer.
    writers_lock: Lock,
    state: ParkingMutex<WriterState>,
    cohort: ParkingMutex<CohortSlot>,
    /// Admitted plus queued writers.
    writer_count: AtomicUsize,
}

#[derive(Debug, Default)]
struct WriterState {
    /// Admitted readers.
    readers: usize,
    /// Readers waiting for the writer sequence to finish.
    readers_blocked: usize,
}

/// The reader cohort: present while `readers > 0`.
#[derive(Debug)]
struct Cohort {
    /// The readers lock held on behalf of all current readers.
    guard: Option<LockGuard>,
    /// True while some reader is acquiring the readers lock.
    leader_active: bool,
    /// Signalled on every cohort transition.
    event: Event,
}

#[derive(Debug, Default)]
struct CohortSlot {
    cohort: Option<Cohort>,
}

impl RwLockWriter {
    /// Creates a new, unlocked read-write lock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires with the given lock type.
    pub async fn lock(&self, cx: &Cx, ty: LockType) -> Result<RwLockWriterGuard> {
        match ty {
            LockType::Read => self.read(cx).await,
            LockType::Write => self.write(cx).await,
        }
    }

    /// Acquires shared access.
    ///
    /// Blocks while any writer is admitted or queued.
    pub async fn read(&self, cx: &Cx) -> Result<RwLockWriterGuard> {
        let shared = Arc::clone(&self.shared);

        // Writers gate new readers. Re-check after every wake: another
        // writer may have queued while this reader slept.
        while shared.writer_count.load(Ordering::SeqCst) > 0 {
            shared.state.lock().readers_blocked += 1;
            let waited = shared.writers_lock.wait_for_unlock(cx).await;
            shared.state.lock().readers_blocked -= 1;
            waited?;
        }

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
            match shared.readers_lock.lock(cx).await {
                Ok(rguard) => {
                    shared.install_cohort_guard(rguard);
                }
                Err(err) => {
                    shared.retire_failed_leader();
                    return Err(err);
                }
            }
        } else {
            shared.join_cohort(cx).await?;
        }
        Ok(RwLockWriterGuard {
            shared,
            ty: LockType::Read,
            write_guards: None,
        })
    }

    /// Acquires exclusive access.
    ///
    /// Takes the writers lock, then the readers lock; holding the writers
    /// lock is what blocks new readers from entering meanwhile.
    pub async fn write(&self, cx: &Cx) -> Result<RwLockWriterGuard> {
        let shared = Arc::clone(&self.shared);
        shared.writer_count.fetch_add(1, Ordering::SeqCst);
        let wguard = match shared.writers_lock.lock(cx).await {
            Ok(guard) => guard,
            Err(err) => {
                shared.writer_count.fetch_sub(1, Ordering::SeqCst);
                return Err(err);
            }
        };
        match shared.readers_lock.lock(cx).await {
            Ok(rguard) => Ok(RwLockWriterGuard {
                shared,
                ty: LockType::Write,
                write_guards: Some(WriteGuards {
                    readers: rguard,
                    writers: wguard,
                }),
            }),
            Err(err) => {
                drop(wguard);
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

    /// Returns true if a reader cohort is active with no writer admitted.
    #[must_use]
    pub fn is_read_locked(&self) -> bool {
        self.writer_count() == 0 && self.shared.readers_lock.is_locked()
    }

    /// Returns true if the writer side is active.
    #[must_use]
    pub fn is_write_locked(&self) -> bool {
        self.writer_count() > 0 && self.shared.writers_lock.is_locked()
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

impl WriterShared {
    fn install_cohort_guard(&self, rguard: LockGuard) {
        let event = {
            let mut slot = self.cohort.lock();
            let cohort = slot.cohort.as_mut().expect("cohort exists while readers > 0");
            cohort.guard = Some(rguard);
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
    /// the previous leader retired without it. The wait itself ignores the
    /// caller's context; only a leadership retry observes it.
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
                Step::Claim => match self.readers_lock.lock(cx).await {
                    Ok(rguard) => {
                        self.install_cohort_guard(rguard);
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
        // Dropping the cohort guard releases the readers lock and admits
        // the writer waiting on it.
        drop(guard);
    }
}

/// The two inner guards held by an admitted writer.
///
/// Field order releases the readers lock before the writers lock.
#[derive(Debug)]
struct WriteGuards {
    readers: LockGuard,
    writers: LockGuard,
}

/// A held acquisition of a [`RwLockWriter`], released on drop.
#[must_use = "the lock is released immediately if the guard is not held"]
#[derive(Debug)]
pub struct RwLockWriterGuard {
    shared: Arc<WriterShared>,
    ty: LockType,
    write_guards: Option<WriteGuards>,
}

impl RwLockWriterGuard {
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

impl Drop for RwLockWriterGuard {
    fn drop(&mut self) {
        match self.ty {
            LockType::Read => self.shared.release_read(),
            LockType::Write => {
                self.write_guards.take();
                self.shared.writer_count.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}
