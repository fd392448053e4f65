//! The lockable seam: what a [`LockBox`](crate::lockbox::LockBox) entry
//! must provide.
//!
//! Every primitive in this crate that can live under a key implements
//! [`Lockable`]: construction from per-key setup parameters, an owned
//! cancel-aware acquisition, an unlock probe, and the `is_locked`/`count`
//! diagnostics. Read-write locks additionally implement [`RwLockable`],
//! which the [`Monitor`](crate::monitor::Monitor) deadlock detector uses
//! to ask whether an acquisition of a given type would block right now.

use core::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::cx::Cx;
use crate::error::Result;
use crate::lock::{Lock, LockGuard};
use crate::rwlock_reader::{RwLockReader, RwLockReaderGuard};
use crate::rwlock_writer::{RwLockWriter, RwLockWriterGuard};
use crate::semaphore::{OwnedSemaphorePermit, Semaphore};

/// The mode of a read-write acquisition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum LockType {
    /// Shared access.
    Read,
    /// Exclusive access (the default for bare-key requests).
    #[default]
    Write,
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// A primitive that can live inside a [`LockBox`](crate::lockbox::LockBox).
///
/// Implementors are cheap-clone handles: cloning returns another handle to
/// the same underlying lock, which is what lets the box hand per-key
/// acquisitions to independent callers.
pub trait Lockable: Clone + Send + Sync + fmt::Debug + 'static {
    /// Construction parameters, fixed per key for the key's lifetime.
    type Setup: Clone + PartialEq + fmt::Debug + Send + Sync + 'static;
    /// Per-acquisition parameters (weight, lock type, ...).
    type Request: Clone + fmt::Debug + Send + Sync + 'static;
    /// The held acquisition, released on drop.
    type Guard: Send + fmt::Debug + 'static;

    /// Builds a fresh lockable from per-key setup parameters.
    fn from_setup(setup: &Self::Setup) -> Self;

    /// Acquires asynchronously with the given request parameters.
    fn acquire(
        &self,
        request: Self::Request,
        cx: Cx,
    ) -> impl Future<Output = Result<Self::Guard>> + Send + 'static;

    /// Resolves when a default acquisition could proceed.
    fn wait_unlocked(&self, cx: Cx) -> impl Future<Output = Result<()>> + Send + 'static;

    /// Returns true if held or waited on.
    fn is_locked(&self) -> bool;

    /// Returns the number of holders plus queued waiters.
    fn count(&self) -> usize;
}

/// A lockable acquired by [`LockType`], usable under a
/// [`Monitor`](crate::monitor::Monitor).
pub trait RwLockable: Lockable<Request = LockType> {
    /// Returns true if an acquisition of `ty` would block right now.
    ///
    /// Consulted by the deadlock detector before a monitor suspends.
    fn would_block(&self, ty: LockType) -> bool;
}

/// Per-key setup for a weighted semaphore entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreSetup {
    /// The weight limit.
    pub limit: usize,
    /// Whether waiters queue sorted by weight.
    pub priority: bool,
}

impl SemaphoreSetup {
    /// An unprioritised semaphore with the given limit.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            priority: false,
        }
    }
}

impl Lockable for Arc<Semaphore> {
    type Setup = SemaphoreSetup;
    type Request = usize;
    type Guard = OwnedSemaphorePermit;

    fn from_setup(setup: &Self::Setup) -> Self {
        Arc::new(Semaphore::with_priority(setup.limit, setup.priority))
    }

    fn acquire(
        &self,
        weight: usize,
        cx: Cx,
    ) -> impl Future<Output = Result<Self::Guard>> + Send + 'static {
        OwnedSemaphorePermit::acquire(Arc::clone(self), &cx, weight)
    }

    fn wait_unlocked(&self, cx: Cx) -> impl Future<Output = Result<()>> + Send + 'static {
        Semaphore::wait_for_unlock_owned(Arc::clone(self), &cx, 1)
    }

    fn is_locked(&self) -> bool {
        Semaphore::is_locked(self)
    }

    fn count(&self) -> usize {
        Semaphore::count(self)
    }
}

impl Lockable for Lock {
    type Setup = ();
    type Request = ();
    type Guard = LockGuard;

    fn from_setup(_setup: &Self::Setup) -> Self {
        Self::new()
    }

    fn acquire(
        &self,
        (): Self::Request,
        cx: Cx,
    ) -> impl Future<Output = Result<Self::Guard>> + Send + 'static {
        self.lock(&cx)
    }

    fn wait_unlocked(&self, cx: Cx) -> impl Future<Output = Result<()>> + Send + 'static {
        self.wait_for_unlock(&cx)
    }

    fn is_locked(&self) -> bool {
        Self::is_locked(self)
    }

    fn count(&self) -> usize {
        Self::count(self)
    }
}

impl Lockable for RwLockReader {
    type Setup = ();
    type Request = LockType;
    type Guard = RwLockReaderGuard;

    fn from_setup(_setup: &Self::Setup) -> Self {
        Self::new()
    }

    fn acquire(
        &self,
        ty: LockType,
        cx: Cx,
    ) -> impl Future<Output = Result<Self::Guard>> + Send + 'static {
        let lock = self.clone();
        async move { lock.lock(&cx, ty).await }
    }

    fn wait_unlocked(&self, cx: Cx) -> impl Future<Output = Result<()>> + Send + 'static {
        let lock = self.clone();
        async move { lock.wait_for_unlock(&cx).await }
    }

    fn is_locked(&self) -> bool {
        Self::is_locked(self)
    }

    fn count(&self) -> usize {
        Self::count(self)
    }
}

impl RwLockable for RwLockReader {
    fn would_block(&self, ty: LockType) -> bool {
        match ty {
            // Readers only ever wait on a holding writer.
            LockType::Read => self.is_write_locked(),
            LockType::Write => Self::is_locked(self),
        }
    }
}

impl Lockable for RwLockWriter {
    type Setup = ();
    type Request = LockType;
    type Guard = RwLockWriterGuard;

    fn from_setup(_setup: &Self::Setup) -> Self {
        Self::new()
    }

    fn acquire(
        &self,
        ty: LockType,
        cx: Cx,
    ) -> impl Future<Output = Result<Self::Guard>> + Send + 'static {
        let lock = self.clone();
        async move { lock.lock(&cx, ty).await }
    }

    fn wait_unlocked(&self, cx: Cx) -> impl Future<Output = Result<()>> + Send + 'static {
        let lock = self.clone();
        async move { lock.wait_for_unlock(&cx).await }
    }

    fn is_locked(&self) -> bool {
        Self::is_locked(self)
    }

    fn count(&self) -> usize {
        Self::count(self)
    }
}

impl RwLockable for RwLockWriter {
    fn would_block(&self, ty: LockType) -> bool {
        match ty {
            // Any admitted or queued writer gates new readers.
            LockType::Read => self.writer_count() > 0,
            LockType::Write => Self::is_locked(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_type_defaults_to_write() {
        assert_eq!(LockType::default(), LockType::Write);
        assert_eq!(LockType::Read.to_string(), "read");
        assert_eq!(LockType::Write.to_string(), "write");
    }

    #[test]
    fn semaphore_setup_compares_by_value() {
        assert_eq!(SemaphoreSetup::new(3), SemaphoreSetup::new(3));
        assert_ne!(
            SemaphoreSetup::new(3),
            SemaphoreSetup {
                limit: 3,
                priority: true
            }
        );
    }

    #[test]
    fn from_setup_builds_matching_semaphore() {
        let sem = <Arc<Semaphore>>::from_setup(&SemaphoreSetup {
            limit: 4,
            priority: true,
        });
        assert_eq!(sem.limit(), 4);
        assert!(sem.is_priority());
    }
}
