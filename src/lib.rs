//! Cancel-aware pessimistic locking for asynchronous Rust.
//!
//! keylock is a family of interacting synchronization primitives for
//! tasks that share in-process state: a weighted, ordered [`Semaphore`]
//! at the root; a [`Lock`] as its limit-1 specialisation; read-preferring
//! and write-preferring read-write locks built from two inner locks; a
//! countdown [`Barrier`]; a keyed [`LockBox`] with sorted multi-key
//! acquisition and automatic entry cleanup; and a transactional
//! [`Monitor`] with re-entrancy and deadlock detection.
//!
//! # Timed, cancellable waiting
//!
//! Every blocking operation takes a [`Cx`]: an optional deadline plus an
//! optional external [`CancelSignal`], normalised into one abort check.
//! An aborted wait decrements counters exactly as a release would, never
//! strands a lock box entry, and surfaces the signal's reason verbatim.
//!
//! # Runtime independence
//!
//! The primitives are hand-written futures driven by wakers — no
//! executor is required or assumed. Internal state sits behind short
//! `parking_lot` critical sections, so the crate is safe under both
//! single-threaded and multi-threaded executors.
//!
//! # Release handles
//!
//! Every acquisition yields a guard that releases on drop and offers an
//! explicit consuming `release()`; double release is unrepresentable.
//! The [`scoped`] module wraps acquire/use/release around async bodies
//! and lazy sequences.
//!
//! # Example
//!
//! ```ignore
//! use keylock::{BoxRequest, Cx, Lock, LockBox};
//! use std::time::Duration;
//!
//! let boxed: LockBox<Lock> = LockBox::new();
//! let cx = Cx::with_timeout(Duration::from_millis(100));
//!
//! // Keys acquire in canonical order, so overlapping multi-acquires
//! // cannot deadlock through inverse ordering.
//! let guard = boxed
//!     .lock(&cx, vec![BoxRequest::key("accounts/7"), BoxRequest::key("accounts/3")])
//!     .await?;
//! // ... critical section over both keys ...
//! guard.release();
//! ```

#![forbid(unsafe_code)]

pub mod barrier;
pub mod cx;
pub mod error;
mod event;
pub mod lock;
pub mod lockable;
pub mod lockbox;
pub mod monitor;
pub mod rwlock_reader;
pub mod rwlock_writer;
pub mod scoped;
pub mod semaphore;
mod timer;

#[cfg(test)]
mod test_util;

pub use barrier::Barrier;
pub use cx::{CancelSignal, Cx};
pub use error::{CancelReason, Error, ErrorKind, Result};
pub use lock::{Lock, LockGuard};
pub use lockable::{LockType, Lockable, RwLockable, SemaphoreSetup};
pub use lockbox::{BoxRequest, EntryGuard, KeyAcquire, LockBox, LockBoxGuard};
pub use monitor::{
    LockStatus, Monitor, MonitorLockView, MonitorRelease, MonitorRequest, PendingLocks,
};
pub use rwlock_reader::{RwLockReader, RwLockReaderGuard};
pub use rwlock_writer::{RwLockWriter, RwLockWriterGuard};
pub use scoped::{Guarded, with_f};
pub use semaphore::{OwnedSemaphorePermit, Semaphore, SemaphorePermit};
