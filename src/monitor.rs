//! Transactional, re-entrant view over a shared lock box of RW locks.
//!
//! A [`Monitor`] is a short-lived transactional scope: within one monitor,
//! locking a key it already holds with the same type is a silent no-op
//! (the key is *kept*, not re-acquired), while a cross-typed re-entry is a
//! hard error — there is no upgrade or downgrade. Across monitors the
//! usual locking rules of the underlying box apply.
//!
//! # Deadlock detection
//!
//! When monitors share a [`PendingLocks`] table, each acquisition that
//! would block first scans the table for a hold-and-wait cycle: some other
//! monitor pending on a key *this* monitor holds, where either side wants
//! exclusivity. The detecting acquire fails with a deadlock error; the
//! monitor **keeps its existing holdings**. Recovery is the caller's job —
//! unlock and retry, or give up — the library never auto-unwinds holdings
//! on deadlock.
//!
//! # Example
//!
//! ```ignore
//! use keylock::{Cx, LockBox, Monitor, PendingLocks, RwLockWriter};
//!
//! let shared: LockBox<RwLockWriter> = LockBox::new();
//! let pending = PendingLocks::new();
//! let m1 = Monitor::with_deadlock_detection(shared.clone(), pending.clone());
//!
//! let release = m1.lock(&Cx::new(), vec!["balance".into()]).await?;
//! // ... transactional work ...
//! m1.unlock_all();
//! ```

use parking_lot::Mutex as ParkingMutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::cx::Cx;
use crate::error::{Error, Result};
use crate::lockable::{LockType, RwLockable};
use crate::lockbox::{BoxRequest, EntryGuard, LockBox};

/// The shared table of `(key, type)` pairs monitors are blocked on.
///
/// Sharing one table across a set of monitors is what enables deadlock
/// detection between them. Cloning returns a handle to the same table.
#[derive(Debug, Clone, Default)]
pub struct PendingLocks {
    inner: Arc<ParkingMutex<HashMap<(String, LockType), usize>>>,
}

impl PendingLocks {
    /// Creates an empty pending-locks table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of distinct `(key, type)` pairs blocked on.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Returns true if no monitor is blocked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    fn register(&self, key: &str, ty: LockType) {
        *self
            .inner
            .lock()
            .entry((key.to_string(), ty))
            .or_insert(0) += 1;
    }

    fn unregister(&self, key: &str, ty: LockType) {
        let mut table = self.inner.lock();
        let pair = (key.to_string(), ty);
        if let Some(count) = table.get_mut(&pair) {
            *count -= 1;
            if *count == 0 {
                table.remove(&pair);
            }
        }
    }

    fn snapshot(&self) -> Vec<(String, LockType)> {
        self.inner
            .lock()
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|((key, ty), _)| (key.clone(), *ty))
            .collect()
    }
}

/// Keeps the pending entry registered for exactly the await's duration.
struct PendingToken {
    pending: PendingLocks,
    key: String,
    ty: LockType,
}

impl PendingToken {
    fn new(pending: PendingLocks, key: String, ty: LockType) -> Self {
        pending.register(&key, ty);
        Self { pending, key, ty }
    }
}

impl Drop for PendingToken {
    fn drop(&mut self) {
        self.pending.unregister(&self.key, self.ty);
    }
}

/// One request of a monitor multi-acquire.
#[derive(Debug, Clone)]
pub struct MonitorRequest {
    /// The key to acquire.
    pub key: String,
    /// The lock type; bare keys default to write.
    pub ty: LockType,
    /// Optional per-request context overriding the method context.
    pub cx: Option<Cx>,
}

impl MonitorRequest {
    /// Creates a request with an explicit lock type.
    pub fn new(key: impl Into<String>, ty: LockType) -> Self {
        Self {
            key: key.into(),
            ty,
            cx: None,
        }
    }

    /// Creates a read request.
    pub fn read(key: impl Into<String>) -> Self {
        Self::new(key, LockType::Read)
    }

    /// Creates a write request.
    pub fn write(key: impl Into<String>) -> Self {
        Self::new(key, LockType::Write)
    }

    /// Overrides the method context for this request.
    #[must_use]
    pub fn with_cx(mut self, cx: &Cx) -> Self {
        self.cx = Some(cx.clone());
        self
    }
}

impl From<&str> for MonitorRequest {
    fn from(key: &str) -> Self {
        Self::write(key)
    }
}

impl From<String> for MonitorRequest {
    fn from(key: String) -> Self {
        Self::write(key)
    }
}

impl From<(&str, LockType)> for MonitorRequest {
    fn from((key, ty): (&str, LockType)) -> Self {
        Self::new(key, ty)
    }
}

/// The status of a key in a monitor's ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    /// The monitor is blocked acquiring the key.
    Acquiring,
    /// The monitor holds the key.
    Acquired,
}

/// A read-only view of one ledger entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorLockView {
    /// The key.
    pub key: String,
    /// The lock type requested or held.
    pub ty: LockType,
    /// Whether the key is held or still being acquired.
    pub status: LockStatus,
}

#[derive(Debug)]
enum KeyState<L: RwLockable> {
    Acquiring { ty: LockType },
    Acquired { ty: LockType, guard: EntryGuard<L> },
}

impl<L: RwLockable> KeyState<L> {
    fn ty(&self) -> LockType {
        match self {
            Self::Acquiring { ty } | Self::Acquired { ty, .. } => *ty,
        }
    }

    fn acquired_ty(&self) -> Option<LockType> {
        match self {
            Self::Acquired { ty, .. } => Some(*ty),
            Self::Acquiring { .. } => None,
        }
    }
}

#[derive(Debug)]
struct Ledger<L: RwLockable> {
    /// Keys in local insertion order.
    order: Vec<String>,
    entries: HashMap<String, KeyState<L>>,
}

impl<L: RwLockable> Default for Ledger<L> {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            entries: HashMap::new(),
        }
    }
}

/// Removes the `Acquiring` ledger entry if the acquisition never
/// completed — the error path and an abandoned future both end here.
struct AcquiringToken<L: RwLockable> {
    ledger: Arc<ParkingMutex<Ledger<L>>>,
    key: String,
}

impl<L: RwLockable> Drop for AcquiringToken<L> {
    fn drop(&mut self) {
        let mut ledger = self.ledger.lock();
        if matches!(
            ledger.entries.get(&self.key),
            Some(KeyState::Acquiring { .. })
        ) {
            ledger.remove(&self.key);
        }
    }
}

impl<L: RwLockable> Ledger<L> {
    fn remove(&mut self, key: &str) -> Option<KeyState<L>> {
        let state = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(state)
    }
}

/// A transactional re-entrant view over a shared [`LockBox`].
#[derive(Debug)]
pub struct Monitor<L: RwLockable> {
    lock_box: LockBox<L>,
    pending: Option<PendingLocks>,
    ledger: Arc<ParkingMutex<Ledger<L>>>,
}

impl<L> Monitor<L>
where
    L: RwLockable,
    L::Setup: Default,
{
    /// Creates a monitor over the shared box, without deadlock detection.
    #[must_use]
    pub fn new(lock_box: LockBox<L>) -> Self {
        Self {
            lock_box,
            pending: None,
            ledger: Arc::new(ParkingMutex::new(Ledger::default())),
        }
    }

    /// Creates a monitor with deadlock detection through a shared
    /// [`PendingLocks`] table.
    #[must_use]
    pub fn with_deadlock_detection(lock_box: LockBox<L>, pending: PendingLocks) -> Self {
        Self {
            lock_box,
            pending: Some(pending),
            ledger: Arc::new(ParkingMutex::new(Ledger::default())),
        }
    }

    /// Acquires the requested keys in canonical order.
    ///
    /// Same-typed requests for keys this monitor already tracks are silent
    /// no-ops; a cross-typed request fails before anything is acquired.
    /// On any per-key failure — including a detected deadlock — the keys
    /// this call acquired are released in reverse order and the error
    /// propagates; holdings from earlier calls are kept.
    ///
    /// The returned [`MonitorRelease`] releases exactly this call's
    /// acquisitions; dropping it without calling
    /// [`release`](MonitorRelease::release) leaves the keys with the
    /// monitor until [`unlock`](Self::unlock) or
    /// [`unlock_all`](Self::unlock_all).
    pub async fn lock(
        &self,
        cx: &Cx,
        requests: Vec<MonitorRequest>,
    ) -> Result<MonitorRelease<L>> {
        // Re-entrancy pass: drop kept keys, reject type mismatches.
        let mut fresh: Vec<MonitorRequest> = Vec::new();
        {
            let ledger = self.ledger.lock();
            let mut seen = HashSet::new();
            for request in requests {
                if !seen.insert(request.key.clone()) {
                    continue;
                }
                match ledger.entries.get(&request.key) {
                    Some(state) => {
                        if state.ty() != request.ty {
                            return Err(Error::lock_type_mismatch(
                                &request.key,
                                state.ty(),
                                request.ty,
                            ));
                        }
                    }
                    None => fresh.push(request),
                }
            }
        }

        let mut parameters: HashMap<String, (LockType, Option<Cx>)> = fresh
            .iter()
            .map(|r| (r.key.clone(), (r.ty, r.cx.clone())))
            .collect();
        let box_requests = fresh
            .into_iter()
            .map(|r| BoxRequest::new(r.key, L::Setup::default(), r.ty))
            .collect();

        let mut acquired: Vec<String> = Vec::new();
        for acquire in self.lock_box.lock_multi(box_requests) {
            let key = acquire.key().to_string();
            let (ty, cx_override) = parameters.remove(&key).expect("parameters for each key");
            let key_cx = cx_override.unwrap_or_else(|| cx.clone());

            if self.pending.is_some() && self.would_deadlock(&key, ty) {
                tracing::debug!(key = %key, ty = %ty, "monitor deadlock detected");
                self.unwind(&acquired);
                return Err(Error::deadlock(&key, ty));
            }

            {
                let mut ledger = self.ledger.lock();
                ledger.entries.insert(key.clone(), KeyState::Acquiring { ty });
                ledger.order.push(key.clone());
            }
            let acquiring_token = AcquiringToken {
                ledger: Arc::clone(&self.ledger),
                key: key.clone(),
            };
            let pending_token = self
                .pending
                .as_ref()
                .map(|pending| PendingToken::new(pending.clone(), key.clone(), ty));

            let outcome = acquire.invoke(&key_cx).await;
            drop(pending_token);

            match outcome {
                Ok(guard) => {
                    self.ledger
                        .lock()
                        .entries
                        .insert(key.clone(), KeyState::Acquired { ty, guard });
                    drop(acquiring_token);
                    acquired.push(key);
                }
                Err(err) => {
                    drop(acquiring_token);
                    self.unwind(&acquired);
                    return Err(err);
                }
            }
        }

        Ok(MonitorRelease {
            ledger: Arc::clone(&self.ledger),
            keys: acquired,
        })
    }

    /// Releases the given keys, in call order.
    ///
    /// Keys this monitor does not hold are silently skipped.
    pub fn unlock<I>(&self, keys: I)
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut dropped = Vec::new();
        {
            let mut ledger = self.ledger.lock();
            for key in keys {
                let key = key.as_ref();
                if matches!(ledger.entries.get(key), Some(KeyState::Acquired { .. })) {
                    if let Some(state) = ledger.remove(key) {
                        dropped.push(state);
                    }
                }
            }
        }
        // Guards drop outside the ledger lock: releasing wakes waiters.
        drop(dropped);
    }

    /// Releases every held key in reverse insertion order.
    pub fn unlock_all(&self) {
        let mut dropped = Vec::new();
        {
            let mut ledger = self.ledger.lock();
            let keys: Vec<String> = ledger.order.iter().rev().cloned().collect();
            for key in keys {
                if matches!(ledger.entries.get(&key), Some(KeyState::Acquired { .. })) {
                    if let Some(state) = ledger.remove(&key) {
                        dropped.push(state);
                    }
                }
            }
        }
        drop(dropped);
    }

    /// Returns whether this monitor holds the key (or, with `None`, any
    /// key), optionally narrowed by lock type.
    #[must_use]
    pub fn is_locked(&self, key: Option<&str>, ty: Option<LockType>) -> bool {
        let matches_ty = |held: Option<LockType>| match (held, ty) {
            (Some(held), Some(wanted)) => held == wanted,
            (Some(_), None) => true,
            (None, _) => false,
        };
        let ledger = self.ledger.lock();
        match key {
            Some(key) => ledger
                .entries
                .get(key)
                .is_some_and(|state| matches_ty(state.acquired_ty())),
            None => ledger
                .entries
                .values()
                .any(|state| matches_ty(state.acquired_ty())),
        }
    }

    /// Resolves when the tracked key — or, with `None`, every tracked key
    /// — is observably unlocked in the underlying box.
    ///
    /// Keys this monitor does not track resolve immediately.
    pub async fn wait_for_unlock(&self, cx: &Cx, key: Option<&str>) -> Result<()> {
        let keys: Vec<String> = {
            let ledger = self.ledger.lock();
            match key {
                Some(key) => ledger
                    .entries
                    .contains_key(key)
                    .then(|| key.to_string())
                    .into_iter()
                    .collect(),
                None => ledger.order.clone(),
            }
        };
        for key in keys {
            self.lock_box.wait_for_unlock(cx, Some(&key)).await?;
        }
        Ok(())
    }

    /// Returns the number of keys this monitor tracks.
    #[must_use]
    pub fn count(&self) -> usize {
        self.ledger.lock().entries.len()
    }

    /// Returns the ledger in insertion order.
    #[must_use]
    pub fn locks(&self) -> Vec<MonitorLockView> {
        let ledger = self.ledger.lock();
        ledger
            .order
            .iter()
            .filter_map(|key| {
                ledger.entries.get(key).map(|state| MonitorLockView {
                    key: key.clone(),
                    ty: state.ty(),
                    status: match state {
                        KeyState::Acquiring { .. } => LockStatus::Acquiring,
                        KeyState::Acquired { .. } => LockStatus::Acquired,
                    },
                })
            })
            .collect()
    }

    /// True if acquiring `(key, ty)` would close a hold-and-wait cycle.
    ///
    /// No cycle is possible when the live entry would admit the request
    /// without blocking. Otherwise any monitor pending on a key this
    /// monitor holds closes a cycle when either side wants exclusivity.
    fn would_deadlock(&self, key: &str, ty: LockType) -> bool {
        let would_block = self
            .lock_box
            .with_entry(key, |lockable| lockable.would_block(ty))
            .unwrap_or(false);
        if !would_block {
            return false;
        }
        let pending = self.pending.as_ref().expect("detection enabled");
        let ledger = self.ledger.lock();
        pending.snapshot().into_iter().any(|(other_key, other_ty)| {
            ledger
                .entries
                .get(&other_key)
                .and_then(KeyState::acquired_ty)
                .is_some_and(|local_ty| {
                    local_ty == LockType::Write || other_ty == LockType::Write
                })
        })
    }

    /// Releases this call's acquisitions in reverse order.
    fn unwind(&self, acquired: &[String]) {
        let mut dropped = Vec::new();
        {
            let mut ledger = self.ledger.lock();
            for key in acquired.iter().rev() {
                if let Some(state) = ledger.remove(key) {
                    dropped.push(state);
                }
            }
        }
        drop(dropped);
    }
}

/// The scope release returned by [`Monitor::lock`].
///
/// Releases exactly the keys that call acquired — never re-entrant no-ops
/// — in reverse acquisition order. Dropping it without calling
/// [`release`](Self::release) leaves the keys held by the monitor.
#[derive(Debug)]
pub struct MonitorRelease<L: RwLockable> {
    ledger: Arc<ParkingMutex<Ledger<L>>>,
    keys: Vec<String>,
}

impl<L: RwLockable> MonitorRelease<L> {
    /// Returns the keys this call acquired, in acquisition order.
    #[must_use]
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Releases this call's acquisitions in reverse order.
    ///
    /// Keys already released through the monitor are silently skipped.
    pub fn release(self) {
        let mut dropped = Vec::new();
        {
            let mut ledger = self.ledger.lock();
            for key in self.keys.iter().rev() {
                if matches!(ledger.entries.get(key.as_str()), Some(KeyState::Acquired { .. })) {
                    if let Some(state) = ledger.remove(key) {
                        dropped.push(state);
                    }
                }
            }
        }
        drop(dropped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::rwlock_writer::RwLockWriter;
    use crate::test_util::{block_on, poll_once, poll_until_ready};

    fn shared_box() -> LockBox<RwLockWriter> {
        LockBox::new()
    }

    #[test]
    fn bare_keys_default_to_write() {
        let cx = Cx::new();
        let monitor = Monitor::new(shared_box());
        let release = block_on(monitor.lock(&cx, vec!["a".into()])).expect("locked");
        assert!(monitor.is_locked(Some("a"), Some(LockType::Write)));
        assert!(!monitor.is_locked(Some("a"), Some(LockType::Read)));
        release.release();
        assert_eq!(monitor.count(), 0);
    }

    #[test]
    fn same_typed_reentry_is_a_noop() {
        let cx = Cx::new();
        let monitor = Monitor::new(shared_box());
        let first = block_on(monitor.lock(&cx, vec![MonitorRequest::read("a")])).expect("locked");

        let second =
            block_on(monitor.lock(&cx, vec![MonitorRequest::read("a")])).expect("re-entry");
        assert!(second.keys().is_empty(), "kept key is not re-acquired");
        second.release();
        assert!(
            monitor.is_locked(Some("a"), Some(LockType::Read)),
            "no-op release does not touch the holding"
        );

        first.release();
        assert_eq!(monitor.count(), 0);
    }

    #[test]
    fn cross_typed_reentry_fails_before_acquiring() {
        let cx = Cx::new();
        let monitor = Monitor::new(shared_box());
        let _held = block_on(monitor.lock(&cx, vec![MonitorRequest::read("a")])).expect("locked");

        let err = block_on(monitor.lock(&cx, vec![MonitorRequest::write("a"), "b".into()]))
            .expect_err("upgrade refused");
        assert_eq!(err.kind(), ErrorKind::LockTypeMismatch);
        assert!(!monitor.is_locked(Some("b"), None), "nothing was acquired");
    }

    #[test]
    fn duplicate_requests_collapse() {
        let cx = Cx::new();
        let monitor = Monitor::new(shared_box());
        let release = block_on(monitor.lock(
            &cx,
            vec![MonitorRequest::write("a"), MonitorRequest::write("a")],
        ))
        .expect("locked");
        assert_eq!(release.keys(), ["a"]);
        release.release();
    }

    #[test]
    fn monitors_contend_through_the_shared_box() {
        let cx = Cx::new();
        let shared = shared_box();
        let m1 = Monitor::new(shared.clone());
        let m2 = Monitor::new(shared.clone());

        let held = block_on(m1.lock(&cx, vec!["a".into()])).expect("m1 holds a");
        let mut blocked = Box::pin(m2.lock(&cx, vec!["a".into()]));
        assert!(poll_once(&mut blocked).is_none(), "write excludes write");

        drop(held); // scope release not invoked: m1 still holds
        assert!(poll_once(&mut blocked).is_none());

        m1.unlock_all();
        let release = poll_until_ready(&mut blocked).expect("m2 admitted");
        release.release();
        assert!(shared.is_empty(), "entries cleaned up");
    }

    #[test]
    fn unlock_skips_unknown_keys() {
        let cx = Cx::new();
        let monitor = Monitor::new(shared_box());
        let _release = block_on(monitor.lock(&cx, vec!["a".into()])).expect("locked");
        monitor.unlock(["missing", "a"]);
        assert_eq!(monitor.count(), 0);
    }

    #[test]
    fn unlock_all_releases_in_reverse_insertion_order() {
        let cx = Cx::new();
        let monitor = Monitor::new(shared_box());
        let _r1 = block_on(monitor.lock(&cx, vec!["b".into()])).expect("b");
        let _r2 = block_on(monitor.lock(&cx, vec!["a".into()])).expect("a");
        let tracked: Vec<String> = monitor.locks().into_iter().map(|v| v.key).collect();
        assert_eq!(tracked, ["b", "a"], "insertion order");

        monitor.unlock_all();
        assert_eq!(monitor.count(), 0);
    }

    #[test]
    fn two_way_cycle_is_detected_on_the_closing_acquire() {
        let cx = Cx::new();
        let shared = shared_box();
        let pending = PendingLocks::new();
        let m1 = Monitor::with_deadlock_detection(shared.clone(), pending.clone());
        let m2 = Monitor::with_deadlock_detection(shared.clone(), pending.clone());

        let _m1_a = block_on(m1.lock(&cx, vec!["a".into()])).expect("m1 holds a");
        let _m2_b = block_on(m2.lock(&cx, vec!["b".into()])).expect("m2 holds b");

        // M1 blocks acquiring b; no cycle yet.
        let mut m1_b = Box::pin(m1.lock(&cx, vec!["b".into()]));
        assert!(poll_once(&mut m1_b).is_none());
        assert_eq!(pending.len(), 1);

        // M2 attempting a closes the cycle and is refused.
        let err = block_on(m2.lock(&cx, vec!["a".into()])).expect_err("deadlock");
        assert!(err.is_deadlock());
        assert!(
            m2.is_locked(Some("b"), None),
            "detecting monitor keeps its holdings"
        );

        // Recovery: M2 backs off, M1's pending acquire proceeds.
        m2.unlock_all();
        let release = poll_until_ready(&mut m1_b).expect("m1 acquires b");
        release.release();
        m1.unlock_all();
        assert!(pending.is_empty());
        assert!(shared.is_empty());
    }

    #[test]
    fn read_read_overlap_is_not_a_deadlock() {
        let cx = Cx::new();
        let shared = shared_box();
        let pending = PendingLocks::new();
        let m1 = Monitor::with_deadlock_detection(shared.clone(), pending.clone());
        let m2 = Monitor::with_deadlock_detection(shared.clone(), pending.clone());

        let _m1_a = block_on(m1.lock(&cx, vec![MonitorRequest::read("a")])).expect("m1 a");
        let _m2_b = block_on(m2.lock(&cx, vec![MonitorRequest::read("b")])).expect("m2 b");

        // Shared acquisitions cannot close an exclusive cycle.
        let r1 = block_on(m1.lock(&cx, vec![MonitorRequest::read("b")])).expect("m1 reads b");
        let r2 = block_on(m2.lock(&cx, vec![MonitorRequest::read("a")])).expect("m2 reads a");
        r1.release();
        r2.release();
        m1.unlock_all();
        m2.unlock_all();
    }

    #[test]
    fn without_detection_the_same_schedule_blocks() {
        let cx = Cx::new();
        let shared = shared_box();
        let m1 = Monitor::new(shared.clone());
        let m2 = Monitor::new(shared.clone());

        let _m1_a = block_on(m1.lock(&cx, vec!["a".into()])).expect("m1 a");
        let _m2_b = block_on(m2.lock(&cx, vec!["b".into()])).expect("m2 b");

        let mut m1_b = Box::pin(m1.lock(&cx, vec!["b".into()]));
        let mut m2_a = Box::pin(m2.lock(&cx, vec!["a".into()]));
        assert!(poll_once(&mut m1_b).is_none());
        assert!(poll_once(&mut m2_a).is_none());
        // Both sides hang until a timer or an unlock intervenes.
        assert!(poll_once(&mut m1_b).is_none());
        assert!(poll_once(&mut m2_a).is_none());

        m2.unlock_all();
        let release = poll_until_ready(&mut m1_b).expect("m1 proceeds after m2 backs off");
        release.release();
    }

    #[test]
    fn failed_acquisition_unwinds_only_this_call() {
        let cx = Cx::new();
        let shared = shared_box();
        let m1 = Monitor::new(shared.clone());
        let m2 = Monitor::new(shared.clone());

        let _m2_c = block_on(m2.lock(&cx, vec!["c".into()])).expect("m2 holds c");
        let _m1_a = block_on(m1.lock(&cx, vec!["a".into()])).expect("m1 holds a");

        // M1 tries [b, c]: b acquires, c blocks, the timer fires.
        let timed = Cx::with_timeout(std::time::Duration::from_millis(10));
        let mut attempt = Box::pin(m1.lock(&timed, vec!["b".into(), "c".into()]));
        assert!(poll_once(&mut attempt).is_none());
        std::thread::sleep(std::time::Duration::from_millis(20));
        let err = poll_until_ready(&mut attempt).expect_err("timed out");
        assert!(err.is_timeout());
        drop(attempt);

        assert!(m1.is_locked(Some("a"), None), "prior holding kept");
        assert!(!m1.is_locked(Some("b"), None), "this call's key unwound");
        assert!(!shared.contains("b"), "entry cleaned up");
        m1.unlock_all();
        m2.unlock_all();
    }

    #[test]
    fn locks_view_reports_status_and_type() {
        let cx = Cx::new();
        let shared = shared_box();
        let m1 = Monitor::new(shared.clone());
        let m2 = Monitor::new(shared.clone());

        let _held = block_on(m1.lock(&cx, vec!["a".into()])).expect("m1 a");
        let mut blocked = Box::pin(m2.lock(&cx, vec![MonitorRequest::write("a")]));
        assert!(poll_once(&mut blocked).is_none());

        let view = m2.locks();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].key, "a");
        assert_eq!(view[0].ty, LockType::Write);
        assert_eq!(view[0].status, LockStatus::Acquiring);
        assert_eq!(m2.count(), 1);

        drop(blocked);
        assert_eq!(m2.count(), 0, "abandoned acquire leaves the ledger");
    }

    #[test]
    fn wait_for_unlock_is_monitor_local() {
        let cx = Cx::new();
        let shared = shared_box();
        let m1 = Monitor::new(shared.clone());
        let m2 = Monitor::new(shared.clone());
        let _other = block_on(m2.lock(&cx, vec!["other".into()])).expect("m2");

        // m1 tracks nothing: resolves immediately even though m2 holds.
        block_on(m1.wait_for_unlock(&cx, None)).expect("nothing tracked");
        block_on(m1.wait_for_unlock(&cx, Some("other"))).expect("untracked key");

        let _held = block_on(m1.lock(&cx, vec!["mine".into()])).expect("m1");
        let mut wait = Box::pin(m1.wait_for_unlock(&cx, Some("mine")));
        assert!(poll_once(&mut wait).is_none());
        m1.unlock_all();
        poll_until_ready(&mut wait).expect("released");
        m2.unlock_all();
    }
}
