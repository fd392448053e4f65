//! Keyed map of lockables with sorted multi-key acquisition.
//!
//! A [`LockBox`] grows a lockable per string key on first use and removes
//! the entry once the last holder or in-flight acquisition lets go. Multi-
//! key requests are deduplicated (first occurrence wins) and acquired in
//! canonical byte order of the keys, so two callers with overlapping key
//! sets can never deadlock through inverse acquisition order.
//!
//! # Entry lifetime
//!
//! Each entry carries a reference count of live guards plus in-flight
//! acquisitions, taken under the map mutex *before* any suspension. An
//! entry leaves the map exactly when that count returns to zero, so a
//! cancelled wait can never strand an entry and a fresh acquisition can
//! never race a dying one.
//!
//! # Example
//!
//! ```ignore
//! use keylock::{BoxRequest, Cx, Lock, LockBox};
//!
//! let boxed: LockBox<Lock> = LockBox::new();
//! let guard = boxed
//!     .lock(&Cx::new(), vec![BoxRequest::key("a"), BoxRequest::key("b")])
//!     .await?;
//! // "a" and "b" are held; both entries vanish when the guard drops.
//! ```

use core::fmt;
use parking_lot::Mutex as ParkingMutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use crate::cx::Cx;
use crate::error::{Error, Result};
use crate::lockable::Lockable;

/// One per-key request of a multi-key acquisition.
#[derive(Debug, Clone)]
pub struct BoxRequest<L: Lockable> {
    /// The entry key.
    pub key: String,
    /// Construction parameters if the key is not yet live; must match the
    /// live entry's setup otherwise.
    pub setup: L::Setup,
    /// Per-acquisition parameters passed to the lockable.
    pub request: L::Request,
}

impl<L: Lockable> BoxRequest<L> {
    /// Creates a request with explicit setup and acquisition parameters.
    pub fn new(key: impl Into<String>, setup: L::Setup, request: L::Request) -> Self {
        Self {
            key: key.into(),
            setup,
            request,
        }
    }

    /// Creates a request with default setup and acquisition parameters.
    pub fn key(key: impl Into<String>) -> Self
    where
        L::Setup: Default,
        L::Request: Default,
    {
        Self::new(key, L::Setup::default(), L::Request::default())
    }
}

/// A keyed, dynamically growing map of lockables.
///
/// Cloning returns a handle to the same box.
#[derive(Debug)]
pub struct LockBox<L: Lockable> {
    inner: Arc<BoxInner<L>>,
}

impl<L: Lockable> Clone for LockBox<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: Lockable> Default for LockBox<L> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct BoxInner<L: Lockable> {
    entries: ParkingMutex<HashMap<String, BoxEntry<L>>>,
}

#[derive(Debug)]
struct BoxEntry<L: Lockable> {
    lockable: L,
    setup: L::Setup,
    /// Live guards plus in-flight acquisitions referencing this entry.
    refs: usize,
}

/// Deduplicates by key (first occurrence wins) and sorts by key bytes.
fn canonicalize<L: Lockable>(requests: Vec<BoxRequest<L>>) -> Vec<BoxRequest<L>> {
    let mut seen = HashSet::new();
    let mut out: Vec<BoxRequest<L>> = requests
        .into_iter()
        .filter(|request| seen.insert(request.key.clone()))
        .collect();
    out.sort_by(|a, b| a.key.cmp(&b.key));
    out
}

impl<L: Lockable> LockBox<L> {
    /// Creates an empty lock box.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BoxInner {
                entries: ParkingMutex::new(HashMap::new()),
            }),
        }
    }

    /// Acquires every requested key in canonical order.
    ///
    /// Requests are deduplicated by key (first occurrence wins) and walked
    /// in byte order. On any per-key failure the keys acquired so far are
    /// released in reverse order and their entries cleaned up, then the
    /// error propagates unchanged.
    pub async fn lock(&self, cx: &Cx, requests: Vec<BoxRequest<L>>) -> Result<LockBoxGuard<L>> {
        let requests = canonicalize(requests);
        let mut held: Vec<EntryGuard<L>> = Vec::with_capacity(requests.len());
        for request in requests {
            match self.acquire_entry(request, cx.clone()).await {
                Ok(guard) => held.push(guard),
                Err(err) => {
                    // Reverse-order unwind; each drop runs entry cleanup.
                    while held.pop().is_some() {}
                    return Err(err);
                }
            }
        }
        Ok(LockBoxGuard { held })
    }

    /// Returns one lazy acquire per requested key, in canonical order.
    ///
    /// The box's entry lifetime invariants hold for each acquire
    /// independently; release ordering across the returned guards is the
    /// caller's responsibility.
    #[must_use]
    pub fn lock_multi(&self, requests: Vec<BoxRequest<L>>) -> Vec<KeyAcquire<L>> {
        canonicalize(requests)
            .into_iter()
            .map(|request| KeyAcquire {
                lock_box: self.clone(),
                request,
            })
            .collect()
    }

    /// Acquires, runs `body`, and releases every key on any exit path.
    ///
    /// # Errors
    /// Propagates the acquisition error; `body` cannot fail through this
    /// wrapper.
    pub async fn with_f<T, F, Fut>(
        &self,
        cx: &Cx,
        requests: Vec<BoxRequest<L>>,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.lock(cx, requests).await?;
        let value = body().await;
        drop(guard);
        Ok(value)
    }

    /// Acquires every key, hands the per-key guards to `body`, and
    /// guarantees release when the body finishes or unwinds.
    ///
    /// Unlike [`with_f`](Self::with_f) the body owns the guards, so it
    /// controls release ordering — dropping them early, out of order, or
    /// not at all until the body returns.
    ///
    /// # Errors
    /// Propagates the acquisition error; `body` cannot fail through this
    /// wrapper.
    pub async fn with_multi_f<T, F, Fut>(
        &self,
        cx: &Cx,
        requests: Vec<BoxRequest<L>>,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce(Vec<EntryGuard<L>>) -> Fut,
        Fut: Future<Output = T>,
    {
        let mut guards = Vec::new();
        for acquire in self.lock_multi(requests) {
            match acquire.invoke(cx).await {
                Ok(guard) => guards.push(guard),
                Err(err) => {
                    while guards.pop().is_some() {}
                    return Err(err);
                }
            }
        }
        Ok(body(guards).await)
    }

    /// Returns whether the given key — or, with `None`, any entry — is
    /// locked.
    #[must_use]
    pub fn is_locked(&self, key: Option<&str>) -> bool {
        let entries = self.inner.entries.lock();
        match key {
            Some(key) => entries.get(key).is_some_and(|e| e.lockable.is_locked()),
            None => entries.values().any(|e| e.lockable.is_locked()),
        }
    }

    /// Resolves when the given key — or, with `None`, every current entry
    /// — is observably unlocked.
    ///
    /// A key with no live entry is already unlocked.
    pub async fn wait_for_unlock(&self, cx: &Cx, key: Option<&str>) -> Result<()> {
        let targets: Vec<L> = {
            let entries = self.inner.entries.lock();
            match key {
                Some(key) => entries.get(key).map(|e| e.lockable.clone()).into_iter().collect(),
                None => entries.values().map(|e| e.lockable.clone()).collect(),
            }
        };
        for lockable in targets {
            lockable.wait_unlocked(cx.clone()).await?;
        }
        Ok(())
    }

    /// Returns the sum of per-entry counts (holders plus queued waiters).
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner
            .entries
            .lock()
            .values()
            .map(|e| e.lockable.count())
            .sum()
    }

    /// Returns the number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Returns true if no entry is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }

    /// Returns true if the key has a live entry.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.inner.entries.lock().contains_key(key)
    }

    /// Returns the live keys, unordered.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.inner.entries.lock().keys().cloned().collect()
    }

    /// Inspects the live entry for a key, if any.
    pub(crate) fn with_entry<R>(&self, key: &str, f: impl FnOnce(&L) -> R) -> Option<R> {
        self.inner.entries.lock().get(key).map(|e| f(&e.lockable))
    }

    /// Get-or-create the entry and take a reference on it.
    fn checkout(&self, key: &str, setup: &L::Setup) -> Result<L> {
        let mut entries = self.inner.entries.lock();
        match entries.get_mut(key) {
            Some(entry) => {
                if entry.setup != *setup {
                    return Err(Error::box_conflict(
                        key,
                        format!("live setup {:?}, requested {:?}", entry.setup, setup),
                    ));
                }
                entry.refs += 1;
                Ok(entry.lockable.clone())
            }
            None => {
                let lockable = L::from_setup(setup);
                tracing::trace!(key, "lock box entry created");
                entries.insert(
                    key.to_string(),
                    BoxEntry {
                        lockable: lockable.clone(),
                        setup: setup.clone(),
                        refs: 1,
                    },
                );
                Ok(lockable)
            }
        }
    }

    /// Drops a reference; the entry leaves the map at zero.
    fn release_ref(&self, key: &str) {
        let mut entries = self.inner.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            debug_assert!(entry.refs >= 1, "entry released more often than referenced");
            entry.refs -= 1;
            if entry.refs == 0 {
                entries.remove(key);
                tracing::trace!(key, "lock box entry removed");
            }
        }
    }

    async fn acquire_entry(&self, request: BoxRequest<L>, cx: Cx) -> Result<EntryGuard<L>> {
        let BoxRequest {
            key,
            setup,
            request,
        } = request;
        let lockable = self.checkout(&key, &setup)?;
        match lockable.acquire(request, cx).await {
            Ok(guard) => Ok(EntryGuard {
                guard: Some(guard),
                lock_box: self.clone(),
                key,
            }),
            Err(err) => {
                self.release_ref(&key);
                Err(err)
            }
        }
    }
}

/// A lazy per-key acquire returned by [`LockBox::lock_multi`].
#[derive(Debug)]
pub struct KeyAcquire<L: Lockable> {
    lock_box: LockBox<L>,
    request: BoxRequest<L>,
}

impl<L: Lockable> KeyAcquire<L> {
    /// Returns the key this acquire targets.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.request.key
    }

    /// Starts the acquisition under the given context.
    pub fn invoke(self, cx: &Cx) -> impl Future<Output = Result<EntryGuard<L>>> + Send + 'static {
        let cx = cx.clone();
        let Self { lock_box, request } = self;
        async move { lock_box.acquire_entry(request, cx).await }
    }
}

/// A held per-key acquisition; releases and cleans up its entry on drop.
pub struct EntryGuard<L: Lockable> {
    guard: Option<L::Guard>,
    lock_box: LockBox<L>,
    key: String,
}

impl<L: Lockable> EntryGuard<L> {
    /// Returns the held key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Releases the key explicitly.
    pub fn release(self) {
        drop(self);
    }
}

impl<L: Lockable> fmt::Debug for EntryGuard<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryGuard").field("key", &self.key).finish()
    }
}

impl<L: Lockable> Drop for EntryGuard<L> {
    fn drop(&mut self) {
        // Release the underlying lock first so cleanup sees final counts.
        self.guard.take();
        self.lock_box.release_ref(&self.key);
    }
}

/// The held result of [`LockBox::lock`]; releases all keys in reverse
/// acquisition order on drop.
#[must_use = "all keys are released immediately if the guard is not held"]
#[derive(Debug)]
pub struct LockBoxGuard<L: Lockable> {
    held: Vec<EntryGuard<L>>,
}

impl<L: Lockable> LockBoxGuard<L> {
    /// Returns the held keys in acquisition order.
    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        self.held.iter().map(EntryGuard::key).collect()
    }

    /// Releases every key in reverse acquisition order.
    pub fn release(self) {
        drop(self);
    }
}

impl<L: Lockable> Drop for LockBoxGuard<L> {
    fn drop(&mut self) {
        while self.held.pop().is_some() {}
    }
}
