//! Keyed settlement registry.
//!
//! Maps a key to a single in-flight settlement that any number of waiters can
//! join. The first caller for a key runs the executor (the side effect that
//! will eventually settle the key), later callers only join.
//!
//! ## Architecture
//!
//! ```text
//! promise(k, exec) ──► entry(k) vacant?  ── yes ──► insert [tx0], run exec
//!                                 │
//!                                 └─ no ──► push tx1 (exec ignored)
//!
//! resolve(k, v)    ──► remove(k) ──► send v to tx0, tx1, ...
//! resolve_all(v)   ──► remove every key, same as above
//! ```
//!
//! Settling removes the entry, so a key is settled exactly once per round and
//! the next `promise(k, ..)` starts a fresh round.

use std::{
    future::Future,
    hash::Hash,
    pin::Pin,
    task::{Context, Poll},
};

use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::oneshot;

type Waiter<T, E> = oneshot::Sender<Result<T, E>>;

// ============================================================================
// Settlement future
// ============================================================================

/// Future returned by [`SettlementRegistry::promise`].
///
/// Resolves to `None` when the registry was dropped without settling the key.
#[derive(Debug)]
pub struct Settlement<T, E> {
    rx: oneshot::Receiver<Result<T, E>>,
}

impl<T, E> Future for Settlement<T, E> {
    type Output = Option<Result<T, E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(Result::ok)
    }
}

// ============================================================================
// Keyed registry
// ============================================================================

/// Registry of keyed settlements with wildcard settling.
#[derive(Debug)]
pub struct SettlementRegistry<K, T, E>
where
    K: Eq + Hash,
{
    pending: DashMap<K, Vec<Waiter<T, E>>>,
}

impl<K, T, E> Default for SettlementRegistry<K, T, E>
where
    K: Eq + Hash + Clone,
    T: Clone,
    E: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T, E> SettlementRegistry<K, T, E>
where
    K: Eq + Hash + Clone,
    T: Clone,
    E: Clone,
{
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    /// Join the settlement for `key`, creating it if none is outstanding.
    ///
    /// `executor` runs only when this call created the entry, after the entry
    /// is registered, so it may settle the key synchronously.
    pub fn promise<F>(&self, key: K, executor: F) -> Settlement<T, E>
    where
        F: FnOnce(),
    {
        let (tx, rx) = oneshot::channel();
        let created = match self.pending.entry(key) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().push(tx);
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(vec![tx]);
                true
            }
        };
        if created {
            executor();
        }
        Settlement { rx }
    }

    /// Whether a settlement for `key` is outstanding.
    pub fn exists(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    /// Number of outstanding keys.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn resolve(&self, key: &K, value: T) {
        self.settle(key, Ok(value));
    }

    pub fn reject(&self, key: &K, error: E) {
        self.settle(key, Err(error));
    }

    pub fn resolve_many(&self, keys: &[K], value: T) {
        for key in keys {
            self.settle(key, Ok(value.clone()));
        }
    }

    pub fn reject_many(&self, keys: &[K], error: E) {
        for key in keys {
            self.settle(key, Err(error.clone()));
        }
    }

    /// Resolve every outstanding key (the `'*'` wildcard).
    pub fn resolve_all(&self, value: T) {
        self.settle_all(Ok(value));
    }

    /// Reject every outstanding key (the `'*'` wildcard).
    pub fn reject_all(&self, error: E) {
        self.settle_all(Err(error));
    }

    fn settle(&self, key: &K, result: Result<T, E>) {
        if let Some((_, waiters)) = self.pending.remove(key) {
            notify(waiters, result);
        }
    }

    fn settle_all(&self, result: Result<T, E>) {
        // Collect first so no shard lock is held while waking waiters
        let keys: Vec<K> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            self.settle(&key, result.clone());
        }
    }
}

fn notify<T: Clone, E: Clone>(waiters: Vec<Waiter<T, E>>, result: Result<T, E>) {
    for waiter in waiters {
        // A waiter that stopped listening is not an error
        let _ = waiter.send(result.clone());
    }
}

// ============================================================================
// Single slot
// ============================================================================

/// A registry with exactly one implicit key.
///
/// Used for the account loading step, where a loader waits for the UI to
/// accept or reject an intermediate step.
#[derive(Debug)]
pub struct SettlementSlot<T, E> {
    inner: SettlementRegistry<(), T, E>,
}

impl<T: Clone, E: Clone> Default for SettlementSlot<T, E> {
    fn default() -> Self {
        Self {
            inner: SettlementRegistry::new(),
        }
    }
}

impl<T: Clone, E: Clone> SettlementSlot<T, E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn promise<F: FnOnce()>(&self, executor: F) -> Settlement<T, E> {
        self.inner.promise((), executor)
    }

    pub fn is_pending(&self) -> bool {
        self.inner.exists(&())
    }

    pub fn resolve(&self, value: T) {
        self.inner.resolve(&(), value);
    }

    pub fn reject(&self, error: E) {
        self.inner.reject(&(), error);
    }
}
