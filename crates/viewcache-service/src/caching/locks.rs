//! Canonical per-key compilation locks.
//!
//! The [`KeyLockRegistry`] hands out the same lock for equal [`ViewExecutionCacheKey`]s for as
//! long as anybody holds on to it. Once the last handle for a key is gone, the entry is removed
//! from the registry, and a later lookup creates a fresh lock. This keeps the registry bounded by
//! the number of keys currently in use, rather than all keys ever seen.

use std::collections::hash_map::Entry as MapEntry;
use std::fmt;
use std::sync::{Arc, Mutex as SyncMutex, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rustc_hash::FxHashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::types::VersionCorrection;

use super::ViewExecutionCacheKey;

type FineLocks = FxHashMap<VersionCorrection, FxHashMap<DateTime<Utc>, Weak<FineLock>>>;

/// The locks of one key: the broad lock, and the fine locks nested under it.
struct LockSet {
    key: ViewExecutionCacheKey,
    registry: Weak<RegistryInner>,
    broad: Arc<Mutex<()>>,
    fine: SyncMutex<FineLocks>,
}

impl Drop for LockSet {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        // somebody might have raced us and already registered a new set for this key
        registry
            .sets
            .remove_if(&self.key, |_, set| set.strong_count() == 0);
    }
}

struct FineLock {
    set: Arc<LockSet>,
    resolution: VersionCorrection,
    valuation: DateTime<Utc>,
    mutex: Arc<Mutex<()>>,
}

impl Drop for FineLock {
    fn drop(&mut self) {
        let mut fine = self.set.fine.lock().unwrap();
        let MapEntry::Occupied(mut by_valuation) = fine.entry(self.resolution) else {
            return;
        };
        if let MapEntry::Occupied(lock) = by_valuation.get_mut().entry(self.valuation) {
            if lock.get().strong_count() == 0 {
                lock.remove();
            }
        }
        if by_valuation.get().is_empty() {
            by_valuation.remove();
        }
    }
}

#[derive(Clone)]
enum Anchor {
    Broad(Arc<LockSet>),
    Fine(Arc<FineLock>),
}

/// A handle to a canonical lock.
///
/// Holding the handle keeps the lock registered. Cloning it is cheap.
#[derive(Clone)]
pub struct KeyLock {
    mutex: Arc<Mutex<()>>,
    anchor: Anchor,
}

impl KeyLock {
    /// Waits for and acquires the lock.
    ///
    /// The lock is released when the returned guard is dropped, on every exit path.
    pub async fn lock(&self) -> KeyLockGuard {
        let guard = self.mutex.clone().lock_owned().await;
        KeyLockGuard {
            _guard: guard,
            _lock: self.clone(),
        }
    }

    /// Acquires the lock if nobody else is currently holding it.
    pub fn try_lock(&self) -> Option<KeyLockGuard> {
        let guard = self.mutex.clone().try_lock_owned().ok()?;
        Some(KeyLockGuard {
            _guard: guard,
            _lock: self.clone(),
        })
    }

    /// Whether both handles refer to the very same lock.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.mutex, &other.mutex)
    }

    fn key(&self) -> &ViewExecutionCacheKey {
        match &self.anchor {
            Anchor::Broad(set) => &set.key,
            Anchor::Fine(lock) => &lock.set.key,
        }
    }
}

impl fmt::Debug for KeyLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("KeyLock");
        s.field("key", self.key());
        if let Anchor::Fine(lock) = &self.anchor {
            s.field("resolution", &lock.resolution)
                .field("valuation", &lock.valuation);
        }
        s.finish()
    }
}

/// An acquired [`KeyLock`].
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct KeyLockGuard {
    // the guard must be released before the handle keeping the lock registered
    _guard: OwnedMutexGuard<()>,
    _lock: KeyLock,
}

impl fmt::Debug for KeyLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyLockGuard").field(&self._lock).finish()
    }
}

#[derive(Default)]
struct RegistryInner {
    sets: DashMap<ViewExecutionCacheKey, Weak<LockSet>>,
}

/// Canonicalizes compilation locks per [`ViewExecutionCacheKey`].
///
/// Looking up a lock never blocks on another lock being held. Acquiring it is up to the caller.
#[derive(Clone, Default)]
pub struct KeyLockRegistry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for KeyLockRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyLockRegistry")
            .field("keys", &self.inner.sets.len())
            .finish()
    }
}

impl KeyLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the broad lock of `key`.
    ///
    /// This guards the compilation of any temporal instance of the key.
    pub fn broad_lock(&self, key: &ViewExecutionCacheKey) -> KeyLock {
        let set = self.lock_set(key);
        KeyLock {
            mutex: set.broad.clone(),
            anchor: Anchor::Broad(set),
        }
    }

    /// Returns the broad lock of `key` together with the fine lock of one temporal instance.
    ///
    /// The fine lock is specific to the `(resolution, valuation)` pair and is nested under the
    /// same key as the broad lock.
    pub fn locks(
        &self,
        key: &ViewExecutionCacheKey,
        valuation: DateTime<Utc>,
        resolution: VersionCorrection,
    ) -> (KeyLock, KeyLock) {
        let set = self.lock_set(key);
        let fine = {
            let mut locks = set.fine.lock().unwrap();
            let slot = locks
                .entry(resolution)
                .or_default()
                .entry(valuation)
                .or_default();
            match slot.upgrade() {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(FineLock {
                        set: set.clone(),
                        resolution,
                        valuation,
                        mutex: Default::default(),
                    });
                    *slot = Arc::downgrade(&lock);
                    lock
                }
            }
        };

        let broad = KeyLock {
            mutex: set.broad.clone(),
            anchor: Anchor::Broad(set),
        };
        let fine = KeyLock {
            mutex: fine.mutex.clone(),
            anchor: Anchor::Fine(fine),
        };
        (broad, fine)
    }

    /// The number of keys that currently have live locks.
    pub fn len(&self) -> usize {
        self.inner.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sets.is_empty()
    }

    /// Looks up or creates the lock set of `key`.
    ///
    /// The map entry is held for the whole operation, so of two racing lookups exactly one
    /// creates the set and the other observes it.
    fn lock_set(&self, key: &ViewExecutionCacheKey) -> Arc<LockSet> {
        let create = || {
            tracing::trace!(%key, "Creating compilation locks");
            Arc::new(LockSet {
                key: key.clone(),
                registry: Arc::downgrade(&self.inner),
                broad: Default::default(),
                fine: Default::default(),
            })
        };

        match self.inner.sets.entry(key.clone()) {
            Entry::Occupied(mut entry) => match entry.get().upgrade() {
                Some(set) => set,
                None => {
                    let set = create();
                    entry.insert(Arc::downgrade(&set));
                    set
                }
            },
            Entry::Vacant(entry) => {
                let set = create();
                entry.insert(Arc::downgrade(&set));
                set
            }
        }
    }
}
