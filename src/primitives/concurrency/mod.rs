#![forbid(unsafe_code)]
//! Lock tables for the modify protocol.
//!
//! Locks are created on demand per exact key and per exact large-buffer root, so
//! distinct keys and distinct buffers never contend. Entries are held weakly and
//! pruned once no guard refers to them.

use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::{Arc, Weak};

use parking_lot::{
    lock_api::{ArcMutexGuard, ArcRwLockReadGuard, ArcRwLockWriteGuard},
    Mutex, RawMutex, RawRwLock, RwLock,
};
use rustc_hash::FxHashMap;

use crate::types::PageId;

const MIN_PRUNE_AT: usize = 64;

struct LockTable<K, T> {
    entries: FxHashMap<K, Weak<T>>,
    prune_at: usize,
}

impl<K: Hash + Eq, T: Default> LockTable<K, T> {
    fn new() -> Self {
        Self {
            entries: FxHashMap::default(),
            prune_at: MIN_PRUNE_AT,
        }
    }

    /// Returns the live lock for `key`, creating it if every previous holder is gone.
    fn entry<Q>(&mut self, key: &Q) -> Arc<T>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
    {
        if let Some(live) = self.entries.get(key).and_then(Weak::upgrade) {
            return live;
        }
        let fresh = Arc::new(T::default());
        self.entries.insert(key.to_owned(), Arc::downgrade(&fresh));
        if self.entries.len() >= self.prune_at {
            self.entries.retain(|_, lock| lock.strong_count() > 0);
            self.prune_at = (self.entries.len() * 2).max(MIN_PRUNE_AT);
        }
        fresh
    }

    fn live(&self, key: &K) -> Option<Arc<T>> {
        self.entries.get(key).and_then(Weak::upgrade)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Exclusive locks over byte-string keys.
pub struct KeyLocks {
    table: Mutex<LockTable<Vec<u8>, Mutex<()>>>,
}

/// A held key lock; released on drop.
pub struct KeyGuard {
    _guard: ArcMutexGuard<RawMutex, ()>,
}

impl Default for KeyLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyLocks {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            table: Mutex::new(LockTable::new()),
        }
    }

    /// Blocks until `key` is held.
    pub fn lock(&self, key: &[u8]) -> KeyGuard {
        let lock = self.table.lock().entry(key);
        KeyGuard {
            _guard: lock.lock_arc(),
        }
    }

    /// Takes `key` only if nobody holds it.
    pub fn try_lock(&self, key: &[u8]) -> Option<KeyGuard> {
        let lock = self.table.lock().entry(key);
        lock.try_lock_arc().map(|guard| KeyGuard { _guard: guard })
    }
}

/// Access mode requested on a large buffer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockMode {
    /// Shared access; segments may only be read.
    Read,
    /// Exclusive access; segments may be written and the buffer resized.
    Write,
}

/// Which end of a large buffer an access touches.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EndHint {
    /// Only the head: first segment and the mapping origin.
    Head,
    /// Only the tail: last segment and the segment count.
    Tail,
    /// The whole buffer.
    Whole,
}

impl EndHint {
    fn locks_head(self) -> bool {
        matches!(self, EndHint::Head | EndHint::Whole)
    }

    fn locks_tail(self) -> bool {
        matches!(self, EndHint::Tail | EndHint::Whole)
    }
}

enum EndGuard {
    Read {
        _guard: ArcRwLockReadGuard<RawRwLock, ()>,
    },
    Write {
        _guard: ArcRwLockWriteGuard<RawRwLock, ()>,
    },
}

impl EndGuard {
    fn acquire(lock: &Arc<RwLock<()>>, mode: LockMode) -> Self {
        match mode {
            LockMode::Read => EndGuard::Read {
                _guard: lock.read_arc(),
            },
            LockMode::Write => EndGuard::Write {
                _guard: lock.write_arc(),
            },
        }
    }
}

#[derive(Default)]
struct EndPair {
    head: Arc<RwLock<()>>,
    tail: Arc<RwLock<()>>,
}

/// Locks held on the ends of one large buffer.
///
/// Owned guards, so the lock state moves together with the buffer handle that
/// holds it.
pub struct EndLockGuard {
    mode: LockMode,
    hint: EndHint,
    _head: Option<EndGuard>,
    _tail: Option<EndGuard>,
    _pair: Arc<EndPair>,
}

impl EndLockGuard {
    /// Mode the ends were locked in.
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Ends covered by this guard.
    pub fn hint(&self) -> EndHint {
        self.hint
    }
}

/// Reader/writer locks over the head and tail of each large buffer, keyed by root.
pub struct EndLocks {
    table: Mutex<LockTable<PageId, EndPair>>,
}

impl Default for EndLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl EndLocks {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            table: Mutex::new(LockTable::new()),
        }
    }

    /// Locks the ends named by `hint`, head before tail.
    pub fn acquire(&self, root: PageId, mode: LockMode, hint: EndHint) -> EndLockGuard {
        let pair = self.table.lock().entry(&root);
        let head = hint
            .locks_head()
            .then(|| EndGuard::acquire(&pair.head, mode));
        let tail = hint
            .locks_tail()
            .then(|| EndGuard::acquire(&pair.tail, mode));
        EndLockGuard {
            mode,
            hint,
            _head: head,
            _tail: tail,
            _pair: pair,
        }
    }

    /// Returns true if the head of `root` could be write-locked right now.
    pub fn head_is_free(&self, root: PageId) -> bool {
        let pair = self.table.lock().live(&root);
        pair.map_or(true, |pair| pair.head.try_write().is_some())
    }

    /// Returns true if the tail of `root` could be write-locked right now.
    pub fn tail_is_free(&self, root: PageId) -> bool {
        let pair = self.table.lock().live(&root);
        pair.map_or(true, |pair| pair.tail.try_write().is_some())
    }

    /// Number of table entries, including ones awaiting pruning.
    pub fn tracked(&self) -> usize {
        self.table.lock().len()
    }
}
