#![forbid(unsafe_code)]
//! Key-ordered value store implementing the modify protocol.
//!
//! A slice maps keys to encoded value slots. Every mutation runs as a modify: the
//! key lock is taken, the old value is decoded (and its large buffer acquired with
//! the locks the operation asks for), the operation decides what to do, and the
//! protocol installs the outcome. Large buffers are flushed before their slot is
//! installed and reclaimed once no slot refers to them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::admin::ControlHandler;
use crate::primitives::blocks::{BlockStore, BlockStoreStats};
use crate::primitives::concurrency::{EndHint, KeyLocks, LockMode};
use crate::storage::largebuf::{LargeBufMetricsSnapshot, LargeBufStore};
use crate::storage::options::SliceOptions;
use crate::storage::provider::{collect, DataProvider, MaybeBufferedDataProvider};
use crate::storage::value::{
    GrowthEngine, NewValue, OldValue, Value, ValueBody, ValueHeader, ValueLimits,
};
use crate::types::{KvError, Result};

mod value_provider;

pub use value_provider::{LargeValueSource, ValueDataProvider};

/// CAS stamp and recency timestamp assigned to a successful modify.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CasTime {
    /// New compare-and-swap value.
    pub cas: u64,
    /// Recency timestamp recorded with the slot.
    pub timestamp: u32,
}

/// What a modify decided to do with the key.
pub enum Modification<T> {
    /// Install a new value.
    Replace(NewValue, T),
    /// Leave the stored value untouched.
    Keep(T),
    /// Delete the key.
    Remove(T),
}

/// State a modify operation can use while deciding.
pub struct ModifyContext<'a> {
    /// Key being modified.
    pub key: &'a [u8],
    /// Stamp the protocol will apply on replace.
    pub cas_time: CasTime,
    /// Large-buffer store backing the slice.
    pub bufs: &'a LargeBufStore,
    /// Size ceilings of the slice.
    pub limits: ValueLimits,
}

impl<'a> ModifyContext<'a> {
    /// Growth engine over this slice's store and limits.
    pub fn growth_engine(&self) -> GrowthEngine<'a> {
        GrowthEngine::new(self.bufs, self.limits)
    }
}

/// An operation run under the modify protocol.
pub trait ModifyOper {
    /// Result reported to the caller.
    type Output;

    /// Locks needed on an existing large value, or `None` if the operation never
    /// touches its bytes.
    fn large_value_access(&self) -> Option<(LockMode, EndHint)>;

    /// Decides the fate of the key given its current value.
    fn operate(
        &mut self,
        ctx: &ModifyContext<'_>,
        old: Option<OldValue>,
    ) -> Result<Modification<Self::Output>>;
}

/// Outcome of [`Slice::set`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SetResult {
    /// The value was stored.
    Stored,
    /// The value exceeds `max_value_size`; nothing changed.
    TooLarge,
    /// The provider failed; nothing changed.
    ProviderFailed,
}

/// Counters describing a slice.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SliceStats {
    /// Keys currently stored.
    pub keys: u64,
    /// Keys whose value lives out of line.
    pub large_values: u64,
    /// Modifies run.
    pub modifies: u64,
    /// Modifies that installed a new value.
    pub replaced: u64,
    /// Modifies that left the key untouched.
    pub kept: u64,
    /// Modifies that removed the key.
    pub removed: u64,
    /// Block store counters.
    pub blocks: BlockStoreStats,
    /// Large-buffer counters.
    pub largebuf: LargeBufMetricsSnapshot,
}

struct Entry {
    slot: Vec<u8>,
    large: bool,
    recency: u32,
}

#[derive(Default)]
struct Counters {
    modifies: AtomicU64,
    replaced: AtomicU64,
    kept: AtomicU64,
    removed: AtomicU64,
}

/// An in-memory, key-ordered slice of the engine.
pub struct Slice {
    bufs: LargeBufStore,
    limits: ValueLimits,
    options: SliceOptions,
    entries: RwLock<BTreeMap<Vec<u8>, Entry>>,
    key_locks: KeyLocks,
    counters: Counters,
}

impl Slice {
    /// Opens an empty slice over `store`.
    pub fn open(store: Arc<dyn BlockStore>, options: SliceOptions) -> Result<Self> {
        let limits = ValueLimits::new(options.max_inline_size, options.max_value_size)?;
        let bufs = LargeBufStore::open(store)?;
        if limits.max_value_size > bufs.max_size() {
            return Err(KvError::Invalid(
                "max_value_size exceeds large buffer capacity for this block size",
            ));
        }
        debug!(
            max_inline_size = limits.max_inline_size,
            max_value_size = limits.max_value_size,
            segment_size = bufs.segment_size(),
            "slice.open"
        );
        Ok(Self {
            bufs,
            limits,
            key_locks: KeyLocks::new(),
            options,
            entries: RwLock::new(BTreeMap::new()),
            counters: Counters::default(),
        })
    }

    /// Size ceilings in force.
    pub fn limits(&self) -> ValueLimits {
        self.limits
    }

    /// Options the slice was opened with.
    pub fn options(&self) -> &SliceOptions {
        &self.options
    }

    /// Large-buffer store backing this slice.
    pub fn large_buffers(&self) -> &LargeBufStore {
        &self.bufs
    }

    /// Runs `oper` against `key` under the modify protocol.
    pub fn run_modify<O: ModifyOper + ?Sized>(
        &self,
        key: &[u8],
        oper: &mut O,
        cas_time: CasTime,
    ) -> Result<O::Output> {
        let _key_guard = self.key_locks.lock(key);
        self.counters.modifies.fetch_add(1, Ordering::Relaxed);
        let stored = self.entries.read().get(key).map(|e| e.slot.clone());
        let old = match stored {
            Some(slot) => {
                let value = Value::decode(&slot, &self.limits)?;
                let large = match (value.large_ref(), oper.large_value_access()) {
                    (Some(reference), Some((mode, hint))) => {
                        Some(self.bufs.acquire(reference, mode, hint)?)
                    }
                    _ => None,
                };
                Some(OldValue { value, large })
            }
            None => None,
        };
        let old_ref = old.as_ref().and_then(|o| o.value.large_ref());
        let ctx = ModifyContext {
            key,
            cas_time,
            bufs: &self.bufs,
            limits: self.limits,
        };
        match oper.operate(&ctx, old)? {
            Modification::Keep(out) => {
                self.counters.kept.fetch_add(1, Ordering::Relaxed);
                trace!(key_len = key.len(), "slice.keep");
                Ok(out)
            }
            Modification::Replace(new, out) => {
                let NewValue { mut value, large } = new;
                if let Some(mut buf) = large {
                    self.bufs.flush(&mut buf)?;
                }
                if let Err(err) = value.validate(&self.limits) {
                    panic!("modify produced a value that breaks its representation: {err}");
                }
                if value.header.cas.is_some() {
                    value.header.cas = Some(cas_time.cas);
                }
                let new_root = value.large_ref().map(|r| r.root);
                let entry = Entry {
                    slot: value.encode(),
                    large: value.is_large(),
                    recency: cas_time.timestamp,
                };
                self.entries.write().insert(key.to_vec(), entry);
                if let Some(old_ref) = old_ref {
                    if new_root != Some(old_ref.root) {
                        self.bufs.mark_deleted_ref(old_ref)?;
                    }
                }
                self.counters.replaced.fetch_add(1, Ordering::Relaxed);
                trace!(key_len = key.len(), len = value.len(), "slice.replace");
                Ok(out)
            }
            Modification::Remove(out) => {
                self.entries.write().remove(key);
                if let Some(old_ref) = old_ref {
                    self.bufs.mark_deleted_ref(old_ref)?;
                }
                self.counters.removed.fetch_add(1, Ordering::Relaxed);
                trace!(key_len = key.len(), "slice.remove");
                Ok(out)
            }
        }
    }

    /// Stores the bytes of `provider` under `key`, replacing any existing value.
    pub fn set<P: DataProvider>(
        &self,
        key: &[u8],
        provider: P,
        header: ValueHeader,
        cas_time: CasTime,
    ) -> Result<SetResult> {
        let provider = MaybeBufferedDataProvider::new(provider, self.options.buffer_threshold);
        let mut oper = SetOper { provider, header };
        self.run_modify(key, &mut oper, cas_time)
    }

    /// Removes `key`. Returns false if it was absent.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        self.run_modify(key, &mut DeleteOper, CasTime::default())
    }

    /// Returns a provider over the value of `key`.
    ///
    /// A large value stays read-locked until the provider is dropped, so do not
    /// modify the same key from the thread holding it. Other keys, including ones
    /// fed from this provider, are unaffected.
    pub fn get(&self, key: &[u8]) -> Result<Option<ValueDataProvider>> {
        let _key_guard = self.key_locks.lock(key);
        let Some(value) = self.load(key)? else {
            return Ok(None);
        };
        let provider = match value.body {
            ValueBody::Small(bytes) => ValueDataProvider::small(bytes),
            ValueBody::Large(reference) => ValueDataProvider::large(self.bufs.acquire(
                reference,
                LockMode::Read,
                EndHint::Whole,
            )?),
        };
        Ok(Some(provider))
    }

    /// Returns a copy of the value of `key`.
    pub fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.get(key)? {
            Some(mut provider) => Ok(Some(collect(&mut provider)?)),
            None => Ok(None),
        }
    }

    /// Returns the header of `key`'s value.
    pub fn header(&self, key: &[u8]) -> Result<Option<ValueHeader>> {
        Ok(self.load(key)?.map(|v| v.header))
    }

    /// Returns the recency timestamp recorded by the last modify of `key`.
    pub fn recency(&self, key: &[u8]) -> Option<u32> {
        self.entries.read().get(key).map(|e| e.recency)
    }

    /// Returns true if `key` is stored out of line.
    pub fn is_large(&self, key: &[u8]) -> Option<bool> {
        self.entries.read().get(key).map(|e| e.large)
    }

    /// Number of keys stored.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if no key is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Snapshot of the slice counters.
    pub fn stats(&self) -> SliceStats {
        let (keys, large_values) = {
            let entries = self.entries.read();
            let large = entries.values().filter(|e| e.large).count();
            (entries.len() as u64, large as u64)
        };
        SliceStats {
            keys,
            large_values,
            modifies: self.counters.modifies.load(Ordering::Relaxed),
            replaced: self.counters.replaced.load(Ordering::Relaxed),
            kept: self.counters.kept.load(Ordering::Relaxed),
            removed: self.counters.removed.load(Ordering::Relaxed),
            blocks: self.bufs.block_store().stats(),
            largebuf: self.bufs.metrics_snapshot(),
        }
    }

    /// A debug control reporting [`Self::stats`]. Holds only a weak reference.
    pub fn stats_control(self: &Arc<Self>) -> impl ControlHandler + 'static {
        let slice: Weak<Slice> = Arc::downgrade(self);
        move |_args: &[&str]| match slice.upgrade() {
            Some(slice) => render_stats(&slice.stats()),
            None => "slice closed\r\n".to_string(),
        }
    }

    fn load(&self, key: &[u8]) -> Result<Option<Value>> {
        let slot = self.entries.read().get(key).map(|e| e.slot.clone());
        slot.map(|slot| Value::decode(&slot, &self.limits))
            .transpose()
    }
}

fn render_stats(stats: &SliceStats) -> String {
    let rows = [
        ("keys", stats.keys as i64),
        ("large_values", stats.large_values as i64),
        ("modifies", stats.modifies as i64),
        ("replaced", stats.replaced as i64),
        ("kept", stats.kept as i64),
        ("removed", stats.removed as i64),
        ("live_blocks", stats.blocks.live_blocks() as i64),
        ("largebuf_live_segments", stats.largebuf.live_segments()),
        ("largebuf_bytes_flushed", stats.largebuf.bytes_flushed as i64),
        ("largebuf_bytes_loaded", stats.largebuf.bytes_loaded as i64),
    ];
    rows.iter()
        .map(|(name, value)| format!("{name}: {value}\r\n"))
        .collect()
}

struct SetOper<P> {
    provider: P,
    header: ValueHeader,
}

impl<P: DataProvider> ModifyOper for SetOper<P> {
    type Output = SetResult;

    fn large_value_access(&self) -> Option<(LockMode, EndHint)> {
        None
    }

    fn operate(
        &mut self,
        ctx: &ModifyContext<'_>,
        _old: Option<OldValue>,
    ) -> Result<Modification<SetResult>> {
        let size = self.provider.size();
        if size as u64 > ctx.limits.max_value_size {
            if self.provider.discard().is_err() {
                trace!(size, "slice.set.discard_failed");
            }
            return Ok(Modification::Keep(SetResult::TooLarge));
        }
        if ctx.limits.is_inline(size as u64) {
            return Ok(match collect(&mut self.provider) {
                Ok(bytes) => Modification::Replace(
                    NewValue {
                        value: Value::small(self.header, bytes),
                        large: None,
                    },
                    SetResult::Stored,
                ),
                Err(_) => Modification::Keep(SetResult::ProviderFailed),
            });
        }
        let mut buf = ctx.bufs.allocate(size as u64)?;
        let filled = {
            let mut dest = buf.bufs_at_mut(0, size);
            self.provider.fill_into(&mut dest)
        };
        if filled.is_err() {
            ctx.bufs.mark_deleted(buf);
            return Ok(Modification::Keep(SetResult::ProviderFailed));
        }
        Ok(Modification::Replace(
            NewValue {
                value: Value::large(self.header, buf.reference()),
                large: Some(buf),
            },
            SetResult::Stored,
        ))
    }
}

struct DeleteOper;

impl ModifyOper for DeleteOper {
    type Output = bool;

    fn large_value_access(&self) -> Option<(LockMode, EndHint)> {
        None
    }

    fn operate(
        &mut self,
        _ctx: &ModifyContext<'_>,
        old: Option<OldValue>,
    ) -> Result<Modification<bool>> {
        Ok(match old {
            Some(_) => Modification::Remove(true),
            None => Modification::Keep(false),
        })
    }
}
