#![forbid(unsafe_code)]
//! Fixed-size block storage backing large-buffer segments and index blocks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use crate::types::{KvError, PageId, Result};

/// Smallest block size the large-buffer index format can live in.
pub const MIN_BLOCK_SIZE: u32 = 64;

/// Fixed-size block storage that large buffers allocate their segments from.
pub trait BlockStore: Send + Sync + 'static {
    /// Returns the block size in bytes.
    fn block_size(&self) -> u32;
    /// Allocates a zero-filled block.
    fn allocate(&self) -> Result<PageId>;
    /// Returns a block to the free list.
    ///
    /// Freeing a block that is not allocated means the caller's bookkeeping is
    /// corrupt; implementations panic.
    fn free(&self, id: PageId);
    /// Copies a block's contents into `dst`, which must be exactly one block long.
    fn read(&self, id: PageId, dst: &mut [u8]) -> Result<()>;
    /// Overwrites a block with `src`, which must be exactly one block long.
    fn write(&self, id: PageId, src: &[u8]) -> Result<()>;
    /// Returns a snapshot of allocation counters.
    fn stats(&self) -> BlockStoreStats;
}

/// Allocation counters for a block store.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BlockStoreStats {
    /// Blocks handed out over the store's lifetime.
    pub allocated: u64,
    /// Blocks returned over the store's lifetime.
    pub freed: u64,
    /// Block reads served.
    pub reads: u64,
    /// Block writes served.
    pub writes: u64,
}

impl BlockStoreStats {
    /// Returns the number of blocks currently allocated.
    pub fn live_blocks(&self) -> u64 {
        self.allocated - self.freed
    }
}

/// Options for [`MemBlockStore`].
#[derive(Clone, Copy, Debug)]
pub struct MemBlockStoreOptions {
    /// Size of each block in bytes.
    pub block_size: u32,
    /// Upper bound on simultaneously allocated blocks.
    pub max_blocks: Option<u64>,
}

impl Default for MemBlockStoreOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            max_blocks: None,
        }
    }
}

/// Heap-backed block store with a LIFO free list.
pub struct MemBlockStore {
    block_size: u32,
    max_blocks: Option<u64>,
    inner: Mutex<Inner>,
    allocated: AtomicU64,
    freed: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
}

#[derive(Default)]
struct Inner {
    blocks: HashMap<PageId, Box<[u8]>>,
    free: Vec<PageId>,
    next: u64,
}

impl MemBlockStore {
    /// Creates an empty store.
    pub fn new(options: MemBlockStoreOptions) -> Result<Self> {
        if options.block_size < MIN_BLOCK_SIZE {
            return Err(KvError::Invalid("block size below minimum"));
        }
        Ok(Self {
            block_size: options.block_size,
            max_blocks: options.max_blocks,
            inner: Mutex::new(Inner {
                next: 1,
                ..Inner::default()
            }),
            allocated: AtomicU64::new(0),
            freed: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        })
    }

    /// Returns true if `id` is currently allocated.
    pub fn is_allocated(&self, id: PageId) -> bool {
        self.inner.lock().blocks.contains_key(&id)
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len != self.block_size as usize {
            return Err(KvError::Invalid("buffer length does not match block size"));
        }
        Ok(())
    }
}

impl BlockStore for MemBlockStore {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn allocate(&self) -> Result<PageId> {
        let mut inner = self.inner.lock();
        if let Some(max) = self.max_blocks {
            if inner.blocks.len() as u64 >= max {
                return Err(KvError::NoSpace);
            }
        }
        let id = match inner.free.pop() {
            Some(id) => id,
            None => {
                let id = PageId(inner.next);
                inner.next += 1;
                id
            }
        };
        inner
            .blocks
            .insert(id, vec![0u8; self.block_size as usize].into_boxed_slice());
        self.allocated.fetch_add(1, Ordering::Relaxed);
        trace!(block = id.0, "blocks.allocate");
        Ok(id)
    }

    fn free(&self, id: PageId) {
        let mut inner = self.inner.lock();
        if inner.blocks.remove(&id).is_none() {
            panic!("freeing block {id} which is not allocated");
        }
        inner.free.push(id);
        self.freed.fetch_add(1, Ordering::Relaxed);
        trace!(block = id.0, "blocks.free");
    }

    fn read(&self, id: PageId, dst: &mut [u8]) -> Result<()> {
        self.check_len(dst.len())?;
        let inner = self.inner.lock();
        let block = inner
            .blocks
            .get(&id)
            .ok_or(KvError::Corruption("read of unallocated block"))?;
        dst.copy_from_slice(block);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write(&self, id: PageId, src: &[u8]) -> Result<()> {
        self.check_len(src.len())?;
        let mut inner = self.inner.lock();
        let block = inner
            .blocks
            .get_mut(&id)
            .ok_or(KvError::Corruption("write to unallocated block"))?;
        block.copy_from_slice(src);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn stats(&self) -> BlockStoreStats {
        BlockStoreStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            freed: self.freed.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }
}
