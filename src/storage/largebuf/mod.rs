#![forbid(unsafe_code)]
//! Out-of-line segmented storage for values too large to live inline.
//!
//! A large buffer is a root index block plus an ordered list of segment blocks.
//! Logical byte `pos` lives in segment `(pos + offset) / seg` at
//! `(pos + offset) % seg`, where `offset < seg` is the mapping origin. Prepending
//! moves the origin and pushes fresh segments at the front instead of shifting the
//! payload already stored.
//!
//! Index block layout (big-endian):
//!
//! ```text
//! magic "SGLB" | crc32 | offset u32 | count u32 | segment ids u64 * count | zero pad
//! ```
//!
//! The checksum covers everything from `offset` through the last segment id and is
//! salted with the root block id.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::primitives::blocks::BlockStore;
use crate::primitives::bytes::{be, buf::Cursor};
use crate::primitives::concurrency::{EndHint, EndLockGuard, EndLocks, LockMode};
use crate::storage::provider::{BufferGroup, ConstBufferGroup};
use crate::types::checksum::index_crc32;
use crate::types::{KvError, PageId, Result};


/// Encoded length of a [`LargeBufRef`].
pub const LARGE_REF_LEN: usize = 12;

const INDEX_MAGIC: [u8; 4] = *b"SGLB";
const INDEX_HEADER_LEN: usize = 16;

/// Persisted pointer to a large buffer: its root block and total length.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct LargeBufRef {
    /// Index block of the buffer.
    pub root: PageId,
    /// Logical length in bytes.
    pub size: u32,
}

impl LargeBufRef {
    /// Encodes the reference into its fixed-width form.
    pub fn to_bytes(&self) -> [u8; LARGE_REF_LEN] {
        let mut out = [0u8; LARGE_REF_LEN];
        be::put_u64(&mut out[..8], self.root.0);
        be::put_u32(&mut out[8..], self.size);
        out
    }

    /// Decodes a reference written by [`Self::to_bytes`].
    pub fn decode(src: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(src, "large buffer reference truncated");
        let root = PageId(cur.u64()?);
        let size = cur.u32()?;
        if root.is_none() {
            return Err(KvError::Corruption("large buffer reference has no root"));
        }
        Ok(Self { root, size })
    }
}

/// End of a large buffer that grows or shrinks.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BufEnd {
    /// Before byte 0.
    Head,
    /// After the last byte.
    Tail,
}

impl From<BufEnd> for EndHint {
    fn from(end: BufEnd) -> Self {
        match end {
            BufEnd::Head => EndHint::Head,
            BufEnd::Tail => EndHint::Tail,
        }
    }
}

/// Effect of a resize on a large buffer.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SizeAdjustment {
    /// Change in logical length.
    pub bytes: i64,
    /// Change in segment count.
    pub segments: i64,
}

struct Segment {
    id: PageId,
    data: Option<Box<[u8]>>,
    dirty: bool,
}

impl Segment {
    fn fresh(id: PageId, seg_size: usize) -> Self {
        Self {
            id,
            data: Some(vec![0u8; seg_size].into_boxed_slice()),
            dirty: true,
        }
    }
}

/// An acquired large buffer.
///
/// Owns its lock guards; moving the handle into a new value moves the locks with it.
pub struct LargeBuf {
    root: PageId,
    size: u64,
    offset: usize,
    seg_size: usize,
    segments: VecDeque<Segment>,
    mode: LockMode,
    index_dirty: bool,
    _locks: Option<EndLockGuard>,
}

impl LargeBuf {
    /// Reference describing this buffer's current shape.
    pub fn reference(&self) -> LargeBufRef {
        LargeBufRef {
            root: self.root,
            size: self.size as u32,
        }
    }

    /// Root block id.
    pub fn root(&self) -> PageId {
        self.root
    }

    /// Logical length in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Mapping origin within the first segment.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Segment capacity in bytes.
    pub fn segment_size(&self) -> usize {
        self.seg_size
    }

    /// Number of segments.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Segment block ids, front to back.
    pub fn segment_ids(&self) -> Vec<PageId> {
        self.segments.iter().map(|s| s.id).collect()
    }

    /// Access mode this handle was acquired with.
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Returns true if segment `ix` is resident.
    pub fn is_loaded(&self, ix: usize) -> bool {
        self.segments.get(ix).is_some_and(|s| s.data.is_some())
    }

    /// Segment index holding logical byte `pos`.
    pub fn pos_to_ix(&self, pos: u64) -> usize {
        ((pos + self.offset as u64) / self.seg_size as u64) as usize
    }

    /// Offset within its segment of logical byte `pos`.
    pub fn pos_to_seg_pos(&self, pos: u64) -> usize {
        ((pos + self.offset as u64) % self.seg_size as u64) as usize
    }

    /// Logical position of byte `seg_pos` of segment `ix`.
    pub fn ix_to_pos(&self, ix: usize, seg_pos: usize) -> u64 {
        let raw = ix as u64 * self.seg_size as u64 + seg_pos as u64;
        assert!(
            raw >= self.offset as u64,
            "segment position {ix}:{seg_pos} precedes the mapping origin"
        );
        raw - self.offset as u64
    }

    /// Number of logical bytes held by segment `ix`.
    pub fn segment_len(&self, ix: usize) -> usize {
        let seg = self.seg_size as u64;
        let lo = (ix as u64 * seg).max(self.offset as u64);
        let hi = ((ix as u64 + 1) * seg).min(self.offset as u64 + self.size);
        hi.saturating_sub(lo) as usize
    }

    fn check_range(&self, pos: u64, len: usize) {
        assert!(
            pos + len as u64 <= self.size,
            "range {pos}+{len} outside large buffer of {} bytes",
            self.size
        );
    }

    /// Writable spans covering `[pos, pos + len)`, one per segment touched.
    pub fn bufs_at_mut(&mut self, pos: u64, len: usize) -> BufferGroup<'_> {
        assert_eq!(
            self.mode,
            LockMode::Write,
            "write access through a read-locked large buffer"
        );
        self.check_range(pos, len);
        let mut group = BufferGroup::new();
        if len == 0 {
            return group;
        }
        let first = self.pos_to_ix(pos);
        let mut seg_pos = self.pos_to_seg_pos(pos);
        let mut remaining = len;
        for seg in self.segments.iter_mut().skip(first) {
            if remaining == 0 {
                break;
            }
            let id = seg.id;
            seg.dirty = true;
            let data = match seg.data.as_deref_mut() {
                Some(data) => data,
                None => panic!("large buffer segment {id} written before it was loaded"),
            };
            let n = (data.len() - seg_pos).min(remaining);
            group.add_buffer(&mut data[seg_pos..seg_pos + n]);
            remaining -= n;
            seg_pos = 0;
        }
        assert_eq!(remaining, 0, "segment mapping ran past the last segment");
        group
    }

    /// Read-only spans covering `[pos, pos + len)`.
    pub fn bufs_at(&self, pos: u64, len: usize) -> ConstBufferGroup<'_> {
        self.check_range(pos, len);
        let mut group = ConstBufferGroup::new();
        if len == 0 {
            return group;
        }
        let first = self.pos_to_ix(pos);
        let mut seg_pos = self.pos_to_seg_pos(pos);
        let mut remaining = len;
        for seg in self.segments.iter().skip(first) {
            if remaining == 0 {
                break;
            }
            let data = match seg.data.as_deref() {
                Some(data) => data,
                None => panic!("large buffer segment {} read before it was loaded", seg.id),
            };
            let n = (data.len() - seg_pos).min(remaining);
            group.add_buffer(&data[seg_pos..seg_pos + n]);
            remaining -= n;
            seg_pos = 0;
        }
        assert_eq!(remaining, 0, "segment mapping ran past the last segment");
        group
    }

    /// Copies `bytes` to logical position `pos`.
    pub fn fill_at(&mut self, pos: u64, bytes: &[u8]) {
        self.bufs_at_mut(pos, bytes.len()).write_from(bytes);
    }

    fn segments_for(&self, offset: usize, size: u64) -> usize {
        let end = offset as u64 + size;
        end.div_ceil(self.seg_size as u64).max(1) as usize
    }
}

/// Metrics tracking for large-buffer storage operations.
#[derive(Default)]
pub struct LargeBufMetrics {
    segments_allocated: AtomicU64,
    segments_freed: AtomicU64,
    bytes_flushed: AtomicU64,
    bytes_loaded: AtomicU64,
    index_writes: AtomicU64,
}

/// Snapshot of large-buffer metrics at a point in time.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LargeBufMetricsSnapshot {
    /// Blocks allocated for roots and segments.
    pub segments_allocated: u64,
    /// Blocks returned for roots and segments.
    pub segments_freed: u64,
    /// Segment bytes written back to the block store.
    pub bytes_flushed: u64,
    /// Segment bytes read from the block store.
    pub bytes_loaded: u64,
    /// Index blocks written.
    pub index_writes: u64,
}

impl LargeBufMetricsSnapshot {
    /// Returns the number of blocks currently owned by large buffers.
    pub fn live_segments(&self) -> i64 {
        self.segments_allocated as i64 - self.segments_freed as i64
    }
}

impl LargeBufMetrics {
    /// Creates a snapshot of the current metrics.
    pub fn snapshot(&self) -> LargeBufMetricsSnapshot {
        LargeBufMetricsSnapshot {
            segments_allocated: self.segments_allocated.load(Ordering::Relaxed),
            segments_freed: self.segments_freed.load(Ordering::Relaxed),
            bytes_flushed: self.bytes_flushed.load(Ordering::Relaxed),
            bytes_loaded: self.bytes_loaded.load(Ordering::Relaxed),
            index_writes: self.index_writes.load(Ordering::Relaxed),
        }
    }

    fn add(counter: &AtomicU64, delta: u64) {
        if delta != 0 {
            counter.fetch_add(delta, Ordering::Relaxed);
        }
    }
}

/// Allocates, acquires, resizes and reclaims large buffers on a block store.
pub struct LargeBufStore {
    store: Arc<dyn BlockStore>,
    seg_size: usize,
    max_segments: usize,
    locks: EndLocks,
    metrics: Arc<LargeBufMetrics>,
}

impl LargeBufStore {
    /// Opens a large-buffer layer over `store`.
    pub fn open(store: Arc<dyn BlockStore>) -> Result<Self> {
        let seg_size = store.block_size() as usize;
        if seg_size < INDEX_HEADER_LEN + 8 {
            return Err(KvError::Invalid("block size too small for large buffer index"));
        }
        let max_segments = (seg_size - INDEX_HEADER_LEN) / 8;
        Ok(Self {
            store,
            seg_size,
            max_segments,
            locks: EndLocks::new(),
            metrics: Arc::new(LargeBufMetrics::default()),
        })
    }

    /// Segment capacity in bytes.
    pub fn segment_size(&self) -> usize {
        self.seg_size
    }

    /// Largest segment count an index block can describe.
    pub fn max_segments(&self) -> usize {
        self.max_segments
    }

    /// Largest length representable regardless of mapping origin.
    pub fn max_size(&self) -> u64 {
        (self.max_segments * self.seg_size - (self.seg_size - 1)) as u64
    }

    /// Returns the underlying block store.
    pub fn block_store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    /// Returns a reference to the metrics.
    pub fn metrics(&self) -> Arc<LargeBufMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Returns a snapshot of current metrics.
    pub fn metrics_snapshot(&self) -> LargeBufMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Allocates a zero-filled, write-mode buffer of `size` bytes.
    ///
    /// Nothing references a fresh buffer yet, so it takes no locks; it is persisted
    /// only by [`Self::flush`].
    pub fn allocate(&self, size: u64) -> Result<LargeBuf> {
        if size == 0 {
            return Err(KvError::Invalid("large buffer must not be empty"));
        }
        let count = size.div_ceil(self.seg_size as u64) as usize;
        if count > self.max_segments {
            return Err(KvError::Invalid("large buffer exceeds index capacity"));
        }
        let mut ids = self.allocate_blocks(count + 1)?;
        let root = ids.remove(0);
        let segments = ids
            .into_iter()
            .map(|id| Segment::fresh(id, self.seg_size))
            .collect();
        trace!(root = root.0, size, segments = count, "largebuf.allocate");
        Ok(LargeBuf {
            root,
            size,
            offset: 0,
            seg_size: self.seg_size,
            segments,
            mode: LockMode::Write,
            index_dirty: true,
            _locks: None,
        })
    }

    /// Locks and opens the buffer behind `reference`, loading the segments on the
    /// ends named by `hint`.
    pub fn acquire(&self, reference: LargeBufRef, mode: LockMode, hint: EndHint) -> Result<LargeBuf> {
        let mut buf = self.acquire_unloaded(reference, mode, hint)?;
        let last = buf.segments.len() - 1;
        let range = match hint {
            EndHint::Head => 0..1,
            EndHint::Tail => last..last + 1,
            EndHint::Whole => 0..last + 1,
        };
        for ix in range {
            self.load_segment(&mut buf.segments[ix])?;
        }
        trace!(
            root = reference.root.0,
            size = reference.size,
            ?mode,
            ?hint,
            "largebuf.acquire"
        );
        Ok(buf)
    }

    fn acquire_unloaded(
        &self,
        reference: LargeBufRef,
        mode: LockMode,
        hint: EndHint,
    ) -> Result<LargeBuf> {
        let guard = self.locks.acquire(reference.root, mode, hint);
        let mut block = vec![0u8; self.seg_size];
        self.store.read(reference.root, &mut block)?;
        let (offset, ids) = self.decode_index(reference.root, &block)?;
        if ids.is_empty() {
            return Err(KvError::Corruption("large buffer index has no segments"));
        }
        if offset >= self.seg_size {
            return Err(KvError::Corruption("large buffer origin beyond first segment"));
        }
        let buf = LargeBuf {
            root: reference.root,
            size: reference.size as u64,
            offset,
            seg_size: self.seg_size,
            segments: ids
                .into_iter()
                .map(|id| Segment {
                    id,
                    data: None,
                    dirty: false,
                })
                .collect(),
            mode,
            index_dirty: false,
            _locks: Some(guard),
        };
        if buf.segments_for(offset, buf.size) != buf.segments.len() {
            return Err(KvError::Corruption(
                "large buffer index disagrees with reference size",
            ));
        }
        Ok(buf)
    }

    /// Grows `buf` by `delta` bytes on `end`, adding segments as needed.
    ///
    /// New bytes are zero until written. Existing segment payloads never move.
    pub fn extend(&self, buf: &mut LargeBuf, delta: u64, end: BufEnd) -> Result<SizeAdjustment> {
        assert_eq!(buf.mode, LockMode::Write, "extending a read-locked large buffer");
        if delta == 0 {
            return Ok(SizeAdjustment::default());
        }
        let seg = self.seg_size as u64;
        let (added, new_offset) = match end {
            BufEnd::Tail => {
                let needed = buf.segments_for(buf.offset, buf.size + delta);
                (needed - buf.segments.len(), buf.offset)
            }
            BufEnd::Head => {
                let offset = buf.offset as u64;
                if delta <= offset {
                    (0, (offset - delta) as usize)
                } else {
                    let k = (delta - offset).div_ceil(seg);
                    (k as usize, (offset + k * seg - delta) as usize)
                }
            }
        };
        if buf.segments.len() + added > self.max_segments {
            return Err(KvError::Invalid("large buffer exceeds index capacity"));
        }
        let ids = self.allocate_blocks(added)?;
        match end {
            BufEnd::Tail => {
                for id in ids {
                    buf.segments.push_back(Segment::fresh(id, self.seg_size));
                }
            }
            BufEnd::Head => {
                for id in ids.into_iter().rev() {
                    buf.segments.push_front(Segment::fresh(id, self.seg_size));
                }
            }
        }
        buf.offset = new_offset;
        buf.size += delta;
        buf.index_dirty = true;
        trace!(
            root = buf.root.0,
            delta,
            ?end,
            added,
            size = buf.size,
            "largebuf.extend"
        );
        Ok(SizeAdjustment {
            bytes: delta as i64,
            segments: added as i64,
        })
    }

    /// Removes `delta` bytes from `end`, releasing segments that no longer hold
    /// data. Exactly reverses an [`Self::extend`] of the same amount on the same end.
    pub fn shrink(&self, buf: &mut LargeBuf, delta: u64, end: BufEnd) -> SizeAdjustment {
        assert_eq!(buf.mode, LockMode::Write, "shrinking a read-locked large buffer");
        assert!(delta <= buf.size, "shrinking {delta} bytes from {}", buf.size);
        if delta == 0 {
            return SizeAdjustment::default();
        }
        let mut released = Vec::new();
        match end {
            BufEnd::Tail => {
                buf.size -= delta;
                let needed = buf.segments_for(buf.offset, buf.size);
                while buf.segments.len() > needed {
                    if let Some(seg) = buf.segments.pop_back() {
                        released.push(seg.id);
                    }
                }
            }
            BufEnd::Head => {
                buf.size -= delta;
                let mut offset = buf.offset as u64 + delta;
                while offset >= self.seg_size as u64 && buf.segments.len() > 1 {
                    if let Some(seg) = buf.segments.pop_front() {
                        released.push(seg.id);
                    }
                    offset -= self.seg_size as u64;
                }
                buf.offset = offset as usize;
            }
        }
        let removed = released.len();
        self.free_blocks(released);
        buf.index_dirty = true;
        trace!(
            root = buf.root.0,
            delta,
            ?end,
            removed,
            size = buf.size,
            "largebuf.shrink"
        );
        SizeAdjustment {
            bytes: -(delta as i64),
            segments: -(removed as i64),
        }
    }

    /// Releases every block of `buf`. Consumes the handle and its locks.
    pub fn mark_deleted(&self, buf: LargeBuf) {
        let mut ids: Vec<PageId> = buf.segments.iter().map(|s| s.id).collect();
        ids.push(buf.root);
        let count = ids.len();
        self.free_blocks(ids);
        trace!(root = buf.root.0, blocks = count, "largebuf.mark_deleted");
    }

    /// Releases the buffer behind a stored reference without loading its segments.
    pub fn mark_deleted_ref(&self, reference: LargeBufRef) -> Result<()> {
        let buf = self.acquire_unloaded(reference, LockMode::Write, EndHint::Whole)?;
        self.mark_deleted(buf);
        Ok(())
    }

    /// Writes dirty segments and, if the shape changed, the index block.
    pub fn flush(&self, buf: &mut LargeBuf) -> Result<()> {
        assert_eq!(buf.mode, LockMode::Write, "flushing a read-locked large buffer");
        let mut flushed = 0u64;
        for seg in buf.segments.iter_mut() {
            if !seg.dirty {
                continue;
            }
            if let Some(data) = seg.data.as_deref() {
                self.store.write(seg.id, data)?;
                flushed += data.len() as u64;
            }
            seg.dirty = false;
        }
        LargeBufMetrics::add(&self.metrics.bytes_flushed, flushed);
        if buf.index_dirty {
            let block = self.encode_index(buf);
            self.store.write(buf.root, &block)?;
            buf.index_dirty = false;
            LargeBufMetrics::add(&self.metrics.index_writes, 1);
        }
        trace!(root = buf.root.0, flushed, "largebuf.flush");
        Ok(())
    }

    /// Logs the layout of `buf` segment by segment.
    pub fn dump(&self, buf: &LargeBuf) {
        debug!(
            root = buf.root.0,
            size = buf.size,
            offset = buf.offset,
            segments = buf.segments.len(),
            "largebuf.dump.start"
        );
        for (ix, seg) in buf.segments.iter().enumerate() {
            debug!(
                index = ix,
                block = seg.id.0,
                used = buf.segment_len(ix),
                loaded = seg.data.is_some(),
                dirty = seg.dirty,
                "largebuf.dump.segment"
            );
        }
    }

    fn allocate_blocks(&self, count: usize) -> Result<Vec<PageId>> {
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            match self.store.allocate() {
                Ok(id) => ids.push(id),
                Err(err) => {
                    self.free_blocks(ids);
                    return Err(err);
                }
            }
        }
        LargeBufMetrics::add(&self.metrics.segments_allocated, count as u64);
        Ok(ids)
    }

    fn free_blocks(&self, ids: Vec<PageId>) {
        let count = ids.len() as u64;
        for id in ids {
            self.store.free(id);
        }
        LargeBufMetrics::add(&self.metrics.segments_freed, count);
    }

    fn load_segment(&self, seg: &mut Segment) -> Result<()> {
        if seg.data.is_some() {
            return Ok(());
        }
        let mut data = vec![0u8; self.seg_size].into_boxed_slice();
        self.store.read(seg.id, &mut data)?;
        seg.data = Some(data);
        LargeBufMetrics::add(&self.metrics.bytes_loaded, self.seg_size as u64);
        Ok(())
    }

    fn encode_index(&self, buf: &LargeBuf) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.seg_size);
        out.extend_from_slice(&INDEX_MAGIC);
        be::push_u32(&mut out, 0);
        be::push_u32(&mut out, buf.offset as u32);
        be::push_u32(&mut out, buf.segments.len() as u32);
        for seg in &buf.segments {
            be::push_u64(&mut out, seg.id.0);
        }
        let body_end = out.len();
        let crc = index_crc32(buf.root.0, &out[8..body_end]);
        be::put_u32(&mut out[4..8], crc);
        out.resize(self.seg_size, 0);
        out
    }

    fn decode_index(&self, root: PageId, block: &[u8]) -> Result<(usize, Vec<PageId>)> {
        let mut cur = Cursor::new(block, "large buffer index truncated");
        if cur.take(4)? != INDEX_MAGIC {
            return Err(KvError::Corruption("large buffer index magic mismatch"));
        }
        let stored_crc = cur.u32()?;
        let offset = cur.u32()? as usize;
        let count = cur.u32()? as usize;
        if count > self.max_segments {
            return Err(KvError::Corruption("large buffer index count out of range"));
        }
        let body_end = INDEX_HEADER_LEN + count * 8;
        if index_crc32(root.0, &block[8..body_end]) != stored_crc {
            return Err(KvError::Corruption("large buffer index checksum mismatch"));
        }
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            let id = PageId(cur.u64()?);
            if id.is_none() {
                return Err(KvError::Corruption("large buffer index names no block"));
            }
            ids.push(id);
        }
        Ok((offset, ids))
    }
}
