#![forbid(unsafe_code)]
//! One-shot byte sources and the scatter/gather groups they move bytes through.
//!
//! A [`DataProvider`] stands for bytes that have not been materialized yet: an
//! in-memory buffer, a stored value, or a stream that can only be read once. Its data
//! must be consumed exactly once, by [`DataProvider::fill_into`],
//! [`DataProvider::as_buffers`] or [`DataProvider::discard`]. Consuming twice is a
//! caller bug and panics.
//!
//! A failed provider reports [`ProviderFailed`] and nothing else; the reason travels
//! out of band (typically to the provider's creator), never through the error value.

use std::io::{self, Read};
use std::iter::Map;
use std::mem;
use std::slice::IterMut;

use bytes::{Bytes, BytesMut};
use smallvec::SmallVec;
use tracing::{debug, warn};

/// A data provider could not produce its bytes.
#[derive(thiserror::Error, Debug, Clone, Copy, Default, Eq, PartialEq)]
#[error("data provider failed")]
pub struct ProviderFailed;

/// Writable spans of a [`BufferGroup`], in order.
pub type SpansMut<'s, 'a> = Map<IterMut<'s, &'a mut [u8]>, for<'r> fn(&'r mut &'a mut [u8]) -> &'r mut [u8]>;

/// Ordered, non-owning destination spans.
#[derive(Default)]
pub struct BufferGroup<'a> {
    buffers: SmallVec<[&'a mut [u8]; 4]>,
}

impl<'a> BufferGroup<'a> {
    /// Creates an empty group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a span.
    pub fn add_buffer(&mut self, buf: &'a mut [u8]) {
        self.buffers.push(buf);
    }

    /// Total bytes across all spans.
    pub fn size(&self) -> usize {
        self.buffers.iter().map(|b| b.len()).sum()
    }

    /// Number of spans.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Returns true if the group has no spans.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Span lengths in order.
    pub fn span_lens(&self) -> Vec<usize> {
        self.buffers.iter().map(|b| b.len()).collect()
    }

    /// Iterates the spans for writing.
    pub fn iter_mut(&mut self) -> SpansMut<'_, 'a> {
        let reborrow: for<'r> fn(&'r mut &'a mut [u8]) -> &'r mut [u8] = |span| &mut **span;
        self.buffers.iter_mut().map(reborrow)
    }

    /// Copies `src` across the spans in order. `src` must match [`Self::size`].
    pub fn write_from(&mut self, mut src: &[u8]) {
        assert_eq!(src.len(), self.size(), "source length differs from group size");
        for span in self.iter_mut() {
            let (head, rest) = src.split_at(span.len());
            span.copy_from_slice(head);
            src = rest;
        }
    }
}

/// Ordered, non-owning source spans.
#[derive(Default, Clone)]
pub struct ConstBufferGroup<'a> {
    buffers: SmallVec<[&'a [u8]; 4]>,
}

impl<'a> ConstBufferGroup<'a> {
    /// Creates an empty group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a span.
    pub fn add_buffer(&mut self, buf: &'a [u8]) {
        self.buffers.push(buf);
    }

    /// Total bytes across all spans.
    pub fn size(&self) -> usize {
        self.buffers.iter().map(|b| b.len()).sum()
    }

    /// Number of spans.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Returns true if the group has no spans.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Iterates the spans.
    pub fn iter(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        self.buffers.iter().copied()
    }

    /// Concatenates the spans into an owned vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        for span in self.iter() {
            out.extend_from_slice(span);
        }
        out
    }
}

/// Copies every byte of `src` into `dest`; both groups must describe the same size.
pub fn copy_group(src: &ConstBufferGroup<'_>, dest: &mut BufferGroup<'_>) {
    assert_eq!(src.size(), dest.size(), "buffer group sizes differ");
    let mut sources = src.iter();
    let mut cur: &[u8] = &[];
    for span in dest.iter_mut() {
        let mut span = span;
        while !span.is_empty() {
            while cur.is_empty() {
                match sources.next() {
                    Some(next) => cur = next,
                    None => unreachable!("source group exhausted before destination"),
                }
            }
            let n = cur.len().min(span.len());
            let (head, rest) = mem::take(&mut span).split_at_mut(n);
            head.copy_from_slice(&cur[..n]);
            span = rest;
            cur = &cur[n..];
        }
    }
}

/// A read-once array of bytes.
pub trait DataProvider {
    /// Number of bytes this provider delivers. Stable for the provider's lifetime.
    fn size(&self) -> usize;

    /// Copies exactly [`size`](Self::size) bytes into `dest`, in order.
    ///
    /// On failure any prefix of `dest` may have been written; callers treat the whole
    /// operation as not having happened.
    fn fill_into(&mut self, dest: &mut BufferGroup<'_>) -> Result<(), ProviderFailed>;

    /// Exposes spans that already hold the data, valid while the provider lives.
    fn as_buffers(&mut self) -> Result<ConstBufferGroup<'_>, ProviderFailed>;

    /// Consumes the data without delivering it anywhere.
    fn discard(&mut self) -> Result<(), ProviderFailed> {
        self.as_buffers().map(|_| ())
    }

    /// Returns true once the data has been consumed.
    fn is_consumed(&self) -> bool;
}

impl<P: DataProvider + ?Sized> DataProvider for &mut P {
    fn size(&self) -> usize {
        (**self).size()
    }

    fn fill_into(&mut self, dest: &mut BufferGroup<'_>) -> Result<(), ProviderFailed> {
        (**self).fill_into(dest)
    }

    fn as_buffers(&mut self) -> Result<ConstBufferGroup<'_>, ProviderFailed> {
        (**self).as_buffers()
    }

    fn discard(&mut self) -> Result<(), ProviderFailed> {
        (**self).discard()
    }

    fn is_consumed(&self) -> bool {
        (**self).is_consumed()
    }
}

impl<P: DataProvider + ?Sized> DataProvider for Box<P> {
    fn size(&self) -> usize {
        (**self).size()
    }

    fn fill_into(&mut self, dest: &mut BufferGroup<'_>) -> Result<(), ProviderFailed> {
        (**self).fill_into(dest)
    }

    fn as_buffers(&mut self) -> Result<ConstBufferGroup<'_>, ProviderFailed> {
        (**self).as_buffers()
    }

    fn discard(&mut self) -> Result<(), ProviderFailed> {
        (**self).discard()
    }

    fn is_consumed(&self) -> bool {
        (**self).is_consumed()
    }
}

/// Reads a provider's bytes into an owned vector.
pub fn collect<P: DataProvider + ?Sized>(provider: &mut P) -> Result<Vec<u8>, ProviderFailed> {
    let mut out = vec![0u8; provider.size()];
    {
        let mut group = BufferGroup::new();
        group.add_buffer(&mut out);
        provider.fill_into(&mut group)?;
    }
    Ok(out)
}

#[derive(Debug, Default)]
struct Consumption {
    consumed: bool,
}

impl Consumption {
    fn consume(&mut self) {
        assert!(!self.consumed, "data provider consumed twice");
        self.consumed = true;
    }
}

/// A producer that can only write its bytes into caller-provided spans.
pub trait FillSource {
    /// Number of bytes produced.
    fn size(&self) -> usize;
    /// Writes all bytes into `dest`; called at most once.
    fn fill(&mut self, dest: &mut BufferGroup<'_>) -> Result<(), ProviderFailed>;

    /// Produces and drops all bytes; called at most once, instead of `fill`.
    fn skip(&mut self) -> Result<(), ProviderFailed> {
        let mut scratch = vec![0u8; self.size()];
        let mut group = BufferGroup::new();
        group.add_buffer(&mut scratch);
        self.fill(&mut group)
    }
}

/// A producer that already holds its bytes in buffers.
pub trait BufferSource {
    /// Number of bytes held.
    fn size(&self) -> usize;
    /// Exposes the held bytes; called at most once.
    fn buffers(&mut self) -> Result<ConstBufferGroup<'_>, ProviderFailed>;
}

/// Turns a [`FillSource`] into a [`DataProvider`]; `as_buffers` fills a private
/// buffer once and exposes it.
pub struct AutoBuffering<S> {
    source: S,
    buffer: Option<Box<[u8]>>,
    state: Consumption,
}

impl<S: FillSource> AutoBuffering<S> {
    /// Wraps `source`.
    pub fn new(source: S) -> Self {
        Self {
            source,
            buffer: None,
            state: Consumption::default(),
        }
    }

    /// Returns the wrapped source.
    pub fn source(&self) -> &S {
        &self.source
    }
}

impl<S: FillSource> DataProvider for AutoBuffering<S> {
    fn size(&self) -> usize {
        self.source.size()
    }

    fn fill_into(&mut self, dest: &mut BufferGroup<'_>) -> Result<(), ProviderFailed> {
        self.state.consume();
        assert_eq!(dest.size(), self.source.size(), "destination size mismatch");
        self.source.fill(dest)
    }

    fn as_buffers(&mut self) -> Result<ConstBufferGroup<'_>, ProviderFailed> {
        self.state.consume();
        let mut buf = vec![0u8; self.source.size()].into_boxed_slice();
        {
            let mut group = BufferGroup::new();
            group.add_buffer(&mut buf);
            self.source.fill(&mut group)?;
        }
        let stored: &[u8] = self.buffer.insert(buf);
        let mut out = ConstBufferGroup::new();
        out.add_buffer(stored);
        Ok(out)
    }

    fn discard(&mut self) -> Result<(), ProviderFailed> {
        self.state.consume();
        self.source.skip()
    }

    fn is_consumed(&self) -> bool {
        self.state.consumed
    }
}

/// Turns a [`BufferSource`] into a [`DataProvider`]; `fill_into` copies out of the
/// source's own buffers.
pub struct AutoCopying<S> {
    source: S,
    state: Consumption,
}

impl<S: BufferSource> AutoCopying<S> {
    /// Wraps `source`.
    pub fn new(source: S) -> Self {
        Self {
            source,
            state: Consumption::default(),
        }
    }

    /// Returns the wrapped source.
    pub fn source(&self) -> &S {
        &self.source
    }
}

impl<S: BufferSource> DataProvider for AutoCopying<S> {
    fn size(&self) -> usize {
        self.source.size()
    }

    fn fill_into(&mut self, dest: &mut BufferGroup<'_>) -> Result<(), ProviderFailed> {
        self.state.consume();
        let src = self.source.buffers()?;
        copy_group(&src, dest);
        Ok(())
    }

    fn as_buffers(&mut self) -> Result<ConstBufferGroup<'_>, ProviderFailed> {
        self.state.consume();
        self.source.buffers()
    }

    fn is_consumed(&self) -> bool {
        self.state.consumed
    }
}

/// A provider over an owned, immutable buffer.
pub struct BufferedDataProvider {
    data: Bytes,
    state: Consumption,
}

impl BufferedDataProvider {
    /// Wraps an existing buffer without copying.
    pub fn from_bytes(data: Bytes) -> Self {
        Self {
            data,
            state: Consumption::default(),
        }
    }

    /// Copies `data` into a new buffer.
    pub fn copy_from(data: &[u8]) -> Self {
        Self::from_bytes(Bytes::copy_from_slice(data))
    }

    /// Allocates `size` zeroed bytes and lets `fill` write them.
    pub fn with_filler(size: usize, fill: impl FnOnce(&mut [u8])) -> Self {
        let mut buf = BytesMut::zeroed(size);
        fill(&mut buf);
        Self::from_bytes(buf.freeze())
    }

    /// Consumes `provider` completely into a new buffer.
    pub fn from_provider<P: DataProvider + ?Sized>(
        provider: &mut P,
    ) -> Result<Self, ProviderFailed> {
        let mut buf = BytesMut::zeroed(provider.size());
        {
            let mut group = BufferGroup::new();
            group.add_buffer(&mut buf);
            provider.fill_into(&mut group)?;
        }
        Ok(Self::from_bytes(buf.freeze()))
    }
}

impl DataProvider for BufferedDataProvider {
    fn size(&self) -> usize {
        self.data.len()
    }

    fn fill_into(&mut self, dest: &mut BufferGroup<'_>) -> Result<(), ProviderFailed> {
        self.state.consume();
        dest.write_from(&self.data);
        Ok(())
    }

    fn as_buffers(&mut self) -> Result<ConstBufferGroup<'_>, ProviderFailed> {
        self.state.consume();
        let mut out = ConstBufferGroup::new();
        out.add_buffer(&self.data);
        Ok(out)
    }

    fn discard(&mut self) -> Result<(), ProviderFailed> {
        self.state.consume();
        Ok(())
    }

    fn is_consumed(&self) -> bool {
        self.state.consumed
    }
}

enum Buffering {
    Passthrough,
    Buffered(BufferedDataProvider),
    Failed(Consumption),
}

/// Wraps another provider and, when it is smaller than a threshold, reads it into
/// memory up front.
///
/// Behaves exactly like the wrapped provider either way: the data is consumed once
/// and a failure surfaces from the same consuming call it would have come from. A
/// failure while buffering is remembered and replayed by the first consuming call.
pub struct MaybeBufferedDataProvider<P> {
    size: usize,
    original: P,
    buffering: Buffering,
}

impl<P: DataProvider> MaybeBufferedDataProvider<P> {
    /// Wraps `original`, buffering it now if its size is below `threshold`.
    pub fn new(mut original: P, threshold: usize) -> Self {
        let size = original.size();
        let buffering = if size < threshold {
            match BufferedDataProvider::from_provider(&mut original) {
                Ok(buffered) => Buffering::Buffered(buffered),
                Err(ProviderFailed) => {
                    debug!(size, threshold, "provider.buffer_failed");
                    Buffering::Failed(Consumption::default())
                }
            }
        } else {
            Buffering::Passthrough
        };
        Self {
            size,
            original,
            buffering,
        }
    }

    /// Returns true if the data was (or was attempted to be) read up front.
    pub fn is_buffered(&self) -> bool {
        !matches!(self.buffering, Buffering::Passthrough)
    }
}

impl<P: DataProvider> DataProvider for MaybeBufferedDataProvider<P> {
    fn size(&self) -> usize {
        self.size
    }

    fn fill_into(&mut self, dest: &mut BufferGroup<'_>) -> Result<(), ProviderFailed> {
        match &mut self.buffering {
            Buffering::Passthrough => self.original.fill_into(dest),
            Buffering::Buffered(buffered) => buffered.fill_into(dest),
            Buffering::Failed(state) => {
                state.consume();
                Err(ProviderFailed)
            }
        }
    }

    fn as_buffers(&mut self) -> Result<ConstBufferGroup<'_>, ProviderFailed> {
        match &mut self.buffering {
            Buffering::Passthrough => self.original.as_buffers(),
            Buffering::Buffered(buffered) => buffered.as_buffers(),
            Buffering::Failed(state) => {
                state.consume();
                Err(ProviderFailed)
            }
        }
    }

    fn discard(&mut self) -> Result<(), ProviderFailed> {
        match &mut self.buffering {
            Buffering::Passthrough => self.original.discard(),
            Buffering::Buffered(buffered) => buffered.discard(),
            Buffering::Failed(state) => {
                state.consume();
                Err(ProviderFailed)
            }
        }
    }

    fn is_consumed(&self) -> bool {
        match &self.buffering {
            Buffering::Passthrough => self.original.is_consumed(),
            Buffering::Buffered(buffered) => buffered.is_consumed(),
            Buffering::Failed(state) => state.consumed,
        }
    }
}

/// A [`FillSource`] reading a declared number of bytes from a stream.
pub struct ReadSource<R> {
    reader: R,
    size: usize,
}

impl<R: Read> FillSource for ReadSource<R> {
    fn size(&self) -> usize {
        self.size
    }

    fn fill(&mut self, dest: &mut BufferGroup<'_>) -> Result<(), ProviderFailed> {
        for span in dest.iter_mut() {
            if let Err(err) = self.reader.read_exact(span) {
                warn!(error = %err, size = self.size, "provider.read_failed");
                return Err(ProviderFailed);
            }
        }
        Ok(())
    }

    fn skip(&mut self) -> Result<(), ProviderFailed> {
        let wanted = self.size as u64;
        match io::copy(&mut (&mut self.reader).take(wanted), &mut io::sink()) {
            Ok(skipped) if skipped == wanted => Ok(()),
            Ok(skipped) => {
                warn!(skipped, size = self.size, "provider.skip_short");
                Err(ProviderFailed)
            }
            Err(err) => {
                warn!(error = %err, size = self.size, "provider.skip_failed");
                Err(ProviderFailed)
            }
        }
    }
}

/// Provider for bytes arriving on a stream, such as a client connection.
pub type ReaderDataProvider<R> = AutoBuffering<ReadSource<R>>;

impl<R: Read> AutoBuffering<ReadSource<R>> {
    /// Creates a provider that will read exactly `size` bytes from `reader`.
    pub fn from_reader(reader: R, size: usize) -> Self {
        AutoBuffering::new(ReadSource { reader, size })
    }
}
