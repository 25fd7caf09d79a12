#![forbid(unsafe_code)]
//! Data providers over values already stored in a slice.
//!
//! Inline values are served from a copy. Large values are served in place from
//! their loaded segments while the buffer stays read-locked.

use bytes::Bytes;

use crate::storage::largebuf::LargeBuf;
use crate::storage::provider::{
    AutoCopying, BufferGroup, BufferSource, BufferedDataProvider, ConstBufferGroup, DataProvider,
    ProviderFailed,
};

/// Exposes the loaded bytes of a read-acquired large buffer without copying.
pub struct LargeValueSource {
    buf: LargeBuf,
}

impl LargeValueSource {
    /// Wraps an acquired handle. Every segment must be loaded.
    pub fn new(buf: LargeBuf) -> Self {
        Self { buf }
    }

    /// The underlying handle.
    pub fn buffer(&self) -> &LargeBuf {
        &self.buf
    }
}

impl BufferSource for LargeValueSource {
    fn size(&self) -> usize {
        self.buf.size() as usize
    }

    fn buffers(&mut self) -> Result<ConstBufferGroup<'_>, ProviderFailed> {
        Ok(self.buf.bufs_at(0, self.buf.size() as usize))
    }
}

/// Provider over the bytes of one stored value.
///
/// A large variant keeps the buffer read-locked until it is dropped; modifying the
/// same key meanwhile blocks.
pub enum ValueDataProvider {
    /// Copy of an inline value.
    Small(BufferedDataProvider),
    /// Spans over a large buffer's segments.
    Large(AutoCopying<LargeValueSource>),
}

impl ValueDataProvider {
    pub(crate) fn small(bytes: Vec<u8>) -> Self {
        ValueDataProvider::Small(BufferedDataProvider::from_bytes(Bytes::from(bytes)))
    }

    pub(crate) fn large(buf: LargeBuf) -> Self {
        ValueDataProvider::Large(AutoCopying::new(LargeValueSource::new(buf)))
    }

    /// Returns true if the value lives out of line.
    pub fn is_large(&self) -> bool {
        matches!(self, ValueDataProvider::Large(_))
    }
}

impl DataProvider for ValueDataProvider {
    fn size(&self) -> usize {
        match self {
            ValueDataProvider::Small(p) => p.size(),
            ValueDataProvider::Large(p) => p.size(),
        }
    }

    fn fill_into(&mut self, dest: &mut BufferGroup<'_>) -> Result<(), ProviderFailed> {
        match self {
            ValueDataProvider::Small(p) => p.fill_into(dest),
            ValueDataProvider::Large(p) => p.fill_into(dest),
        }
    }

    fn as_buffers(&mut self) -> Result<ConstBufferGroup<'_>, ProviderFailed> {
        match self {
            ValueDataProvider::Small(p) => p.as_buffers(),
            ValueDataProvider::Large(p) => p.as_buffers(),
        }
    }

    fn discard(&mut self) -> Result<(), ProviderFailed> {
        match self {
            ValueDataProvider::Small(p) => p.discard(),
            ValueDataProvider::Large(p) => p.discard(),
        }
    }

    fn is_consumed(&self) -> bool {
        match self {
            ValueDataProvider::Small(p) => p.is_consumed(),
            ValueDataProvider::Large(p) => p.is_consumed(),
        }
    }
}
