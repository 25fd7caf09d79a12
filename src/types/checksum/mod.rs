#![forbid(unsafe_code)]
//! Checksums guarding persisted large-buffer index blocks.

/// Incremental checksum.
pub trait Checksum {
    /// Clears all accumulated state.
    fn reset(&mut self);
    /// Feeds more bytes.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum of everything fed so far.
    fn finalize(&self) -> u32;
}

/// CRC32 backed by `crc32fast`.
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// Checksum of an index block body, salted with the block's own id so that a block
/// copied to the wrong place does not validate.
pub fn index_crc32(root: u64, body: &[u8]) -> u32 {
    let mut hasher = Crc32Fast::default();
    hasher.update(&root.to_be_bytes());
    hasher.update(body);
    hasher.finalize()
}
