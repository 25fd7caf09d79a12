#![forbid(unsafe_code)]
//! Big-endian encoding helpers shared by the slot and index-block codecs.

pub mod be {
    //! Fixed-width big-endian writers.

    /// Appends a `u16` in big-endian order.
    pub fn push_u16(dst: &mut Vec<u8>, v: u16) {
        dst.extend_from_slice(&v.to_be_bytes());
    }

    /// Appends a `u32` in big-endian order.
    pub fn push_u32(dst: &mut Vec<u8>, v: u32) {
        dst.extend_from_slice(&v.to_be_bytes());
    }

    /// Appends a `u64` in big-endian order.
    pub fn push_u64(dst: &mut Vec<u8>, v: u64) {
        dst.extend_from_slice(&v.to_be_bytes());
    }

    /// Writes a `u32` at the front of `dst`.
    pub fn put_u32(dst: &mut [u8], v: u32) {
        assert!(dst.len() >= 4, "destination too small");
        dst[..4].copy_from_slice(&v.to_be_bytes());
    }

    /// Writes a `u64` at the front of `dst`.
    pub fn put_u64(dst: &mut [u8], v: u64) {
        assert!(dst.len() >= 8, "destination too small");
        dst[..8].copy_from_slice(&v.to_be_bytes());
    }
}

pub mod buf {
    //! A slice-backed cursor whose reads fail with a corruption error instead of
    //! panicking, for decoding persisted bytes.

    use core::fmt;

    use crate::types::{KvError, Result};

    /// A cursor for reading bytes from a slice with offset tracking.
    pub struct Cursor<'a> {
        buf: &'a [u8],
        off: usize,
        what: &'static str,
    }

    impl<'a> Cursor<'a> {
        /// Creates a new cursor; `what` names the structure in truncation errors.
        pub fn new(buf: &'a [u8], what: &'static str) -> Self {
            Self { buf, off: 0, what }
        }

        /// Takes the next `n` bytes, advancing the offset.
        pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
            let end = self
                .off
                .checked_add(n)
                .filter(|end| *end <= self.buf.len())
                .ok_or(KvError::Corruption(self.what))?;
            let slice = &self.buf[self.off..end];
            self.off = end;
            Ok(slice)
        }

        /// Reads one byte.
        pub fn u8(&mut self) -> Result<u8> {
            Ok(self.take(1)?[0])
        }

        /// Reads a big-endian `u16`.
        pub fn u16(&mut self) -> Result<u16> {
            let mut arr = [0u8; 2];
            arr.copy_from_slice(self.take(2)?);
            Ok(u16::from_be_bytes(arr))
        }

        /// Reads a big-endian `u32`.
        pub fn u32(&mut self) -> Result<u32> {
            let mut arr = [0u8; 4];
            arr.copy_from_slice(self.take(4)?);
            Ok(u32::from_be_bytes(arr))
        }

        /// Reads a big-endian `u64`.
        pub fn u64(&mut self) -> Result<u64> {
            let mut arr = [0u8; 8];
            arr.copy_from_slice(self.take(8)?);
            Ok(u64::from_be_bytes(arr))
        }

        /// Returns the number of bytes remaining in the buffer.
        pub fn remaining(&self) -> usize {
            self.buf.len().saturating_sub(self.off)
        }
    }

    impl<'a> fmt::Debug for Cursor<'a> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Cursor")
                .field("what", &self.what)
                .field("off", &self.off)
                .field("remaining", &self.remaining())
                .finish()
        }
    }
}
