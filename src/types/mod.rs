#![forbid(unsafe_code)]
//! Shared identifiers, error type and checksum helpers.

use std::fmt;

pub mod checksum;

pub use checksum::{Checksum, Crc32Fast};

use crate::storage::provider::ProviderFailed;

/// Identifier of a block owned by the block store.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct PageId(pub u64);

impl PageId {
    /// Sentinel for "no block".
    pub const NONE: PageId = PageId(0);

    /// Returns true when this id is the "no block" sentinel.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors produced by the storage core.
#[derive(thiserror::Error, Debug)]
pub enum KvError {
    /// Underlying I/O failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// A persisted structure failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an invalid argument or configuration.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The key has no value.
    #[error("not found")]
    NotFound,
    /// The value would exceed the configured size ceiling.
    #[error("value too large")]
    TooLarge,
    /// The block store has no free blocks left.
    #[error("out of space")]
    NoSpace,
    /// A data provider could not deliver its bytes.
    #[error(transparent)]
    ProviderFailed(#[from] ProviderFailed),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, KvError>;
