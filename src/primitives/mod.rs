//! Low-level primitives for building the storage core.
//!
//! Includes byte utilities, the block store the large-buffer layer allocates from,
//! and the lock tables used by the modify protocol.

/// Byte-level utilities and encoding/decoding.
pub mod bytes;

/// Block allocation and raw block I/O.
///
/// The collaborator storage layer that large buffers are carved out of.
pub mod blocks;

/// Concurrency primitives and synchronization.
///
/// Striped lock tables for keys and large-buffer ends.
pub mod concurrency;
