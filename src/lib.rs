//! Value-mutation core of an embedded key-value engine.
//!
//! Values grow in place by append or prepend, moving between an inline
//! representation and a segmented out-of-line one, with bytes delivered by
//! read-once data providers and undone if a provider fails midway.

#![warn(missing_docs)]

pub mod admin;
pub mod logging;
pub mod primitives;
pub mod storage;
pub mod types;

pub use storage::{
    append_prepend, AppendPrependResult, CasTime, DataProvider, Direction, EngineOptions, Slice,
};
pub use types::{KvError, PageId, Result};
