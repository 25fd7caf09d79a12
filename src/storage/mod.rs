//! Value storage core.
//!
//! Data providers deliver bytes, values switch between an inline and a segmented
//! out-of-line representation as they grow, and append/prepend runs as a modify
//! operation against a key-ordered slice.

/// Append and prepend modify operation.
pub mod append_prepend;

/// Segmented out-of-line buffers for large values.
///
/// Segments are whole blocks addressed through a root index block.
pub mod largebuf;

/// Engine and slice configuration.
pub mod options;

/// The data provider contract and its adapters.
pub mod provider;

/// Key-ordered slice implementing the modify protocol.
pub mod slice;

/// Value model, slot codec and growth transitions.
pub mod value;

pub use append_prepend::{append_prepend, AppendPrependOper, AppendPrependResult};
pub use largebuf::{BufEnd, LargeBuf, LargeBufRef, LargeBufStore, SizeAdjustment, LARGE_REF_LEN};
pub use options::{BlockStoreOptions, ConfigError, EngineOptions, SliceOptions};
pub use provider::{
    AutoBuffering, AutoCopying, BufferGroup, BufferSource, BufferedDataProvider,
    ConstBufferGroup, DataProvider, FillSource, MaybeBufferedDataProvider, ProviderFailed,
    ReaderDataProvider,
};
pub use slice::{
    CasTime, Modification, ModifyContext, ModifyOper, SetResult, Slice, SliceStats,
    ValueDataProvider,
};
pub use value::{Direction, Value, ValueBody, ValueHeader, ValueLimits};
