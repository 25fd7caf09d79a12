use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::primitives::blocks::{MemBlockStore, MemBlockStoreOptions};
use crate::storage::slice::Slice;
use crate::storage::value::{DEFAULT_MAX_INLINE_SIZE, DEFAULT_MAX_VALUE_SIZE};
use crate::types::Result;

/// Block store section of [`EngineOptions`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BlockStoreOptions {
    /// Block (and large-buffer segment) size in bytes.
    pub block_size: u32,
    /// Upper bound on allocated blocks; unbounded when absent.
    pub max_blocks: Option<u64>,
}

impl Default for BlockStoreOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            max_blocks: None,
        }
    }
}

impl From<&BlockStoreOptions> for MemBlockStoreOptions {
    fn from(opts: &BlockStoreOptions) -> Self {
        MemBlockStoreOptions {
            block_size: opts.block_size,
            max_blocks: opts.max_blocks,
        }
    }
}

/// Slice section of [`EngineOptions`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SliceOptions {
    /// Largest value stored inline in its slot.
    pub max_inline_size: usize,
    /// Largest value stored at all.
    pub max_value_size: u64,
    /// Providers smaller than this are buffered before the key lock is taken.
    pub buffer_threshold: usize,
}

impl Default for SliceOptions {
    fn default() -> Self {
        Self {
            max_inline_size: DEFAULT_MAX_INLINE_SIZE,
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
            buffer_threshold: 4096,
        }
    }
}

/// Engine configuration, loadable from TOML with `[store]` and `[slice]` tables.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineOptions {
    /// Block store settings.
    pub store: BlockStoreOptions,
    /// Slice settings.
    pub slice: SliceOptions,
}

impl EngineOptions {
    /// Parses options from TOML text; missing fields take their defaults.
    pub fn from_toml_str(text: &str) -> std::result::Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse { path: None, source })
    }

    /// Reads and parses an options file.
    pub fn load(path: impl AsRef<Path>) -> std::result::Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: Some(path.to_path_buf()),
            source,
        })
    }

    /// Renders the options as TOML.
    pub fn to_toml_string(&self) -> std::result::Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize { source })
    }

    /// Creates an in-memory block store and opens a slice over it.
    pub fn open(&self) -> Result<Slice> {
        let blocks = Arc::new(MemBlockStore::new((&self.store).into())?);
        Slice::open(blocks, self.slice.clone())
    }
}

/// Errors raised while reading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config at {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The text is not valid options TOML.
    #[error("failed to parse config{}: {source}", at_path(.path))]
    Parse {
        /// File that failed, when parsing a file.
        path: Option<PathBuf>,
        /// Underlying error.
        #[source]
        source: toml::de::Error,
    },
    /// The options could not be rendered.
    #[error("failed to serialize config: {source}")]
    Serialize {
        /// Underlying error.
        #[source]
        source: toml::ser::Error,
    },
}

fn at_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!(" at {}", path.display()),
        None => String::new(),
    }
}
