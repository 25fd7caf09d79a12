#![forbid(unsafe_code)]
//! Process-wide `tracing` subscriber setup.

use tracing_subscriber::{fmt, EnvFilter};

use crate::types::{KvError, Result};

/// Installs a formatting subscriber filtered by `filter` (for example
/// `"segkv=debug"`). Fails if the filter does not parse or a global subscriber is
/// already installed.
pub fn init_logging(filter: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(filter).map_err(|_| KvError::Invalid("invalid log filter"))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| KvError::Invalid("logging already initialized"))
}
