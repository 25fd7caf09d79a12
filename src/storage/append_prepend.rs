#![forbid(unsafe_code)]
//! Append and prepend as a modify operation.
//!
//! The provider's bytes land directly in the grown value's reserved range. If the
//! provider fails midway the growth is undone and the stored value is left exactly
//! as it was.

use tracing::{trace, warn};

use crate::primitives::concurrency::{EndHint, LockMode};
use crate::storage::provider::{DataProvider, MaybeBufferedDataProvider};
use crate::storage::slice::{CasTime, Modification, ModifyContext, ModifyOper, Slice};
use crate::storage::value::{Direction, OldValue};
use crate::types::{KvError, Result};

/// Caller-visible outcome of an append or prepend.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AppendPrependResult {
    /// The bytes were added.
    Success,
    /// The key has no value.
    NotFound,
    /// The grown value would exceed `max_value_size`.
    TooLarge,
    /// The provider failed; the stored value is unchanged.
    ProviderFailed,
}

/// Modify operation adding a provider's bytes to one end of a value.
pub struct AppendPrependOper<P> {
    provider: P,
    direction: Direction,
}

impl<P: DataProvider> AppendPrependOper<P> {
    /// Creates an operation that adds `provider`'s bytes on `direction`'s end.
    pub fn new(provider: P, direction: Direction) -> Self {
        Self {
            provider,
            direction,
        }
    }

    /// End the operation grows.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Returns the provider, consumed or not.
    pub fn into_provider(self) -> P {
        self.provider
    }

    fn reject(&mut self, result: AppendPrependResult) -> Modification<AppendPrependResult> {
        if self.provider.discard().is_err() {
            trace!(?result, "apr.discard_failed");
        }
        Modification::Keep(result)
    }
}

impl<P: DataProvider> ModifyOper for AppendPrependOper<P> {
    type Output = AppendPrependResult;

    fn large_value_access(&self) -> Option<(LockMode, EndHint)> {
        Some(self.direction.large_value_access())
    }

    fn operate(
        &mut self,
        ctx: &ModifyContext<'_>,
        old: Option<OldValue>,
    ) -> Result<Modification<AppendPrependResult>> {
        let engine = ctx.growth_engine();
        let delta = self.provider.size();
        let mut growth = match engine.prepare_growth(old, delta, self.direction) {
            Ok(growth) => growth,
            Err(KvError::NotFound) => return Ok(self.reject(AppendPrependResult::NotFound)),
            Err(KvError::TooLarge) => return Ok(self.reject(AppendPrependResult::TooLarge)),
            Err(err) => return Err(err),
        };
        let filled = {
            let mut dest = growth.destination();
            self.provider.fill_into(&mut dest)
        };
        match filled {
            Ok(()) => Ok(Modification::Replace(
                engine.commit(growth),
                AppendPrependResult::Success,
            )),
            Err(_) => {
                warn!(
                    direction = ?self.direction,
                    delta,
                    transition = ?growth.transition(),
                    "apr.provider_failed"
                );
                engine.undo_growth(growth);
                Ok(Modification::Keep(AppendPrependResult::ProviderFailed))
            }
        }
    }
}

/// Appends or prepends `provider`'s bytes to the value of `key`.
///
/// Small providers are buffered before the key lock is taken so a slow producer
/// does not hold it.
pub fn append_prepend<P: DataProvider>(
    slice: &Slice,
    key: &[u8],
    provider: P,
    direction: Direction,
    cas_time: CasTime,
) -> Result<AppendPrependResult> {
    let threshold = slice.options().buffer_threshold;
    let provider = MaybeBufferedDataProvider::new(provider, threshold);
    let mut oper = AppendPrependOper::new(provider, direction);
    let result = slice.run_modify(key, &mut oper, cas_time)?;
    trace!(?direction, ?result, "apr.done");
    Ok(result)
}

impl Slice {
    /// Appends or prepends `provider`'s bytes to the value of `key`.
    pub fn append_or_prepend<P: DataProvider>(
        &self,
        key: &[u8],
        provider: P,
        direction: Direction,
        cas_time: CasTime,
    ) -> Result<AppendPrependResult> {
        append_prepend(self, key, provider, direction, cas_time)
    }
}
