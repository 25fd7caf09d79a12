#![forbid(unsafe_code)]
//! Growing a value by `delta` bytes at either end.
//!
//! [`GrowthEngine::prepare_growth`] builds the new representation with a reserved,
//! still-unwritten range, [`Growth::destination`] exposes that range for a data
//! provider to fill, and the growth is finally either committed or undone. Both
//! consume the [`Growth`], so neither can happen twice.

use tracing::{debug, trace};

use crate::primitives::concurrency::{EndHint, LockMode};
use crate::storage::largebuf::{BufEnd, LargeBuf, LargeBufStore, SizeAdjustment};
use crate::storage::provider::BufferGroup;
use crate::storage::value::{Value, ValueBody, ValueHeader, ValueLimits};
use crate::types::{KvError, Result};

/// Which end of the value grows.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    /// New bytes go after the existing ones.
    Append,
    /// New bytes go before the existing ones.
    Prepend,
}

impl Direction {
    /// End of the large buffer this direction touches.
    pub fn end(self) -> BufEnd {
        match self {
            Direction::Append => BufEnd::Tail,
            Direction::Prepend => BufEnd::Head,
        }
    }

    /// Locks a modify in this direction needs on an existing large buffer.
    pub fn large_value_access(self) -> (LockMode, EndHint) {
        (LockMode::Write, self.end().into())
    }
}

/// Representation change performed by a growth.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Transition {
    /// Inline before and after.
    SmallToSmall,
    /// Inline before, out of line after.
    SmallToLarge,
    /// Out of line before and after.
    LargeToLarge,
}

/// A stored value handed to a modify, with its large buffer if one was acquired.
pub struct OldValue {
    /// The decoded value.
    pub value: Value,
    /// Acquired handle on the value's large buffer.
    pub large: Option<LargeBuf>,
}

/// The value a modify wants installed.
pub struct NewValue {
    /// Header and body to store.
    pub value: Value,
    /// Handle on the body's large buffer; flushed by the modify protocol.
    pub large: Option<LargeBuf>,
}

/// Everything needed to reverse a prepared growth.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct UndoToken {
    /// Representation change that was prepared.
    pub transition: Transition,
    /// Bytes reserved.
    pub delta: u64,
    /// End the bytes were reserved on.
    pub end: BufEnd,
    /// Resize applied to the large buffer.
    pub adjustment: SizeAdjustment,
}

enum NewBody {
    Small(Vec<u8>),
    Large(LargeBuf),
}

/// A prepared growth: the new value with an unwritten range reserved for the data.
pub struct Growth {
    header: ValueHeader,
    body: NewBody,
    reserved_pos: u64,
    undo: UndoToken,
}

impl Growth {
    /// Spans covering the reserved range, in order.
    pub fn destination(&mut self) -> BufferGroup<'_> {
        let len = self.undo.delta as usize;
        match &mut self.body {
            NewBody::Small(bytes) => {
                let start = self.reserved_pos as usize;
                let mut group = BufferGroup::new();
                group.add_buffer(&mut bytes[start..start + len]);
                group
            }
            NewBody::Large(buf) => buf.bufs_at_mut(self.reserved_pos, len),
        }
    }

    /// Representation change this growth performs.
    pub fn transition(&self) -> Transition {
        self.undo.transition
    }

    /// Length of the value after the growth.
    pub fn new_len(&self) -> u64 {
        match &self.body {
            NewBody::Small(bytes) => bytes.len() as u64,
            NewBody::Large(buf) => buf.size(),
        }
    }

    /// Reversal record for this growth.
    pub fn undo_token(&self) -> &UndoToken {
        &self.undo
    }
}

/// Prepares, commits and undoes growths against one large-buffer store.
pub struct GrowthEngine<'a> {
    bufs: &'a LargeBufStore,
    limits: ValueLimits,
}

impl<'a> GrowthEngine<'a> {
    /// Creates an engine bound to `bufs` and `limits`.
    pub fn new(bufs: &'a LargeBufStore, limits: ValueLimits) -> Self {
        Self { bufs, limits }
    }

    /// Size ceilings this engine enforces.
    pub fn limits(&self) -> ValueLimits {
        self.limits
    }

    /// Builds the grown representation of `old` with `delta` unwritten bytes on the
    /// end named by `direction`.
    ///
    /// Fails with [`KvError::NotFound`] for an absent value and [`KvError::TooLarge`]
    /// past `max_value_size`; in both cases nothing has been allocated.
    pub fn prepare_growth(
        &self,
        old: Option<OldValue>,
        delta: usize,
        direction: Direction,
    ) -> Result<Growth> {
        let old = old.ok_or(KvError::NotFound)?;
        let old_len = old.value.len();
        let delta = delta as u64;
        let new_len = old_len
            .checked_add(delta)
            .filter(|len| *len <= self.limits.max_value_size)
            .ok_or(KvError::TooLarge)?;
        if let Err(err) = old.value.validate(&self.limits) {
            panic!("growing a value that breaks its representation: {err}");
        }
        let end = direction.end();
        let header = old.value.header;
        let reserved_pos = match direction {
            Direction::Append => old_len,
            Direction::Prepend => 0,
        };
        let (body, transition, adjustment) = match old.value.body {
            ValueBody::Small(bytes) if self.limits.is_inline(new_len) => {
                let mut out = vec![0u8; new_len as usize];
                match direction {
                    Direction::Append => out[..bytes.len()].copy_from_slice(&bytes),
                    Direction::Prepend => out[delta as usize..].copy_from_slice(&bytes),
                }
                (
                    NewBody::Small(out),
                    Transition::SmallToSmall,
                    SizeAdjustment::default(),
                )
            }
            ValueBody::Small(bytes) => {
                let mut buf = self.bufs.allocate(new_len)?;
                let at = match direction {
                    Direction::Append => 0,
                    Direction::Prepend => delta,
                };
                buf.fill_at(at, &bytes);
                let adjustment = SizeAdjustment {
                    bytes: new_len as i64,
                    segments: buf.segment_count() as i64,
                };
                (NewBody::Large(buf), Transition::SmallToLarge, adjustment)
            }
            ValueBody::Large(reference) => {
                let mut buf = old
                    .large
                    .ok_or(KvError::Invalid("large value was not acquired for modify"))?;
                if buf.root() != reference.root || buf.size() != old_len {
                    return Err(KvError::Invalid("acquired buffer does not match value"));
                }
                let adjustment = self.bufs.extend(&mut buf, delta, end)?;
                (NewBody::Large(buf), Transition::LargeToLarge, adjustment)
            }
        };
        trace!(?transition, old_len, delta, ?direction, "growth.prepare");
        Ok(Growth {
            header,
            body,
            reserved_pos,
            undo: UndoToken {
                transition,
                delta,
                end,
                adjustment,
            },
        })
    }

    /// Reverses a prepared growth, releasing everything it allocated.
    pub fn undo_growth(&self, growth: Growth) {
        let Growth { body, undo, .. } = growth;
        match body {
            NewBody::Small(_) => {}
            NewBody::Large(mut buf) => match undo.transition {
                Transition::LargeToLarge => {
                    self.bufs.shrink(&mut buf, undo.delta, undo.end);
                }
                _ => self.bufs.mark_deleted(buf),
            },
        }
        debug!(transition = ?undo.transition, delta = undo.delta, "growth.undo");
    }

    /// Finalizes a filled growth into the value to install.
    pub fn commit(&self, growth: Growth) -> NewValue {
        let Growth {
            header, body, undo, ..
        } = growth;
        let new = match body {
            NewBody::Small(bytes) => NewValue {
                value: Value::small(header, bytes),
                large: None,
            },
            NewBody::Large(buf) => NewValue {
                value: Value::large(header, buf.reference()),
                large: Some(buf),
            },
        };
        trace!(
            transition = ?undo.transition,
            len = new.value.len(),
            "growth.commit"
        );
        new
    }
}
