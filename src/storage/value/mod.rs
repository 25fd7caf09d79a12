#![forbid(unsafe_code)]
//! Stored value model and the slot encoding the slice keeps per key.
//!
//! A value is SMALL (bytes inline in the slot) exactly when its length is at most
//! `max_inline_size`, and LARGE (a [`LargeBufRef`] in the slot) otherwise.

use crate::primitives::bytes::{be, buf::Cursor};
use crate::storage::largebuf::{LargeBufRef, LARGE_REF_LEN};
use crate::types::{KvError, Result};

pub mod growth;

pub use growth::{Direction, Growth, GrowthEngine, NewValue, OldValue, Transition, UndoToken};

const SLOT_SMALL: u8 = 1;
const SLOT_LARGE: u8 = 2;

/// Default inline ceiling in bytes.
pub const DEFAULT_MAX_INLINE_SIZE: usize = 250;
/// Default value ceiling in bytes.
pub const DEFAULT_MAX_VALUE_SIZE: u64 = 1024 * 1024;

/// Size ceilings governing the small/large representation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ValueLimits {
    /// Largest length stored inline.
    pub max_inline_size: usize,
    /// Largest length stored at all.
    pub max_value_size: u64,
}

impl Default for ValueLimits {
    fn default() -> Self {
        Self {
            max_inline_size: DEFAULT_MAX_INLINE_SIZE,
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
        }
    }
}

impl ValueLimits {
    /// Validates and builds a limit pair.
    pub fn new(max_inline_size: usize, max_value_size: u64) -> Result<Self> {
        if max_inline_size > u16::MAX as usize {
            return Err(KvError::Invalid("max_inline_size exceeds slot length field"));
        }
        if max_inline_size as u64 >= max_value_size {
            return Err(KvError::Invalid(
                "max_inline_size must be below max_value_size",
            ));
        }
        if max_value_size > u32::MAX as u64 {
            return Err(KvError::Invalid("max_value_size exceeds large reference range"));
        }
        Ok(Self {
            max_inline_size,
            max_value_size,
        })
    }

    /// Returns true if a value of `len` bytes is stored inline.
    pub fn is_inline(&self, len: u64) -> bool {
        len <= self.max_inline_size as u64
    }
}

/// Fixed header fields carried across mutations.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ValueHeader {
    /// Opaque client flags.
    pub flags: u32,
    /// Expiration time, 0 for none.
    pub exptime: u32,
    /// Compare-and-swap stamp, restamped on every successful modify.
    pub cas: Option<u64>,
}

/// Where a value's bytes live.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ValueBody {
    /// Bytes inline in the slot.
    Small(Vec<u8>),
    /// Bytes in a large buffer.
    Large(LargeBufRef),
}

/// A stored value: header plus body.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Value {
    /// Header fields.
    pub header: ValueHeader,
    /// Payload location.
    pub body: ValueBody,
}

impl Value {
    /// Builds an inline value.
    pub fn small(header: ValueHeader, bytes: Vec<u8>) -> Self {
        Self {
            header,
            body: ValueBody::Small(bytes),
        }
    }

    /// Builds a value pointing at a large buffer.
    pub fn large(header: ValueHeader, reference: LargeBufRef) -> Self {
        Self {
            header,
            body: ValueBody::Large(reference),
        }
    }

    /// Logical length in bytes.
    pub fn len(&self) -> u64 {
        match &self.body {
            ValueBody::Small(bytes) => bytes.len() as u64,
            ValueBody::Large(r) => r.size as u64,
        }
    }

    /// Returns true for a zero-length value.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if the body is out of line.
    pub fn is_large(&self) -> bool {
        matches!(self.body, ValueBody::Large(_))
    }

    /// Large-buffer reference, if any.
    pub fn large_ref(&self) -> Option<LargeBufRef> {
        match &self.body {
            ValueBody::Large(r) => Some(*r),
            ValueBody::Small(_) => None,
        }
    }

    /// Checks the representation invariant against `limits`.
    pub fn validate(&self, limits: &ValueLimits) -> Result<()> {
        let len = self.len();
        if len > limits.max_value_size {
            return Err(KvError::Corruption("value longer than max_value_size"));
        }
        match (&self.body, limits.is_inline(len)) {
            (ValueBody::Small(_), false) => {
                Err(KvError::Corruption("small value above inline limit"))
            }
            (ValueBody::Large(_), true) => {
                Err(KvError::Corruption("large value within inline limit"))
            }
            _ => Ok(()),
        }
    }

    /// Encodes the value into its slot form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.push(match self.body {
            ValueBody::Small(_) => SLOT_SMALL,
            ValueBody::Large(_) => SLOT_LARGE,
        });
        be::push_u32(&mut out, self.header.flags);
        be::push_u32(&mut out, self.header.exptime);
        match self.header.cas {
            Some(cas) => {
                out.push(1);
                be::push_u64(&mut out, cas);
            }
            None => out.push(0),
        }
        match &self.body {
            ValueBody::Small(bytes) => {
                be::push_u16(&mut out, bytes.len() as u16);
                out.extend_from_slice(bytes);
            }
            ValueBody::Large(r) => out.extend_from_slice(&r.to_bytes()),
        }
        out
    }

    /// Decodes a slot and checks it against `limits`.
    pub fn decode(slot: &[u8], limits: &ValueLimits) -> Result<Self> {
        let mut cur = Cursor::new(slot, "value slot truncated");
        let kind = cur.u8()?;
        let flags = cur.u32()?;
        let exptime = cur.u32()?;
        let cas = match cur.u8()? {
            0 => None,
            1 => Some(cur.u64()?),
            _ => return Err(KvError::Corruption("value slot cas marker invalid")),
        };
        let header = ValueHeader {
            flags,
            exptime,
            cas,
        };
        let body = match kind {
            SLOT_SMALL => {
                let len = cur.u16()? as usize;
                ValueBody::Small(cur.take(len)?.to_vec())
            }
            SLOT_LARGE => ValueBody::Large(LargeBufRef::decode(cur.take(LARGE_REF_LEN)?)?),
            _ => return Err(KvError::Corruption("value slot kind unknown")),
        };
        if cur.remaining() != 0 {
            return Err(KvError::Corruption("value slot has trailing bytes"));
        }
        let value = Self { header, body };
        value.validate(limits)?;
        Ok(value)
    }

    fn encoded_len(&self) -> usize {
        let header = 1 + 4 + 4 + 1 + if self.header.cas.is_some() { 8 } else { 0 };
        header
            + match &self.body {
                ValueBody::Small(bytes) => 2 + bytes.len(),
                ValueBody::Large(_) => LARGE_REF_LEN,
            }
    }
}
