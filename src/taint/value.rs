use std::fmt;

use strum::{Display, EnumIter};

use crate::{Error, Result};

/// Width of a guest memory access.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter)]
#[repr(u8)]
pub enum AccessSize {
    /// 1 byte
    Byte = 1,
    /// 2 bytes
    Word = 2,
    /// 4 bytes
    Long = 4,
    /// 8 bytes
    Quad = 8,
}

impl AccessSize {
    /// Number of bytes accessed.
    #[must_use]
    pub fn bytes(self) -> usize {
        self as usize
    }

    /// Mask covering the value bits of one access.
    #[must_use]
    pub fn mask(self) -> u64 {
        match self {
            AccessSize::Quad => u64::MAX,
            size => (1u64 << (size.bytes() * 8)) - 1,
        }
    }
}

impl TryFrom<usize> for AccessSize {
    type Error = Error;

    fn try_from(value: usize) -> Result<Self> {
        match value {
            1 => Ok(AccessSize::Byte),
            2 => Ok(AccessSize::Word),
            4 => Ok(AccessSize::Long),
            8 => Ok(AccessSize::Quad),
            other => Err(Error::InvalidAccessSize(other)),
        }
    }
}

/// Up to eight taint bytes copied out of the tree, lowest address first.
///
/// Delivered to taint callbacks so they never borrow the tree itself.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct TaintBytes {
    bytes: [u8; 8],
    len: u8,
}

impl TaintBytes {
    /// Taint bytes of an access, little-endian from `bits`.
    #[must_use]
    pub fn from_bits(bits: u64, size: AccessSize) -> Self {
        TaintBytes {
            bytes: bits.to_le_bytes(),
            len: size as u8,
        }
    }

    /// The bytes, one per accessed guest byte.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }

    /// Returns `true` if no byte is tainted.
    #[must_use]
    pub fn is_clear(&self) -> bool {
        self.as_slice().iter().all(|byte| *byte == 0)
    }
}

impl fmt::Debug for TaintBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

/// Taint of one guest memory access.
///
/// Byte `i` of the access is bits `8*i..8*i+8`, the same little-endian layout the guest
/// uses for the data itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaintValue {
    bits: u64,
    size: AccessSize,
}

impl TaintValue {
    /// Creates a value, truncating `bits` to the access width.
    #[must_use]
    pub fn new(bits: u64, size: AccessSize) -> Self {
        TaintValue {
            bits: bits & size.mask(),
            size,
        }
    }

    /// Untainted value of the given width.
    #[must_use]
    pub fn clean(size: AccessSize) -> Self {
        TaintValue { bits: 0, size }
    }

    /// Raw taint bits.
    #[must_use]
    pub fn bits(&self) -> u64 {
        self.bits
    }

    /// Access width.
    #[must_use]
    pub fn size(&self) -> AccessSize {
        self.size
    }

    /// Returns `true` if no byte is tainted.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.bits == 0
    }

    /// The value as taint bytes.
    #[must_use]
    pub fn bytes(&self) -> TaintBytes {
        TaintBytes::from_bits(self.bits, self.size)
    }
}
