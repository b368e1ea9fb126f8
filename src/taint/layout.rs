use crate::{Gpa, TaintConfig};

/// Address arithmetic of the taint radix tree.
///
/// A guest physical address splits into
///
/// ```text
///  31            leaf_bits+middle_bits   leaf_bits             0
/// +-----------------+---------------------+--------------------+
/// |   root index    |    middle index     |    leaf offset     |
/// +-----------------+---------------------+--------------------+
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaintLayout {
    leaf_bits: u32,
    middle_bits: u32,
    ram_size: u64,
}

impl TaintLayout {
    /// Derives the layout from a validated configuration.
    #[must_use]
    pub fn new(config: &TaintConfig) -> Self {
        TaintLayout {
            leaf_bits: config.leaf_bits,
            middle_bits: config.middle_bits,
            ram_size: config.ram_size,
        }
    }

    /// Bytes shadowed by one leaf.
    #[must_use]
    pub fn leaf_size(&self) -> usize {
        1 << self.leaf_bits
    }

    /// Leaf slots in one middle node.
    #[must_use]
    pub fn middle_size(&self) -> usize {
        1 << self.middle_bits
    }

    /// Number of middle slots in the root array.
    ///
    /// Rounds up so that a RAM size which is not a multiple of the middle span is still
    /// fully covered.
    #[must_use]
    pub fn root_size(&self) -> usize {
        let span = 1u64 << (self.leaf_bits + self.middle_bits);
        self.ram_size.div_ceil(span) as usize
    }

    /// Number of leaves needed to shadow all of RAM.
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.ram_size.div_ceil(self.leaf_size() as u64) as usize
    }

    /// Guest physical memory size.
    #[must_use]
    pub fn ram_size(&self) -> u64 {
        self.ram_size
    }

    /// Returns `true` if `addr` lies inside guest RAM.
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr < self.ram_size
    }

    /// Root array index of `addr`.
    #[must_use]
    pub fn middle_index(&self, addr: u64) -> usize {
        (addr >> (self.leaf_bits + self.middle_bits)) as usize
    }

    /// Slot of `addr` within its middle node.
    #[must_use]
    pub fn leaf_index(&self, addr: u64) -> usize {
        ((addr >> self.leaf_bits) & ((1 << self.middle_bits) - 1)) as usize
    }

    /// Byte offset of `addr` within its leaf.
    #[must_use]
    pub fn leaf_offset(&self, addr: u64) -> usize {
        (addr & ((1 << self.leaf_bits) - 1)) as usize
    }

    /// First address covered by the leaf at root slot `middle` and leaf slot `leaf`.
    #[must_use]
    pub fn leaf_base(&self, middle: usize, leaf: usize) -> u64 {
        ((middle as u64) << (self.leaf_bits + self.middle_bits))
            | ((leaf as u64) << self.leaf_bits)
    }

    /// Splits `[addr, addr + len)` at leaf boundaries, clipped to RAM.
    ///
    /// Yields `(address, offset into the range, chunk length)`.
    pub fn chunks(&self, addr: Gpa, len: usize) -> impl Iterator<Item = (u64, usize, usize)> {
        let layout = *self;
        let start = u64::from(addr);
        let end = (start + len as u64).min(self.ram_size);
        let mut cursor = start;

        std::iter::from_fn(move || {
            if cursor >= end {
                return None;
            }
            let room = (layout.leaf_size() - layout.leaf_offset(cursor)) as u64;
            let chunk = room.min(end - cursor);
            let item = (cursor, (cursor - start) as usize, chunk as usize);
            cursor += chunk;
            Some(item)
        })
    }
}
