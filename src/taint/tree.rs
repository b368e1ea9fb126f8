use rayon::prelude::*;
use tracing::trace;

use crate::{
    taint::{
        layout::TaintLayout,
        pool::{LeafNode, MiddleNode, NodePool},
        stats::{GcReport, TaintUsage},
        value::{AccessSize, TaintValue},
    },
    Gpa, Result, TaintConfig,
};

/// Result of writing taint bytes into the tree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    /// At least one byte differs from its previous taint.
    pub changed: bool,
    /// A leaf was taken from the pool for this write.
    pub allocated_leaf: bool,
    /// Bytes that fell inside RAM and were written; the rest were dropped.
    pub stored: usize,
}

/// The radix tree itself: root array, pools and the address arithmetic tying them.
///
/// Exists only while taint tracking is enabled.
#[derive(Debug)]
pub(crate) struct TaintTree {
    layout: TaintLayout,
    root: Vec<Option<u32>>,
    middles: NodePool<MiddleNode>,
    leaves: NodePool<LeafNode>,
}

impl TaintTree {
    pub(crate) fn new(config: &TaintConfig) -> Self {
        let layout = TaintLayout::new(config);
        let leaf_capacity = config
            .leaf_pool_limit
            .map_or(layout.leaf_count(), |limit| limit.min(layout.leaf_count()));

        TaintTree {
            layout,
            root: vec![None; layout.root_size()],
            middles: NodePool::new(
                "middle",
                layout.middle_size(),
                config.middle_pool_chunk,
                layout.root_size(),
            ),
            leaves: NodePool::new(
                "leaf",
                layout.leaf_size(),
                config.leaf_pool_chunk,
                leaf_capacity,
            ),
        }
    }

    fn leaf_at(&self, addr: u64) -> Option<u32> {
        let middle = self.root[self.layout.middle_index(addr)]?;
        self.middles.get(middle).leaf(self.layout.leaf_index(addr))
    }

    /// Returns the leaf covering `addr`, allocating missing nodes.
    ///
    /// A middle node allocated here is handed back if the leaf allocation fails, so a
    /// failed call leaves the tree as it was.
    fn ensure_leaf(&mut self, addr: u64) -> Result<(u32, bool)> {
        let middle_index = self.layout.middle_index(addr);
        let leaf_index = self.layout.leaf_index(addr);

        let (middle, fresh_middle) = match self.root[middle_index] {
            Some(middle) => (middle, false),
            None => (self.middles.alloc()?, true),
        };

        if let Some(leaf) = self.middles.get(middle).leaf(leaf_index) {
            return Ok((leaf, false));
        }

        let leaf = match self.leaves.alloc() {
            Ok(leaf) => leaf,
            Err(error) => {
                if fresh_middle {
                    self.middles.release(middle);
                }
                return Err(error);
            }
        };

        self.root[middle_index] = Some(middle);
        self.middles.get_mut(middle).set_leaf(leaf_index, Some(leaf));
        trace!(addr, middle, leaf, "allocated taint leaf");
        Ok((leaf, true))
    }

    /// Copies the taint of `[addr, addr + out.len())` into `out`.
    ///
    /// Absent nodes and addresses beyond RAM read as zero.
    pub(crate) fn read_bytes(&self, addr: Gpa, out: &mut [u8]) {
        out.fill(0);
        for (chunk_addr, offset, len) in self.layout.chunks(addr, out.len()) {
            if let Some(leaf) = self.leaf_at(chunk_addr) {
                let start = self.layout.leaf_offset(chunk_addr);
                out[offset..offset + len]
                    .copy_from_slice(&self.leaves.get(leaf).bytes()[start..start + len]);
            }
        }
    }

    /// Reads the taint of one access.
    pub(crate) fn read(&self, addr: Gpa, size: AccessSize) -> TaintValue {
        let mut bytes = [0u8; 8];
        self.read_bytes(addr, &mut bytes[..size.bytes()]);
        TaintValue::new(u64::from_le_bytes(bytes), size)
    }

    /// Writes taint bytes starting at `addr`.
    ///
    /// Leaves are only allocated for chunks carrying non-zero taint; a zero chunk over an
    /// absent leaf is already in the requested state. All allocations happen before the
    /// first byte is written, so an exhausted pool leaves every taint byte untouched.
    /// Bytes beyond RAM are dropped.
    pub(crate) fn write_bytes(&mut self, addr: Gpa, bytes: &[u8]) -> Result<WriteOutcome> {
        let mut outcome = WriteOutcome::default();

        for (chunk_addr, offset, len) in self.layout.chunks(addr, bytes.len()) {
            let tainted = bytes[offset..offset + len].iter().any(|byte| *byte != 0);
            if tainted && self.leaf_at(chunk_addr).is_none() {
                let (_, allocated) = self.ensure_leaf(chunk_addr)?;
                outcome.allocated_leaf |= allocated;
            }
        }

        for (chunk_addr, offset, len) in self.layout.chunks(addr, bytes.len()) {
            let Some(leaf) = self.leaf_at(chunk_addr) else {
                // Zero chunk over an absent leaf
                outcome.stored += len;
                continue;
            };
            let start = self.layout.leaf_offset(chunk_addr);
            let target = &mut self.leaves.get_mut(leaf).bytes_mut()[start..start + len];
            let source = &bytes[offset..offset + len];
            outcome.stored += len;
            if target != source {
                outcome.changed = true;
                target.copy_from_slice(source);
            }
        }

        Ok(outcome)
    }

    pub(crate) fn has_leaf(&self, addr: Gpa) -> bool {
        let addr = u64::from(addr);
        self.layout.contains(addr) && self.leaf_at(addr).is_some()
    }

    fn present_leaves(&self) -> Vec<(usize, usize, u32)> {
        self.root
            .iter()
            .enumerate()
            .filter_map(|(slot, middle)| middle.map(|middle| (slot, middle)))
            .flat_map(|(slot, middle)| {
                self.middles
                    .get(middle)
                    .present()
                    .map(move |(leaf_slot, leaf)| (slot, leaf_slot, leaf))
            })
            .collect()
    }

    /// Returns every all-zero leaf to the pool, then every middle node left without
    /// leaves.
    pub(crate) fn collect(&mut self) -> GcReport {
        let present = self.present_leaves();
        let leaves = &self.leaves;
        let clear: Vec<bool> = present
            .par_iter()
            .map(|&(_, _, leaf)| leaves.get(leaf).is_clear())
            .collect();

        let mut report = GcReport::default();
        for (&(slot, leaf_slot, leaf), clear) in present.iter().zip(clear) {
            if !clear {
                continue;
            }
            if let Some(middle) = self.root[slot] {
                self.middles.get_mut(middle).set_leaf(leaf_slot, None);
            }
            self.leaves.release(leaf);
            report.leaves_freed += 1;
            trace!(
                base = self.layout.leaf_base(slot, leaf_slot),
                "reclaimed taint leaf"
            );
        }

        for slot in 0..self.root.len() {
            let Some(middle) = self.root[slot] else {
                continue;
            };
            if self.middles.get(middle).is_empty() {
                self.root[slot] = None;
                self.middles.release(middle);
                report.middles_freed += 1;
            }
        }

        report
    }

    /// Counts tainted bytes across all present leaves.
    pub(crate) fn tainted_bytes(&self) -> u64 {
        let leaves = &self.leaves;
        self.present_leaves()
            .par_iter()
            .map(|&(_, _, leaf)| leaves.get(leaf).tainted_bytes() as u64)
            .sum()
    }

    pub(crate) fn usage(&self) -> TaintUsage {
        TaintUsage {
            ram_size: self.layout.ram_size(),
            middle_in_use: self.middles.in_use(),
            leaf_in_use: self.leaves.in_use(),
            middle_available: self.middles.available(),
            middle_allocated: self.middles.allocated(),
            leaf_available: self.leaves.available(),
            leaf_allocated: self.leaves.allocated(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn tree() -> TaintTree {
        TaintTree::new(&TaintConfig::compact())
    }

    #[test]
    fn absent_reads_zero() {
        let tree = tree();
        for size in [
            AccessSize::Byte,
            AccessSize::Word,
            AccessSize::Long,
            AccessSize::Quad,
        ] {
            assert!(tree.read(0x1234, size).is_clean());
        }
        assert_eq!(tree.usage().leaf_in_use, 0);
    }

    #[test]
    fn zero_write_does_not_allocate() {
        let mut tree = tree();
        let outcome = tree.write_bytes(0x100, &[0, 0, 0, 0]).unwrap();
        assert_eq!(
            outcome,
            WriteOutcome {
                stored: 4,
                ..WriteOutcome::default()
            }
        );
        assert_eq!(tree.usage().leaf_in_use, 0);
        assert_eq!(tree.usage().middle_in_use, 0);
    }

    #[test]
    fn write_then_read() {
        let mut tree = tree();
        let outcome = tree.write_bytes(0x100, &[0, 0, 0, 0xFF]).unwrap();
        assert!(outcome.changed);
        assert!(outcome.allocated_leaf);

        assert_eq!(tree.read(0x100, AccessSize::Long).bits(), 0xFF00_0000);
        assert_eq!(tree.read(0x103, AccessSize::Byte).bits(), 0xFF);
        assert_eq!(tree.read(0x100, AccessSize::Byte).bits(), 0);

        let again = tree.write_bytes(0x100, &[0, 0, 0, 0xFF]).unwrap();
        assert!(!again.changed);
        assert!(!again.allocated_leaf);
    }

    #[test]
    fn quad_spans_two_leaves() {
        // 64 byte leaves in the compact layout
        let mut tree = tree();
        let bytes = [1, 2, 3, 4, 5, 6, 7, 8];
        let outcome = tree.write_bytes(0x3C, &bytes).unwrap();
        assert!(outcome.allocated_leaf);
        assert_eq!(tree.usage().leaf_in_use, 2);

        assert_eq!(
            tree.read(0x3C, AccessSize::Quad).bits(),
            u64::from_le_bytes(bytes)
        );
        assert_eq!(tree.read(0x40, AccessSize::Long).bits(), 0x0807_0605);
    }

    #[test]
    fn beyond_ram_is_ignored() {
        let mut tree = tree();
        let end = (1u32 << 20) - 2;
        let outcome = tree.write_bytes(end, &[0xAA; 4]).unwrap();
        assert_eq!(outcome.stored, 2);
        assert_eq!(tree.read(end, AccessSize::Long).bits(), 0xAAAA);
        assert!(tree.read(1 << 20, AccessSize::Byte).is_clean());

        let outside = tree.write_bytes(1 << 20, &[0xAA; 4]).unwrap();
        assert_eq!(outside, WriteOutcome::default());
        assert_eq!(tree.usage().leaf_in_use, 1);
    }

    #[test]
    fn collect_reclaims_zero_leaves() {
        let mut tree = tree();
        tree.write_bytes(0x100, &[0xFF]).unwrap();
        tree.write_bytes(0x2000, &[0x01]).unwrap();
        tree.write_bytes(0x100, &[0x00]).unwrap();
        assert_eq!(tree.usage().leaf_in_use, 2);
        assert_eq!(tree.usage().middle_in_use, 2);

        let report = tree.collect();
        assert_eq!(report.leaves_freed, 1);
        assert_eq!(report.middles_freed, 1);
        assert_eq!(tree.usage().leaf_in_use, 1);
        assert_eq!(tree.read(0x2000, AccessSize::Byte).bits(), 1);
        assert!(!tree.has_leaf(0x100));
        assert!(tree.has_leaf(0x2000));
    }

    #[test]
    fn counts_tainted_bytes() {
        let mut tree = tree();
        tree.write_bytes(0x10, &[1, 0, 1, 1]).unwrap();
        tree.write_bytes(0x8000, &[0xFF; 8]).unwrap();
        assert_eq!(tree.tainted_bytes(), 11);
    }

    #[test]
    fn exhaustion_leaves_tree_untouched() {
        let config = TaintConfig::compact().with_leaf_pool_limit(1);
        let mut tree = TaintTree::new(&config);
        tree.write_bytes(0x00, &[1]).unwrap();

        let result = tree.write_bytes(0x3E, &[2, 2, 2, 2]);
        assert!(matches!(result, Err(Error::PoolExhausted { pool: "leaf", .. })));
        assert!(tree.read(0x3E, AccessSize::Word).is_clean());

        let result = tree.write_bytes(0x4000, &[3]);
        assert!(result.is_err());
        assert_eq!(tree.usage().middle_in_use, 1);
    }
}
