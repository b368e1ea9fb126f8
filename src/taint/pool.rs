//! Index based node pool backing the taint radix tree.
//!
//! Nodes are created in chunks and never dropped while tracking is enabled. A released
//! node is cleared and pushed onto a free list, and the next allocation hands out the most
//! recently released index. Callers hold plain `u32` indices, so there is no per-node
//! heap traffic on the store path and no way to free a node twice through aliasing
//! pointers.

use tracing::trace;

use crate::{Error, Result};

/// A node that can live in a [`NodePool`].
pub trait PoolNode {
    /// Creates a cleared node of `len` elements.
    fn fresh(len: usize) -> Self;

    /// Clears the node before it goes back on the free list.
    fn recycle(&mut self);
}

/// Chunked pool of equally sized nodes addressed by index.
///
/// # Example
///
/// ```rust
/// use vmscope::taint::{LeafNode, NodePool};
///
/// let mut pool: NodePool<LeafNode> = NodePool::new("leaf", 64, 8, 100);
/// let leaf = pool.alloc()?;
/// pool.get_mut(leaf).bytes_mut()[3] = 0xFF;
/// pool.release(leaf);
///
/// // The node comes back cleared
/// let again = pool.alloc()?;
/// assert_eq!(again, leaf);
/// assert!(pool.get(again).is_clear());
/// # Ok::<(), vmscope::Error>(())
/// ```
#[derive(Debug)]
pub struct NodePool<T> {
    label: &'static str,
    nodes: Vec<T>,
    free: Vec<u32>,
    node_len: usize,
    chunk: usize,
    capacity: usize,
}

impl<T: PoolNode> NodePool<T> {
    /// Creates a pool and pre-allocates its first chunk.
    ///
    /// # Arguments
    ///
    /// * `label` - Name reported in [`Error::PoolExhausted`]
    /// * `node_len` - Number of elements in every node
    /// * `chunk` - Number of nodes created per refill
    /// * `capacity` - Maximum number of nodes the pool may ever hold
    #[must_use]
    pub fn new(label: &'static str, node_len: usize, chunk: usize, capacity: usize) -> Self {
        let mut pool = NodePool {
            label,
            nodes: Vec::new(),
            free: Vec::new(),
            node_len,
            chunk: chunk.max(1),
            capacity,
        };
        pool.refill();
        pool
    }

    fn refill(&mut self) {
        let start = self.nodes.len();
        let count = self.chunk.min(self.capacity - start);
        if count == 0 {
            return;
        }

        self.nodes.reserve(count);
        for _ in 0..count {
            self.nodes.push(T::fresh(self.node_len));
        }
        // Lowest index on top of the free list
        self.free.extend((start..start + count).rev().map(|idx| idx as u32));
        trace!(pool = self.label, count, total = self.nodes.len(), "refilled pool");
    }

    /// Hands out a cleared node.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] if every node up to the capacity is in use.
    pub fn alloc(&mut self) -> Result<u32> {
        if self.free.is_empty() {
            self.refill();
        }

        self.free.pop().ok_or(Error::PoolExhausted {
            pool: self.label,
            capacity: self.capacity,
        })
    }

    /// Clears a node and returns it to the free list.
    pub fn release(&mut self, idx: u32) {
        debug_assert!(!self.free.contains(&idx), "node {idx} released twice");
        self.nodes[idx as usize].recycle();
        self.free.push(idx);
    }

    /// Returns the node at `idx`.
    #[must_use]
    pub fn get(&self, idx: u32) -> &T {
        &self.nodes[idx as usize]
    }

    /// Returns the node at `idx` mutably.
    pub fn get_mut(&mut self, idx: u32) -> &mut T {
        &mut self.nodes[idx as usize]
    }

    /// Number of nodes currently handed out.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    /// Number of nodes created so far.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.nodes.len()
    }

    /// Number of created nodes sitting on the free list.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Maximum number of nodes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Taint bytes shadowing one leaf-sized range of guest physical memory.
#[derive(Clone, Debug)]
pub struct LeafNode {
    bitmap: Box<[u8]>,
}

impl LeafNode {
    /// Taint bytes of the leaf.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bitmap
    }

    /// Taint bytes of the leaf, mutably.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bitmap
    }

    /// Returns `true` if no byte of the leaf is tainted.
    ///
    /// Scans a 32-bit word at a time.
    #[must_use]
    pub fn is_clear(&self) -> bool {
        let mut words = self.bitmap.chunks_exact(4);
        words
            .by_ref()
            .all(|word| u32::from_ne_bytes([word[0], word[1], word[2], word[3]]) == 0)
            && words.remainder().iter().all(|byte| *byte == 0)
    }

    /// Number of tainted bytes in the leaf.
    #[must_use]
    pub fn tainted_bytes(&self) -> usize {
        self.bitmap.iter().filter(|byte| **byte != 0).count()
    }
}

impl PoolNode for LeafNode {
    fn fresh(len: usize) -> Self {
        LeafNode {
            bitmap: vec![0; len].into_boxed_slice(),
        }
    }

    fn recycle(&mut self) {
        self.bitmap.fill(0);
    }
}

/// Leaf indices of one middle node; `None` marks a range never tainted.
#[derive(Clone, Debug)]
pub struct MiddleNode {
    leaves: Box<[Option<u32>]>,
}

impl MiddleNode {
    /// Leaf index of slot `idx`.
    #[must_use]
    pub fn leaf(&self, idx: usize) -> Option<u32> {
        self.leaves[idx]
    }

    /// Stores or clears the leaf of slot `idx`.
    pub fn set_leaf(&mut self, idx: usize, leaf: Option<u32>) {
        self.leaves[idx] = leaf;
    }

    /// Iterates over `(slot, leaf)` of every present leaf.
    pub fn present(&self) -> impl Iterator<Item = (usize, u32)> + '_ {
        self.leaves
            .iter()
            .enumerate()
            .filter_map(|(slot, leaf)| leaf.map(|leaf| (slot, leaf)))
    }

    /// Returns `true` if the middle node holds no leaf.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.leaves.iter().all(Option::is_none)
    }
}

impl PoolNode for MiddleNode {
    fn fresh(len: usize) -> Self {
        MiddleNode {
            leaves: vec![None; len].into_boxed_slice(),
        }
    }

    fn recycle(&mut self) {
        self.leaves.fill(None);
    }
}
