use bitflags::bitflags;
use tracing::info;

use crate::{
    engine::MutationToken,
    taint::{
        nic::NicTaintBuffer,
        stats::{GcReport, TaintUsage},
        tree::{TaintTree, WriteOutcome},
        value::{AccessSize, TaintValue},
    },
    Error, Gpa, Result, TaintConfig,
};

bitflags! {
    /// Propagation rules consumed by the translator when it emits taint instrumentation.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct TaintPolicy: u8 {
        /// Packets received by the NIC carry taint from the NIC shadow buffer.
        const NIC = 1 << 0;
        /// A load through a tainted pointer taints the loaded value.
        const LOAD_POINTERS = 1 << 1;
        /// A store through a tainted pointer taints the stored bytes.
        const STORE_POINTERS = 1 << 2;
    }
}

/// Result of one taint store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreOutcome {
    /// The taint state changed: some byte differs, or the stored value is tainted.
    pub changed: bool,
    /// A leaf was allocated, so the host has to drop its fast-path TLB entry.
    pub allocated_leaf: bool,
    /// The stored value, with bytes beyond RAM reading as clean.
    pub value: TaintValue,
}

/// The taint memory store.
///
/// Holds the radix tree while tracking is enabled, and nothing but its configuration
/// while disabled. Hot-path reads and writes take `&self`/`&mut self` directly; every
/// operation that creates or destroys the tree, sweeps it or changes the propagation
/// policy requires a [`MutationToken`], which only a [`crate::PauseGuard`] hands out.
#[derive(Debug)]
pub struct TaintStore {
    config: TaintConfig,
    tree: Option<TaintTree>,
    policy: TaintPolicy,
    nic: NicTaintBuffer,
    stores_since_gc: u32,
}

impl TaintStore {
    /// Creates a disabled store.
    #[must_use]
    pub fn new(config: TaintConfig) -> Self {
        TaintStore {
            config,
            tree: None,
            policy: TaintPolicy::empty(),
            nic: NicTaintBuffer::new(),
            stores_since_gc: 0,
        }
    }

    /// Returns `true` while taint tracking is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.tree.is_some()
    }

    /// Allocates the root array and both pools.
    ///
    /// # Returns
    ///
    /// `false` if tracking was already enabled, in which case nothing changes.
    pub fn enable(&mut self, _token: &MutationToken) -> bool {
        if self.tree.is_some() {
            return false;
        }

        self.tree = Some(TaintTree::new(&self.config));
        self.stores_since_gc = 0;
        info!(ram_size = self.config.ram_size, "taint tracking enabled");
        true
    }

    /// Releases every node and forgets all taint.
    ///
    /// # Returns
    ///
    /// `false` if tracking was already disabled, in which case nothing changes.
    pub fn disable(&mut self, _token: &MutationToken) -> bool {
        if self.tree.take().is_none() {
            return false;
        }

        self.policy = TaintPolicy::empty();
        self.nic.reset();
        info!("taint tracking disabled, all taint data discarded");
        true
    }

    /// Reads the taint of one access.
    ///
    /// Addresses never written, addresses beyond RAM, and everything while tracking is
    /// disabled read as untainted.
    #[must_use]
    pub fn read(&self, paddr: Gpa, size: AccessSize) -> TaintValue {
        match &self.tree {
            Some(tree) => tree.read(paddr, size),
            None => TaintValue::clean(size),
        }
    }

    /// Stores the taint of one access.
    ///
    /// A disabled store accepts and drops the write, as does RAM for the bytes of an
    /// access that extend past its end.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] if a leaf or middle node was needed and the pool
    /// is capped below the guest's needs. No taint byte is modified in that case.
    pub fn write(&mut self, paddr: Gpa, size: AccessSize, bits: u64) -> Result<StoreOutcome> {
        let value = TaintValue::new(bits, size);
        let Some(tree) = self.tree.as_mut() else {
            return Ok(StoreOutcome {
                changed: false,
                allocated_leaf: false,
                value,
            });
        };

        self.stores_since_gc = self.stores_since_gc.saturating_add(1);
        let bytes = value.bits().to_le_bytes();
        let outcome = tree.write_bytes(paddr, &bytes[..size.bytes()])?;
        let value = match outcome.stored {
            stored if stored >= size.bytes() => value,
            stored => TaintValue::new(value.bits() & ((1u64 << (stored * 8)) - 1), size),
        };

        Ok(StoreOutcome {
            changed: outcome.changed || (outcome.stored > 0 && !value.is_clean()),
            allocated_leaf: outcome.allocated_leaf,
            value,
        })
    }

    /// Stores taint for an arbitrary range, one byte of `taint` per guest byte.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaintDisabled`] while tracking is disabled and
    /// [`Error::PoolExhausted`] if the tree cannot grow.
    pub fn taint_range(&mut self, paddr: Gpa, taint: &[u8]) -> Result<WriteOutcome> {
        let tree = self.tree.as_mut().ok_or(Error::TaintDisabled)?;
        tree.write_bytes(paddr, taint)
    }

    /// Copies the taint of `out.len()` bytes at `paddr` into `out`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaintDisabled`] while tracking is disabled.
    pub fn check_range(&self, paddr: Gpa, out: &mut [u8]) -> Result<()> {
        let tree = self.tree.as_ref().ok_or(Error::TaintDisabled)?;
        tree.read_bytes(paddr, out);
        Ok(())
    }

    /// Returns `true` if a leaf shadows the page containing `paddr`.
    ///
    /// The softmmu uses this to route a page through the taint-aware slow path. A page
    /// whose taint was cleared keeps its leaf, and stays "tainted" here, until the next
    /// garbage collection sweep.
    #[must_use]
    pub fn is_page_tainted(&self, paddr: Gpa) -> bool {
        self.tree.as_ref().is_some_and(|tree| tree.has_leaf(paddr))
    }

    /// Returns `true` once enough stores happened since the last sweep.
    #[must_use]
    pub fn gc_due(&self) -> bool {
        self.tree.is_some() && self.stores_since_gc >= self.config.gc_interval
    }

    /// Sweeps the tree, returning all-zero leaves and empty middle nodes to their pools.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaintDisabled`] while tracking is disabled.
    pub fn collect(&mut self, _token: &MutationToken) -> Result<GcReport> {
        let tree = self.tree.as_mut().ok_or(Error::TaintDisabled)?;
        let report = tree.collect();
        self.stores_since_gc = 0;
        info!(%report, "taint garbage collection");
        Ok(report)
    }

    /// Counts tainted bytes with a full scan.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaintDisabled`] while tracking is disabled.
    pub fn tainted_bytes(&self, _token: &MutationToken) -> Result<u64> {
        let tree = self.tree.as_ref().ok_or(Error::TaintDisabled)?;
        Ok(tree.tainted_bytes())
    }

    /// Node accounting, or `None` while tracking is disabled.
    #[must_use]
    pub fn usage(&self) -> Option<TaintUsage> {
        self.tree.as_ref().map(TaintTree::usage)
    }

    /// Current propagation policy.
    #[must_use]
    pub fn policy(&self) -> TaintPolicy {
        self.policy
    }

    /// Replaces the propagation policy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaintDisabled`] while tracking is disabled.
    pub fn set_policy(&mut self, _token: &MutationToken, policy: TaintPolicy) -> Result<()> {
        if self.tree.is_none() {
            return Err(Error::TaintDisabled);
        }
        self.policy = policy;
        Ok(())
    }

    /// Taint shadow of the NIC packet buffer.
    #[must_use]
    pub fn nic(&self) -> &NicTaintBuffer {
        &self.nic
    }

    /// Taint shadow of the NIC packet buffer, mutably.
    pub fn nic_mut(&mut self) -> &mut NicTaintBuffer {
        &mut self.nic
    }

    /// The configuration the tree is built from.
    #[must_use]
    pub fn config(&self) -> &TaintConfig {
        &self.config
    }
}
