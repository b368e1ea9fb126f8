//! Engine configuration types.
//!
//! Configuration is split by subsystem:
//!
//! - [`EngineConfig`] - Top-level container handed to [`crate::Engine::new`]
//! - [`DispatchConfig`] - Page geometry, filter quirks and the kernel boundary
//! - [`TaintConfig`] - RAM size, radix tree geometry, pool sizing and GC cadence
//!
//! # Configuration Presets
//!
//! - [`EngineConfig::for_ram()`] - Defaults for a guest with the given amount of RAM
//! - [`EngineConfig::exact_filters()`] - Disables both block filter quirks
//! - [`TaintConfig::compact()`] - Small leaves, useful for tests and tiny guests
//!
//! # Example
//!
//! ```rust
//! use vmscope::{DispatchConfig, EngineConfig, TaintConfig};
//!
//! // Use a preset
//! let config = EngineConfig::for_ram(128 << 20);
//!
//! // Or customize
//! let config = EngineConfig {
//!     dispatch: DispatchConfig::default().with_kernel_base(0xC000_0000),
//!     taint: TaintConfig::new(64 << 20).with_gc_interval(1024),
//! };
//! assert!(config.validate().is_ok());
//! ```

use crate::{Gva, Result};

/// Largest guest physical address space the taint tree can cover.
pub const MAX_RAM_SIZE: u64 = 1 << 32;

/// Top-level engine configuration.
///
/// # Default Configuration
///
/// - 4 KiB pages for block filters
/// - CONST block filters upgraded to ALL, no flush when an exact filter is dropped
/// - Kernel space above `0x8000_0000`
/// - 128 MiB of guest RAM, 4 KiB leaves, 4 MiB middle nodes
#[derive(Clone, Debug, Default)]
pub struct EngineConfig {
    /// Callback dispatcher settings.
    pub dispatch: DispatchConfig,

    /// Taint memory store settings.
    pub taint: TaintConfig,
}

impl EngineConfig {
    /// Default configuration for a guest with `ram_size` bytes of physical memory.
    #[must_use]
    pub fn for_ram(ram_size: u64) -> Self {
        EngineConfig {
            dispatch: DispatchConfig::default(),
            taint: TaintConfig::new(ram_size),
        }
    }

    /// Configuration with both block filter quirks switched off.
    ///
    /// CONST filters narrow dispatch to their exact program counter, and removing the
    /// last exact filter for an address flushes that block.
    #[must_use]
    pub fn exact_filters() -> Self {
        EngineConfig {
            dispatch: DispatchConfig::default()
                .with_exact_block_filters(true)
                .with_flush_on_exact_filter_removal(true),
            taint: TaintConfig::default(),
        }
    }

    /// Replaces the taint configuration.
    #[must_use]
    pub fn with_taint(mut self, taint: TaintConfig) -> Self {
        self.taint = taint;
        self
    }

    /// Replaces the dispatch configuration.
    #[must_use]
    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Checks both sub-configurations.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidConfig`] naming the first inconsistent setting.
    pub fn validate(&self) -> Result<()> {
        self.dispatch.validate()?;
        self.taint.validate()
    }
}

/// Callback dispatcher configuration.
///
/// The two boolean flags preserve long-standing behaviour of block filters that
/// downstream analysis plugins rely on. Both default to `false`.
///
/// | Setting | Default |
/// |---------|---------|
/// | `page_bits` | 12 |
/// | `exact_block_filters` | `false` |
/// | `flush_on_exact_filter_removal` | `false` |
/// | `kernel_base` | `0x8000_0000` |
#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Log2 of the guest page size used by page filters.
    pub page_bits: u32,

    /// Whether [`crate::dispatch::BlockFilter::Const`] narrows dispatch to one address.
    ///
    /// When `false` a CONST registration behaves exactly like
    /// [`crate::dispatch::BlockFilter::All`]: it bumps the enable-all counter and fires
    /// for every block.
    pub exact_block_filters: bool,

    /// Whether dropping the last exact filter for an address flushes that block.
    ///
    /// When `false` the stale instrumented block survives until it is evicted for another
    /// reason. Flushing here has been observed to destabilise guest kernels.
    pub flush_on_exact_filter_removal: bool,

    /// First address above which code counts as kernel code.
    ///
    /// Used to classify control-flow transitions for opcode-range callbacks. An address
    /// strictly greater than this value is kernel space.
    pub kernel_base: Gva,
}

impl DispatchConfig {
    /// Creates the default dispatch configuration.
    #[must_use]
    pub fn new() -> Self {
        DispatchConfig {
            page_bits: 12,
            exact_block_filters: false,
            flush_on_exact_filter_removal: false,
            kernel_base: 0x8000_0000,
        }
    }

    /// Sets the page size, given as log2.
    #[must_use]
    pub fn with_page_bits(mut self, bits: u32) -> Self {
        self.page_bits = bits;
        self
    }

    /// Enables or disables exact CONST block filters.
    #[must_use]
    pub fn with_exact_block_filters(mut self, exact: bool) -> Self {
        self.exact_block_filters = exact;
        self
    }

    /// Enables or disables the flush when the last exact filter of an address goes away.
    #[must_use]
    pub fn with_flush_on_exact_filter_removal(mut self, flush: bool) -> Self {
        self.flush_on_exact_filter_removal = flush;
        self
    }

    /// Sets the kernel boundary.
    #[must_use]
    pub fn with_kernel_base(mut self, base: Gva) -> Self {
        self.kernel_base = base;
        self
    }

    /// Mask selecting the page part of a guest address.
    #[must_use]
    pub fn page_mask(&self) -> Gva {
        !((1u32 << self.page_bits) - 1)
    }

    /// Checks the dispatch settings.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidConfig`] if the page size is outside 512 B..=4 MiB.
    pub fn validate(&self) -> Result<()> {
        if !(9..=22).contains(&self.page_bits) {
            return Err(config_error!(
                "page_bits must be within 9..=22, got {}",
                self.page_bits
            ));
        }
        Ok(())
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Taint memory store configuration.
///
/// The radix tree splits a guest physical address into a root index, a middle index of
/// `middle_bits` and a leaf offset of `leaf_bits`. With the defaults one leaf shadows a
/// 4 KiB page and one middle node covers 4 MiB.
///
/// | Setting | Default |
/// |---------|---------|
/// | `ram_size` | 128 MiB |
/// | `leaf_bits` | 12 |
/// | `middle_bits` | 10 |
/// | `leaf_pool_chunk` | 100 |
/// | `middle_pool_chunk` | 50 |
/// | `gc_interval` | 4096 |
/// | `leaf_pool_limit` | none |
#[derive(Clone, Debug)]
pub struct TaintConfig {
    /// Guest physical memory size in bytes.
    ///
    /// Sizes the root array and bounds both pools.
    pub ram_size: u64,

    /// Log2 of the bytes shadowed by one leaf.
    pub leaf_bits: u32,

    /// Log2 of the number of leaves per middle node.
    pub middle_bits: u32,

    /// Number of leaves a pool refill hands out at once.
    pub leaf_pool_chunk: usize,

    /// Number of middle nodes a pool refill hands out at once.
    pub middle_pool_chunk: usize,

    /// Number of taint stores after which a garbage collection sweep becomes due.
    pub gc_interval: u32,

    /// Optional hard cap on the number of leaves.
    ///
    /// `None` sizes the pool to cover all of `ram_size`.
    pub leaf_pool_limit: Option<usize>,
}

impl TaintConfig {
    /// Default taint configuration for `ram_size` bytes of guest RAM.
    #[must_use]
    pub fn new(ram_size: u64) -> Self {
        TaintConfig {
            ram_size,
            leaf_bits: 12,
            middle_bits: 10,
            leaf_pool_chunk: 100,
            middle_pool_chunk: 50,
            gc_interval: 4096,
            leaf_pool_limit: None,
        }
    }

    /// Small geometry for tests: 1 MiB of RAM, 64 byte leaves, 16 leaves per middle.
    #[must_use]
    pub fn compact() -> Self {
        TaintConfig {
            ram_size: 1 << 20,
            leaf_bits: 6,
            middle_bits: 4,
            leaf_pool_chunk: 8,
            middle_pool_chunk: 4,
            gc_interval: 64,
            leaf_pool_limit: None,
        }
    }

    /// Sets the tree geometry.
    #[must_use]
    pub fn with_geometry(mut self, leaf_bits: u32, middle_bits: u32) -> Self {
        self.leaf_bits = leaf_bits;
        self.middle_bits = middle_bits;
        self
    }

    /// Sets the pool refill sizes.
    #[must_use]
    pub fn with_pool_chunks(mut self, leaf: usize, middle: usize) -> Self {
        self.leaf_pool_chunk = leaf;
        self.middle_pool_chunk = middle;
        self
    }

    /// Sets the number of stores between garbage collection sweeps.
    #[must_use]
    pub fn with_gc_interval(mut self, interval: u32) -> Self {
        self.gc_interval = interval;
        self
    }

    /// Caps the leaf pool.
    #[must_use]
    pub fn with_leaf_pool_limit(mut self, limit: usize) -> Self {
        self.leaf_pool_limit = Some(limit);
        self
    }

    /// Checks the taint settings.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidConfig`] if the RAM size is zero or above 4 GiB, if a
    /// leaf is smaller than 4 bytes, if the geometry does not fit into a 32-bit address, or
    /// if a pool chunk or the GC interval is zero.
    pub fn validate(&self) -> Result<()> {
        if self.ram_size == 0 || self.ram_size > MAX_RAM_SIZE {
            return Err(config_error!(
                "ram_size must be within 1..=4 GiB, got {:#x}",
                self.ram_size
            ));
        }
        if self.leaf_bits < 2 {
            return Err(config_error!(
                "leaf_bits must be at least 2, got {}",
                self.leaf_bits
            ));
        }
        if self.middle_bits == 0 || self.leaf_bits + self.middle_bits > 32 {
            return Err(config_error!(
                "leaf_bits + middle_bits must be within 3..=32, got {} + {}",
                self.leaf_bits,
                self.middle_bits
            ));
        }
        if self.leaf_pool_chunk == 0 || self.middle_pool_chunk == 0 {
            return Err(config_error!("pool chunks must not be empty"));
        }
        if self.gc_interval == 0 {
            return Err(config_error!("gc_interval must not be zero"));
        }
        Ok(())
    }
}

impl Default for TaintConfig {
    fn default() -> Self {
        Self::new(128 << 20)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
        assert!(EngineConfig::exact_filters().validate().is_ok());
        assert!(TaintConfig::compact().validate().is_ok());
    }

    #[test]
    fn page_mask() {
        assert_eq!(DispatchConfig::default().page_mask(), 0xFFFF_F000);
        assert_eq!(
            DispatchConfig::default().with_page_bits(16).page_mask(),
            0xFFFF_0000
        );
    }

    #[test]
    fn rejects_oversized_ram() {
        let config = TaintConfig::new(MAX_RAM_SIZE + 1);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig { .. })));

        let config = TaintConfig::new(0);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn rejects_bad_geometry() {
        let config = TaintConfig::default().with_geometry(20, 13);
        assert!(config.validate().is_err());

        let config = TaintConfig::default().with_geometry(1, 10);
        assert!(config.validate().is_err());

        let config = TaintConfig::default().with_gc_interval(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_page_bits() {
        let config = DispatchConfig::default().with_page_bits(30);
        assert!(config.validate().is_err());
    }
}
