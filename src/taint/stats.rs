//! Reporting types for the taint memory store.

use std::fmt;

/// Node accounting of the taint tree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaintUsage {
    /// Guest physical memory size in bytes.
    pub ram_size: u64,

    /// Middle nodes reachable from the root.
    pub middle_in_use: usize,

    /// Leaves reachable from a middle node.
    pub leaf_in_use: usize,

    /// Middle nodes created but sitting on the free list.
    pub middle_available: usize,

    /// Middle nodes created so far.
    pub middle_allocated: usize,

    /// Leaves created but sitting on the free list.
    pub leaf_available: usize,

    /// Leaves created so far.
    pub leaf_allocated: usize,
}

impl fmt::Display for TaintUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}M RAM: {} mid nodes, {} leaf nodes, {}/{} mid pool, {}/{} leaf pool",
            self.ram_size >> 20,
            self.middle_in_use,
            self.leaf_in_use,
            self.middle_available,
            self.middle_allocated,
            self.leaf_available,
            self.leaf_allocated
        )
    }
}

/// Nodes returned to the pools by one garbage collection sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Middle nodes released.
    pub middles_freed: usize,

    /// Leaves released.
    pub leaves_freed: usize,
}

impl GcReport {
    /// Returns `true` if the sweep released nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.middles_freed == 0 && self.leaves_freed == 0
    }
}

impl fmt::Display for GcReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Removed {} mid nodes, {} leaf nodes",
            self.middles_freed, self.leaves_freed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_display() {
        let usage = TaintUsage {
            ram_size: 128 << 20,
            middle_in_use: 1,
            leaf_in_use: 3,
            middle_available: 49,
            middle_allocated: 50,
            leaf_available: 97,
            leaf_allocated: 100,
        };
        assert_eq!(
            usage.to_string(),
            "128M RAM: 1 mid nodes, 3 leaf nodes, 49/50 mid pool, 97/100 leaf pool"
        );
    }

    #[test]
    fn report_display() {
        let report = GcReport {
            middles_freed: 2,
            leaves_freed: 5,
        };
        assert_eq!(report.to_string(), "Removed 2 mid nodes, 5 leaf nodes");
        assert!(GcReport::default().is_empty());
    }
}
