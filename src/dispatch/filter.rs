//! Reference counted lookup tables answering "does this block need instrumentation".
//!
//! The translator asks once per generated block, so every query is a hash lookup. A key
//! is present exactly while its count is positive; the dispatcher turns the 0→1 and 1→0
//! transitions reported by the mutators into translation cache flushes.

use std::{collections::HashMap, hash::Hash};

use crate::Gva;

/// Multiset of keys.
#[derive(Clone, Debug)]
pub struct CountingSet<K> {
    counts: HashMap<K, usize>,
}

impl<K: Eq + Hash + Copy> CountingSet<K> {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        CountingSet {
            counts: HashMap::new(),
        }
    }

    /// Adds one reference to `key`, returning the new count.
    pub fn add(&mut self, key: K) -> usize {
        let count = self.counts.entry(key).or_insert(0);
        *count += 1;
        *count
    }

    /// Drops one reference to `key`, returning the remaining count.
    ///
    /// Returns `None` if `key` was not present; the set is unchanged then.
    pub fn remove(&mut self, key: K) -> Option<usize> {
        let count = self.counts.get_mut(&key)?;
        *count -= 1;
        let remaining = *count;
        if remaining == 0 {
            self.counts.remove(&key);
        }
        Some(remaining)
    }

    /// Returns `true` if `key` has at least one reference.
    #[must_use]
    pub fn contains(&self, key: K) -> bool {
        self.counts.contains_key(&key)
    }

    /// Number of references to `key`.
    #[must_use]
    pub fn count(&self, key: K) -> usize {
        self.counts.get(&key).copied().unwrap_or(0)
    }

    /// Number of distinct keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Returns `true` if no key is referenced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

impl<K: Eq + Hash + Copy> Default for CountingSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// `from page -> {to page -> count}` for block-end filters naming both ends.
#[derive(Clone, Debug, Default)]
pub struct PairIndex {
    pairs: HashMap<Gva, CountingSet<Gva>>,
}

impl PairIndex {
    /// Adds one reference to the pair, returning its new count.
    pub fn add(&mut self, from: Gva, to: Gva) -> usize {
        self.pairs.entry(from).or_default().add(to)
    }

    /// Drops one reference to the pair, returning the remaining count.
    pub fn remove(&mut self, from: Gva, to: Gva) -> Option<usize> {
        let targets = self.pairs.get_mut(&from)?;
        let remaining = targets.remove(to)?;
        if targets.is_empty() {
            self.pairs.remove(&from);
        }
        Some(remaining)
    }

    /// Returns `true` if the pair has at least one reference.
    #[must_use]
    pub fn contains(&self, from: Gva, to: Gva) -> bool {
        self.pairs
            .get(&from)
            .is_some_and(|targets| targets.contains(to))
    }

    /// Returns `true` if no pair is referenced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// All filter tables of the dispatcher.
///
/// Block-begin and block-end registrations without an address filter only bump an
/// enable-all counter; everything else lands in one of the keyed tables.
#[derive(Clone, Debug, Default)]
pub struct FilterIndex {
    pub(crate) block_begin_all: usize,
    pub(crate) block_begin_exact: CountingSet<Gva>,
    pub(crate) block_begin_pages: CountingSet<Gva>,
    pub(crate) block_end_all: usize,
    pub(crate) block_end_from: CountingSet<Gva>,
    pub(crate) block_end_to: CountingSet<Gva>,
    pub(crate) block_end_pairs: PairIndex,
}

impl FilterIndex {
    /// Number of unfiltered block-begin registrations.
    #[must_use]
    pub fn block_begin_all(&self) -> usize {
        self.block_begin_all
    }

    /// Exact block-begin addresses.
    #[must_use]
    pub fn block_begin_exact(&self) -> &CountingSet<Gva> {
        &self.block_begin_exact
    }

    /// Block-begin pages.
    #[must_use]
    pub fn block_begin_pages(&self) -> &CountingSet<Gva> {
        &self.block_begin_pages
    }

    /// Number of unfiltered block-end registrations.
    #[must_use]
    pub fn block_end_all(&self) -> usize {
        self.block_end_all
    }

    /// Block-end source pages of `from`-only filters.
    #[must_use]
    pub fn block_end_from(&self) -> &CountingSet<Gva> {
        &self.block_end_from
    }

    /// Block-end target pages of `to`-only filters.
    #[must_use]
    pub fn block_end_to(&self) -> &CountingSet<Gva> {
        &self.block_end_to
    }

    /// Block-end source/target page pairs.
    #[must_use]
    pub fn block_end_pairs(&self) -> &PairIndex {
        &self.block_end_pairs
    }

    /// Returns `true` if no filter of any kind is referenced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.block_begin_all == 0
            && self.block_begin_exact.is_empty()
            && self.block_begin_pages.is_empty()
            && self.block_end_all == 0
            && self.block_end_from.is_empty()
            && self.block_end_to.is_empty()
            && self.block_end_pairs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counting_set() {
        let mut set = CountingSet::new();
        assert_eq!(set.add(0x1000), 1);
        assert_eq!(set.add(0x1000), 2);
        assert_eq!(set.count(0x1000), 2);

        assert_eq!(set.remove(0x1000), Some(1));
        assert!(set.contains(0x1000));
        assert_eq!(set.remove(0x1000), Some(0));
        assert!(!set.contains(0x1000));
        assert!(set.is_empty());

        assert_eq!(set.remove(0x1000), None);
    }

    #[test]
    fn pair_index() {
        let mut pairs = PairIndex::default();
        pairs.add(0x1000, 0x2000);
        pairs.add(0x1000, 0x3000);
        assert!(pairs.contains(0x1000, 0x2000));
        assert!(!pairs.contains(0x2000, 0x1000));

        assert_eq!(pairs.remove(0x1000, 0x2000), Some(0));
        assert!(!pairs.is_empty());
        assert_eq!(pairs.remove(0x1000, 0x3000), Some(0));
        assert!(pairs.is_empty());
        assert_eq!(pairs.remove(0x1000, 0x3000), None);
    }

    #[test]
    fn empty_index() {
        let mut index = FilterIndex::default();
        assert!(index.is_empty());
        index.block_end_all = 1;
        assert!(!index.is_empty());
    }
}
