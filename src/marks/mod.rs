//! Address mark index over guest virtual memory.
//!
//! A flat page table with one slot per 4 KiB guest page. A page holds 64 entries, and an
//! entry holds a 64-bit bitmap for one 64-byte aligned block: bit `i` marks byte
//! `block + i`. Marked bytes may carry a 64-bit payload, stored densely in bit order.
//!
//! Unlike the taint tree, the index reclaims eagerly: an entry whose bitmap drops to zero
//! is freed on the spot, and so is a page whose last entry goes away. The page table
//! itself is allocated on the first mark.
//!
//! # Example
//!
//! ```rust
//! use vmscope::marks::MarkIndex;
//!
//! let mut marks = MarkIndex::new();
//! // Mark the first and last byte of a 4 byte range that straddles two blocks
//! marks.set_mark(0x40_103E, 4, 0b1001)?;
//! assert_eq!(marks.check_mark(0x40_103E, 4)?, 0b1001);
//! assert_eq!(marks.allocated_entries(), 2);
//!
//! marks.clear_marks(0x40_1000, 0x1000);
//! assert_eq!(marks.allocated_pages(), 0);
//! # Ok::<(), vmscope::Error>(())
//! ```

use tracing::trace;

use crate::{Error, Gva, Result};

const PAGE_BITS: u32 = 12;
const BLOCK_BITS: u32 = 6;
const BLOCK_SIZE: u64 = 1 << BLOCK_BITS;
const ENTRIES_PER_PAGE: usize = 1 << (PAGE_BITS - BLOCK_BITS);

/// Number of page slots covering the 32-bit guest virtual address space.
pub const PAGE_COUNT: usize = 1 << (32 - PAGE_BITS);

/// Largest number of bytes a single bitmap describes.
pub const MAX_MARK_SPAN: usize = 64;

fn span_mask(len: u64) -> u64 {
    if len >= 64 {
        u64::MAX
    } else {
        (1u64 << len) - 1
    }
}

#[derive(Clone, Debug, Default)]
struct MarkEntry {
    bitmap: u64,
    // Empty until the first payload is attached
    payload: Vec<u64>,
}

impl MarkEntry {
    fn rank(&self, bit: u32) -> usize {
        (self.bitmap & span_mask(u64::from(bit))).count_ones() as usize
    }

    fn is_marked(&self, bit: u32) -> bool {
        self.bitmap & (1 << bit) != 0
    }

    /// Installs a new bitmap, keeping the payload of bits that stay set.
    fn update(&mut self, bitmap: u64) {
        if !self.payload.is_empty() {
            let mut payload = Vec::with_capacity(bitmap.count_ones() as usize);
            let mut remaining = bitmap;
            while remaining != 0 {
                let bit = remaining.trailing_zeros();
                let kept = if self.is_marked(bit) {
                    self.payload[self.rank(bit)]
                } else {
                    0
                };
                payload.push(kept);
                remaining &= remaining - 1;
            }
            self.payload = payload;
        }
        self.bitmap = bitmap;
    }
}

#[derive(Debug)]
struct MarkPage {
    entries: [Option<MarkEntry>; ENTRIES_PER_PAGE],
    live: usize,
}

impl MarkPage {
    fn new() -> Self {
        MarkPage {
            entries: std::array::from_fn(|_| None),
            live: 0,
        }
    }
}

/// Sparse 64-bit markers over guest virtual addresses.
#[derive(Debug, Default)]
pub struct MarkIndex {
    pages: Vec<Option<Box<MarkPage>>>,
    page_count: usize,
    entry_count: usize,
}

impl MarkIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn locate(addr: u64) -> (usize, usize, u32) {
        (
            (addr >> PAGE_BITS) as usize,
            ((addr >> BLOCK_BITS) as usize) & (ENTRIES_PER_PAGE - 1),
            (addr & (BLOCK_SIZE - 1)) as u32,
        )
    }

    fn entry(&self, addr: u64) -> Option<&MarkEntry> {
        let (page, entry, _) = Self::locate(addr);
        self.pages.get(page)?.as_ref()?.entries[entry].as_ref()
    }

    fn entry_mut(&mut self, addr: u64) -> Option<&mut MarkEntry> {
        let (page, entry, _) = Self::locate(addr);
        self.pages.get_mut(page)?.as_mut()?.entries[entry].as_mut()
    }

    /// Splits `[addr, addr + len)` at 64-byte block boundaries, clipped to 4 GiB.
    ///
    /// Yields `(address, offset into the range, chunk length)`.
    fn blocks(addr: Gva, len: usize) -> impl Iterator<Item = (u64, u64, u64)> {
        let start = u64::from(addr);
        let end = (start + len as u64).min(1 << 32);
        let mut cursor = start;

        std::iter::from_fn(move || {
            if cursor >= end {
                return None;
            }
            let room = BLOCK_SIZE - (cursor & (BLOCK_SIZE - 1));
            let chunk = room.min(end - cursor);
            let item = (cursor, cursor - start, chunk);
            cursor += chunk;
            Some(item)
        })
    }

    /// Replaces the marks of one sub-range of a single block.
    fn update_block(&mut self, addr: u64, len: u64, bits: u64) {
        let (page_idx, entry_idx, offset) = Self::locate(addr);
        let range = span_mask(len) << offset;
        let old = self.entry(addr).map_or(0, |entry| entry.bitmap);
        let new = (old & !range) | ((bits << offset) & range);

        if new == old {
            return;
        }

        if new == 0 {
            let Some(page) = self.pages.get_mut(page_idx).and_then(Option::as_mut) else {
                return;
            };
            page.entries[entry_idx] = None;
            page.live -= 1;
            self.entry_count -= 1;
            if page.live == 0 {
                self.pages[page_idx] = None;
                self.page_count -= 1;
                trace!(page = page_idx, "released mark page");
            }
            return;
        }

        if self.pages.is_empty() {
            self.pages.resize_with(PAGE_COUNT, || None);
        }
        if self.pages[page_idx].is_none() {
            self.pages[page_idx] = Some(Box::new(MarkPage::new()));
            self.page_count += 1;
        }
        let Some(page) = self.pages[page_idx].as_mut() else {
            return;
        };
        if page.entries[entry_idx].is_none() {
            page.entries[entry_idx] = Some(MarkEntry::default());
            page.live += 1;
            self.entry_count += 1;
        }
        if let Some(entry) = page.entries[entry_idx].as_mut() {
            entry.update(new);
        }
    }

    /// Sets the marks of `size` bytes at `addr` from `bitmap`, bit `i` for byte `addr + i`.
    ///
    /// Bits of `bitmap` beyond `size` are ignored. Existing marks in the range are
    /// replaced; marks outside it are kept.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MarkSpanTooLarge`] if `size` exceeds 64.
    pub fn set_mark(&mut self, addr: Gva, size: usize, bitmap: u64) -> Result<()> {
        if size > MAX_MARK_SPAN {
            return Err(Error::MarkSpanTooLarge(size));
        }

        for (block, offset, len) in Self::blocks(addr, size) {
            self.update_block(block, len, bitmap >> offset);
        }
        Ok(())
    }

    /// Returns the marks of `size` bytes at `addr`, bit `i` for byte `addr + i`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MarkSpanTooLarge`] if `size` exceeds 64.
    pub fn check_mark(&self, addr: Gva, size: usize) -> Result<u64> {
        if size > MAX_MARK_SPAN {
            return Err(Error::MarkSpanTooLarge(size));
        }

        let mut marks = 0;
        for (block, offset, len) in Self::blocks(addr, size) {
            if let Some(entry) = self.entry(block) {
                let (_, _, shift) = Self::locate(block);
                marks |= ((entry.bitmap >> shift) & span_mask(len)) << offset;
            }
        }
        Ok(marks)
    }

    /// Returns `true` if the byte at `addr` is marked.
    #[must_use]
    pub fn is_marked(&self, addr: Gva) -> bool {
        let (_, _, bit) = Self::locate(u64::from(addr));
        self.entry(u64::from(addr))
            .is_some_and(|entry| entry.is_marked(bit))
    }

    /// Removes every mark in `[addr, addr + len)`.
    pub fn clear_marks(&mut self, addr: Gva, len: usize) {
        for (block, _, chunk) in Self::blocks(addr, len) {
            self.update_block(block, chunk, 0);
        }
    }

    /// Attaches `value` to the marked byte at `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotMarked`] if the byte carries no mark.
    pub fn set_mark_payload(&mut self, addr: Gva, value: u64) -> Result<()> {
        let (_, _, bit) = Self::locate(u64::from(addr));
        let entry = self
            .entry_mut(u64::from(addr))
            .filter(|entry| entry.is_marked(bit))
            .ok_or(Error::NotMarked(addr))?;

        if entry.payload.is_empty() {
            entry.payload = vec![0; entry.bitmap.count_ones() as usize];
        }
        let rank = entry.rank(bit);
        entry.payload[rank] = value;
        Ok(())
    }

    /// Payload of the marked byte at `addr`; zero if none was attached.
    ///
    /// Returns `None` if the byte carries no mark.
    #[must_use]
    pub fn mark_payload(&self, addr: Gva) -> Option<u64> {
        let (_, _, bit) = Self::locate(u64::from(addr));
        let entry = self
            .entry(u64::from(addr))
            .filter(|entry| entry.is_marked(bit))?;
        Some(entry.payload.get(entry.rank(bit)).copied().unwrap_or(0))
    }

    /// Number of pages holding at least one entry.
    #[must_use]
    pub fn allocated_pages(&self) -> usize {
        self.page_count
    }

    /// Number of entries holding at least one mark.
    #[must_use]
    pub fn allocated_entries(&self) -> usize {
        self.entry_count
    }

    /// Removes every mark.
    pub fn clear(&mut self) {
        self.pages = Vec::new();
        self.page_count = 0;
        self.entry_count = 0;
    }
}
