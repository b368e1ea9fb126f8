use crate::{Error, Result};

/// Size of the NIC taint shadow, matching the NIC's on-board packet buffer.
pub const NIC_BUFFER_SIZE: usize = 32 * 1024;

/// Taint shadow of the network card's internal packet buffer.
///
/// Packets sit in device memory between the guest driver's DMA and the wire, outside
/// guest physical RAM, so their taint lives here instead of in the radix tree.
#[derive(Clone)]
pub struct NicTaintBuffer {
    bytes: Box<[u8]>,
}

impl NicTaintBuffer {
    /// Creates an untainted buffer.
    #[must_use]
    pub fn new() -> Self {
        NicTaintBuffer {
            bytes: vec![0; NIC_BUFFER_SIZE].into_boxed_slice(),
        }
    }

    fn range(offset: usize, len: usize) -> Result<std::ops::Range<usize>> {
        match offset.checked_add(len) {
            Some(end) if end <= NIC_BUFFER_SIZE => Ok(offset..end),
            _ => Err(Error::OutOfBounds { offset, len }),
        }
    }

    /// Stores taint for `taint.len()` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if the range exceeds the buffer.
    pub fn write(&mut self, offset: usize, taint: &[u8]) -> Result<()> {
        let range = Self::range(offset, taint.len())?;
        self.bytes[range].copy_from_slice(taint);
        Ok(())
    }

    /// Copies the taint of `out.len()` bytes at `offset` into `out`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if the range exceeds the buffer.
    pub fn read(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        let range = Self::range(offset, out.len())?;
        out.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    /// Clears the taint of `len` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if the range exceeds the buffer.
    pub fn clear(&mut self, offset: usize, len: usize) -> Result<()> {
        let range = Self::range(offset, len)?;
        self.bytes[range].fill(0);
        Ok(())
    }

    /// Clears the whole buffer.
    pub fn reset(&mut self) {
        self.bytes.fill(0);
    }
}

impl Default for NicTaintBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NicTaintBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tainted = self.bytes.iter().filter(|byte| **byte != 0).count();
        f.debug_struct("NicTaintBuffer")
            .field("tainted", &tainted)
            .finish()
    }
}
