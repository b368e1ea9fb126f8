use crate::dispatch::CallbackHandle;

/// Number of slots in the opcode table: 256 one-byte opcodes plus 256 `0x0F`-prefixed ones.
pub const OPCODE_TABLE_SIZE: usize = 0x200;

/// Maps an x86 opcode to its table slot.
///
/// One-byte opcodes map to themselves. Two-byte opcodes, given either as `0x0Fxx` or
/// already compacted as `0x1xx`, map to `0x100 | xx`.
///
/// # Example
///
/// ```rust
/// use vmscope::dispatch::normalize_opcode;
///
/// assert_eq!(normalize_opcode(0x90), 0x90);
/// assert_eq!(normalize_opcode(0x0F05), 0x105);
/// assert_eq!(normalize_opcode(0x105), 0x105);
/// ```
#[must_use]
pub fn normalize_opcode(opcode: u16) -> u16 {
    if opcode >= 0x0F00 {
        0x100 | (opcode & 0xFF)
    } else {
        opcode
    }
}

/// One registration slot per compact opcode.
///
/// A later registration overwrites the slots it covers; removing a registration clears
/// only the slots it still owns.
pub(crate) struct OpcodeTable {
    slots: Box<[Option<CallbackHandle>; OPCODE_TABLE_SIZE]>,
}

impl OpcodeTable {
    pub(crate) fn new() -> Self {
        OpcodeTable {
            slots: Box::new([None; OPCODE_TABLE_SIZE]),
        }
    }

    /// Points every slot in `start..=end` at `handle`. Both ends are compact opcodes.
    pub(crate) fn fill(&mut self, start: u16, end: u16, handle: CallbackHandle) {
        for slot in &mut self.slots[usize::from(start)..=usize::from(end)] {
            *slot = Some(handle);
        }
    }

    /// Clears the slots in `start..=end` that still point at `handle`.
    ///
    /// # Returns
    ///
    /// Number of slots cleared.
    pub(crate) fn clear(&mut self, start: u16, end: u16, handle: CallbackHandle) -> usize {
        let mut cleared = 0;
        for slot in &mut self.slots[usize::from(start)..=usize::from(end)] {
            if *slot == Some(handle) {
                *slot = None;
                cleared += 1;
            }
        }
        cleared
    }

    /// Registration owning the slot of `opcode`, which may be in either encoding.
    pub(crate) fn get(&self, opcode: u16) -> Option<CallbackHandle> {
        self.slots
            .get(usize::from(normalize_opcode(opcode)))
            .copied()
            .flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{registry::RecordArena, registry::RecordFilter, CallbackKind};

    fn handles() -> (CallbackHandle, CallbackHandle) {
        let mut arena = RecordArena::new();
        let first = arena.insert(
            CallbackKind::OpcodeRange,
            None,
            RecordFilter::None,
            Box::new(|_, _| {}),
        );
        let second = arena.insert(
            CallbackKind::OpcodeRange,
            None,
            RecordFilter::None,
            Box::new(|_, _| {}),
        );
        (first, second)
    }

    #[test]
    fn later_fill_wins() {
        let (first, second) = handles();
        let mut table = OpcodeTable::new();
        table.fill(0x10, 0x20, first);
        table.fill(0x18, 0x28, second);

        assert_eq!(table.get(0x10), Some(first));
        assert_eq!(table.get(0x17), Some(first));
        assert_eq!(table.get(0x18), Some(second));
        assert_eq!(table.get(0x20), Some(second));
        assert_eq!(table.get(0x28), Some(second));
        assert_eq!(table.get(0x29), None);
    }

    #[test]
    fn clear_only_owned_slots() {
        let (first, second) = handles();
        let mut table = OpcodeTable::new();
        table.fill(0x10, 0x20, first);
        table.fill(0x18, 0x28, second);

        assert_eq!(table.clear(0x10, 0x20, first), 8);
        assert_eq!(table.get(0x10), None);
        assert_eq!(table.get(0x18), Some(second));
    }

    #[test]
    fn two_byte_opcodes() {
        let (first, _) = handles();
        let mut table = OpcodeTable::new();
        table.fill(0x105, 0x105, first);

        assert_eq!(table.get(0x0F05), Some(first));
        assert_eq!(table.get(0x105), Some(first));
        assert_eq!(table.get(0x05), None);
    }
}
