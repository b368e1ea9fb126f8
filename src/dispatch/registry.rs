//! Arena of callback records with per-kind registration lists.
//!
//! Records live in slots addressed by index. Every removal bumps the slot's generation, so
//! a [`CallbackHandle`] stays tied to the one registration that produced it: a handle
//! kept after unregistering can never reach a later record that reused the slot.

use std::fmt;

use strum::EnumCount;

use crate::{
    dispatch::{BlockFilter, CallbackKind, CallbackParams, EnableFlag, TransitionCondition},
    Engine, Error, Gva, Result,
};

/// Analysis function invoked by the dispatcher.
///
/// Receives the engine, so it can query or mutate taint, marks and registrations
/// (including unregistering itself) while it runs.
pub type Callback = Box<dyn FnMut(&mut Engine, &CallbackParams<'_>) + Send>;

/// Identity of one registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallbackHandle {
    kind: CallbackKind,
    index: u32,
    generation: u32,
}

impl CallbackHandle {
    /// Event kind the handle was registered for.
    #[must_use]
    pub fn kind(&self) -> CallbackKind {
        self.kind
    }
}

impl fmt::Display for CallbackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}.{}", self.kind, self.index, self.generation)
    }
}

/// Address filter stored with a record.
///
/// Page filters hold page-aligned addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RecordFilter {
    None,
    BlockBegin(BlockFilter),
    BlockEnd {
        from: Option<Gva>,
        to: Option<Gva>,
    },
    Opcode {
        start: u16,
        end: u16,
        condition: TransitionCondition,
    },
}

pub(crate) struct Record {
    pub(crate) enabled: Option<EnableFlag>,
    pub(crate) filter: RecordFilter,
    // Taken out while the callback runs
    pub(crate) callback: Option<Callback>,
}

impl Record {
    fn is_enabled(&self) -> bool {
        self.enabled.as_ref().is_none_or(EnableFlag::is_enabled)
    }
}

struct Slot {
    generation: u32,
    kind: CallbackKind,
    record: Option<Record>,
}

pub(crate) struct RecordArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    // Registration order; dispatch walks these back to front
    lists: [Vec<CallbackHandle>; CallbackKind::COUNT],
}

impl RecordArena {
    pub(crate) fn new() -> Self {
        RecordArena {
            slots: Vec::new(),
            free: Vec::new(),
            lists: std::array::from_fn(|_| Vec::new()),
        }
    }

    pub(crate) fn insert(
        &mut self,
        kind: CallbackKind,
        enabled: Option<EnableFlag>,
        filter: RecordFilter,
        callback: Callback,
    ) -> CallbackHandle {
        let record = Record {
            enabled,
            filter,
            callback: Some(callback),
        };

        let index = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.kind = kind;
                slot.record = Some(record);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    kind,
                    record: Some(record),
                });
                (self.slots.len() - 1) as u32
            }
        };

        let handle = CallbackHandle {
            kind,
            index,
            generation: self.slots[index as usize].generation,
        };
        self.lists[kind.index()].push(handle);
        handle
    }

    fn slot(&self, handle: CallbackHandle) -> Result<&Slot> {
        let slot = self
            .slots
            .get(handle.index as usize)
            .ok_or(Error::InvalidHandle(handle))?;
        if slot.generation != handle.generation || slot.record.is_none() {
            return Err(Error::StaleHandle(handle));
        }
        if slot.kind != handle.kind {
            return Err(Error::InvalidHandle(handle));
        }
        Ok(slot)
    }

    #[cfg(test)]
    pub(crate) fn get(&self, handle: CallbackHandle) -> Result<&Record> {
        self.slot(handle)?
            .record
            .as_ref()
            .ok_or(Error::StaleHandle(handle))
    }

    fn live_mut(&mut self, handle: CallbackHandle) -> Option<&mut Record> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation || slot.kind != handle.kind {
            return None;
        }
        slot.record.as_mut()
    }

    pub(crate) fn remove(&mut self, handle: CallbackHandle) -> Result<Record> {
        self.slot(handle)?;

        let slot = &mut self.slots[handle.index as usize];
        let record = slot.record.take().ok_or(Error::StaleHandle(handle))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.lists[handle.kind.index()].retain(|live| *live != handle);
        Ok(record)
    }

    pub(crate) fn len(&self, kind: CallbackKind) -> usize {
        self.lists[kind.index()].len()
    }

    /// Live handles of `kind`, most recent registration first.
    pub(crate) fn snapshot(&self, kind: CallbackKind) -> Vec<CallbackHandle> {
        self.lists[kind.index()].iter().rev().copied().collect()
    }

    /// Takes the callback of a live, enabled record whose filter satisfies `matches`.
    ///
    /// Returns `None` for records removed since the snapshot was taken, disabled records,
    /// filtered-out records, and records whose callback is already running further up
    /// the stack.
    pub(crate) fn begin_call(
        &mut self,
        handle: CallbackHandle,
        matches: impl FnOnce(&RecordFilter) -> bool,
    ) -> Option<Callback> {
        let record = self.live_mut(handle)?;
        if !record.is_enabled() || !matches(&record.filter) {
            return None;
        }
        record.callback.take()
    }

    /// Puts a callback back after it ran; drops it if its record went away meanwhile.
    pub(crate) fn end_call(&mut self, handle: CallbackHandle, callback: Callback) {
        if let Some(record) = self.live_mut(handle) {
            if record.callback.is_none() {
                record.callback = Some(callback);
            }
        }
    }
}
