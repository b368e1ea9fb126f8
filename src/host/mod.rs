//! The contract between the instrumentation core and the translation engine.
//!
//! The core never owns the CPU emulator. It calls back into it through
//! [`TranslationHost`] to invalidate translated code, to pause and resume the guest around
//! structural mutations, and to read guest physical memory. Everything the emulator calls
//! *into* lives on [`crate::Engine`].
//!
//! # Flushing
//!
//! Registration changes do not flush immediately. They queue a [`FlushScope`] in a
//! [`FlushQueue`] that the host drains through [`crate::Engine::perform_pending_flushes`]
//! right before it looks up the next translation block, the only point where dropping
//! translated code is safe.
//!
//! # Example
//!
//! ```rust
//! use vmscope::host::{FlushScope, HostEvent, RecordingHost};
//! use vmscope::prelude::*;
//!
//! let host = RecordingHost::new();
//! let mut engine = Engine::new(EngineConfig::default(), host.clone())?;
//!
//! engine.register_block_begin(BlockFilter::All, None, |_, _| {})?;
//! assert!(host.events().is_empty());
//!
//! engine.perform_pending_flushes();
//! assert_eq!(host.events(), vec![HostEvent::Flush(FlushScope::All)]);
//! # Ok::<(), vmscope::Error>(())
//! ```

mod flush;
mod pagewalk;

pub use flush::FlushQueue;
pub use pagewalk::translate_with_page_directory;

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use crate::{Gpa, Gva};

/// Granularity of a translation cache flush.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FlushScope {
    /// Every translated block.
    All,
    /// Every block whose code lies in the page containing the address.
    Page(Gva),
    /// The single block starting at the address.
    Block(Gva),
}

impl fmt::Display for FlushScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlushScope::All => write!(f, "all"),
            FlushScope::Page(addr) => write!(f, "page {addr:#x}"),
            FlushScope::Block(addr) => write!(f, "block {addr:#x}"),
        }
    }
}

/// Operations the instrumentation core needs from the emulator.
///
/// Implementations must be cheap to call; `stop_vm`/`start_vm` are issued in strict pairs
/// by [`crate::PauseGuard`].
pub trait TranslationHost: Send {
    /// Invalidates translated code so it is regenerated with current instrumentation.
    fn flush_translation_cache(&mut self, scope: FlushScope);

    /// Pauses guest execution.
    fn stop_vm(&mut self);

    /// Resumes guest execution.
    fn start_vm(&mut self);

    /// Reads a 32-bit little-endian word of guest physical memory.
    ///
    /// The default reads zero, which makes every page table walk fail.
    fn read_physical_memory(&mut self, _paddr: Gpa) -> u32 {
        0
    }

    /// Flushes the softmmu TLB entry for `vaddr`, or the whole TLB for `None`.
    ///
    /// Called when a store allocates a new taint leaf so that the fast path stops
    /// treating the page as untainted.
    fn flush_tlb(&mut self, _vaddr: Option<Gva>) {}

    /// Translates a guest virtual address under the current page directory.
    fn virt_to_phys(&mut self, _vaddr: Gva) -> Option<Gpa> {
        None
    }
}

/// Host that ignores every request.
///
/// Useful when the core runs detached from an emulator, e.g. in unit tests or offline
/// replay of recorded events.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullHost;

impl TranslationHost for NullHost {
    fn flush_translation_cache(&mut self, _scope: FlushScope) {}

    fn stop_vm(&mut self) {}

    fn start_vm(&mut self) {}
}

/// One call the core made into a [`RecordingHost`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostEvent {
    /// `flush_translation_cache`
    Flush(FlushScope),
    /// `stop_vm`
    StopVm,
    /// `start_vm`
    StartVm,
    /// `flush_tlb`
    FlushTlb(Option<Gva>),
}

#[derive(Debug, Default)]
struct RecordingState {
    events: Vec<HostEvent>,
    physical: HashMap<Gpa, u32>,
    mappings: HashMap<Gva, Gpa>,
}

/// Host that records every call and serves memory and mappings from tables.
///
/// Clones share their state, so a test keeps one clone and hands the other to the engine.
#[derive(Clone, Debug, Default)]
pub struct RecordingHost {
    state: Arc<Mutex<RecordingState>>,
}

impl RecordingHost {
    /// Creates an empty recording host.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut RecordingState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Every call recorded so far, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<HostEvent> {
        self.with_state(|state| state.events.clone())
    }

    /// Only the translation cache flushes recorded so far.
    #[must_use]
    pub fn flushes(&self) -> Vec<FlushScope> {
        self.with_state(|state| {
            state
                .events
                .iter()
                .filter_map(|event| match event {
                    HostEvent::Flush(scope) => Some(*scope),
                    _ => None,
                })
                .collect()
        })
    }

    /// Forgets all recorded calls.
    pub fn clear(&self) {
        self.with_state(|state| state.events.clear());
    }

    /// Stores a word of guest physical memory served by `read_physical_memory`.
    pub fn write_physical(&self, paddr: Gpa, value: u32) {
        self.with_state(|state| {
            state.physical.insert(paddr, value);
        });
    }

    /// Maps the 4 KiB virtual page containing `vaddr` to the physical page of `paddr`.
    pub fn map_page(&self, vaddr: Gva, paddr: Gpa) {
        self.with_state(|state| {
            state.mappings.insert(vaddr & !0xFFF, paddr & !0xFFF);
        });
    }
}

impl TranslationHost for RecordingHost {
    fn flush_translation_cache(&mut self, scope: FlushScope) {
        self.with_state(|state| state.events.push(HostEvent::Flush(scope)));
    }

    fn stop_vm(&mut self) {
        self.with_state(|state| state.events.push(HostEvent::StopVm));
    }

    fn start_vm(&mut self) {
        self.with_state(|state| state.events.push(HostEvent::StartVm));
    }

    fn read_physical_memory(&mut self, paddr: Gpa) -> u32 {
        self.with_state(|state| state.physical.get(&paddr).copied().unwrap_or(0))
    }

    fn flush_tlb(&mut self, vaddr: Option<Gva>) {
        self.with_state(|state| state.events.push(HostEvent::FlushTlb(vaddr)));
    }

    fn virt_to_phys(&mut self, vaddr: Gva) -> Option<Gpa> {
        self.with_state(|state| {
            state
                .mappings
                .get(&(vaddr & !0xFFF))
                .map(|page| page | (vaddr & 0xFFF))
        })
    }
}
