//! The engine context.
//!
//! [`Engine`] owns the dispatcher, the taint store, the mark index and the host handle.
//! Everything the emulator and analysis code do goes through it, and every mutating
//! operation takes `&mut Engine`.
//!
//! # Safe points
//!
//! The host calls [`Engine::safe_point`] between translation blocks. It performs the
//! translation cache flushes that registration changes queued and, once enough taint
//! stores accumulated, runs a garbage collection sweep under a [`PauseGuard`].

mod invoke;
mod pause;

pub use pause::{MutationToken, PauseGuard};

use std::{fmt, ops::Range};

use tracing::info;

use crate::{
    dispatch::{
        BlockFilter, CallbackHandle, CallbackKind, CallbackParams, Dispatcher, EnableFlag,
        TransitionCondition,
    },
    host::{translate_with_page_directory, TranslationHost},
    marks::MarkIndex,
    taint::{AccessSize, GcReport, NicTaintBuffer, TaintPolicy, TaintStore, TaintUsage, TaintValue},
    EngineConfig, Error, Gpa, Gva, Result,
};

/// Guest page size used when walking virtual ranges.
const GUEST_PAGE_SIZE: u64 = 0x1000;

/// The instrumentation core.
///
/// # Example
///
/// ```rust
/// use vmscope::prelude::*;
///
/// let mut engine = Engine::new(EngineConfig::default(), NullHost)?;
/// engine.register(CallbackKind::InsnBegin, None, |engine, _| {
///     // Callbacks get the engine back and may use it freely
///     let _ = engine.check_mark(0x40_1000, 4);
/// })?;
///
/// engine.invoke_insn_begin(&Cpu(0x40_1000));
/// engine.shutdown();
///
/// struct Cpu(u32);
///
/// impl GuestCpu for Cpu {
///     fn pc(&self) -> u32 {
///         self.0
///     }
/// }
/// # Ok::<(), vmscope::Error>(())
/// ```
pub struct Engine {
    config: EngineConfig,
    host: Box<dyn TranslationHost>,
    dispatcher: Dispatcher,
    taint: TaintStore,
    marks: MarkIndex,
}

impl Engine {
    /// Creates an engine with no registrations and taint tracking disabled.
    ///
    /// No call is made into `host` until something needs it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` fails validation.
    pub fn new(config: EngineConfig, host: impl TranslationHost + 'static) -> Result<Self> {
        config.validate()?;
        info!(
            ram_size = config.taint.ram_size,
            page_bits = config.dispatch.page_bits,
            "instrumentation engine created"
        );

        Ok(Engine {
            dispatcher: Dispatcher::new(config.dispatch.clone()),
            taint: TaintStore::new(config.taint.clone()),
            marks: MarkIndex::new(),
            host: Box::new(host),
            config,
        })
    }

    /// Disables taint tracking and drops every registration and mark.
    pub fn shutdown(mut self) {
        self.pause_for_mutation().disable_taint();
        self.marks.clear();
        info!("instrumentation engine shut down");
    }

    /// The configuration the engine was built with.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Read access to the dispatcher, for introspection.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Pauses the guest until the returned guard is dropped.
    pub fn pause_for_mutation(&mut self) -> PauseGuard<'_> {
        PauseGuard::new(self)
    }

    /// Hands queued translation cache flushes to the host.
    ///
    /// # Returns
    ///
    /// Number of flushes performed.
    pub fn perform_pending_flushes(&mut self) -> usize {
        self.dispatcher.flushes_mut().perform(self.host.as_mut())
    }

    /// Performs queued flushes and a due garbage collection sweep.
    ///
    /// # Returns
    ///
    /// The sweep's report if one ran.
    ///
    /// # Errors
    ///
    /// Propagates sweep failures.
    pub fn safe_point(&mut self) -> Result<Option<GcReport>> {
        self.perform_pending_flushes();
        if !self.taint.gc_due() {
            return Ok(None);
        }

        let report = self.pause_for_mutation().collect_taint_garbage()?;
        Ok(Some(report))
    }

    /// Resolves `vaddr` under the page directory at `pgd` instead of the current one.
    pub fn translate_with_page_directory(&mut self, pgd: Gpa, vaddr: Gva) -> Option<Gpa> {
        translate_with_page_directory(self.host.as_mut(), pgd, vaddr)
    }

    // Registration

    /// Registers `callback` for every event of `kind`.
    ///
    /// `enabled`, if given, gates the callback without unregistering it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedFilter`] for [`CallbackKind::OpcodeRange`]; use
    /// [`Engine::register_opcode_range`].
    pub fn register<F>(
        &mut self,
        kind: CallbackKind,
        enabled: Option<EnableFlag>,
        callback: F,
    ) -> Result<CallbackHandle>
    where
        F: FnMut(&mut Engine, &CallbackParams<'_>) + Send + 'static,
    {
        self.dispatcher.register(kind, enabled, Box::new(callback))
    }

    /// Registers a block-begin callback narrowed by `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedFilter`] for negated filters.
    pub fn register_block_begin<F>(
        &mut self,
        filter: BlockFilter,
        enabled: Option<EnableFlag>,
        callback: F,
    ) -> Result<CallbackHandle>
    where
        F: FnMut(&mut Engine, &CallbackParams<'_>) + Send + 'static,
    {
        self.dispatcher
            .register_block_begin(filter, enabled, Box::new(callback))
    }

    /// Registers a block-end callback for transfers from page `from` to page `to`.
    ///
    /// `None` leaves that side unfiltered.
    pub fn register_block_end<F>(
        &mut self,
        from: Option<Gva>,
        to: Option<Gva>,
        enabled: Option<EnableFlag>,
        callback: F,
    ) -> Result<CallbackHandle>
    where
        F: FnMut(&mut Engine, &CallbackParams<'_>) + Send + 'static,
    {
        self.dispatcher
            .register_block_end(from, to, enabled, Box::new(callback))
    }

    /// Routes opcodes `start..=end` to `callback` for the transitions in `condition`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOpcodeRange`] for reversed or out-of-table ranges.
    pub fn register_opcode_range<F>(
        &mut self,
        start: u16,
        end: u16,
        condition: TransitionCondition,
        callback: F,
    ) -> Result<CallbackHandle>
    where
        F: FnMut(&mut Engine, &CallbackParams<'_>) + Send + 'static,
    {
        self.dispatcher
            .register_opcode_range(start, end, condition, Box::new(callback))
    }

    /// Removes a registration. Safe to call from inside any callback, including the one
    /// being removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StaleHandle`] or [`Error::InvalidHandle`] for handles that do not
    /// name a live registration.
    pub fn unregister(&mut self, handle: CallbackHandle) -> Result<()> {
        self.dispatcher.unregister(handle)
    }

    // Translation time queries

    /// See [`Dispatcher::is_callback_needed`].
    #[must_use]
    pub fn is_callback_needed(&self, kind: CallbackKind) -> bool {
        self.dispatcher.is_callback_needed(kind)
    }

    /// See [`Dispatcher::is_block_begin_needed`].
    #[must_use]
    pub fn is_block_begin_needed(&self, pc: Gva) -> bool {
        self.dispatcher.is_block_begin_needed(pc)
    }

    /// See [`Dispatcher::is_block_end_needed`].
    #[must_use]
    pub fn is_block_end_needed(&self, from: Gva, to: Option<Gva>) -> bool {
        self.dispatcher.is_block_end_needed(from, to)
    }

    /// See [`Dispatcher::is_callback_needed_for_opcode`].
    #[must_use]
    pub fn is_callback_needed_for_opcode(&self, opcode: u16) -> bool {
        self.dispatcher.is_callback_needed_for_opcode(opcode)
    }

    // Taint

    /// Enables taint tracking under a pause.
    ///
    /// # Returns
    ///
    /// `false` if tracking was already enabled.
    pub fn enable_taint(&mut self) -> bool {
        self.pause_for_mutation().enable_taint()
    }

    /// Disables taint tracking under a pause, discarding all taint.
    ///
    /// # Returns
    ///
    /// `false` if tracking was already disabled.
    pub fn disable_taint(&mut self) -> bool {
        self.pause_for_mutation().disable_taint()
    }

    /// Returns `true` while taint tracking is enabled.
    #[must_use]
    pub fn is_taint_enabled(&self) -> bool {
        self.taint.is_enabled()
    }

    /// The taint store.
    #[must_use]
    pub fn taint(&self) -> &TaintStore {
        &self.taint
    }

    /// Taint of a guest load, firing [`CallbackKind::ReadTaintMem`] if it is tainted.
    pub fn taint_load(&mut self, paddr: Gpa, vaddr: Gva, size: AccessSize) -> TaintValue {
        let value = self.taint.read(paddr, size);
        if !value.is_clean() {
            self.invoke_read_taint_mem(vaddr, paddr, value.bytes());
        }
        value
    }

    /// Records the taint of a guest store.
    ///
    /// Fires [`CallbackKind::WriteTaintMem`] if the taint state changed. When the store
    /// needed a new leaf, the TLB entry of `vaddr` (the whole TLB for `vaddr == 0`) is
    /// flushed so the fast path starts checking the page.
    ///
    /// # Returns
    ///
    /// `true` if the taint state changed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] if the tree could not grow.
    pub fn taint_store(
        &mut self,
        paddr: Gpa,
        vaddr: Gva,
        size: AccessSize,
        bits: u64,
    ) -> Result<bool> {
        let outcome = self.taint.write(paddr, size, bits)?;
        if outcome.allocated_leaf {
            self.host.flush_tlb((vaddr != 0).then_some(vaddr));
        }
        if outcome.changed {
            self.invoke_write_taint_mem(vaddr, paddr, outcome.value.bytes());
        }
        Ok(outcome.changed)
    }

    /// Sets the taint of `taint.len()` bytes of guest physical memory at `paddr`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaintDisabled`] while tracking is disabled and
    /// [`Error::PoolExhausted`] if the tree could not grow.
    pub fn taint_range(&mut self, paddr: Gpa, taint: &[u8]) -> Result<()> {
        let outcome = self.taint.taint_range(paddr, taint)?;
        if outcome.allocated_leaf {
            self.host.flush_tlb(None);
        }
        Ok(())
    }

    /// Reads the taint of `out.len()` bytes of guest physical memory at `paddr`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaintDisabled`] while tracking is disabled.
    pub fn check_taint_range(&self, paddr: Gpa, out: &mut [u8]) -> Result<()> {
        self.taint.check_range(paddr, out)
    }

    /// Splits `len` bytes at `vaddr` into physical chunks that do not cross a guest page.
    fn translate_range(&mut self, vaddr: Gva, len: usize) -> Result<Vec<(Gpa, Range<usize>)>> {
        let mut chunks = Vec::new();
        let mut done = 0;
        while done < len {
            let addr = u64::from(vaddr) + done as u64;
            let Ok(current) = Gva::try_from(addr) else {
                return Err(Error::TranslationFault(Gva::MAX));
            };
            let in_page = (GUEST_PAGE_SIZE - (addr % GUEST_PAGE_SIZE)) as usize;
            let take = in_page.min(len - done);

            let paddr = self
                .host
                .virt_to_phys(current)
                .ok_or(Error::TranslationFault(current))?;
            chunks.push((paddr, done..done + take));
            done += take;
        }
        Ok(chunks)
    }

    /// Sets the taint of `taint.len()` bytes of guest virtual memory at `vaddr`.
    ///
    /// Every page is translated before any taint is written.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TranslationFault`] if a page of the range is unmapped, plus the
    /// errors of [`Engine::taint_range`].
    pub fn taint_virtual_range(&mut self, vaddr: Gva, taint: &[u8]) -> Result<()> {
        if !self.taint.is_enabled() {
            return Err(Error::TaintDisabled);
        }
        for (paddr, range) in self.translate_range(vaddr, taint.len())? {
            self.taint_range(paddr, &taint[range])?;
        }
        Ok(())
    }

    /// Reads the taint of `out.len()` bytes of guest virtual memory at `vaddr`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TranslationFault`] if a page of the range is unmapped and
    /// [`Error::TaintDisabled`] while tracking is disabled.
    pub fn check_virtual_range(&mut self, vaddr: Gva, out: &mut [u8]) -> Result<()> {
        if !self.taint.is_enabled() {
            return Err(Error::TaintDisabled);
        }
        for (paddr, range) in self.translate_range(vaddr, out.len())? {
            self.taint.check_range(paddr, &mut out[range])?;
        }
        Ok(())
    }

    /// Runs a garbage collection sweep under a pause.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaintDisabled`] while tracking is disabled.
    pub fn collect_taint_garbage(&mut self) -> Result<GcReport> {
        self.pause_for_mutation().collect_taint_garbage()
    }

    /// Counts tainted bytes under a pause.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaintDisabled`] while tracking is disabled.
    pub fn tainted_bytes(&mut self) -> Result<u64> {
        self.pause_for_mutation().tainted_bytes()
    }

    /// Node accounting, or `None` while tracking is disabled.
    #[must_use]
    pub fn taint_usage(&self) -> Option<TaintUsage> {
        self.taint.usage()
    }

    /// Turns taint propagation through the NIC buffer on or off.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaintDisabled`] while tracking is disabled.
    pub fn set_nic_tainting(&mut self, enabled: bool) -> Result<()> {
        let mut policy = self.taint.policy();
        policy.set(TaintPolicy::NIC, enabled);
        self.pause_for_mutation().set_taint_policy(policy)
    }

    /// Turns pointer tainting for loads and stores on or off.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaintDisabled`] while tracking is disabled.
    pub fn set_pointer_tainting(&mut self, loads: bool, stores: bool) -> Result<()> {
        let mut policy = self.taint.policy();
        policy.set(TaintPolicy::LOAD_POINTERS, loads);
        policy.set(TaintPolicy::STORE_POINTERS, stores);
        self.pause_for_mutation().set_taint_policy(policy)
    }

    /// Taint shadow of the NIC packet buffer, for the NIC model.
    pub fn nic_taint_mut(&mut self) -> &mut NicTaintBuffer {
        self.taint.nic_mut()
    }

    // Marks

    /// See [`MarkIndex::set_mark`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::MarkSpanTooLarge`] for spans above 64 bytes.
    pub fn set_mark(&mut self, addr: Gva, size: usize, bitmap: u64) -> Result<()> {
        self.marks.set_mark(addr, size, bitmap)
    }

    /// See [`MarkIndex::check_mark`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::MarkSpanTooLarge`] for spans above 64 bytes.
    pub fn check_mark(&self, addr: Gva, size: usize) -> Result<u64> {
        self.marks.check_mark(addr, size)
    }

    /// The address mark index.
    #[must_use]
    pub fn marks(&self) -> &MarkIndex {
        &self.marks
    }

    /// The address mark index, mutably.
    pub fn marks_mut(&mut self) -> &mut MarkIndex {
        &mut self.marks
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("taint_enabled", &self.taint.is_enabled())
            .field("pending_flushes", &self.dispatcher.pending_flushes())
            .field("marked_pages", &self.marks.allocated_pages())
            .finish_non_exhaustive()
    }
}
