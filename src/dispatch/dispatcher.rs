use tracing::{debug, warn};

use crate::{
    dispatch::{
        filter::FilterIndex,
        opcode::{normalize_opcode, OpcodeTable, OPCODE_TABLE_SIZE},
        registry::{Callback, RecordArena, RecordFilter},
        BlockFilter, CallbackHandle, CallbackKind, EnableFlag, TransitionCondition,
    },
    host::{FlushQueue, FlushScope},
    DispatchConfig, Error, Gva, Result,
};

/// Callback registries, filter index and opcode table.
///
/// The dispatcher never talks to the host directly. Registration changes that make
/// translated code stale queue a [`FlushScope`]; [`crate::Engine::perform_pending_flushes`]
/// hands them to the host at the next safe point.
pub struct Dispatcher {
    config: DispatchConfig,
    arena: RecordArena,
    filters: FilterIndex,
    opcodes: OpcodeTable,
    flushes: FlushQueue,
}

impl Dispatcher {
    /// Creates a dispatcher without registrations.
    #[must_use]
    pub fn new(config: DispatchConfig) -> Self {
        Dispatcher {
            config,
            arena: RecordArena::new(),
            filters: FilterIndex::default(),
            opcodes: OpcodeTable::new(),
            flushes: FlushQueue::new(),
        }
    }

    /// The configuration in effect.
    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    fn page(&self, addr: Gva) -> Gva {
        addr & self.config.page_mask()
    }

    /// Registers `callback` for `kind` without an address filter.
    ///
    /// Block kinds register with [`BlockFilter::All`] and an unfiltered block end. The
    /// first registration of any other translation-affecting kind queues a full flush.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedFilter`] for [`CallbackKind::OpcodeRange`], which needs
    /// [`Dispatcher::register_opcode_range`].
    pub fn register(
        &mut self,
        kind: CallbackKind,
        enabled: Option<EnableFlag>,
        callback: Callback,
    ) -> Result<CallbackHandle> {
        match kind {
            CallbackKind::BlockBegin => {
                return self.register_block_begin(BlockFilter::All, enabled, callback)
            }
            CallbackKind::BlockEnd => return self.register_block_end(None, None, enabled, callback),
            CallbackKind::OpcodeRange => {
                return Err(Error::UnsupportedFilter(
                    "opcode range callbacks need an opcode range",
                ))
            }
            _ => {}
        }

        if kind.affects_translation() && self.arena.len(kind) == 0 {
            self.flushes.push(FlushScope::All);
        }

        let handle = self
            .arena
            .insert(kind, enabled, RecordFilter::None, callback);
        debug!(%handle, "registered callback");
        Ok(handle)
    }

    /// Registers a block-begin callback restricted by `filter`.
    ///
    /// With [`DispatchConfig::exact_block_filters`] off, [`BlockFilter::Const`] is
    /// registered as [`BlockFilter::All`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedFilter`] for the negated filter classes.
    pub fn register_block_begin(
        &mut self,
        filter: BlockFilter,
        enabled: Option<EnableFlag>,
        callback: Callback,
    ) -> Result<CallbackHandle> {
        let stored = match filter {
            BlockFilter::All => {
                self.add_block_begin_all();
                BlockFilter::All
            }
            BlockFilter::Const(addr) if !self.config.exact_block_filters => {
                warn!(
                    addr = format_args!("{addr:#x}"),
                    "exact block filter registered as an unfiltered one"
                );
                self.add_block_begin_all();
                BlockFilter::All
            }
            BlockFilter::Const(addr) => {
                if self.filters.block_begin_exact.add(addr) == 1 {
                    self.flushes.push(FlushScope::Block(addr));
                }
                BlockFilter::Const(addr)
            }
            BlockFilter::Page(addr) => {
                let page = self.page(addr);
                if self.filters.block_begin_pages.add(page) == 1 {
                    self.flushes.push(FlushScope::Page(page));
                }
                BlockFilter::Page(page)
            }
            BlockFilter::ConstNot(_) => {
                return Err(Error::UnsupportedFilter("negated constant block filter"))
            }
            BlockFilter::PageNot(_) => {
                return Err(Error::UnsupportedFilter("negated page block filter"))
            }
        };

        let handle = self.arena.insert(
            CallbackKind::BlockBegin,
            enabled,
            RecordFilter::BlockBegin(stored),
            callback,
        );
        debug!(%handle, filter = ?stored, "registered block begin callback");
        Ok(handle)
    }

    fn add_block_begin_all(&mut self) {
        self.filters.block_begin_all += 1;
        if self.filters.block_begin_all == 1 {
            self.flushes.push(FlushScope::All);
        }
    }

    /// Registers a block-end callback for blocks ending in page `from` and continuing in
    /// page `to`. `None` leaves that side unfiltered.
    ///
    /// A new `to`-only filter queues a full flush: any block anywhere may branch into the
    /// target page.
    pub fn register_block_end(
        &mut self,
        from: Option<Gva>,
        to: Option<Gva>,
        enabled: Option<EnableFlag>,
        callback: Callback,
    ) -> Result<CallbackHandle> {
        let from = from.map(|addr| self.page(addr));
        let to = to.map(|addr| self.page(addr));

        match (from, to) {
            (None, None) => {
                self.filters.block_end_all += 1;
                if self.filters.block_end_all == 1 {
                    self.flushes.push(FlushScope::All);
                }
            }
            (Some(from), None) => {
                if self.filters.block_end_from.add(from) == 1 {
                    self.flushes.push(FlushScope::Page(from));
                }
            }
            (None, Some(to)) => {
                if self.filters.block_end_to.add(to) == 1 {
                    self.flushes.push(FlushScope::All);
                }
            }
            (Some(from), Some(to)) => {
                if self.filters.block_end_pairs.add(from, to) == 1 {
                    self.flushes.push(FlushScope::Page(from));
                }
            }
        }

        let handle = self.arena.insert(
            CallbackKind::BlockEnd,
            enabled,
            RecordFilter::BlockEnd { from, to },
            callback,
        );
        debug!(%handle, ?from, ?to, "registered block end callback");
        Ok(handle)
    }

    /// Routes opcodes `start..=end` to `callback`, taking over slots of earlier ranges.
    ///
    /// Two-byte opcodes may be given as `0x0Fxx` or `0x1xx`. Always queues a full flush.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOpcodeRange`] if `end < start` or either end lies outside
    /// the table. Nothing is registered then.
    pub fn register_opcode_range(
        &mut self,
        start: u16,
        end: u16,
        condition: TransitionCondition,
        callback: Callback,
    ) -> Result<CallbackHandle> {
        let invalid = Error::InvalidOpcodeRange { start, end };
        if end < start {
            return Err(invalid);
        }

        let (first, last) = (normalize_opcode(start), normalize_opcode(end));
        if first > last || usize::from(last) >= OPCODE_TABLE_SIZE {
            return Err(invalid);
        }

        let handle = self.arena.insert(
            CallbackKind::OpcodeRange,
            None,
            RecordFilter::Opcode {
                start: first,
                end: last,
                condition,
            },
            callback,
        );
        self.opcodes.fill(first, last, handle);
        self.flushes.push(FlushScope::All);
        debug!(
            %handle,
            start = format_args!("{first:#x}"),
            end = format_args!("{last:#x}"),
            "registered opcode range callback"
        );
        Ok(handle)
    }

    /// Removes a registration and releases its filter references.
    ///
    /// Queues the flush matching the filter whose last reference went away, except for
    /// exact block filters unless [`DispatchConfig::flush_on_exact_filter_removal`] is set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StaleHandle`] if the handle was already unregistered and
    /// [`Error::InvalidHandle`] if it was never issued by this dispatcher.
    pub fn unregister(&mut self, handle: CallbackHandle) -> Result<()> {
        let record = self.arena.remove(handle)?;

        match record.filter {
            RecordFilter::BlockBegin(BlockFilter::Const(addr)) => {
                if self.filters.block_begin_exact.remove(addr) == Some(0)
                    && self.config.flush_on_exact_filter_removal
                {
                    self.flushes.push(FlushScope::Block(addr));
                }
            }
            RecordFilter::BlockBegin(BlockFilter::Page(page)) => {
                if self.filters.block_begin_pages.remove(page) == Some(0) {
                    self.flushes.push(FlushScope::Page(page));
                }
            }
            RecordFilter::BlockBegin(_) => {
                if release(&mut self.filters.block_begin_all) {
                    self.flushes.push(FlushScope::All);
                }
            }
            RecordFilter::BlockEnd { from, to } => match (from, to) {
                (None, None) => {
                    if release(&mut self.filters.block_end_all) {
                        self.flushes.push(FlushScope::All);
                    }
                }
                (Some(from), None) => {
                    if self.filters.block_end_from.remove(from) == Some(0) {
                        self.flushes.push(FlushScope::Page(from));
                    }
                }
                (None, Some(to)) => {
                    if self.filters.block_end_to.remove(to) == Some(0) {
                        self.flushes.push(FlushScope::All);
                    }
                }
                (Some(from), Some(to)) => {
                    if self.filters.block_end_pairs.remove(from, to) == Some(0) {
                        self.flushes.push(FlushScope::Page(from));
                    }
                }
            },
            RecordFilter::Opcode { start, end, .. } => {
                self.opcodes.clear(start, end, handle);
            }
            RecordFilter::None => {
                if handle.kind() == CallbackKind::TlbExec
                    && self.arena.len(CallbackKind::TlbExec) == 0
                {
                    self.flushes.push(FlushScope::All);
                }
            }
        }

        debug!(%handle, "unregistered callback");
        Ok(())
    }

    /// Returns `true` if at least one callback of `kind` is registered.
    #[must_use]
    pub fn is_callback_needed(&self, kind: CallbackKind) -> bool {
        self.arena.len(kind) > 0
    }

    /// Returns `true` if the block starting at `pc` must call the block-begin dispatcher.
    #[must_use]
    pub fn is_block_begin_needed(&self, pc: Gva) -> bool {
        self.filters.block_begin_all > 0
            || self.filters.block_begin_pages.contains(self.page(pc))
            || self.filters.block_begin_exact.contains(pc)
    }

    /// Returns `true` if a block ending at `from` and continuing at `to` must call the
    /// block-end dispatcher.
    ///
    /// `to` is `None` when the target is unknown at translation time; only unfiltered and
    /// `from`-only registrations can match then.
    #[must_use]
    pub fn is_block_end_needed(&self, from: Gva, to: Option<Gva>) -> bool {
        if self.filters.block_end_all > 0 {
            return true;
        }

        let from = self.page(from);
        if self.filters.block_end_from.contains(from) {
            return true;
        }

        let Some(to) = to else {
            return false;
        };
        let to = self.page(to);
        self.filters.block_end_to.contains(to) || self.filters.block_end_pairs.contains(from, to)
    }

    /// Returns `true` if instructions with `opcode` must call the opcode-range dispatcher.
    #[must_use]
    pub fn is_callback_needed_for_opcode(&self, opcode: u16) -> bool {
        self.opcodes.get(opcode).is_some()
    }

    /// Number of live registrations of `kind`.
    #[must_use]
    pub fn registered(&self, kind: CallbackKind) -> usize {
        self.arena.len(kind)
    }

    /// Read access to the filter reference counts.
    #[must_use]
    pub fn filter_index(&self) -> &FilterIndex {
        &self.filters
    }

    /// Flushes queued and not yet performed.
    #[must_use]
    pub fn pending_flushes(&self) -> Vec<FlushScope> {
        self.flushes.pending()
    }

    pub(crate) fn flushes_mut(&mut self) -> &mut FlushQueue {
        &mut self.flushes
    }

    /// Live handles of `kind`, most recent registration first.
    pub(crate) fn snapshot(&self, kind: CallbackKind) -> Vec<CallbackHandle> {
        self.arena.snapshot(kind)
    }

    /// Takes the callback of `handle` out of its record if the record is live, enabled
    /// and its filter satisfies `matches`.
    pub(crate) fn begin_call(
        &mut self,
        handle: CallbackHandle,
        matches: impl FnOnce(&DispatchConfig, &RecordFilter) -> bool,
    ) -> Option<Callback> {
        let config = &self.config;
        self.arena
            .begin_call(handle, |filter| matches(config, filter))
    }

    pub(crate) fn end_call(&mut self, handle: CallbackHandle, callback: Callback) {
        self.arena.end_call(handle, callback);
    }

    pub(crate) fn opcode_slot(&self, opcode: u16) -> Option<CallbackHandle> {
        self.opcodes.get(opcode)
    }
}

/// Does a block-begin record with `filter` fire for a block at `pc`?
pub(crate) fn block_begin_matches(config: &DispatchConfig, filter: &RecordFilter, pc: Gva) -> bool {
    match filter {
        RecordFilter::BlockBegin(BlockFilter::Const(addr)) => pc == *addr,
        RecordFilter::BlockBegin(BlockFilter::Page(page)) => pc & config.page_mask() == *page,
        RecordFilter::BlockBegin(_) | RecordFilter::None => true,
        _ => false,
    }
}

/// Does a block-end record with `filter` fire for a transfer from `cur_pc` to `next_pc`?
pub(crate) fn block_end_matches(
    config: &DispatchConfig,
    filter: &RecordFilter,
    cur_pc: Gva,
    next_pc: Gva,
) -> bool {
    let mask = config.page_mask();
    match filter {
        RecordFilter::BlockEnd { from, to } => {
            from.is_none_or(|page| cur_pc & mask == page)
                && to.is_none_or(|page| next_pc & mask == page)
        }
        RecordFilter::None => true,
        _ => false,
    }
}

/// Does an opcode record with `filter` fire for the transfer from `eip` to `next_eip`?
pub(crate) fn opcode_matches(
    config: &DispatchConfig,
    filter: &RecordFilter,
    eip: Gva,
    next_eip: Gva,
) -> bool {
    match filter {
        RecordFilter::Opcode { condition, .. } => condition.admits(TransitionCondition::classify(
            eip,
            next_eip,
            config.kernel_base,
        )),
        _ => false,
    }
}

/// Drops one reference from an enable-all counter; `true` on the transition to zero.
fn release(counter: &mut usize) -> bool {
    if *counter == 0 {
        return false;
    }
    *counter -= 1;
    *counter == 0
}
