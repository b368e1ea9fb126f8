use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use bitflags::bitflags;
use strum::{Display, EnumCount, EnumIter};

use crate::Gva;

/// Event kinds analysis code can subscribe to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter, EnumCount)]
pub enum CallbackKind {
    /// Before a translation block executes.
    BlockBegin,
    /// After a translation block executed, before control reaches the next one.
    BlockEnd,
    /// Before every guest instruction.
    InsnBegin,
    /// After every guest instruction.
    InsnEnd,
    /// Guest memory load.
    MemRead,
    /// Guest memory store.
    MemWrite,
    /// Indirect control transfer, for checking tainted jump targets.
    EipCheck,
    /// Keyboard input reaching the guest.
    Keystroke,
    /// Packet received by the guest NIC.
    NicReceive,
    /// Packet sent by the guest NIC.
    NicSend,
    /// Instruction inside a registered opcode range.
    OpcodeRange,
    /// Instruction fetch filled a TLB entry.
    TlbExec,
    /// Load of tainted memory.
    ReadTaintMem,
    /// Store that changed memory taint.
    WriteTaintMem,
}

impl CallbackKind {
    /// Position of the kind in per-kind tables.
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Returns `true` if the translator decides at code generation time whether to emit
    /// calls for this kind.
    ///
    /// The first registration of such a kind has to flush the translation cache; code
    /// generated before it carries no calls into the dispatcher.
    #[must_use]
    pub fn affects_translation(self) -> bool {
        matches!(
            self,
            CallbackKind::BlockBegin
                | CallbackKind::BlockEnd
                | CallbackKind::InsnBegin
                | CallbackKind::InsnEnd
                | CallbackKind::MemRead
                | CallbackKind::MemWrite
                | CallbackKind::EipCheck
                | CallbackKind::OpcodeRange
        )
    }
}

/// Address filter of a block-begin registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlockFilter {
    /// Every block.
    All,
    /// The block starting exactly at the address.
    ///
    /// With the default [`crate::DispatchConfig`] this is upgraded to [`BlockFilter::All`]
    /// at registration: it instruments and fires for every block. Set
    /// [`crate::DispatchConfig::exact_block_filters`] to get exact matching.
    Const(Gva),
    /// Every block starting in the page containing the address.
    Page(Gva),
    /// Every block except the one at the address. Not implemented.
    ConstNot(Gva),
    /// Every block outside the page containing the address. Not implemented.
    PageNot(Gva),
}

bitflags! {
    /// Privilege transitions an opcode-range callback fires for.
    ///
    /// The empty set means "every transition". Addresses above
    /// [`crate::DispatchConfig::kernel_base`] count as kernel space.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct TransitionCondition: u8 {
        /// From user space into user space.
        const USER_TO_USER = 1 << 0;
        /// From user space into the kernel.
        const USER_TO_KERNEL = 1 << 1;
        /// From the kernel back to user space.
        const KERNEL_TO_USER = 1 << 2;
        /// From the kernel into the kernel.
        const KERNEL_TO_KERNEL = 1 << 3;
    }
}

impl TransitionCondition {
    /// Classifies the transition from `eip` to `next_eip`.
    #[must_use]
    pub fn classify(eip: Gva, next_eip: Gva, kernel_base: Gva) -> Self {
        match (eip > kernel_base, next_eip > kernel_base) {
            (false, false) => TransitionCondition::USER_TO_USER,
            (false, true) => TransitionCondition::USER_TO_KERNEL,
            (true, false) => TransitionCondition::KERNEL_TO_USER,
            (true, true) => TransitionCondition::KERNEL_TO_KERNEL,
        }
    }

    /// Returns `true` if a callback registered with `self` fires for `observed`.
    #[must_use]
    pub fn admits(self, observed: TransitionCondition) -> bool {
        self.is_empty() || self.intersects(observed)
    }
}

/// Switch owned by analysis code that gates a registration without unregistering it.
///
/// Clones share the same switch.
///
/// # Example
///
/// ```rust
/// use vmscope::dispatch::EnableFlag;
///
/// let flag = EnableFlag::new(true);
/// let registered = flag.clone();
/// flag.set(false);
/// assert!(!registered.is_enabled());
/// ```
#[derive(Clone, Debug, Default)]
pub struct EnableFlag(Arc<AtomicBool>);

impl EnableFlag {
    /// Creates a switch in the given state.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        EnableFlag(Arc::new(AtomicBool::new(enabled)))
    }

    /// Flips the switch.
    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::Relaxed);
    }

    /// Current state of the switch.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
