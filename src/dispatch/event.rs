use std::{cell::Cell, fmt};

use crate::{
    dispatch::{CallbackHandle, CallbackKind},
    taint::{AccessSize, TaintBytes},
    Gpa, Gva,
};

/// View of a virtual CPU handed to callbacks.
///
/// Implemented by the emulator's CPU state. The core only ever asks for the program
/// counter; analysis code downcasts through its own channels if it needs registers.
pub trait GuestCpu {
    /// Linear address of the next instruction (on x86, `eip` plus the CS base).
    fn pc(&self) -> Gva;

    /// Index of the virtual CPU.
    fn cpu_index(&self) -> usize {
        0
    }
}

/// A translation block as seen by block callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct BlockInfo {
    /// Linear address of the first instruction.
    pub pc: Gva,
    /// Size of the guest code in bytes.
    pub size: u32,
    /// Number of guest instructions.
    pub icount: u32,
}

impl BlockInfo {
    /// Describes a block at `pc`.
    #[must_use]
    pub fn new(pc: Gva, size: u32, icount: u32) -> Self {
        BlockInfo { pc, size, icount }
    }
}

/// One guest memory access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemAccess {
    /// Guest virtual address.
    pub vaddr: Gva,
    /// Guest physical address.
    pub paddr: Gpa,
    /// Value loaded or stored.
    pub value: u64,
    /// Access width.
    pub size: AccessSize,
}

/// One access to tainted memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaintAccess {
    /// Guest virtual address.
    pub vaddr: Gva,
    /// Guest physical address.
    pub paddr: Gpa,
    /// Taint of the accessed bytes, lowest address first.
    pub taint: TaintBytes,
}

/// Payload of one callback invocation, one variant per [`CallbackKind`].
#[derive(Clone, Copy)]
pub enum CallbackEvent<'a> {
    /// See [`CallbackKind::BlockBegin`].
    BlockBegin {
        /// Executing CPU
        cpu: &'a dyn GuestCpu,
        /// Block about to execute
        block: BlockInfo,
    },
    /// See [`CallbackKind::BlockEnd`].
    BlockEnd {
        /// Executing CPU
        cpu: &'a dyn GuestCpu,
        /// Block that finished
        block: BlockInfo,
        /// Address of the block's last instruction
        cur_pc: Gva,
        /// Address control transfers to
        next_pc: Gva,
    },
    /// See [`CallbackKind::InsnBegin`].
    InsnBegin {
        /// Executing CPU
        cpu: &'a dyn GuestCpu,
    },
    /// See [`CallbackKind::InsnEnd`].
    InsnEnd {
        /// Executing CPU
        cpu: &'a dyn GuestCpu,
    },
    /// See [`CallbackKind::MemRead`].
    MemRead(MemAccess),
    /// See [`CallbackKind::MemWrite`].
    MemWrite(MemAccess),
    /// See [`CallbackKind::EipCheck`].
    EipCheck {
        /// Address of the control transfer
        source: Gva,
        /// Target address
        target: Gva,
        /// Taint of the target address
        target_taint: u32,
    },
    /// See [`CallbackKind::Keystroke`].
    Keystroke {
        /// Scan code
        keycode: i32,
        /// Taint assigned to the key; callbacks set it to start tracking the input
        taint: &'a Cell<u32>,
    },
    /// See [`CallbackKind::NicReceive`].
    NicReceive {
        /// Packet contents
        packet: &'a [u8],
        /// Write position in the NIC ring buffer
        cur_pos: u32,
        /// Ring buffer start
        start: u32,
        /// Ring buffer end
        stop: u32,
    },
    /// See [`CallbackKind::NicSend`].
    NicSend {
        /// Offset of the packet in the NIC buffer
        addr: u32,
        /// Packet contents
        packet: &'a [u8],
    },
    /// See [`CallbackKind::OpcodeRange`].
    OpcodeRange {
        /// Executing CPU
        cpu: &'a dyn GuestCpu,
        /// Address of the instruction
        eip: Gva,
        /// Address of the following instruction or branch target
        next_eip: Gva,
        /// Compact opcode, `0x100 | byte` for two-byte opcodes
        opcode: u16,
    },
    /// See [`CallbackKind::TlbExec`].
    TlbExec {
        /// Executing CPU
        cpu: &'a dyn GuestCpu,
        /// Virtual address whose TLB entry was filled
        vaddr: Gva,
    },
    /// See [`CallbackKind::ReadTaintMem`].
    ReadTaintMem(TaintAccess),
    /// See [`CallbackKind::WriteTaintMem`].
    WriteTaintMem(TaintAccess),
}

impl CallbackEvent<'_> {
    /// Kind of the event.
    #[must_use]
    pub fn kind(&self) -> CallbackKind {
        match self {
            CallbackEvent::BlockBegin { .. } => CallbackKind::BlockBegin,
            CallbackEvent::BlockEnd { .. } => CallbackKind::BlockEnd,
            CallbackEvent::InsnBegin { .. } => CallbackKind::InsnBegin,
            CallbackEvent::InsnEnd { .. } => CallbackKind::InsnEnd,
            CallbackEvent::MemRead(_) => CallbackKind::MemRead,
            CallbackEvent::MemWrite(_) => CallbackKind::MemWrite,
            CallbackEvent::EipCheck { .. } => CallbackKind::EipCheck,
            CallbackEvent::Keystroke { .. } => CallbackKind::Keystroke,
            CallbackEvent::NicReceive { .. } => CallbackKind::NicReceive,
            CallbackEvent::NicSend { .. } => CallbackKind::NicSend,
            CallbackEvent::OpcodeRange { .. } => CallbackKind::OpcodeRange,
            CallbackEvent::TlbExec { .. } => CallbackKind::TlbExec,
            CallbackEvent::ReadTaintMem(_) => CallbackKind::ReadTaintMem,
            CallbackEvent::WriteTaintMem(_) => CallbackKind::WriteTaintMem,
        }
    }

    /// CPU that triggered the event, for kinds that carry one.
    #[must_use]
    pub fn cpu(&self) -> Option<&dyn GuestCpu> {
        match self {
            CallbackEvent::BlockBegin { cpu, .. }
            | CallbackEvent::BlockEnd { cpu, .. }
            | CallbackEvent::InsnBegin { cpu }
            | CallbackEvent::InsnEnd { cpu }
            | CallbackEvent::OpcodeRange { cpu, .. }
            | CallbackEvent::TlbExec { cpu, .. } => Some(*cpu),
            _ => None,
        }
    }
}

impl fmt::Debug for CallbackEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.kind().to_string();
        let mut out = f.debug_struct(&name);
        if let Some(cpu) = self.cpu() {
            out.field("cpu", &cpu.cpu_index()).field("pc", &cpu.pc());
        }
        match self {
            CallbackEvent::BlockBegin { block, .. } => out.field("block", block),
            CallbackEvent::BlockEnd {
                block,
                cur_pc,
                next_pc,
                ..
            } => out
                .field("block", block)
                .field("cur_pc", cur_pc)
                .field("next_pc", next_pc),
            CallbackEvent::MemRead(access) | CallbackEvent::MemWrite(access) => {
                out.field("access", access)
            }
            CallbackEvent::EipCheck {
                source,
                target,
                target_taint,
            } => out
                .field("source", source)
                .field("target", target)
                .field("target_taint", target_taint),
            CallbackEvent::Keystroke { keycode, taint } => {
                out.field("keycode", keycode).field("taint", &taint.get())
            }
            CallbackEvent::NicReceive { packet, .. } | CallbackEvent::NicSend { packet, .. } => {
                out.field("len", &packet.len())
            }
            CallbackEvent::OpcodeRange {
                eip,
                next_eip,
                opcode,
                ..
            } => out
                .field("eip", eip)
                .field("next_eip", next_eip)
                .field("opcode", opcode),
            CallbackEvent::TlbExec { vaddr, .. } => out.field("vaddr", vaddr),
            CallbackEvent::ReadTaintMem(access) | CallbackEvent::WriteTaintMem(access) => {
                out.field("access", access)
            }
            CallbackEvent::InsnBegin { .. } | CallbackEvent::InsnEnd { .. } => &mut out,
        };
        out.finish()
    }
}

/// Everything a callback receives besides the engine.
#[derive(Clone, Copy, Debug)]
pub struct CallbackParams<'a> {
    /// Registration being invoked; a callback may pass it to
    /// [`crate::Engine::unregister`] to remove itself.
    pub handle: CallbackHandle,
    /// Event payload.
    pub event: CallbackEvent<'a>,
}
