//! Run-time entry points called from translated code.
//!
//! Each entry point builds the [`CallbackEvent`] of its kind and walks the registrations
//! of that kind, most recent first, over a snapshot of their handles. A callback may
//! register or unregister anything, itself included: records removed during the walk are
//! skipped, records added during the walk first fire on the next event.

use std::cell::Cell;

use crate::{
    dispatch::{
        dispatcher::{block_begin_matches, block_end_matches, opcode_matches},
        normalize_opcode,
        registry::RecordFilter,
        BlockInfo, CallbackEvent, CallbackHandle, CallbackParams, GuestCpu, MemAccess,
        TaintAccess,
    },
    taint::{AccessSize, TaintBytes},
    DispatchConfig, Engine, Gpa, Gva,
};

impl Engine {
    fn call(
        &mut self,
        handle: CallbackHandle,
        event: CallbackEvent<'_>,
        matches: impl FnOnce(&DispatchConfig, &RecordFilter) -> bool,
    ) {
        let Some(mut callback) = self.dispatcher.begin_call(handle, matches) else {
            return;
        };
        callback(self, &CallbackParams { handle, event });
        self.dispatcher.end_call(handle, callback);
    }

    fn dispatch(
        &mut self,
        event: CallbackEvent<'_>,
        matches: impl Fn(&DispatchConfig, &RecordFilter) -> bool,
    ) {
        let kind = event.kind();
        if !self.dispatcher.is_callback_needed(kind) {
            return;
        }
        for handle in self.dispatcher.snapshot(kind) {
            self.call(handle, event, &matches);
        }
    }

    /// A translation block is about to execute.
    pub fn invoke_block_begin(&mut self, cpu: &dyn GuestCpu, block: BlockInfo) {
        self.dispatch(CallbackEvent::BlockBegin { cpu, block }, |config, filter| {
            block_begin_matches(config, filter, block.pc)
        });
    }

    /// A translation block finished; its last instruction is at `cur_pc` and control
    /// continues at `cpu.pc()`.
    pub fn invoke_block_end(&mut self, cpu: &dyn GuestCpu, block: BlockInfo, cur_pc: Gva) {
        let next_pc = cpu.pc();
        let event = CallbackEvent::BlockEnd {
            cpu,
            block,
            cur_pc,
            next_pc,
        };
        self.dispatch(event, |config, filter| {
            block_end_matches(config, filter, cur_pc, next_pc)
        });
    }

    /// A guest instruction is about to execute.
    pub fn invoke_insn_begin(&mut self, cpu: &dyn GuestCpu) {
        self.dispatch(CallbackEvent::InsnBegin { cpu }, |_, _| true);
    }

    /// A guest instruction finished.
    pub fn invoke_insn_end(&mut self, cpu: &dyn GuestCpu) {
        self.dispatch(CallbackEvent::InsnEnd { cpu }, |_, _| true);
    }

    /// The guest loaded `value` from `vaddr`.
    pub fn invoke_mem_read(&mut self, vaddr: Gva, paddr: Gpa, value: u64, size: AccessSize) {
        let access = MemAccess {
            vaddr,
            paddr,
            value,
            size,
        };
        self.dispatch(CallbackEvent::MemRead(access), |_, _| true);
    }

    /// The guest stored `value` to `vaddr`.
    pub fn invoke_mem_write(&mut self, vaddr: Gva, paddr: Gpa, value: u64, size: AccessSize) {
        let access = MemAccess {
            vaddr,
            paddr,
            value,
            size,
        };
        self.dispatch(CallbackEvent::MemWrite(access), |_, _| true);
    }

    /// An indirect control transfer from `source` to `target`, whose taint is
    /// `target_taint`.
    pub fn invoke_eip_check(&mut self, source: Gva, target: Gva, target_taint: u32) {
        let event = CallbackEvent::EipCheck {
            source,
            target,
            target_taint,
        };
        self.dispatch(event, |_, _| true);
    }

    /// A key reached the guest.
    ///
    /// # Returns
    ///
    /// The taint callbacks assigned to the key, zero if none did.
    pub fn invoke_keystroke(&mut self, keycode: i32) -> u32 {
        let taint = Cell::new(0);
        self.dispatch(
            CallbackEvent::Keystroke {
                keycode,
                taint: &taint,
            },
            |_, _| true,
        );
        taint.get()
    }

    /// The NIC received `packet` into its ring buffer at `cur_pos`.
    pub fn invoke_nic_receive(&mut self, packet: &[u8], cur_pos: u32, start: u32, stop: u32) {
        let event = CallbackEvent::NicReceive {
            packet,
            cur_pos,
            start,
            stop,
        };
        self.dispatch(event, |_, _| true);
    }

    /// The NIC sent `packet` from buffer offset `addr`.
    pub fn invoke_nic_send(&mut self, addr: u32, packet: &[u8]) {
        self.dispatch(CallbackEvent::NicSend { addr, packet }, |_, _| true);
    }

    /// An instruction with `opcode` at `eip` executed and control continues at `next_eip`.
    ///
    /// Only the registration owning the opcode's slot runs, and only if its transition
    /// condition admits the user/kernel transition from `eip` to `next_eip`.
    pub fn invoke_opcode_range(
        &mut self,
        cpu: &dyn GuestCpu,
        eip: Gva,
        next_eip: Gva,
        opcode: u16,
    ) {
        let opcode = normalize_opcode(opcode);
        let Some(handle) = self.dispatcher.opcode_slot(opcode) else {
            return;
        };

        let event = CallbackEvent::OpcodeRange {
            cpu,
            eip,
            next_eip,
            opcode,
        };
        self.call(handle, event, |config, filter| {
            opcode_matches(config, filter, eip, next_eip)
        });
    }

    /// An instruction fetch at `vaddr` filled a TLB entry. Ignored for `vaddr == 0`.
    pub fn invoke_tlb_exec(&mut self, cpu: &dyn GuestCpu, vaddr: Gva) {
        if vaddr == 0 {
            return;
        }
        self.dispatch(CallbackEvent::TlbExec { cpu, vaddr }, |_, _| true);
    }

    /// The guest loaded tainted bytes.
    pub fn invoke_read_taint_mem(&mut self, vaddr: Gva, paddr: Gpa, taint: TaintBytes) {
        let access = TaintAccess {
            vaddr,
            paddr,
            taint,
        };
        self.dispatch(CallbackEvent::ReadTaintMem(access), |_, _| true);
    }

    /// A guest store changed memory taint.
    pub fn invoke_write_taint_mem(&mut self, vaddr: Gva, paddr: Gpa, taint: TaintBytes) {
        let access = TaintAccess {
            vaddr,
            paddr,
            taint,
        };
        self.dispatch(CallbackEvent::WriteTaintMem(access), |_, _| true);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use crate::{
        dispatch::{BlockFilter, CallbackKind, EnableFlag, TransitionCondition},
        host::NullHost,
        test::{CallLog, TestCpu},
        EngineConfig,
    };

    use super::*;

    fn engine() -> Engine {
        Engine::new(EngineConfig::default(), NullHost).unwrap()
    }

    #[test]
    fn lifo_order() {
        let mut engine = engine();
        let log = CallLog::new();
        for label in ["a", "b", "c"] {
            engine
                .register(CallbackKind::InsnEnd, None, log.recorder(label))
                .unwrap();
        }

        engine.invoke_insn_end(&TestCpu(0));
        engine.invoke_insn_end(&TestCpu(0));
        assert_eq!(log.calls(), ["c", "b", "a", "c", "b", "a"]);
    }

    #[test]
    fn disabled_callbacks_are_skipped() {
        let mut engine = engine();
        let log = CallLog::new();
        let flag = EnableFlag::new(false);
        engine
            .register(CallbackKind::MemRead, Some(flag.clone()), log.recorder("gated"))
            .unwrap();

        engine.invoke_mem_read(0x10, 0x10, 0, AccessSize::Byte);
        assert!(log.calls().is_empty());

        flag.set(true);
        engine.invoke_mem_read(0x10, 0x10, 0, AccessSize::Byte);
        assert_eq!(log.calls(), ["gated"]);
    }

    #[test]
    fn page_filtered_block_begin() {
        let mut engine = engine();
        let log = CallLog::new();
        engine
            .register_block_begin(BlockFilter::Page(0x40_1000), None, log.recorder("page"))
            .unwrap();

        let cpu = TestCpu(0);
        engine.invoke_block_begin(&cpu, BlockInfo::new(0x40_1000, 4, 1));
        engine.invoke_block_begin(&cpu, BlockInfo::new(0x40_1FFC, 4, 1));
        engine.invoke_block_begin(&cpu, BlockInfo::new(0x40_2000, 4, 1));
        engine.invoke_block_begin(&cpu, BlockInfo::new(0x40_0FFC, 4, 1));
        assert_eq!(log.calls(), ["page", "page"]);
    }

    #[test]
    fn const_block_begin_fires_everywhere_by_default() {
        let mut engine = engine();
        let log = CallLog::new();
        engine
            .register_block_begin(BlockFilter::Const(0x40_1000), None, log.recorder("const"))
            .unwrap();

        engine.invoke_block_begin(&TestCpu(0), BlockInfo::new(0x7000_0000, 4, 1));
        assert_eq!(log.calls(), ["const"]);
    }

    #[test]
    fn exact_block_begin_when_configured() {
        let mut engine = Engine::new(EngineConfig::exact_filters(), NullHost).unwrap();
        let log = CallLog::new();
        engine
            .register_block_begin(BlockFilter::Const(0x40_1000), None, log.recorder("const"))
            .unwrap();

        engine.invoke_block_begin(&TestCpu(0), BlockInfo::new(0x40_1004, 4, 1));
        engine.invoke_block_begin(&TestCpu(0), BlockInfo::new(0x40_1000, 4, 1));
        assert_eq!(log.calls(), ["const"]);
    }

    #[test]
    fn block_end_matches_both_sides() {
        let mut engine = engine();
        let log = CallLog::new();
        engine
            .register_block_end(Some(0x40_1000), None, None, log.recorder("from"))
            .unwrap();
        engine
            .register_block_end(None, Some(0x50_0000), None, log.recorder("to"))
            .unwrap();
        engine
            .register_block_end(Some(0x40_1000), Some(0x60_0000), None, log.recorder("pair"))
            .unwrap();
        let block = BlockInfo::new(0x40_1000, 16, 4);

        // Next pc comes from the cpu
        engine.invoke_block_end(&TestCpu(0x50_0010), block, 0x40_100C);
        assert_eq!(log.calls(), ["to", "from"]);

        log.clear();
        engine.invoke_block_end(&TestCpu(0x60_0000), block, 0x40_100C);
        assert_eq!(log.calls(), ["pair", "from"]);

        log.clear();
        engine.invoke_block_end(&TestCpu(0x60_0000), block, 0x70_0000);
        assert!(log.calls().is_empty());
    }

    #[test]
    fn callback_can_unregister_itself() {
        let mut engine = engine();
        let log = CallLog::new();
        engine
            .register(CallbackKind::InsnBegin, None, log.recorder("first"))
            .unwrap();

        let once = log.recorder("once");
        let mut once = Some(once);
        engine
            .register(CallbackKind::InsnBegin, None, move |engine, params| {
                if let Some(mut inner) = once.take() {
                    inner(engine, params);
                }
                engine.unregister(params.handle).unwrap();
            })
            .unwrap();

        engine.invoke_insn_begin(&TestCpu(0));
        engine.invoke_insn_begin(&TestCpu(0));
        assert_eq!(log.calls(), ["once", "first", "first"]);
        assert_eq!(engine.dispatcher().registered(CallbackKind::InsnBegin), 1);
    }

    #[test]
    fn callback_can_unregister_a_later_one() {
        let mut engine = engine();
        let log = CallLog::new();
        let victim = engine
            .register(CallbackKind::NicSend, None, log.recorder("victim"))
            .unwrap();
        engine
            .register(CallbackKind::NicSend, None, move |engine, _| {
                let _ = engine.unregister(victim);
            })
            .unwrap();

        engine.invoke_nic_send(0, &[1, 2, 3]);
        assert!(log.calls().is_empty());
        assert_eq!(engine.dispatcher().registered(CallbackKind::NicSend), 1);
    }

    #[test]
    fn registration_during_dispatch_fires_next_time() {
        let mut engine = engine();
        let log = CallLog::new();
        let recorder = Arc::new(Mutex::new(Some(log.recorder("late"))));
        engine
            .register(CallbackKind::EipCheck, None, move |engine, _| {
                if let Some(late) = recorder.lock().unwrap().take() {
                    engine.register(CallbackKind::EipCheck, None, late).unwrap();
                }
            })
            .unwrap();

        engine.invoke_eip_check(0x1000, 0x2000, 0);
        assert!(log.calls().is_empty());
        engine.invoke_eip_check(0x1000, 0x2000, 0);
        assert_eq!(log.calls(), ["late"]);
    }

    #[test]
    fn nested_dispatch_skips_running_callback() {
        let mut engine = engine();
        let log = CallLog::new();
        let mut record = log.recorder("outer");
        engine
            .register(CallbackKind::InsnBegin, None, move |engine, params| {
                record(engine, params);
                // Re-entering the same kind does not re-enter this callback
                engine.invoke_insn_begin(&TestCpu(0));
            })
            .unwrap();

        engine.invoke_insn_begin(&TestCpu(0));
        assert_eq!(log.calls(), ["outer"]);
    }

    #[test]
    fn opcode_range_last_registration_wins() {
        let mut engine = engine();
        let log = CallLog::new();
        engine
            .register_opcode_range(0x10, 0x20, TransitionCondition::empty(), log.recorder("first"))
            .unwrap();
        engine
            .register_opcode_range(0x18, 0x28, TransitionCondition::empty(), log.recorder("second"))
            .unwrap();

        let cpu = TestCpu(0x40_1000);
        engine.invoke_opcode_range(&cpu, 0x40_1000, 0x40_1002, 0x10);
        engine.invoke_opcode_range(&cpu, 0x40_1000, 0x40_1002, 0x18);
        engine.invoke_opcode_range(&cpu, 0x40_1000, 0x40_1002, 0x20);
        engine.invoke_opcode_range(&cpu, 0x40_1000, 0x40_1002, 0x29);
        assert_eq!(log.calls(), ["first", "second", "second"]);
    }

    #[test]
    fn opcode_range_condition() {
        let mut engine = engine();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        engine
            .register_opcode_range(
                0x0F34,
                0x0F35,
                TransitionCondition::USER_TO_KERNEL,
                move |_, params| {
                    if let CallbackEvent::OpcodeRange { opcode, .. } = params.event {
                        sink.lock().unwrap().push(opcode);
                    }
                },
            )
            .unwrap();

        let cpu = TestCpu(0);
        // sysenter from user space into the kernel
        engine.invoke_opcode_range(&cpu, 0x40_1000, 0x8050_0000, 0x0F34);
        // sysexit back to user space is filtered out
        engine.invoke_opcode_range(&cpu, 0x8050_0000, 0x40_1000, 0x0F35);
        assert_eq!(*seen.lock().unwrap(), [0x134]);
    }

    #[test]
    fn keystroke_taint_is_returned() {
        let mut engine = engine();
        assert_eq!(engine.invoke_keystroke(0x1E), 0);

        engine
            .register(CallbackKind::Keystroke, None, |_, params| {
                if let CallbackEvent::Keystroke { keycode, taint } = params.event {
                    if keycode == 0x1E {
                        taint.set(0xFF);
                    }
                }
            })
            .unwrap();
        assert_eq!(engine.invoke_keystroke(0x1E), 0xFF);
        assert_eq!(engine.invoke_keystroke(0x1F), 0);
    }

    #[test]
    fn nic_and_tlb_payloads() {
        let mut engine = engine();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        engine
            .register(CallbackKind::NicReceive, None, move |_, params| {
                if let CallbackEvent::NicReceive { packet, cur_pos, .. } = params.event {
                    sink.lock().unwrap().push((packet.len() as u32, cur_pos));
                }
            })
            .unwrap();
        let sink = seen.clone();
        engine
            .register(CallbackKind::TlbExec, None, move |_, params| {
                if let CallbackEvent::TlbExec { vaddr, .. } = params.event {
                    sink.lock().unwrap().push((0, vaddr));
                }
            })
            .unwrap();

        engine.invoke_nic_receive(&[0; 60], 0x4000, 0x4000, 0x6000);
        engine.invoke_tlb_exec(&TestCpu(0), 0);
        engine.invoke_tlb_exec(&TestCpu(0), 0x40_1000);
        assert_eq!(*seen.lock().unwrap(), [(60, 0x4000), (0, 0x40_1000)]);
    }
}
