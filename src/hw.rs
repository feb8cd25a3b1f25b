//! Per-core hardware control: kickoff, abort, reset, and the buffer linker.
//!
//! One `CoreDev` per physical VCMD-capable core. All mutable core state
//! (queue, register mirror, ready counter, coalescing accumulator) lives in
//! `CoreState` behind the core's spinlock; the ISR and process-context paths
//! are mutually exclusive through that lock and nothing here ever sleeps
//! while holding it.

use core::ptr::NonNull;

use spin::{Mutex, MutexGuard};

use crate::cmdbuf::{CmdbufFlags, CmdbufTable, NIL};
use crate::config::{CoreDesc, HwGeneration, ModuleType};
use crate::err::VcmdError;
use crate::ins;
use crate::pool::CmdbufPool;
use crate::queue::CoreQueue;
use crate::registers::consts::*;
use crate::registers::mirror::*;
use crate::registers::VcmdRegisters;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkingState {
    Idle,
    Working,
    Stall,
}

pub struct CoreState {
    pub working: WorkingState,
    pub queue: CoreQueue,
    /// Buffers linked but not yet consumed by hardware; mirrored into
    /// `REG_CMDBUF_RDY_NUM`.
    pub sw_cmdbuf_rdy_num: u32,
    /// Estimated cost accumulated along the current run of
    /// interrupt-suppressing buffers.
    pub duration_without_int: u64,
    pub mirror: RegisterMirror,
    /// A software-requested abort is in flight: the ISR must not
    /// auto-restart, the requester reprograms the core itself.
    pub sw_abort: bool,
}

pub struct CoreDev {
    /// Index across all cores of all module types; also the core's slot in
    /// the register-dump DMA area.
    pub global_id: u16,
    pub module_type: ModuleType,
    pub desc: CoreDesc,
    pub gen: HwGeneration,
    pub regs: VcmdRegisters,
    state: Mutex<CoreState>,
}

impl CoreDev {
    /// # Safety
    ///
    /// `base` must be a valid mapping of this core's VCMD register file for
    /// the lifetime of the device.
    pub unsafe fn new(global_id: u16, desc: CoreDesc, base: NonNull<u8>) -> Self {
        let regs = unsafe { VcmdRegisters::new(base) };
        let hw_id = regs.hw_id_raw();
        let gen = HwGeneration::from_hw_id(hw_id);
        debug!(
            "vcmd core {}: hw id {:#010x}, generation {:?}",
            global_id, hw_id, gen
        );
        Self {
            global_id,
            module_type: desc.module_type,
            desc,
            gen,
            regs,
            state: Mutex::new(CoreState {
                working: WorkingState::Idle,
                queue: CoreQueue::new(),
                sw_cmdbuf_rdy_num: 0,
                duration_without_int: 0,
                mirror: RegisterMirror::new(),
                sw_abort: false,
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock()
    }

    /// Bus address as the hardware command fetcher sees it.
    pub fn translate(&self, bus: u64) -> u64 {
        if self.desc.mmu_enable {
            bus
        } else {
            bus - self.desc.bus_base
        }
    }

    /// Number of buffers the hardware reports having consumed.
    pub fn hw_exe_count(&self, pool: &CmdbufPool) -> u32 {
        if self.gen.has_executing_id() {
            pool.read_dump_cell(self.global_id as usize, DUMP_CELL_EXE_COUNT)
        } else {
            self.regs.read_word(REG_EXE_CMDBUF_COUNT)
        }
    }

    /// Locate the buffer the hardware is (or was) executing.
    ///
    /// Pre-1.1 parts report an address that is range-matched against the
    /// queue; 1.1+ parts mirror the executing id into the dump area. An
    /// out-of-range id means the shared state can no longer be trusted and
    /// the caller must abandon its operation.
    pub fn executing_node(
        &self,
        state: &CoreState,
        table: &CmdbufTable,
        pool: &CmdbufPool,
    ) -> Result<Option<u16>, VcmdError> {
        if self.gen.has_executing_id() {
            let id = pool.read_dump_cell(self.global_id as usize, DUMP_CELL_EXECUTING_ID) as u16;
            if id == NIL {
                return Ok(None);
            }
            match table.get(id) {
                Some(obj) if obj.core_id == Some(self.global_id) => Ok(Some(id)),
                _ => {
                    error!(
                        "vcmd core {}: executing id {} out of range",
                        self.global_id, id
                    );
                    Err(VcmdError::Internal)
                }
            }
        } else {
            let lo = self.regs.read_word(REG_EXECUTING_ADDR) as u64;
            let hi = self.regs.read_word(REG_EXECUTING_ADDR_MSB) as u64;
            let hw_addr = lo | (hi << 32);
            let bus = if self.desc.mmu_enable {
                hw_addr
            } else {
                hw_addr + self.desc.bus_base
            };
            let mut cur = state.queue.head;
            while cur != NIL {
                let obj = table.get(cur).ok_or(VcmdError::Internal)?;
                if obj.contains_bus(bus) {
                    return Ok(Some(cur));
                }
                cur = obj.next;
            }
            Ok(None)
        }
    }

    /// Interrupt-coalescing account for a buffer about to be linked. While
    /// consecutive buffers suppress their completion interrupts the costs
    /// accumulate; at the ceiling the buffer's suppression is overridden so
    /// worst-case notification latency stays bounded.
    fn account_interrupt(&self, state: &mut CoreState, table: &CmdbufTable, id: u16, ceiling: u64) {
        let (suppress, cost) = match table.get(id) {
            Some(o) => (o.flags.contains(CmdbufFlags::NO_NORMAL_INT), o.estimated_cost),
            None => return,
        };
        if suppress {
            state.duration_without_int += cost;
            if state.duration_without_int >= ceiling {
                table.update(id, |o| o.flags.remove(CmdbufFlags::NO_NORMAL_INT));
                state.duration_without_int = 0;
            }
        } else {
            state.duration_without_int = 0;
        }
    }

    /// Chain every unlinked buffer from `from` through the tail into the
    /// hardware-traversable list, patching each predecessor's trailing JMP.
    pub fn link_chain(
        &self,
        state: &mut CoreState,
        table: &CmdbufTable,
        from: u16,
        coalesce_ceiling: u64,
    ) {
        if from == NIL {
            return;
        }
        if table
            .get(from)
            .map(|o| !o.linked() && !o.run_done())
            .unwrap_or(false)
        {
            self.account_interrupt(state, table, from, coalesce_ceiling);
            table.update(from, |o| o.flags.insert(CmdbufFlags::DATA_LINKED));
            state.sw_cmdbuf_rdy_num += 1;
        }

        let mut a = from;
        loop {
            let a_obj = match table.get(a) {
                Some(o) => o,
                None => break,
            };
            let b = a_obj.next;
            if b == NIL {
                break;
            }
            let b_obj = match table.get(b) {
                Some(o) => o,
                None => break,
            };
            if !a_obj.flags.contains(CmdbufFlags::HAS_END_OPCODE) && !b_obj.run_done() {
                if !b_obj.linked() {
                    self.account_interrupt(state, table, b, coalesce_ceiling);
                    table.update(b, |o| o.flags.insert(CmdbufFlags::DATA_LINKED));
                    state.sw_cmdbuf_rdy_num += 1;
                }
                // re-read A: the accounting pass may have cleared its
                // suppression before we patch its JMP
                let a_suppress = table
                    .get(a)
                    .map(|o| o.flags.contains(CmdbufFlags::NO_NORMAL_INT))
                    .unwrap_or(false);
                let tail = ins::JmpTail {
                    rdy: true,
                    ie: !a_suppress,
                    exe_length: ins::exe_length_of(b_obj.filled_bytes) as u16,
                    target_bus: self.translate(b_obj.slot.cmd_bus),
                    target_id: if self.gen.has_executing_id() { b } else { 0 },
                };
                unsafe { ins::patch_jmp(a_obj.jmp_ptr(), &tail) };
            }
            a = b;
        }
    }

    /// Write the full register image and pull the start trigger. Only legal
    /// from IDLE with at least one linked buffer at `first`.
    pub fn start(&self, state: &mut CoreState, table: &CmdbufTable, timeout_cycles: u32) {
        debug_assert_eq!(state.working, WorkingState::Idle);
        let first = match table.get(state.queue.head) {
            Some(o) => o,
            None => return,
        };
        debug_assert!(first.linked());

        let m = &mut state.mirror;
        m.set(HWIF_CLK_GATE_DISABLE, 0b111);
        m.set(HWIF_ABORT_MODE, 0);
        m.set(HWIF_RESET_CORE, 0);
        m.set(HWIF_RESET_ALL, 0);
        m.set(HWIF_START_TRIGGER, 0);
        m.set_word(REG_IRQ_ENABLE, irq_enable_mask(self.gen));
        m.set(HWIF_TIMEOUT_ENABLE, 1);
        m.set(HWIF_TIMEOUT_CYCLES, timeout_cycles);
        let hw_addr = self.translate(first.slot.cmd_bus);
        m.set(HWIF_EXECUTING_ADDR, hw_addr as u32);
        m.set(HWIF_EXECUTING_ADDR_MSB, (hw_addr >> 32) as u32);
        m.set(HWIF_EXE_LENGTH, ins::exe_length_of(first.filled_bytes));
        m.set(HWIF_CMDBUF_RDY_NUM, state.sw_cmdbuf_rdy_num);
        if self.gen.has_executing_id() {
            m.set(HWIF_EXECUTING_ID, first.id as u32);
        }
        if self.gen == HwGeneration::V1_2 {
            self.write_init_program(m);
        }
        m.flush(&self.regs);

        state.working = WorkingState::Working;
        m.set(HWIF_START_TRIGGER, 1);
        m.flush_word(&self.regs, REG_CONTROL);
        debug!(
            "vcmd core {}: started at cmdbuf {} (rdy {})",
            self.global_id, first.id, state.sw_cmdbuf_rdy_num
        );
    }

    /// The 1.2.1+ front end wants a tiny init program (AXI-FE and MMU
    /// register writes terminated by END) in its init window before the
    /// start trigger.
    fn write_init_program(&self, mirror: &mut RegisterMirror) {
        let axife = [0u32, 0];
        let mmu_en = [self.desc.mmu_enable as u32];
        let prog = [
            ins::Instr::Wreg {
                fix: true,
                addr: self.desc.submodules.axife,
                values: &axife,
            },
            ins::Instr::Wreg {
                fix: true,
                addr: self.desc.submodules.mmu,
                values: &mmu_en,
            },
            ins::Instr::End,
        ];
        let mut words = [0u32; INIT_PROGRAM_WORDS];
        let mut off = 0;
        for instr in &prog {
            off += instr.encode(&mut words[off..]);
        }
        for (i, w) in words.iter().enumerate() {
            mirror.set_word(REG_INIT_PROGRAM + i, *w);
        }
    }

    /// Clear the start trigger, driving the hardware toward IDLE. The IDLE
    /// transition itself is observed by the ISR (abort interrupt) or by the
    /// teardown spin-wait.
    pub fn trigger_abort(&self, state: &mut CoreState, software: bool) {
        state.sw_abort = software;
        state.mirror.set(HWIF_ABORT_MODE, 1);
        state.mirror.set(HWIF_START_TRIGGER, 0);
        state.mirror.flush_word(&self.regs, REG_CONTROL);
        debug!(
            "vcmd core {}: abort asserted (software={})",
            self.global_id, software
        );
    }

    /// Full hardware reset of this core; used only by timeout recovery.
    pub fn reset_asic(&self, state: &mut CoreState) {
        state.mirror.set(HWIF_RESET_CORE, 1);
        state.mirror.flush_word(&self.regs, REG_CONTROL);
        state.mirror.set(HWIF_RESET_CORE, 0);
        state.mirror.set(HWIF_START_TRIGGER, 0);
        state.mirror.flush_word(&self.regs, REG_CONTROL);
        self.regs.write_word(REG_IRQ_STATUS, IRQ_CLEAR_ALL);
        state.working = WorkingState::Idle;
    }

    /// Reprogram the execution window after surgery on the queue and pull
    /// the trigger again. `first` must be linked and pending.
    pub fn restart(&self, state: &mut CoreState, table: &CmdbufTable, timeout_cycles: u32) {
        state.working = WorkingState::Idle;
        if let Some(head) = table.get(state.queue.head) {
            if head.linked() && !head.run_done() {
                self.start(state, table, timeout_cycles);
            }
        }
    }

    /// Recount `sw_cmdbuf_rdy_num` from the queue: linked, not yet done.
    pub fn recount_rdy(&self, state: &mut CoreState, table: &CmdbufTable) {
        let mut n = 0;
        let mut cur = state.queue.head;
        while cur != NIL {
            let obj = match table.get(cur) {
                Some(o) => o,
                None => break,
            };
            if obj.linked() && !obj.run_done() {
                n += 1;
            }
            cur = obj.next;
        }
        state.sw_cmdbuf_rdy_num = n;
    }
}
