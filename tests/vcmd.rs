//! Hosted scheduler tests over a fake register file.
//!
//! Each "core" is a heap-backed window of u32 words standing in for the MMIO
//! register file, and the per-core dump area lives in the (identity-mapped)
//! DMA pool, so tests play the hardware's half of the protocol: poke the
//! executing-id dump cell and the interrupt-status word, then dispatch the
//! handler.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use dma_api::{Direction, Impl};
use vc8000_vcmd::{
    CancelToken, CmdbufSlot, CoreDesc, ExecStatus, HwGeneration, Instr, JmpTail, ModuleType, Osal,
    Priority, SessionId, SubmoduleOffsets, Vcmd, VcmdConfig, VcmdError, CORE_DUMP_WORDS,
};

/// Identity mapping: the bus address is the CPU address.
struct IdentityDma;

impl Impl for IdentityDma {
    fn map(addr: NonNull<u8>, _size: usize, _direction: Direction) -> u64 {
        addr.as_ptr() as u64
    }

    fn unmap(_addr: NonNull<u8>, _size: usize) {}

    fn flush(_addr: NonNull<u8>, _size: usize) {}

    fn invalidate(_addr: NonNull<u8>, _size: usize) {}
}

dma_api::set_impl!(IdentityDma);

struct HostOsal;

impl Osal for HostOsal {
    fn get_time_us(&self) -> u64 {
        use std::sync::OnceLock;
        static START: OnceLock<Instant> = OnceLock::new();
        START.get_or_init(Instant::now).elapsed().as_micros() as u64
    }

    fn udelay(&self, us: u32) {
        std::thread::sleep(std::time::Duration::from_micros(us as u64));
    }

    fn msleep(&self, ms: u32) {
        std::thread::sleep(std::time::Duration::from_millis(ms as u64));
    }
}

// Register word indices and status bits of the fake register file, matching
// the hardware layout the driver programs.
const REG_EXECUTING_ADDR: usize = 3;
const REG_EXECUTING_ADDR_MSB: usize = 4;
const REG_CONTROL: usize = 6;
const REG_IRQ_STATUS: usize = 7;
const REG_WINDOW_WORDS: usize = 32;

const IRQ_ENDCMD: u32 = 1 << 0;
const IRQ_BUSERR: u32 = 1 << 1;
const IRQ_TIMEOUT: u32 = 1 << 2;
const IRQ_CMDERR: u32 = 1 << 3;
const IRQ_ABORT: u32 = 1 << 4;
const IRQ_RESET: u32 = 1 << 5;
const IRQ_JMPD: u32 = 1 << 6;

const JMP_RDY: u32 = 1 << 26;
const JMP_IE: u32 = 1 << 25;

// Hardware id low halves selecting the interface generation.
const HW_ID_V1_0: u32 = 0x0102;
const HW_ID_V1_1: u32 = 0x0110;
const HW_ID_V1_2: u32 = 0x0121;

const DUMP_CELL_EXE_COUNT: usize = 0;
const DUMP_CELL_EXECUTING_ID: usize = 1;

fn decoder_core() -> CoreDesc {
    CoreDesc {
        module_type: ModuleType::VideoDecoder,
        irq: None,
        submodules: SubmoduleOffsets {
            main: 0x800,
            mmu: 0x600,
            axife: 0x700,
            dec400: 0,
        },
        bus_base: 0,
        mmu_enable: false,
    }
}

struct Harness {
    vcmd: Vcmd<HostOsal>,
    reg_bases: Vec<usize>,
    dump_base: usize,
}

impl Harness {
    fn new(cores: usize, tweak: impl FnOnce(&mut VcmdConfig)) -> Self {
        Self::with_hw_id(cores, HW_ID_V1_2, tweak)
    }

    fn with_hw_id(cores: usize, hw_id: u32, tweak: impl FnOnce(&mut VcmdConfig)) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut bases = Vec::new();
        let mut reg_bases = Vec::new();
        for _ in 0..cores {
            let window: &'static mut [u32; REG_WINDOW_WORDS] =
                Box::leak(Box::new([0; REG_WINDOW_WORDS]));
            window[0] = hw_id;
            reg_bases.push(window.as_ptr() as usize);
            bases.push(NonNull::new(window.as_mut_ptr() as *mut u8).unwrap());
        }
        let mut cfg = VcmdConfig::new(vec![decoder_core(); cores]);
        cfg.cmdbuf_count = 32;
        tweak(&mut cfg);
        let vcmd = unsafe { Vcmd::new(&bases, cfg, HostOsal) }.unwrap();
        let dump_base = vcmd.cmdbuf_parameter().dump_base_bus as usize;
        Self {
            vcmd,
            reg_bases,
            dump_base,
        }
    }

    fn reg_read(&self, core: usize, idx: usize) -> u32 {
        unsafe { ((self.reg_bases[core] as *const u32).add(idx)).read_volatile() }
    }

    fn reg_write(&self, core: usize, idx: usize, val: u32) {
        unsafe { ((self.reg_bases[core] as *mut u32).add(idx)).write_volatile(val) }
    }

    fn dump_write(&self, core: usize, cell: usize, val: u32) {
        let p = (self.dump_base + (core * CORE_DUMP_WORDS + cell) * 4) as *mut u32;
        unsafe { p.write_volatile(val) }
    }

    /// Play the hardware: publish what is executing, latch an interrupt
    /// status, dispatch the handler, then drop the latched status the way a
    /// write-1-clear register would have.
    fn raise(&self, core: usize, status: u32, executing_id: u16) {
        self.dump_write(core, DUMP_CELL_EXECUTING_ID, executing_id as u32);
        self.reg_write(core, REG_IRQ_STATUS, status);
        self.vcmd.irq_handle(core as u16).unwrap();
        self.reg_write(core, REG_IRQ_STATUS, 0);
    }

    /// Legacy-generation variant of `raise`: the hardware reports its
    /// position through the executing-address registers, not a dump cell.
    fn raise_at_addr(&self, core: usize, status: u32, addr: u64) {
        self.reg_write(core, REG_EXECUTING_ADDR, addr as u32);
        self.reg_write(core, REG_EXECUTING_ADDR_MSB, (addr >> 32) as u32);
        self.reg_write(core, REG_IRQ_STATUS, status);
        self.vcmd.irq_handle(core as u16).unwrap();
        self.reg_write(core, REG_IRQ_STATUS, 0);
    }

    fn executing_addr(&self, core: usize) -> u64 {
        self.reg_read(core, REG_EXECUTING_ADDR) as u64
            | (self.reg_read(core, REG_EXECUTING_ADDR_MSB) as u64) << 32
    }

    /// Reserve, fill with NOPs plus a trailing JMP and hand off.
    fn submit(&self, session: SessionId, priority: Priority, cost: u64, ie: bool) -> u16 {
        let cancel = CancelToken::new();
        let id = self
            .vcmd
            .reserve_cmdbuf(session, ModuleType::VideoDecoder, priority, cost, &cancel)
            .unwrap();
        let slot = self.vcmd.cmdbuf_slot(session, id).unwrap();
        let filled = fill_payload(&slot, ie);
        self.vcmd.link_run_cmdbuf(session, id, filled).unwrap();
        id
    }

    fn jmp_word0(&self, session: SessionId, id: u16) -> u32 {
        let slot = self.vcmd.cmdbuf_slot(session, id).unwrap();
        // payload layout from fill_payload: two NOPs then the JMP
        unsafe { slot.cmd_virt.add(2).read_volatile() }
    }

    fn jmp_target(&self, session: SessionId, id: u16) -> u64 {
        let slot = self.vcmd.cmdbuf_slot(session, id).unwrap();
        let lo = unsafe { slot.cmd_virt.add(3).read_volatile() } as u64;
        let hi = unsafe { slot.cmd_virt.add(4).read_volatile() } as u64;
        lo | (hi << 32)
    }
}

/// Two NOPs and an unpatched trailing JMP; returns the filled byte count.
fn fill_payload(slot: &CmdbufSlot, ie: bool) -> u32 {
    let words = unsafe { std::slice::from_raw_parts_mut(slot.cmd_virt, 6) };
    let mut off = Instr::Nop.encode(&mut words[..]);
    off += Instr::Nop.encode(&mut words[off..]);
    let mut tail = [0u32; 4];
    JmpTail {
        rdy: false,
        ie,
        exe_length: 0,
        target_bus: 0,
        target_id: 0,
    }
    .encode(&mut tail);
    words[off..off + 4].copy_from_slice(&tail);
    ((off + 4) * 4) as u32
}

#[test]
fn parameter_queries() {
    let h = Harness::new(2, |_| {});
    let p = h.vcmd.cmdbuf_parameter();
    assert_eq!(p.slot_count, 32);
    assert_eq!(p.cmd_slot_size, 0x2000);
    assert_eq!(p.cmd_total_size, 32 * 0x2000);
    assert_ne!(p.cmd_base_bus, 0);

    let v = h.vcmd.vcmd_parameter(ModuleType::VideoDecoder).unwrap();
    assert_eq!(v.core_count, 2);
    assert_eq!(v.generation, HwGeneration::V1_2 as u16);
    assert_eq!(v.mmu_offset, 0x600);
    assert!(h.vcmd.vcmd_parameter(ModuleType::JpegEncoder).is_err());
}

#[test]
fn pool_exhaustion_and_idempotent_release() {
    let h = Harness::new(1, |cfg| cfg.cmdbuf_count = 4);
    let session = SessionId(1);
    h.vcmd.open_session(session);
    let cancel = CancelToken::new();

    // slot 0 is reserved, so three usable slots
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(
            h.vcmd
                .reserve_cmdbuf(session, ModuleType::VideoDecoder, Priority::Normal, 1, &cancel)
                .unwrap(),
        );
    }
    let cancelled = CancelToken::new();
    cancelled.cancel();
    assert_eq!(
        h.vcmd
            .reserve_cmdbuf(session, ModuleType::VideoDecoder, Priority::Normal, 1, &cancelled)
            .unwrap_err(),
        VcmdError::Interrupted
    );

    h.vcmd.release_cmdbuf(session, ids[0]).unwrap();
    // released ids are no-ops on a second call
    h.vcmd.release_cmdbuf(session, ids[0]).unwrap();
    let again = h
        .vcmd
        .reserve_cmdbuf(session, ModuleType::VideoDecoder, Priority::Normal, 1, &cancel)
        .unwrap();
    assert!(!ids.contains(&again) || again == ids[0]);
    for id in [ids[1], ids[2], again] {
        h.vcmd.release_cmdbuf(session, id).unwrap();
    }
    h.vcmd.close_session(session).unwrap();
}

#[test]
fn budget_charge_reverts_on_cancel() {
    let h = Harness::new(1, |cfg| cfg.budget_ceiling = 10);
    let session = SessionId(2);
    h.vcmd.open_session(session);
    let cancel = CancelToken::new();

    let first = h
        .vcmd
        .reserve_cmdbuf(session, ModuleType::VideoDecoder, Priority::Normal, 8, &cancel)
        .unwrap();
    // second reservation would sit at 16 outstanding against a ceiling of
    // 10; a cancelled wait must put the charge back
    let cancelled = CancelToken::new();
    cancelled.cancel();
    assert_eq!(
        h.vcmd
            .reserve_cmdbuf(session, ModuleType::VideoDecoder, Priority::Normal, 8, &cancelled)
            .unwrap_err(),
        VcmdError::Interrupted
    );
    h.vcmd.release_cmdbuf(session, first).unwrap();
    let retry = h
        .vcmd
        .reserve_cmdbuf(session, ModuleType::VideoDecoder, Priority::Normal, 8, &cancel)
        .unwrap();
    h.vcmd.release_cmdbuf(session, retry).unwrap();
    h.vcmd.close_session(session).unwrap();
}

#[test]
fn rejects_foreign_and_malformed_buffers() {
    let h = Harness::new(1, |_| {});
    let owner = SessionId(3);
    let intruder = SessionId(4);
    h.vcmd.open_session(owner);
    h.vcmd.open_session(intruder);
    let cancel = CancelToken::new();

    let id = h
        .vcmd
        .reserve_cmdbuf(owner, ModuleType::VideoDecoder, Priority::Normal, 1, &cancel)
        .unwrap();
    assert_eq!(
        h.vcmd.cmdbuf_slot(intruder, id).unwrap_err(),
        VcmdError::NotOwner
    );
    assert_eq!(
        h.vcmd.link_run_cmdbuf(intruder, id, 16).unwrap_err(),
        VcmdError::NotOwner
    );

    // NOPs with no trailing JMP or END
    let slot = h.vcmd.cmdbuf_slot(owner, id).unwrap();
    let words = unsafe { std::slice::from_raw_parts_mut(slot.cmd_virt, 4) };
    for w in words.iter_mut() {
        *w = 0x03 << 27;
    }
    assert_eq!(
        h.vcmd.link_run_cmdbuf(owner, id, 16).unwrap_err(),
        VcmdError::MalformedCmdbuf
    );
    h.vcmd.release_cmdbuf(owner, id).unwrap();
    h.vcmd.close_session(owner).unwrap();
    h.vcmd.close_session(intruder).unwrap();
}

#[test]
fn fifo_completion_within_core() {
    let h = Harness::new(1, |_| {});
    let session = SessionId(5);
    h.vcmd.open_session(session);
    let cancel = CancelToken::new();

    let b1 = h.submit(session, Priority::Normal, 1, true);
    let b2 = h.submit(session, Priority::Normal, 1, true);
    let b3 = h.submit(session, Priority::Normal, 1, true);

    // the core started on b1; its chain JMPs must be ready and point forward
    let b1_slot = h.vcmd.cmdbuf_slot(session, b1).unwrap();
    assert_eq!(h.executing_addr(0), b1_slot.cmd_bus);
    assert_ne!(h.jmp_word0(session, b1) & JMP_RDY, 0);
    let b2_slot = h.vcmd.cmdbuf_slot(session, b2).unwrap();
    assert_eq!(h.jmp_target(session, b1), b2_slot.cmd_bus);

    // hardware moved on to b2: only b1 is done
    h.raise(0, IRQ_JMPD, b2);
    assert_eq!(h.vcmd.wait_cmdbuf(session, b1, &cancel).unwrap(), ExecStatus::Ok);
    assert_eq!(h.vcmd.wait_any_cmdbuf(session, &cancel).unwrap(), b1);
    h.vcmd.release_cmdbuf(session, b1).unwrap();

    // chain ran out: everything left is done
    h.raise(0, IRQ_JMPD, 0);
    assert_eq!(h.vcmd.wait_cmdbuf(session, b2, &cancel).unwrap(), ExecStatus::Ok);
    assert_eq!(h.vcmd.wait_cmdbuf(session, b3, &cancel).unwrap(), ExecStatus::Ok);
    h.vcmd.release_cmdbuf(session, b2).unwrap();
    h.vcmd.release_cmdbuf(session, b3).unwrap();
    h.vcmd.close_session(session).unwrap();
}

#[test]
fn spreads_work_across_idle_cores() {
    let h = Harness::new(2, |_| {});
    let session = SessionId(6);
    h.vcmd.open_session(session);

    let cancel = CancelToken::new();
    let a = h
        .vcmd
        .reserve_cmdbuf(session, ModuleType::VideoDecoder, Priority::Normal, 1, &cancel)
        .unwrap();
    let b = h
        .vcmd
        .reserve_cmdbuf(session, ModuleType::VideoDecoder, Priority::Normal, 1, &cancel)
        .unwrap();
    let slot_a = h.vcmd.cmdbuf_slot(session, a).unwrap();
    let slot_b = h.vcmd.cmdbuf_slot(session, b).unwrap();
    let fa = fill_payload(&slot_a, true);
    let fb = fill_payload(&slot_b, true);
    let core_a = h.vcmd.link_run_cmdbuf(session, a, fa).unwrap();
    let core_b = h.vcmd.link_run_cmdbuf(session, b, fb).unwrap();
    assert_ne!(core_a, core_b);
    assert_eq!(h.executing_addr(core_a as usize), slot_a.cmd_bus);
    assert_eq!(h.executing_addr(core_b as usize), slot_b.cmd_bus);

    h.raise(core_a as usize, IRQ_JMPD, 0);
    h.raise(core_b as usize, IRQ_JMPD, 0);
    h.vcmd.close_session(session).unwrap();
}

#[test]
fn interrupt_coalescing_is_bounded() {
    // ceiling 3, five suppressing buffers of cost 1: the accumulator crosses
    // the ceiling at the third buffer, which must have its interrupt forced
    let h = Harness::new(1, |cfg| cfg.int_coalesce_ceiling = Some(3));
    let session = SessionId(7);
    h.vcmd.open_session(session);

    let ids: Vec<u16> = (0..5).map(|_| h.submit(session, Priority::Normal, 1, false)).collect();

    let ie_bits: Vec<bool> = ids[..4]
        .iter()
        .map(|&id| h.jmp_word0(session, id) & JMP_IE != 0)
        .collect();
    assert_eq!(ie_bits, [false, false, true, false]);
    // the last buffer's JMP has no successor and stays as authored
    assert_eq!(h.jmp_word0(session, ids[4]) & (JMP_RDY | JMP_IE), 0);

    h.raise(0, IRQ_JMPD, 0);
    h.vcmd.close_session(session).unwrap();
}

#[test]
fn high_priority_preempts_and_cuts_the_queue() {
    let h = Harness::new(1, |_| {});
    let session = SessionId(8);
    h.vcmd.open_session(session);
    let cancel = CancelToken::new();

    let n1 = h.submit(session, Priority::Normal, 10, true);
    let n2 = h.submit(session, Priority::Normal, 10, true);

    let done = AtomicBool::new(false);
    std::thread::scope(|s| {
        let h = &h;
        let done_ref = &done;
        s.spawn(move || {
            // play the hardware acknowledging the abort once the trigger
            // drops
            while h.reg_read(0, REG_CONTROL) & 1 != 0 {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            h.raise(0, IRQ_ABORT, n1);
            done_ref.store(true, Ordering::Release);
        });
        let hp = h.submit(session, Priority::High, 1, true);
        assert!(done.load(Ordering::Acquire));

        // the interrupted buffer completed at the abort boundary
        assert_eq!(h.vcmd.wait_cmdbuf(session, n1, &cancel).unwrap(), ExecStatus::Ok);
        // restarted from the high-priority buffer, chained ahead of n2
        let hp_slot = h.vcmd.cmdbuf_slot(session, hp).unwrap();
        let n2_slot = h.vcmd.cmdbuf_slot(session, n2).unwrap();
        assert_eq!(h.executing_addr(0), hp_slot.cmd_bus);
        assert_eq!(h.jmp_target(session, hp), n2_slot.cmd_bus);

        h.raise(0, IRQ_JMPD, 0);
        assert_eq!(h.vcmd.wait_cmdbuf(session, hp, &cancel).unwrap(), ExecStatus::Ok);
        assert_eq!(h.vcmd.wait_cmdbuf(session, n2, &cancel).unwrap(), ExecStatus::Ok);
    });
    h.vcmd.close_session(session).unwrap();
}

#[test]
fn bus_error_poisons_one_buffer_and_restarts() {
    let h = Harness::new(1, |_| {});
    let session = SessionId(9);
    h.vcmd.open_session(session);
    let cancel = CancelToken::new();

    let b1 = h.submit(session, Priority::Normal, 1, true);
    let b2 = h.submit(session, Priority::Normal, 1, true);
    let b3 = h.submit(session, Priority::Normal, 1, true);

    h.raise(0, IRQ_BUSERR, b2);
    assert_eq!(h.vcmd.wait_cmdbuf(session, b1, &cancel).unwrap(), ExecStatus::Ok);
    assert_eq!(
        h.vcmd.wait_cmdbuf(session, b2, &cancel).unwrap(),
        ExecStatus::BusErr
    );
    // sibling survives the fault and the core restarted on it
    let b3_slot = h.vcmd.cmdbuf_slot(session, b3).unwrap();
    assert_eq!(h.executing_addr(0), b3_slot.cmd_bus);
    h.raise(0, IRQ_JMPD, 0);
    assert_eq!(h.vcmd.wait_cmdbuf(session, b3, &cancel).unwrap(), ExecStatus::Ok);

    for id in [b1, b2, b3] {
        h.vcmd.release_cmdbuf(session, id).unwrap();
    }
    h.vcmd.close_session(session).unwrap();
}

#[test]
fn timeout_resets_and_replays_the_suspect() {
    let h = Harness::new(1, |_| {});
    let session = SessionId(13);
    h.vcmd.open_session(session);
    let cancel = CancelToken::new();

    let b1 = h.submit(session, Priority::Normal, 1, true);
    let b2 = h.submit(session, Priority::Normal, 1, true);

    // timeout anchors one node earlier: b1 completes, b2 is replayed after
    // the hardware reset, not failed
    h.raise(0, IRQ_TIMEOUT, b2);
    assert_eq!(h.vcmd.wait_cmdbuf(session, b1, &cancel).unwrap(), ExecStatus::Ok);
    let b2_slot = h.vcmd.cmdbuf_slot(session, b2).unwrap();
    assert_eq!(h.executing_addr(0), b2_slot.cmd_bus);

    h.raise(0, IRQ_JMPD, 0);
    assert_eq!(h.vcmd.wait_cmdbuf(session, b2, &cancel).unwrap(), ExecStatus::Ok);
    h.vcmd.close_session(session).unwrap();
}

#[test]
fn command_error_fails_only_the_faulting_buffer() {
    let h = Harness::new(1, |_| {});
    let session = SessionId(14);
    h.vcmd.open_session(session);
    let cancel = CancelToken::new();

    let b1 = h.submit(session, Priority::Normal, 1, true);
    let b2 = h.submit(session, Priority::Normal, 1, true);

    h.raise(0, IRQ_CMDERR, b1);
    assert_eq!(
        h.vcmd.wait_cmdbuf(session, b1, &cancel).unwrap(),
        ExecStatus::CmdErr
    );
    let b2_slot = h.vcmd.cmdbuf_slot(session, b2).unwrap();
    assert_eq!(h.executing_addr(0), b2_slot.cmd_bus);
    h.raise(0, IRQ_JMPD, 0);
    assert_eq!(h.vcmd.wait_cmdbuf(session, b2, &cancel).unwrap(), ExecStatus::Ok);
    h.vcmd.close_session(session).unwrap();
}

#[test]
fn teardown_excises_only_the_dying_session() {
    let h = Harness::new(1, |cfg| {
        cfg.abort_poll_count = 200;
        cfg.abort_poll_interval_ms = 1;
    });
    let dying = SessionId(10);
    let survivor = SessionId(11);
    h.vcmd.open_session(dying);
    h.vcmd.open_session(survivor);
    let cancel = CancelToken::new();

    let a1 = h.submit(dying, Priority::Normal, 1, true);
    let b1 = h.submit(survivor, Priority::Normal, 1, true);
    let a2 = h.submit(dying, Priority::Normal, 1, true);

    std::thread::scope(|s| {
        let h = &h;
        s.spawn(move || {
            while h.reg_read(0, REG_CONTROL) & 1 != 0 {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            h.raise(0, IRQ_ABORT, a1);
        });
        h.vcmd.close_session(dying).unwrap();
    });

    // the dying session's ids are gone
    assert_eq!(
        h.vcmd.wait_cmdbuf(dying, a2, &cancel).unwrap_err(),
        VcmdError::InvalidArgument
    );
    assert_eq!(h.vcmd.cmdbuf_slot(dying, a1).unwrap_err(), VcmdError::InvalidArgument);

    // the survivor's buffer was re-programmed as the new head and completes
    let b1_slot = h.vcmd.cmdbuf_slot(survivor, b1).unwrap();
    assert_eq!(h.executing_addr(0), b1_slot.cmd_bus);
    h.raise(0, IRQ_JMPD, 0);
    assert_eq!(h.vcmd.wait_cmdbuf(survivor, b1, &cancel).unwrap(), ExecStatus::Ok);
    h.vcmd.release_cmdbuf(survivor, b1).unwrap();
    h.vcmd.close_session(survivor).unwrap();
}

#[test]
fn end_opcode_buffers_complete_via_endcmd() {
    let h = Harness::new(1, |_| {});
    let session = SessionId(12);
    h.vcmd.open_session(session);
    let cancel = CancelToken::new();

    let id = h
        .vcmd
        .reserve_cmdbuf(session, ModuleType::VideoDecoder, Priority::Normal, 1, &cancel)
        .unwrap();
    let slot = h.vcmd.cmdbuf_slot(session, id).unwrap();
    let words = unsafe { std::slice::from_raw_parts_mut(slot.cmd_virt, 2) };
    let mut off = Instr::Nop.encode(words);
    off += Instr::End.encode(&mut words[off..]);
    h.vcmd.link_run_cmdbuf(session, id, (off * 4) as u32).unwrap();

    h.raise(0, IRQ_ENDCMD, id);
    assert_eq!(h.vcmd.wait_cmdbuf(session, id, &cancel).unwrap(), ExecStatus::Ok);
    h.vcmd.release_cmdbuf(session, id).unwrap();
    h.vcmd.close_session(session).unwrap();
}

#[test]
fn self_test_runs_one_buffer_per_core() {
    let h = Harness::new(2, |_| {});
    let cancel = CancelToken::new();

    let stop = AtomicBool::new(false);
    std::thread::scope(|s| {
        let h = &h;
        let stop_ref = &stop;
        s.spawn(move || {
            // complete whatever appears on either core until told to stop
            while !stop_ref.load(Ordering::Acquire) {
                for core in 0..2 {
                    if h.reg_read(core, REG_CONTROL) & 1 != 0 {
                        h.raise(core, IRQ_ENDCMD, 0);
                        h.reg_write(core, REG_CONTROL, 0);
                    }
                }
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        });
        h.vcmd.self_test(&cancel).unwrap();
        stop.store(true, Ordering::Release);
    });
}

#[test]
fn release_while_executing_is_credited_on_completion() {
    let h = Harness::new(1, |cfg| cfg.budget_ceiling = 10);
    let session = SessionId(16);
    h.vcmd.open_session(session);

    let b = h.submit(session, Priority::Normal, 8, true);
    // in flight: release only tags the buffer, the charge stays held
    h.vcmd.release_cmdbuf(session, b).unwrap();

    // completion frees the slot and returns the charge to the session
    h.raise(0, IRQ_JMPD, 0);
    let cancel = CancelToken::new();
    assert_eq!(
        h.vcmd.wait_cmdbuf(session, b, &cancel).unwrap_err(),
        VcmdError::InvalidArgument
    );

    // this reserve never reaches the polling loop: it only succeeds on a
    // cancelled token because the credit already came back
    let cancelled = CancelToken::new();
    cancelled.cancel();
    let again = h
        .vcmd
        .reserve_cmdbuf(session, ModuleType::VideoDecoder, Priority::Normal, 8, &cancelled)
        .unwrap();
    h.vcmd.release_cmdbuf(session, again).unwrap();
    h.vcmd.close_session(session).unwrap();
}

#[test]
fn resubmitting_a_linked_buffer_is_rejected() {
    let h = Harness::new(1, |_| {});
    let session = SessionId(17);
    h.vcmd.open_session(session);

    let id = h.submit(session, Priority::Normal, 1, true);
    let slot = h.vcmd.cmdbuf_slot(session, id).unwrap();
    let filled = fill_payload(&slot, true);
    assert_eq!(
        h.vcmd.link_run_cmdbuf(session, id, filled).unwrap_err(),
        VcmdError::InvalidArgument
    );

    h.raise(0, IRQ_JMPD, 0);
    h.vcmd.release_cmdbuf(session, id).unwrap();
    h.vcmd.close_session(session).unwrap();
}

#[test]
fn busy_cores_tie_break_toward_the_later_core() {
    let h = Harness::new(2, |_| {});
    let session = SessionId(18);
    h.vcmd.open_session(session);
    let cancel = CancelToken::new();

    // occupy both cores so selection falls through to the cost pass
    let a = h.submit(session, Priority::Normal, 5, true);
    let b = h.submit(session, Priority::Normal, 5, true);

    let submit_to = |cost: u64| {
        let id = h
            .vcmd
            .reserve_cmdbuf(session, ModuleType::VideoDecoder, Priority::Normal, cost, &cancel)
            .unwrap();
        let slot = h.vcmd.cmdbuf_slot(session, id).unwrap();
        let filled = fill_payload(&slot, true);
        h.vcmd.link_run_cmdbuf(session, id, filled).unwrap()
    };

    // equal backlog on both cores: the later core wins the tie
    assert_eq!(submit_to(1), 1);
    // the later core now carries more, so the strictly lighter one wins
    assert_eq!(submit_to(1), 0);

    h.raise(0, IRQ_JMPD, 0);
    h.raise(1, IRQ_JMPD, 0);
    assert_eq!(h.vcmd.wait_cmdbuf(session, a, &cancel).unwrap(), ExecStatus::Ok);
    assert_eq!(h.vcmd.wait_cmdbuf(session, b, &cancel).unwrap(), ExecStatus::Ok);
    h.vcmd.close_session(session).unwrap();
}

#[test]
fn wait_any_deadline_expires_as_timeout_not_interruption() {
    let h = Harness::new(1, |cfg| cfg.any_wait_timeout_ms = 20);
    let session = SessionId(19);
    h.vcmd.open_session(session);
    let cancel = CancelToken::new();

    let b = h.submit(session, Priority::Normal, 1, true);
    assert_eq!(
        h.vcmd.wait_any_cmdbuf(session, &cancel).unwrap_err(),
        VcmdError::Timeout
    );
    let cancelled = CancelToken::new();
    cancelled.cancel();
    assert_eq!(
        h.vcmd.wait_any_cmdbuf(session, &cancelled).unwrap_err(),
        VcmdError::Interrupted
    );

    h.raise(0, IRQ_JMPD, 0);
    assert_eq!(h.vcmd.wait_any_cmdbuf(session, &cancel).unwrap(), b);
    h.vcmd.release_cmdbuf(session, b).unwrap();
    h.vcmd.close_session(session).unwrap();
}

#[test]
fn legacy_reset_relinks_and_restarts() {
    let h = Harness::with_hw_id(1, HW_ID_V1_0, |_| {});
    let session = SessionId(20);
    h.vcmd.open_session(session);
    let cancel = CancelToken::new();

    let v = h.vcmd.vcmd_parameter(ModuleType::VideoDecoder).unwrap();
    assert_eq!(v.generation, HwGeneration::V1_0 as u16);

    let b1 = h.submit(session, Priority::Normal, 1, true);
    let b2 = h.submit(session, Priority::Normal, 1, true);
    let b1_slot = h.vcmd.cmdbuf_slot(session, b1).unwrap();

    // the core came back from a reset: nothing was consumed, the whole
    // chain is relinked and kicked off again from b1
    h.raise_at_addr(0, IRQ_RESET, 0);
    assert_eq!(h.executing_addr(0), b1_slot.cmd_bus);
    assert_ne!(h.reg_read(0, REG_CONTROL) & 1, 0);
    assert_ne!(h.jmp_word0(session, b1) & JMP_RDY, 0);

    // legacy completion names the finished buffer in the INTCMD vector
    h.raise_at_addr(0, (b2 as u32) << 16, 0);
    assert_eq!(h.vcmd.wait_cmdbuf(session, b1, &cancel).unwrap(), ExecStatus::Ok);
    assert_eq!(h.vcmd.wait_cmdbuf(session, b2, &cancel).unwrap(), ExecStatus::Ok);
    h.vcmd.release_cmdbuf(session, b1).unwrap();
    h.vcmd.release_cmdbuf(session, b2).unwrap();
    h.vcmd.close_session(session).unwrap();
}

#[test]
fn legacy_bus_error_is_localized_by_address() {
    let h = Harness::with_hw_id(1, HW_ID_V1_0, |_| {});
    let session = SessionId(21);
    h.vcmd.open_session(session);
    let cancel = CancelToken::new();

    let b1 = h.submit(session, Priority::Normal, 1, true);
    let b2 = h.submit(session, Priority::Normal, 1, true);
    let b2_slot = h.vcmd.cmdbuf_slot(session, b2).unwrap();

    // fault reported inside b2's slot: b1 completed, b2 takes the blame
    h.raise_at_addr(0, IRQ_BUSERR, b2_slot.cmd_bus + 16);
    assert_eq!(h.vcmd.wait_cmdbuf(session, b1, &cancel).unwrap(), ExecStatus::Ok);
    assert_eq!(
        h.vcmd.wait_cmdbuf(session, b2, &cancel).unwrap(),
        ExecStatus::BusErr
    );
    h.vcmd.release_cmdbuf(session, b1).unwrap();
    h.vcmd.release_cmdbuf(session, b2).unwrap();
    h.vcmd.close_session(session).unwrap();
}

#[test]
fn v1_1_parts_complete_by_executing_id() {
    let h = Harness::with_hw_id(1, HW_ID_V1_1, |_| {});
    let session = SessionId(22);
    h.vcmd.open_session(session);
    let cancel = CancelToken::new();

    let v = h.vcmd.vcmd_parameter(ModuleType::VideoDecoder).unwrap();
    assert_eq!(v.generation, HwGeneration::V1_1 as u16);

    let b1 = h.submit(session, Priority::Normal, 1, true);
    let b2 = h.submit(session, Priority::Normal, 1, true);

    // the dump-cell id protocol is live on 1.1.x even without the 1.2
    // init program: buffers strictly before the executing one are done
    h.raise(0, IRQ_JMPD, b2);
    assert_eq!(h.vcmd.wait_cmdbuf(session, b1, &cancel).unwrap(), ExecStatus::Ok);

    h.raise(0, IRQ_JMPD, 0);
    assert_eq!(h.vcmd.wait_cmdbuf(session, b2, &cancel).unwrap(), ExecStatus::Ok);
    h.vcmd.release_cmdbuf(session, b1).unwrap();
    h.vcmd.release_cmdbuf(session, b2).unwrap();
    h.vcmd.close_session(session).unwrap();
}
