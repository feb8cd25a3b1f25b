//! Command-buffer scheduler for VeriSilicon VC8000-family codec hardware.
//!
//! The hardware walks linked lists of command buffers on its own; this crate
//! owns the software side of that contract: a DMA-backed slab of fixed-size
//! buffer slots, per-core work queues stitched together with trailing JMP
//! instructions, multi-core load balancing with priority preemption, and the
//! interrupt classification needed to recover from aborts, faults and
//! timeouts without losing other sessions' work.
//!
//! The crate is platform-independent: MMIO mappings come in as raw pointers,
//! timing comes in through the [`Osal`] trait, and blocking paths poll
//! cooperatively with a [`CancelToken`] instead of sleeping on a kernel
//! waitqueue.

#![no_std]

extern crate alloc;
#[macro_use]
extern crate log;

use core::ptr::NonNull;

mod cmdbuf;
mod config;
mod err;
mod hw;
mod ins;
mod isr;
mod ledger;
mod osal;
mod params;
mod pool;
mod queue;
mod registers;
mod sched;

use alloc::vec::Vec;

pub use cmdbuf::{CmdbufFlags, CmdbufObj, ExecStatus, SessionId, KERNEL_SESSION, NIL};
pub use config::*;
pub use err::*;
pub use ins::{Instr, JmpTail, Terminator};
pub use isr::IrqResult;
pub use osal::*;
pub use params::{CmdbufParameter, VcmdParameter};
pub use pool::CmdbufSlot;

use cmdbuf::CmdbufTable;
use hw::CoreDev;
use ledger::LedgerList;
use pool::CmdbufPool;
use sched::{Scheduler, TypeSched};

/// The scheduler device: one instance per VC8000 subsystem, shared across
/// every session and the interrupt path.
pub struct Vcmd<O: Osal> {
    cfg: VcmdConfig,
    osal: O,
    pool: CmdbufPool,
    table: CmdbufTable,
    ledger: LedgerList,
    sched: Scheduler,
}

impl<O: Osal> Vcmd<O> {
    /// Bring up the scheduler over already-mapped register files, one base
    /// pointer per configured core, in configuration order.
    ///
    /// # Safety
    ///
    /// Every pointer in `bases` must be a valid MMIO mapping of the matching
    /// core's VCMD register file and stay mapped for the device's lifetime.
    pub unsafe fn new(
        bases: &[NonNull<u8>],
        cfg: VcmdConfig,
        osal: O,
    ) -> Result<Self, VcmdError> {
        if bases.len() != cfg.cores.len() || cfg.cores.is_empty() {
            return Err(VcmdError::InvalidArgument);
        }
        let pool = CmdbufPool::new(cfg.cmdbuf_count, cfg.cores.len());
        let table = CmdbufTable::new(cfg.cmdbuf_count);
        let ledger = LedgerList::new(cfg.budget_ceiling);

        let mut per_type: Vec<Vec<CoreDev>> = (0..MAX_MODULE_TYPES).map(|_| Vec::new()).collect();
        for (i, (desc, base)) in cfg.cores.iter().zip(bases.iter()).enumerate() {
            let core = unsafe { CoreDev::new(i as u16, *desc, *base) };
            per_type[desc.module_type.index()].push(core);
        }
        let scheds = ModuleType::ALL
            .iter()
            .filter_map(|&ty| {
                let cores = core::mem::take(&mut per_type[ty.index()]);
                if cores.is_empty() {
                    None
                } else {
                    Some(TypeSched::new(ty, cores))
                }
            })
            .collect();

        info!(
            "vcmd: {} cores, {} cmdbuf slots",
            cfg.cores.len(),
            cfg.cmdbuf_count
        );
        Ok(Self {
            cfg,
            osal,
            pool,
            table,
            ledger,
            sched: Scheduler::new(scheds),
        })
    }

    /// Register a session before it reserves anything.
    pub fn open_session(&self, session: SessionId) {
        self.ledger.open(session);
    }

    /// Tear a session down: free its completed buffers, excise its pending
    /// ones, abort the ones executing. Buffers of other sessions sharing the
    /// cores keep running in order.
    pub fn close_session(&self, session: SessionId) -> Result<(), VcmdError> {
        self.sched.teardown(
            &self.osal,
            &self.table,
            &self.pool,
            &self.ledger,
            &self.cfg,
            session,
        )
    }

    /// Shared-memory layout of the command-buffer pool.
    pub fn cmdbuf_parameter(&self) -> CmdbufParameter {
        CmdbufParameter {
            cmd_base_bus: self.pool.cmd_base_bus(),
            status_base_bus: self.pool.status_base_bus(),
            dump_base_bus: self.pool.dump_base_bus(),
            cmd_slot_size: CMDBUF_SLOT_SIZE as u32,
            status_slot_size: STATUS_SLOT_SIZE as u32,
            slot_count: self.pool.slot_count() as u32,
            cmd_total_size: (self.pool.slot_count() * CMDBUF_SLOT_SIZE) as u32,
        }
    }

    /// Hardware description of the cores serving one module type.
    pub fn vcmd_parameter(&self, ty: ModuleType) -> Result<VcmdParameter, VcmdError> {
        let ts = self.sched.of(ty)?;
        let first = ts.cores.first().ok_or(VcmdError::Internal)?;
        Ok(VcmdParameter::new(
            ty,
            ts.cores.len() as u16,
            first.regs.hw_id_raw(),
            first.gen,
            &first.desc,
        ))
    }

    /// Reserve one pool slot for the session, charging its estimated cost.
    /// Blocks while the session is over its cost ceiling or the pool is
    /// exhausted.
    pub fn reserve_cmdbuf(
        &self,
        session: SessionId,
        ty: ModuleType,
        priority: Priority,
        estimated_cost: u64,
        cancel: &CancelToken,
    ) -> Result<u16, VcmdError> {
        self.sched.reserve(
            &self.osal,
            &self.table,
            &self.pool,
            &self.ledger,
            session,
            ty,
            priority,
            estimated_cost,
            cancel,
        )
    }

    /// CPU-visible window of a reserved buffer, for filling in the payload.
    pub fn cmdbuf_slot(&self, session: SessionId, id: u16) -> Result<CmdbufSlot, VcmdError> {
        let obj = self.table.get(id).ok_or(VcmdError::InvalidArgument)?;
        if obj.owner != session {
            return Err(VcmdError::NotOwner);
        }
        Ok(obj.slot)
    }

    /// Hand a filled buffer to the scheduler. Returns the global id of the
    /// core it landed on.
    pub fn link_run_cmdbuf(
        &self,
        session: SessionId,
        id: u16,
        filled_bytes: u32,
    ) -> Result<u16, VcmdError> {
        self.sched.link_and_run(
            &self.osal,
            &self.table,
            &self.pool,
            &self.cfg,
            session,
            id,
            filled_bytes,
        )
    }

    /// Block until one specific buffer has run; reports how it finished.
    pub fn wait_cmdbuf(
        &self,
        session: SessionId,
        id: u16,
        cancel: &CancelToken,
    ) -> Result<ExecStatus, VcmdError> {
        self.sched
            .wait_single(&self.osal, &self.table, session, id, cancel)
    }

    /// Block until any of the session's buffers has run; returns its id.
    pub fn wait_any_cmdbuf(
        &self,
        session: SessionId,
        cancel: &CancelToken,
    ) -> Result<u16, VcmdError> {
        self.sched
            .wait_any(&self.osal, &self.table, &self.cfg, session, cancel)
    }

    /// Return a buffer to the pool and credit its cost back to the session.
    /// Safe to call twice; the second call is a no-op.
    pub fn release_cmdbuf(&self, session: SessionId, id: u16) -> Result<(), VcmdError> {
        self.sched
            .release(&self.table, &self.pool, &self.ledger, session, id)
    }

    /// Interrupt entry point for one core, addressed by global id.
    pub fn irq_handle(&self, core_global_id: u16) -> Result<IrqResult, VcmdError> {
        for ts in self.sched.iter() {
            if let Some(core) = ts.core(core_global_id) {
                return isr::irq_handle(
                    core,
                    &self.table,
                    &self.pool,
                    &self.ledger,
                    self.cfg.coalesce_ceiling(ts.module_type),
                    self.cfg.timeout_cycles,
                );
            }
        }
        Err(VcmdError::InvalidArgument)
    }

    /// Interrupt-less operation: sweep every core's status register once.
    /// Deployments without wired IRQ lines call this from a timer tick;
    /// tests call it to pump completions.
    pub fn polling_cmdbuf(&self) -> Result<(), VcmdError> {
        for ts in self.sched.iter() {
            for core in &ts.cores {
                isr::irq_handle(
                    core,
                    &self.table,
                    &self.pool,
                    &self.ledger,
                    self.cfg.coalesce_ceiling(ts.module_type),
                    self.cfg.timeout_cycles,
                )?;
            }
        }
        Ok(())
    }

    /// Run one NOP buffer through every core as a bring-up check. Uses the
    /// kernel session and the polling path, so it needs no IRQ wiring; call
    /// it after `new` when the hardware is expected to be alive.
    pub fn self_test(&self, cancel: &CancelToken) -> Result<(), VcmdError> {
        let mut ids = Vec::new();
        for ts in self.sched.iter() {
            for _ in 0..ts.cores.len() {
                let id = self.reserve_cmdbuf(KERNEL_SESSION, ts.module_type, Priority::Normal, 0, cancel)?;
                let slot = self.cmdbuf_slot(KERNEL_SESSION, id)?;
                let words =
                    unsafe { core::slice::from_raw_parts_mut(slot.cmd_virt, 2) };
                let mut off = Instr::Nop.encode(words);
                off += Instr::End.encode(&mut words[off..]);
                self.link_run_cmdbuf(KERNEL_SESSION, id, (off * 4) as u32)?;
                ids.push(id);
            }
        }
        let start = self.osal.get_time_us();
        let result = loop {
            self.polling_cmdbuf()?;
            if ids
                .iter()
                .all(|&id| self.table.get(id).map(|o| o.run_done()).unwrap_or(true))
            {
                break Ok(());
            }
            if cancel.is_cancelled() {
                break Err(VcmdError::Interrupted);
            }
            if self
                .osal
                .timeout_check(start, self.cfg.any_wait_timeout_ms * 1000)
            {
                error!("vcmd: self test did not complete");
                break Err(VcmdError::Timeout);
            }
            self.osal.udelay(100);
        };
        for id in ids {
            self.release_cmdbuf(KERNEL_SESSION, id)?;
        }
        result
    }
}
