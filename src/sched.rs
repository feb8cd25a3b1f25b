//! Command-buffer lifecycle and core selection.
//!
//! One [`TypeSched`] exists per module type present in the configuration and
//! owns that type's cores plus the admission lock serializing link, abort
//! and release against each other. Core selection runs four passes in order
//! and takes the first hit:
//!
//! 1. a core reporting IDLE, round-robin from a per-type cursor
//! 2. a core whose queue tail has already run to completion
//! 3. a core whose hardware-consumed count caught up with the software
//!    ready count
//! 4. the core with the smallest total remaining cost, later cores winning
//!    ties
//!
//! High-priority work skips all four: it picks the least-loaded core,
//! aborts it, and splices in ahead of every normal-priority buffer.

use alloc::vec::Vec;

use spin::Mutex;

use crate::cmdbuf::{CmdbufFlags, CmdbufObj, CmdbufTable, ExecStatus, SessionId, NIL};
use crate::config::{ModuleType, Priority, VcmdConfig, CMDBUF_SLOT_SIZE};
use crate::err::VcmdError;
use crate::hw::{CoreDev, WorkingState};
use crate::ins::{self, Terminator};
use crate::ledger::LedgerList;
use crate::osal::{CancelToken, Osal};
use crate::pool::CmdbufPool;
use crate::registers::consts::REG_CMDBUF_RDY_NUM;
use crate::registers::mirror::HWIF_CMDBUF_RDY_NUM;

/// Round-robin cursor, guarded by the admission lock it lives in.
struct Cursor {
    next: usize,
}

/// Per-module-type scheduling state.
pub struct TypeSched {
    pub module_type: ModuleType,
    pub cores: Vec<CoreDev>,
    sem: Mutex<Cursor>,
}

impl TypeSched {
    pub fn new(module_type: ModuleType, cores: Vec<CoreDev>) -> Self {
        Self {
            module_type,
            cores,
            sem: Mutex::new(Cursor { next: 0 }),
        }
    }

    fn remaining_cost(&self, core: &CoreDev, table: &CmdbufTable) -> u64 {
        let state = core.lock();
        let mut total = 0;
        let mut cur = state.queue.head;
        while cur != NIL {
            match table.get(cur) {
                Some(o) => {
                    if !o.run_done() {
                        total += o.estimated_cost;
                    }
                    cur = o.next;
                }
                None => break,
            }
        }
        total
    }

    /// Normal-priority selection passes, run with the admission lock held.
    fn select_core(&self, cursor: &mut Cursor, table: &CmdbufTable, pool: &CmdbufPool) -> usize {
        let n = self.cores.len();

        // pass 1: idle core, round-robin
        for i in 0..n {
            let idx = (cursor.next + i) % n;
            if self.cores[idx].lock().working == WorkingState::Idle {
                cursor.next = (idx + 1) % n;
                return idx;
            }
        }

        // pass 2: queue tail already completed
        for (idx, core) in self.cores.iter().enumerate() {
            let state = core.lock();
            let tail = state.queue.tail;
            if tail != NIL && table.get(tail).map(|o| o.run_done()).unwrap_or(false) {
                return idx;
            }
        }

        // pass 3: hardware consumed everything software handed it
        for (idx, core) in self.cores.iter().enumerate() {
            let rdy = core.lock().sw_cmdbuf_rdy_num;
            if rdy != 0 && core.hw_exe_count(pool) >= rdy {
                return idx;
            }
        }

        // pass 4: least total remaining cost, `<=` so later cores win ties
        let mut best = 0;
        let mut best_cost = u64::MAX;
        for (idx, core) in self.cores.iter().enumerate() {
            let cost = self.remaining_cost(core, table);
            if cost <= best_cost {
                best = idx;
                best_cost = cost;
            }
        }
        best
    }

    /// Least-loaded core for high-priority insertion. The buffer currently
    /// under the hardware will finish (or be aborted) regardless of where
    /// the new work lands, so its cost does not count against the choice.
    fn least_loaded(&self, table: &CmdbufTable) -> usize {
        let mut best = 0;
        let mut best_cost = u64::MAX;
        for (idx, core) in self.cores.iter().enumerate() {
            let mut cost = self.remaining_cost(core, table);
            let state = core.lock();
            if state.working != WorkingState::Idle {
                if let Some(head) = table.get(state.queue.head) {
                    if !head.run_done() {
                        cost = cost.saturating_sub(head.estimated_cost);
                    }
                }
            }
            drop(state);
            if cost <= best_cost {
                best = idx;
                best_cost = cost;
            }
        }
        best
    }

    pub fn core(&self, global_id: u16) -> Option<&CoreDev> {
        self.cores.iter().find(|c| c.global_id == global_id)
    }
}

/// Abort a working core and spin until the abort interrupt has driven it to
/// IDLE. Bounded; a core that never drains is reported as [`VcmdError::Timeout`].
fn abort_and_drain<O: Osal>(
    core: &CoreDev,
    osal: &O,
    cfg: &VcmdConfig,
) -> Result<(), VcmdError> {
    {
        let mut state = core.lock();
        if state.working == WorkingState::Idle {
            return Ok(());
        }
        core.trigger_abort(&mut state, true);
    }
    for _ in 0..cfg.abort_poll_count {
        if core.lock().working == WorkingState::Idle {
            return Ok(());
        }
        osal.msleep(cfg.abort_poll_interval_ms);
    }
    error!(
        "vcmd core {}: abort did not reach idle, hardware stuck",
        core.global_id
    );
    Err(VcmdError::Timeout)
}

/// All per-type schedulers, indexed by module type.
pub struct Scheduler {
    types: Vec<Option<TypeSched>>,
}

impl Scheduler {
    pub fn new(mut scheds: Vec<TypeSched>) -> Self {
        let mut types: Vec<Option<TypeSched>> = (0..crate::config::MAX_MODULE_TYPES)
            .map(|_| None)
            .collect();
        for ts in scheds.drain(..) {
            let idx = ts.module_type.index();
            types[idx] = Some(ts);
        }
        Self { types }
    }

    pub fn of(&self, ty: ModuleType) -> Result<&TypeSched, VcmdError> {
        self.types[ty.index()].as_ref().ok_or(VcmdError::InvalidArgument)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TypeSched> {
        self.types.iter().filter_map(|t| t.as_ref())
    }

    /// Reserve a pool slot and charge its estimated cost to the session.
    /// Blocks (polling) while the session is over its cost ceiling or the
    /// pool is exhausted; cancellation reverts the charge.
    #[allow(clippy::too_many_arguments)]
    pub fn reserve<O: Osal>(
        &self,
        osal: &O,
        table: &CmdbufTable,
        pool: &CmdbufPool,
        ledger: &LedgerList,
        session: SessionId,
        module_type: ModuleType,
        priority: Priority,
        estimated_cost: u64,
        cancel: &CancelToken,
    ) -> Result<u16, VcmdError> {
        self.of(module_type)?;
        ledger.charge(session, estimated_cost)?;
        if let Err(e) = ledger.wait_under_ceiling(osal, session, cancel) {
            ledger.credit(session, estimated_cost);
            return Err(e);
        }
        let slot = loop {
            if let Some(slot) = pool.allocate() {
                break slot;
            }
            if cancel.is_cancelled() {
                ledger.credit(session, estimated_cost);
                return Err(VcmdError::Interrupted);
            }
            osal.udelay(100);
        };
        let obj = CmdbufObj::new(slot, module_type, priority, estimated_cost, session);
        let id = obj.id;
        table.insert(obj);
        trace!("reserved cmdbuf {} for session {:?}", id, session);
        Ok(id)
    }

    /// Validate a filled buffer, pick a core, append (or splice, for high
    /// priority) and make sure the hardware will get to it.
    #[allow(clippy::too_many_arguments)]
    pub fn link_and_run<O: Osal>(
        &self,
        osal: &O,
        table: &CmdbufTable,
        pool: &CmdbufPool,
        cfg: &VcmdConfig,
        session: SessionId,
        id: u16,
        filled_bytes: u32,
    ) -> Result<u16, VcmdError> {
        let ty = table.get(id).ok_or(VcmdError::InvalidArgument)?.module_type;
        let ts = self.of(ty)?;
        let ceiling = cfg.coalesce_ceiling(ty);
        let mut cursor = ts.sem.lock();

        // state checks run under the admission lock; of two concurrent
        // submits of the same id, the loser sees DATA_LOADED already set
        let obj = table.get(id).ok_or(VcmdError::InvalidArgument)?;
        if obj.owner != session {
            return Err(VcmdError::NotOwner);
        }
        if obj.module_type != ts.module_type
            || obj.core_id.is_some()
            || obj.flags.contains(CmdbufFlags::DATA_LOADED)
        {
            return Err(VcmdError::InvalidArgument);
        }
        if filled_bytes == 0
            || filled_bytes % 4 != 0
            || filled_bytes as usize > CMDBUF_SLOT_SIZE
        {
            return Err(VcmdError::InvalidArgument);
        }

        let filled_words = filled_bytes as usize / 4;
        let words = unsafe { core::slice::from_raw_parts(obj.slot.cmd_virt, filled_words) };
        let mut flags = CmdbufFlags::DATA_LOADED;
        match ins::parse_terminator(words, filled_words) {
            Some(Terminator::End) => flags.insert(CmdbufFlags::HAS_END_OPCODE),
            Some(Terminator::Jmp(tail)) => {
                if !tail.ie {
                    flags.insert(CmdbufFlags::NO_NORMAL_INT);
                }
            }
            None => return Err(VcmdError::MalformedCmdbuf),
        }
        table.update(id, |o| {
            o.filled_bytes = filled_bytes;
            o.flags.insert(flags);
        });
        pool.confirm_writes();

        if obj.priority == Priority::High {
            let idx = ts.least_loaded(table);
            let core = &ts.cores[idx];
            abort_and_drain(core, osal, cfg)?;
            let mut state = core.lock();
            state.sw_abort = false;
            // splice point: the first normal-priority or already-completed
            // node; earlier high-priority work keeps its place
            let mut pos = state.queue.head;
            while pos != NIL {
                match table.get(pos) {
                    Some(o) if o.priority == Priority::Normal || o.run_done() => break,
                    Some(o) => pos = o.next,
                    None => break,
                }
            }
            if pos == NIL {
                state.queue.push_tail(table, id);
            } else {
                state.queue.insert_before(table, pos, id);
            }
            table.update(id, |o| o.core_id = Some(core.global_id));
            core.recount_rdy(&mut state, table);
            state.duration_without_int = 0;
            let head = state.queue.head;
            core.link_chain(&mut state, table, head, ceiling);
            core.restart(&mut state, table, cfg.timeout_cycles);
            debug!(
                "cmdbuf {} spliced high-priority onto core {}",
                id, core.global_id
            );
            return Ok(core.global_id);
        }

        let idx = ts.select_core(&mut cursor, table, pool);
        let core = &ts.cores[idx];
        let mut state = core.lock();
        let prev_tail = state.queue.tail;
        state.queue.push_tail(table, id);
        table.update(id, |o| o.core_id = Some(core.global_id));
        let from = if prev_tail != NIL { prev_tail } else { id };
        core.link_chain(&mut state, table, from, ceiling);
        match state.working {
            WorkingState::Idle => core.start(&mut state, table, cfg.timeout_cycles),
            _ => {
                // hardware is running: republish the ready count so it can
                // see past its old chain end
                let rdy = state.sw_cmdbuf_rdy_num;
                state.mirror.set(HWIF_CMDBUF_RDY_NUM, rdy);
                state.mirror.flush_word(&core.regs, REG_CMDBUF_RDY_NUM);
            }
        }
        trace!("cmdbuf {} linked onto core {}", id, core.global_id);
        Ok(core.global_id)
    }

    /// Block (polling) until one specific buffer has run, and report how it
    /// finished.
    pub fn wait_single<O: Osal>(
        &self,
        osal: &O,
        table: &CmdbufTable,
        session: SessionId,
        id: u16,
        cancel: &CancelToken,
    ) -> Result<ExecStatus, VcmdError> {
        let obj = table.get(id).ok_or(VcmdError::InvalidArgument)?;
        if obj.owner != session {
            return Err(VcmdError::NotOwner);
        }
        loop {
            match table.get(id) {
                Some(o) if o.run_done() => return Ok(o.exec_status),
                Some(_) => {}
                None => return Err(VcmdError::InvalidArgument),
            }
            if cancel.is_cancelled() {
                return Err(VcmdError::Interrupted);
            }
            osal.udelay(100);
        }
    }

    /// Block until any of the session's buffers has run; bounded by the
    /// configured deadline.
    pub fn wait_any<O: Osal>(
        &self,
        osal: &O,
        table: &CmdbufTable,
        cfg: &VcmdConfig,
        session: SessionId,
        cancel: &CancelToken,
    ) -> Result<u16, VcmdError> {
        let start = osal.get_time_us();
        loop {
            for id in table.owned_by(session) {
                if table.get(id).map(|o| o.run_done()).unwrap_or(false) {
                    return Ok(id);
                }
            }
            if cancel.is_cancelled() {
                return Err(VcmdError::Interrupted);
            }
            if osal.timeout_check(start, cfg.any_wait_timeout_ms * 1000) {
                return Err(VcmdError::Timeout);
            }
            osal.udelay(100);
        }
    }

    /// Return one buffer to the pool and credit its cost back. Completed
    /// buffers free immediately; in-flight buffers are tagged for removal
    /// and the interrupt handler frees them the moment they complete.
    /// Releasing an id twice is a no-op.
    pub fn release(
        &self,
        table: &CmdbufTable,
        pool: &CmdbufPool,
        ledger: &LedgerList,
        session: SessionId,
        id: u16,
    ) -> Result<(), VcmdError> {
        let obj = match table.get(id) {
            Some(o) => o,
            None => return Ok(()),
        };
        if obj.owner != session {
            return Err(VcmdError::NotOwner);
        }

        let core_id = match obj.core_id {
            None => {
                // never linked, nothing in any queue
                table.remove(id);
                pool.free(id);
                ledger.credit(obj.owner, obj.estimated_cost);
                return Ok(());
            }
            Some(c) => c,
        };
        let ts = self.of(obj.module_type)?;
        let _sem = ts.sem.lock();
        let core = ts.core(core_id).ok_or(VcmdError::Internal)?;
        let mut state = core.lock();
        if let Some(o) = table.get(id) {
            if o.run_done() {
                // the done prefix is already delinked by the ISR; unlink
                // covers the buffer being released out of order
                if o.prev != NIL || o.next != NIL || state.queue.head == id {
                    state.queue.unlink(table, id);
                }
                table.remove(id);
                pool.free(id);
                ledger.credit(o.owner, o.estimated_cost);
            } else {
                table.update(id, |o| o.flags.insert(CmdbufFlags::NEED_REMOVE));
            }
        }
        Ok(())
    }

    /// Tear down everything a dying session still owns: free what is done,
    /// excise what is pending, abort what is executing. Other sessions'
    /// buffers on the same cores keep their relative order and get
    /// restarted.
    pub fn teardown<O: Osal>(
        &self,
        osal: &O,
        table: &CmdbufTable,
        pool: &CmdbufPool,
        ledger: &LedgerList,
        cfg: &VcmdConfig,
        session: SessionId,
    ) -> Result<(), VcmdError> {
        for ts in self.iter() {
            let _sem = ts.sem.lock();
            let ceiling = cfg.coalesce_ceiling(ts.module_type);
            for core in &ts.cores {
                let has_victim = {
                    let state = core.lock();
                    state
                        .queue
                        .collect(table)
                        .iter()
                        .any(|&n| table.get(n).map(|o| o.owner == session).unwrap_or(false))
                };
                if !has_victim {
                    continue;
                }
                // an executing buffer cannot be excised under the hardware;
                // park the core first
                abort_and_drain(core, osal, cfg)?;
                let mut state = core.lock();
                state.sw_abort = false;
                let nodes = state.queue.collect(table);
                for n in nodes {
                    let o = match table.get(n) {
                        Some(o) if o.owner == session => o,
                        _ => continue,
                    };
                    state.queue.unlink(table, n);
                    table.remove(n);
                    pool.free(n);
                    ledger.credit(o.owner, o.estimated_cost);
                }
                core.recount_rdy(&mut state, table);
                state.duration_without_int = 0;
                let head = state.queue.head;
                core.link_chain(&mut state, table, head, ceiling);
                core.restart(&mut state, table, cfg.timeout_cycles);
            }
        }
        // buffers that never reached a core, plus completed ones the ISR
        // already delinked
        for id in table.owned_by(session) {
            if let Some(o) = table.remove(id) {
                pool.free(id);
                ledger.credit(o.owner, o.estimated_cost);
            }
        }
        ledger.close(session);
        Ok(())
    }
}
