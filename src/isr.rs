//! Interrupt classification and recovery.
//!
//! The handler body runs entirely under the core's spinlock, never blocks
//! and never allocates. Causes are tested in a fixed priority order, first
//! match wins: reset, abort, bus error, timeout, command error, end-command,
//! normal completion. Every path that completes at least one buffer leaves
//! its `RUN_DONE` flag set for the polling wait paths to observe.

use crate::cmdbuf::{CmdbufFlags, CmdbufTable, ExecStatus, NIL};
use crate::config::HwGeneration;
use crate::err::VcmdError;
use crate::hw::{CoreDev, CoreState, WorkingState};
use crate::ledger::LedgerList;
use crate::pool::CmdbufPool;
use crate::registers::consts::*;

/// Outcome of one interrupt dispatch, distinguishing spurious/shared-line
/// interrupts from real ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqResult {
    Handled,
    NotMine,
}

/// Mark `through` and every not-yet-done buffer before it as done. The
/// faulting buffer (if any) gets its distinct status; the rest of the prefix
/// completed fine.
fn mark_prefix_done(
    state: &mut CoreState,
    table: &CmdbufTable,
    through: u16,
    fault: Option<(u16, ExecStatus)>,
) -> usize {
    if through == NIL {
        return 0;
    }
    let mut marked = 0;
    let mut cur = state.queue.head;
    loop {
        if cur == NIL {
            break;
        }
        let was_done = table
            .update(cur, |o| {
                let done = o.run_done();
                if !done {
                    o.flags.insert(CmdbufFlags::RUN_DONE);
                    o.flags.remove(CmdbufFlags::DATA_LINKED);
                    o.exec_status = match fault {
                        Some((id, status)) if id == o.id => status,
                        _ => ExecStatus::Ok,
                    };
                }
                (done, o.next)
            })
            .unwrap_or((true, NIL));
        if !was_done.0 {
            marked += 1;
            state.sw_cmdbuf_rdy_num = state.sw_cmdbuf_rdy_num.saturating_sub(1);
        }
        if cur == through {
            break;
        }
        cur = was_done.1;
    }
    marked
}

/// Unlink the run-done prefix from the queue. Buffers the owner already
/// released while they were in flight carry `NEED_REMOVE` and are freed
/// here, credit included; the rest stay in the global table until their
/// owner releases them.
fn delink_done_prefix(
    state: &mut CoreState,
    table: &CmdbufTable,
    pool: &CmdbufPool,
    ledger: &LedgerList,
) {
    loop {
        let head = state.queue.head;
        if head == NIL {
            break;
        }
        match table.get(head) {
            Some(o) if o.run_done() => {
                state.queue.unlink(table, head);
                if o.flags.contains(CmdbufFlags::NEED_REMOVE) {
                    table.remove(head);
                    pool.free(head);
                    ledger.credit(o.owner, o.estimated_cost);
                }
            }
            _ => break,
        }
    }
}

/// Relink the remainder and restart the core from its new head.
fn relink_restart(
    core: &CoreDev,
    state: &mut CoreState,
    table: &CmdbufTable,
    coalesce_ceiling: u64,
    timeout_cycles: u32,
) {
    core.recount_rdy(state, table);
    let head = state.queue.head;
    core.link_chain(state, table, head, coalesce_ceiling);
    core.restart(state, table, timeout_cycles);
}

/// Per-core interrupt service routine.
pub fn irq_handle(
    core: &CoreDev,
    table: &CmdbufTable,
    pool: &CmdbufPool,
    ledger: &LedgerList,
    coalesce_ceiling: u64,
    timeout_cycles: u32,
) -> Result<IrqResult, VcmdError> {
    let mut state = core.lock();
    if state.queue.is_empty() {
        return Ok(IrqResult::NotMine);
    }
    let status = core.regs.read_word(REG_IRQ_STATUS);
    if status == 0 {
        return Ok(IrqResult::NotMine);
    }
    core.regs.write_word(REG_IRQ_STATUS, status);

    if status & IRQ_RESET != 0 && core.gen == HwGeneration::V1_0 {
        // Nothing after this point executed. Drop the hardware-visible
        // chain state and rebuild it from the software queue.
        debug!("vcmd core {}: reset interrupt", core.global_id);
        let mut cur = state.queue.head;
        while cur != NIL {
            cur = table
                .update(cur, |o| {
                    o.flags.remove(CmdbufFlags::DATA_LINKED);
                    o.next
                })
                .unwrap_or(NIL);
        }
        state.sw_cmdbuf_rdy_num = 0;
        state.duration_without_int = 0;
        state.working = WorkingState::Idle;
        relink_restart(core, &mut state, table, coalesce_ceiling, timeout_cycles);
        return Ok(IrqResult::Handled);
    }

    if status & IRQ_ABORT != 0 {
        let exec = core.executing_node(&state, table, pool)?;
        if let Some(id) = exec {
            mark_prefix_done(&mut state, table, id, None);
        }
        delink_done_prefix(&mut state, table, pool, ledger);
        state.working = WorkingState::Idle;
        if state.sw_abort {
            // software-requested: the requester (high-priority insertion or
            // teardown) reprograms and restarts the core itself
            debug!("vcmd core {}: software abort reached idle", core.global_id);
        } else {
            relink_restart(core, &mut state, table, coalesce_ceiling, timeout_cycles);
        }
        return Ok(IrqResult::Handled);
    }

    if status & IRQ_BUSERR != 0 {
        let exec = core.executing_node(&state, table, pool)?;
        if let Some(id) = exec {
            warn!("vcmd core {}: bus error at cmdbuf {}", core.global_id, id);
            mark_prefix_done(&mut state, table, id, Some((id, ExecStatus::BusErr)));
        }
        delink_done_prefix(&mut state, table, pool, ledger);
        state.working = WorkingState::Idle;
        relink_restart(core, &mut state, table, coalesce_ceiling, timeout_cycles);
        return Ok(IrqResult::Handled);
    }

    if status & IRQ_TIMEOUT != 0 {
        // Anchored one node earlier than abort/buserr: timeout means "the
        // node after the last known-good one", so the matched node itself is
        // not marked done.
        let exec = core.executing_node(&state, table, pool)?;
        let anchor = exec
            .and_then(|id| table.get(id))
            .map(|o| o.prev)
            .unwrap_or(NIL);
        warn!(
            "vcmd core {}: execution timeout (executing {:?})",
            core.global_id, exec
        );
        mark_prefix_done(&mut state, table, anchor, None);
        delink_done_prefix(&mut state, table, pool, ledger);
        core.reset_asic(&mut state);
        relink_restart(core, &mut state, table, coalesce_ceiling, timeout_cycles);
        return Ok(IrqResult::Handled);
    }

    if status & IRQ_CMDERR != 0 {
        let exec = core.executing_node(&state, table, pool)?;
        if let Some(id) = exec {
            warn!(
                "vcmd core {}: command error at cmdbuf {}",
                core.global_id, id
            );
            mark_prefix_done(&mut state, table, id, Some((id, ExecStatus::CmdErr)));
        }
        delink_done_prefix(&mut state, table, pool, ledger);
        state.working = WorkingState::Idle;
        relink_restart(core, &mut state, table, coalesce_ceiling, timeout_cycles);
        return Ok(IrqResult::Handled);
    }

    if status & IRQ_ENDCMD != 0 {
        // Legacy path for buffers that terminate with END instead of a JMP:
        // localized by flag scan, not by address/id.
        let mut cur = state.queue.head;
        let mut target = NIL;
        while cur != NIL {
            match table.get(cur) {
                Some(o) if o.flags.contains(CmdbufFlags::HAS_END_OPCODE) && !o.run_done() => {
                    target = cur;
                    break;
                }
                Some(o) => cur = o.next,
                None => break,
            }
        }
        mark_prefix_done(&mut state, table, target, None);
        delink_done_prefix(&mut state, table, pool, ledger);
        state.working = WorkingState::Idle;
        relink_restart(core, &mut state, table, coalesce_ceiling, timeout_cycles);
        return Ok(IrqResult::Handled);
    }

    // Normal completion. Legacy hardware names the completed buffer in the
    // INTCMD vector; newer hardware implies it through the executing id:
    // everything before the currently-executing buffer is done. No restart,
    // the hardware keeps walking its chain on its own.
    let marked = if core.gen <= HwGeneration::V1_1 && status & IRQ_INTCMD_MASK != 0 {
        let id = (status >> IRQ_INTCMD_SHIFT) as u16;
        if !table.contains(id) {
            error!("vcmd core {}: INTCMD vector {} unknown", core.global_id, id);
            return Err(VcmdError::Internal);
        }
        mark_prefix_done(&mut state, table, id, None)
    } else {
        match core.executing_node(&state, table, pool)? {
            Some(id) => {
                let before = table.get(id).map(|o| o.prev).unwrap_or(NIL);
                mark_prefix_done(&mut state, table, before, None)
            }
            None => {
                // ran off the end of the chain
                let tail = state.queue.tail;
                let n = mark_prefix_done(&mut state, table, tail, None);
                state.working = WorkingState::Idle;
                n
            }
        }
    };
    delink_done_prefix(&mut state, table, pool, ledger);
    if marked == 0 {
        debug!(
            "vcmd core {}: completion interrupt with no new work done",
            core.global_id
        );
    }
    Ok(IrqResult::Handled)
}
