//! Per-session resource accounting.
//!
//! Every open device session carries a ledger entry summing the estimated
//! execution cost of its not-yet-released buffers. Reservation charges the
//! cost first and then waits for the total to fall back under the ceiling;
//! that ordering is the backpressure mechanism, so a cancelled wait must
//! revert the charge (the charge/revert pair is transactional here).

use alloc::vec::Vec;

use spin::Mutex;

use crate::cmdbuf::{SessionId, KERNEL_SESSION};
use crate::err::VcmdError;
use crate::osal::{CancelToken, Osal};

#[derive(Debug)]
struct Entry {
    session: SessionId,
    outstanding: u64,
}

pub struct LedgerList {
    entries: Mutex<Vec<Entry>>,
    ceiling: u64,
}

impl LedgerList {
    pub fn new(ceiling: u64) -> Self {
        let mut entries = Vec::new();
        // Permanent kernel record for internally generated buffers.
        entries.push(Entry {
            session: KERNEL_SESSION,
            outstanding: 0,
        });
        Self {
            entries: Mutex::new(entries),
            ceiling,
        }
    }

    pub fn open(&self, session: SessionId) {
        let mut entries = self.entries.lock();
        if entries.iter().any(|e| e.session == session) {
            warn!("ledger entry for session {:?} already open", session);
            return;
        }
        entries.push(Entry {
            session,
            outstanding: 0,
        });
    }

    /// Drop a session's entry. The caller has already reaped the session's
    /// buffers, so a non-zero residue indicates a leak and is logged.
    pub fn close(&self, session: SessionId) {
        if session == KERNEL_SESSION {
            return;
        }
        let mut entries = self.entries.lock();
        if let Some(pos) = entries.iter().position(|e| e.session == session) {
            let entry = entries.swap_remove(pos);
            if entry.outstanding != 0 {
                warn!(
                    "session {:?} closed with {} cost units outstanding",
                    session, entry.outstanding
                );
            }
        }
    }

    /// Add `cost` to the session's outstanding total. Fails when the session
    /// is unknown (device node not opened through the session API).
    pub fn charge(&self, session: SessionId, cost: u64) -> Result<(), VcmdError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .iter_mut()
            .find(|e| e.session == session)
            .ok_or(VcmdError::InvalidArgument)?;
        entry.outstanding = entry.outstanding.saturating_add(cost);
        Ok(())
    }

    /// Subtract `cost`; saturates rather than underflows so a double credit
    /// cannot corrupt the gate.
    pub fn credit(&self, session: SessionId, cost: u64) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.iter_mut().find(|e| e.session == session) {
            entry.outstanding = entry.outstanding.saturating_sub(cost);
        }
    }

    pub fn outstanding(&self, session: SessionId) -> u64 {
        self.entries
            .lock()
            .iter()
            .find(|e| e.session == session)
            .map(|e| e.outstanding)
            .unwrap_or(0)
    }

    /// Block until the session's total is back under the ceiling. The cost
    /// was already charged, so a single request larger than the ceiling waits
    /// for its own charge; callers escape via the cancellation token.
    pub fn wait_under_ceiling<O: Osal>(
        &self,
        osal: &O,
        session: SessionId,
        cancel: &CancelToken,
    ) -> Result<(), VcmdError> {
        loop {
            if self.outstanding(session) <= self.ceiling {
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(VcmdError::Interrupted);
            }
            osal.udelay(100);
        }
    }
}
