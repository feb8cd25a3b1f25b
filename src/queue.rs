//! Per-core work queue: an index-linked FIFO threaded through the global
//! command-buffer table.
//!
//! Nodes link by buffer id (`prev`/`next` in `CmdbufObj`, [`NIL`] as the
//! sentinel), giving O(1) unlink-from-middle and insert-before without raw
//! pointers. Structural changes happen only with the owning core's lock
//! held; individual node updates additionally take that node's table shard
//! lock, one node at a time.

use crate::cmdbuf::{CmdbufTable, NIL};

#[derive(Debug, Clone, Copy)]
pub struct CoreQueue {
    pub head: u16,
    pub tail: u16,
    len: usize,
}

impl CoreQueue {
    pub const fn new() -> Self {
        Self {
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head == NIL
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn push_tail(&mut self, table: &CmdbufTable, id: u16) {
        debug_assert!(id != NIL);
        let old_tail = self.tail;
        table.update(id, |o| {
            o.prev = old_tail;
            o.next = NIL;
        });
        if old_tail == NIL {
            self.head = id;
        } else {
            table.update(old_tail, |o| o.next = id);
        }
        self.tail = id;
        self.len += 1;
    }

    /// Insert `id` immediately before `pos` (which must be a member).
    pub fn insert_before(&mut self, table: &CmdbufTable, pos: u16, id: u16) {
        debug_assert!(pos != NIL && id != NIL);
        let prev = table.get(pos).map(|o| o.prev).unwrap_or(NIL);
        table.update(id, |o| {
            o.prev = prev;
            o.next = pos;
        });
        table.update(pos, |o| o.prev = id);
        if prev == NIL {
            self.head = id;
        } else {
            table.update(prev, |o| o.next = id);
        }
        self.len += 1;
    }

    /// Remove `id` from the list; its own links are cleared.
    pub fn unlink(&mut self, table: &CmdbufTable, id: u16) {
        debug_assert!(id != NIL);
        let (prev, next) = match table.get(id) {
            Some(o) => (o.prev, o.next),
            None => return,
        };
        if prev == NIL {
            self.head = next;
        } else {
            table.update(prev, |o| o.next = next);
        }
        if next == NIL {
            self.tail = prev;
        } else {
            table.update(next, |o| o.prev = prev);
        }
        table.update(id, |o| {
            o.prev = NIL;
            o.next = NIL;
        });
        self.len -= 1;
    }

    pub fn next_of(&self, table: &CmdbufTable, id: u16) -> u16 {
        table.get(id).map(|o| o.next).unwrap_or(NIL)
    }

    /// Snapshot of the ids in FIFO order.
    pub fn collect(&self, table: &CmdbufTable) -> alloc::vec::Vec<u16> {
        let mut out = alloc::vec::Vec::with_capacity(self.len);
        let mut cur = self.head;
        while cur != NIL {
            out.push(cur);
            cur = self.next_of(table, cur);
            if out.len() > self.len {
                // cycle would mean corrupted links; stop rather than spin
                error!("core queue link cycle detected at id {}", cur);
                break;
            }
        }
        out
    }
}

impl Default for CoreQueue {
    fn default() -> Self {
        Self::new()
    }
}
