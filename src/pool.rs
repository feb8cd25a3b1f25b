//! Fixed-slab DMA pool backing the command buffers.
//!
//! Three regions, allocated once at construction and exposed to user space
//! via mmap: the command-buffer slab, the parallel status (register
//! readback) slab, and the per-core register-dump area the hardware mirrors
//! its progress into on 1.1+ parts. Slot selection is a circular scan from a
//! moving cursor; slot 0 is reserved because buffer id 0 doubles as the
//! "none" interrupt vector.

use alloc::vec;
use alloc::vec::Vec;

use dma_api::{DVec, Direction};
use spin::Mutex;

use crate::config::{CMDBUF_SLOT_SIZE, CORE_DUMP_WORDS, STATUS_SLOT_SIZE};

/// Addresses handed to a freshly allocated command buffer. The pool owns the
/// memory; holders reference it by id.
#[derive(Debug, Clone, Copy)]
pub struct CmdbufSlot {
    pub id: u16,
    pub cmd_virt: *mut u32,
    pub cmd_bus: u64,
    pub status_virt: *mut u32,
    pub status_bus: u64,
}

struct PoolInner {
    used: Vec<u64>,
    cursor: usize,
    free_count: usize,
}

pub struct CmdbufPool {
    cmd_slab: DVec<u8>,
    status_slab: DVec<u8>,
    dump_area: DVec<u32>,
    // CPU base pointers of the slabs above, captured once; the allocations
    // never move for the lifetime of the pool
    cmd_base: *mut u8,
    status_base: *mut u8,
    dump_base: *mut u32,
    count: usize,
    inner: Mutex<PoolInner>,
}

unsafe impl Send for CmdbufPool {}
unsafe impl Sync for CmdbufPool {}

impl CmdbufPool {
    /// Allocate the slabs. Runs once at device bring-up; DMA slab
    /// exhaustion at init time is unrecoverable.
    pub fn new(count: usize, num_cores: usize) -> Self {
        assert!(count >= 2, "pool needs at least one usable slot besides slot 0");
        let cmd_slab: DVec<u8> =
            DVec::zeros(count * CMDBUF_SLOT_SIZE, 0x1000, Direction::Bidirectional).unwrap();
        let status_slab: DVec<u8> =
            DVec::zeros(count * STATUS_SLOT_SIZE, 0x1000, Direction::Bidirectional).unwrap();
        let dump_area: DVec<u32> = DVec::zeros(
            num_cores.max(1) * CORE_DUMP_WORDS,
            0x1000,
            Direction::Bidirectional,
        )
        .unwrap();
        let cmd_base = cmd_slab.as_ref().as_ptr() as *mut u8;
        let status_base = status_slab.as_ref().as_ptr() as *mut u8;
        let dump_base = dump_area.as_ref().as_ptr() as *mut u32;

        let words = count.div_ceil(64);
        let mut used = vec![0u64; words];
        used[0] |= 1; // slot 0 reserved
        Self {
            cmd_slab,
            status_slab,
            dump_area,
            cmd_base,
            status_base,
            dump_base,
            count,
            inner: Mutex::new(PoolInner {
                used,
                cursor: 1,
                free_count: count - 1,
            }),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.count
    }

    /// Claim a free slot, or `None` when the pool is exhausted. Never blocks;
    /// the admission layer polls on top of this.
    pub fn allocate(&self) -> Option<CmdbufSlot> {
        let mut inner = self.inner.lock();
        if inner.free_count == 0 {
            return None;
        }
        let start = inner.cursor;
        let mut idx = start;
        loop {
            if idx == 0 {
                idx = 1;
            }
            if inner.used[idx / 64] & (1 << (idx % 64)) == 0 {
                inner.used[idx / 64] |= 1 << (idx % 64);
                inner.free_count -= 1;
                inner.cursor = (idx + 1) % self.count;
                return Some(self.slot(idx as u16));
            }
            idx = (idx + 1) % self.count;
            if idx == start {
                // free_count said otherwise; bitmap is authoritative
                return None;
            }
        }
    }

    /// Mark a slot free again. Double-free is a caller bug and traps in
    /// debug builds.
    pub fn free(&self, id: u16) {
        let idx = id as usize;
        assert!(idx != 0 && idx < self.count);
        let mut inner = self.inner.lock();
        debug_assert!(inner.used[idx / 64] & (1 << (idx % 64)) != 0);
        inner.used[idx / 64] &= !(1 << (idx % 64));
        inner.free_count += 1;
    }

    fn slot(&self, id: u16) -> CmdbufSlot {
        let idx = id as usize;
        CmdbufSlot {
            id,
            cmd_virt: unsafe { self.cmd_base.add(idx * CMDBUF_SLOT_SIZE) } as *mut u32,
            cmd_bus: self.cmd_slab.bus_addr() + (idx * CMDBUF_SLOT_SIZE) as u64,
            status_virt: unsafe { self.status_base.add(idx * STATUS_SLOT_SIZE) } as *mut u32,
            status_bus: self.status_slab.bus_addr() + (idx * STATUS_SLOT_SIZE) as u64,
        }
    }

    /// Push CPU-written payload out to where the hardware will read it.
    /// Called once per buffer, after the caller reports it filled.
    pub fn confirm_writes(&self) {
        self.cmd_slab.confirm_write_all();
    }

    /// Pool base addresses for the mmap/parameter interface.
    pub fn cmd_base_bus(&self) -> u64 {
        self.cmd_slab.bus_addr()
    }

    pub fn status_base_bus(&self) -> u64 {
        self.status_slab.bus_addr()
    }

    pub fn dump_base_bus(&self) -> u64 {
        self.dump_area.bus_addr()
    }

    /// CPU pointer into one core's register-dump cell. The hardware writes
    /// these cells; reads must be volatile.
    pub fn dump_cell_ptr(&self, core: usize, cell: usize) -> *mut u32 {
        debug_assert!(cell < CORE_DUMP_WORDS);
        unsafe { self.dump_base.add(core * CORE_DUMP_WORDS + cell) }
    }

    pub fn read_dump_cell(&self, core: usize, cell: usize) -> u32 {
        unsafe { self.dump_cell_ptr(core, cell).read_volatile() }
    }

    pub fn write_dump_cell(&self, core: usize, cell: usize, value: u32) {
        unsafe { self.dump_cell_ptr(core, cell).write_volatile(value) }
    }
}
