//! Command-buffer metadata and the global id-indexed lookup table.
//!
//! A `CmdbufObj` is pure metadata: the pool owns the DMA memory, the per-core
//! queue orders execution, and this table maps the u16 buffer id (which also
//! doubles as the hardware interrupt vector) to the object. The table is
//! sharded across 16 locks to keep ISR bookkeeping and process-context
//! submission off each other's necks.

use alloc::collections::btree_map::BTreeMap;
use alloc::vec::Vec;

use bitflags::bitflags;
use spin::Mutex;

use crate::config::{ModuleType, Priority};
use crate::pool::CmdbufSlot;

/// "no buffer" link value; id 0 is reserved by the pool.
pub const NIL: u16 = 0;

/// Owner of a command buffer: one open device session. Session 0 is the
/// permanent kernel session used for internally generated buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SessionId(pub u64);

pub const KERNEL_SESSION: SessionId = SessionId(0);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CmdbufFlags: u16 {
        /// Payload filled by the caller, trailing opcode validated.
        const DATA_LOADED = 1 << 0;
        /// Chained into a core's hardware-visible list.
        const DATA_LINKED = 1 << 1;
        /// Completion observed by the ISR.
        const RUN_DONE = 1 << 2;
        /// Owner released the buffer while it was still chained; the ISR
        /// frees it when it completes.
        const NEED_REMOVE = 1 << 3;
        /// Buffer terminates with END instead of a chain-capable JMP.
        const HAS_END_OPCODE = 1 << 4;
        /// Caller asked for its completion interrupt to be coalesced.
        const NO_NORMAL_INT = 1 << 5;
    }
}

/// Completion status recorded by the ISR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum ExecStatus {
    #[default]
    Ok = 0,
    CmdErr = 1,
    BusErr = 2,
}

#[derive(Debug, Clone, Copy)]
pub struct CmdbufObj {
    pub id: u16,
    pub module_type: ModuleType,
    pub priority: Priority,
    pub estimated_cost: u64,
    pub slot: CmdbufSlot,
    /// Caller-reported payload length, bytes (trailing JMP included).
    pub filled_bytes: u32,
    pub flags: CmdbufFlags,
    pub exec_status: ExecStatus,
    pub owner: SessionId,
    /// Global core index, set once at link time.
    pub core_id: Option<u16>,
    pub prev: u16,
    pub next: u16,
}

impl CmdbufObj {
    pub fn new(
        slot: CmdbufSlot,
        module_type: ModuleType,
        priority: Priority,
        estimated_cost: u64,
        owner: SessionId,
    ) -> Self {
        Self {
            id: slot.id,
            module_type,
            priority,
            estimated_cost,
            slot,
            filled_bytes: 0,
            flags: CmdbufFlags::empty(),
            exec_status: ExecStatus::Ok,
            owner,
            core_id: None,
            prev: NIL,
            next: NIL,
        }
    }

    pub fn run_done(&self) -> bool {
        self.flags.contains(CmdbufFlags::RUN_DONE)
    }

    pub fn linked(&self) -> bool {
        self.flags.contains(CmdbufFlags::DATA_LINKED)
    }

    /// Bus address range of the filled payload, for executing-address
    /// localization on pre-1.1 hardware.
    pub fn contains_bus(&self, addr: u64) -> bool {
        addr >= self.slot.cmd_bus && addr < self.slot.cmd_bus + self.filled_bytes.max(1) as u64
    }

    /// CPU pointer to the first word of the trailing JMP.
    pub fn jmp_ptr(&self) -> *mut u32 {
        let words = (self.filled_bytes as usize / 4).saturating_sub(crate::ins::JMP_SIZE_WORDS);
        unsafe { self.slot.cmd_virt.add(words) }
    }
}

const SHARD_COUNT: usize = 16;

/// Global id-indexed lookup table.
pub struct CmdbufTable {
    shards: Vec<Mutex<BTreeMap<u16, CmdbufObj>>>,
    capacity: usize,
}

unsafe impl Send for CmdbufTable {}
unsafe impl Sync for CmdbufTable {}

impl CmdbufTable {
    pub fn new(capacity: usize) -> Self {
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        for _ in 0..SHARD_COUNT {
            shards.push(Mutex::new(BTreeMap::new()));
        }
        Self { shards, capacity }
    }

    fn shard(&self, id: u16) -> &Mutex<BTreeMap<u16, CmdbufObj>> {
        &self.shards[id as usize % SHARD_COUNT]
    }

    pub fn insert(&self, obj: CmdbufObj) {
        debug_assert!(obj.id != NIL && (obj.id as usize) < self.capacity);
        let old = self.shard(obj.id).lock().insert(obj.id, obj);
        debug_assert!(old.is_none(), "cmdbuf id reused while allocated");
    }

    pub fn remove(&self, id: u16) -> Option<CmdbufObj> {
        self.shard(id).lock().remove(&id)
    }

    pub fn contains(&self, id: u16) -> bool {
        self.shard(id).lock().contains_key(&id)
    }

    /// Copy the object out. Ids are u16 and objects are small; copies keep
    /// the shard lock hold times trivial.
    pub fn get(&self, id: u16) -> Option<CmdbufObj> {
        if id == NIL {
            return None;
        }
        self.shard(id).lock().get(&id).copied()
    }

    /// Mutate the object in place under its shard lock.
    pub fn update<R>(&self, id: u16, f: impl FnOnce(&mut CmdbufObj) -> R) -> Option<R> {
        if id == NIL {
            return None;
        }
        self.shard(id).lock().get_mut(&id).map(f)
    }

    /// Ids of all live buffers owned by `session`, ascending.
    pub fn owned_by(&self, session: SessionId) -> Vec<u16> {
        let mut out = Vec::new();
        for shard in &self.shards {
            for (id, obj) in shard.lock().iter() {
                if obj.owner == session {
                    out.push(*id);
                }
            }
        }
        out.sort_unstable();
        out
    }
}
