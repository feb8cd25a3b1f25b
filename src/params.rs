//! Fixed-layout parameter blocks handed to user space.
//!
//! These mirror what the mmap/query interface of the device exposes, so the
//! layout is `repr(C)` and every field is an explicit-width integer.

use crate::config::{CoreDesc, HwGeneration, ModuleType};

/// Everything user space needs to map the shared DMA areas and address an
/// individual slot inside them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct CmdbufParameter {
    /// Bus address of the command-buffer slab.
    pub cmd_base_bus: u64,
    /// Bus address of the status (register readback) slab.
    pub status_base_bus: u64,
    /// Bus address of the per-core register-dump area.
    pub dump_base_bus: u64,
    /// Bytes per command-buffer slot.
    pub cmd_slot_size: u32,
    /// Bytes per status slot.
    pub status_slot_size: u32,
    /// Total slots in the pool, reserved slot 0 included.
    pub slot_count: u32,
    /// Total bytes of the command-buffer slab.
    pub cmd_total_size: u32,
}

/// Static description of the cores serving one module type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct VcmdParameter {
    /// Module type the query was made for.
    pub module_type: u16,
    /// Cores of that type.
    pub core_count: u16,
    /// Raw hardware id of the first core of the type.
    pub hw_id: u32,
    /// Interface generation, encoded as the [`HwGeneration`] discriminant.
    pub generation: u16,
    /// Register offsets of the submodules behind the first core.
    pub main_offset: u16,
    pub mmu_offset: u16,
    pub axife_offset: u16,
    pub dec400_offset: u16,
}

impl VcmdParameter {
    pub fn new(ty: ModuleType, count: u16, hw_id: u32, gen: HwGeneration, desc: &CoreDesc) -> Self {
        Self {
            module_type: ty.index() as u16,
            core_count: count,
            hw_id,
            generation: gen as u16,
            main_offset: desc.submodules.main,
            mmu_offset: desc.submodules.mmu,
            axife_offset: desc.submodules.axife,
            dec400_offset: desc.submodules.dec400,
        }
    }
}
