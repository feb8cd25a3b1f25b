//! Static configuration for the VCMD scheduler.
//!
//! Mirrors what the platform glue learns from the device tree / PCI probe:
//! which command-processor cores exist, which pipeline class each serves, and
//! the pool geometry. Everything algorithmic derives from this one struct so
//! the scheduler itself carries no globals.

/// Hardware pipeline class a command buffer targets. Selects the pool of
/// cores the buffer may be scheduled onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ModuleType {
    VideoDecoder = 0,
    VideoEncoder = 1,
    JpegDecoder = 2,
    JpegEncoder = 3,
    ImagePostProcess = 4,
}

/// Number of distinct [`ModuleType`] values.
pub const MAX_MODULE_TYPES: usize = 5;

impl ModuleType {
    pub const ALL: [ModuleType; MAX_MODULE_TYPES] = [
        ModuleType::VideoDecoder,
        ModuleType::VideoEncoder,
        ModuleType::JpegDecoder,
        ModuleType::JpegEncoder,
        ModuleType::ImagePostProcess,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn from_raw(raw: u16) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }
}

/// Scheduling class of a command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Priority {
    Normal = 0,
    High = 1,
}

/// Command-processor hardware generation, decoded from the HW id register.
///
/// Three generations are in the field and they differ in the IRQ-enable bit
/// layout, in whether the executing buffer is located by address or by id,
/// and in whether an init program is required before the start trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HwGeneration {
    /// Version <= 1.0.c: executing buffer located by address-range match,
    /// RESET interrupt present, INTCMD completion vector.
    V1_0,
    /// 1.1.x: DMA-mirrored executing-id cell, per-buffer id in the JMP tail.
    ///
    /// 1.1.0 parts also still wire the RESET interrupt line. It is bucketed
    /// here anyway: the line is neither enabled nor serviced on this
    /// generation, keeping executing-id localization uniform across 1.1.x.
    V1_1,
    /// >= 1.2.1: additionally needs the AXI-FE/MMU init program at kickoff.
    V1_2,
}

impl HwGeneration {
    /// Decode from the low half of the HW id register
    /// (`major << 8 | minor << 4 | build`).
    pub fn from_hw_id(hw_id: u32) -> Self {
        let version = hw_id & 0xffff;
        if version < 0x110 {
            HwGeneration::V1_0
        } else if version < 0x121 {
            HwGeneration::V1_1
        } else {
            HwGeneration::V1_2
        }
    }

    /// True when the hardware reports the executing buffer by id rather than
    /// by address.
    pub fn has_executing_id(self) -> bool {
        self >= HwGeneration::V1_1
    }
}

/// Register offsets of the submodules hanging off one VCMD core, relative to
/// the core's MMIO base. Reported through the parameter query surface; the
/// scheduler itself only touches the VCMD block.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmoduleOffsets {
    pub main: u16,
    pub mmu: u16,
    pub axife: u16,
    pub dec400: u16,
}

/// One physical VCMD-capable core instance.
#[derive(Debug, Clone, Copy)]
pub struct CoreDesc {
    pub module_type: ModuleType,
    /// IRQ line, `None` for polling-only deployments.
    pub irq: Option<u32>,
    pub submodules: SubmoduleOffsets,
    /// Bus address the hardware subtracts when no IOMMU path is active.
    pub bus_base: u64,
    pub mmu_enable: bool,
}

/// Fixed size of one command-buffer slot.
pub const CMDBUF_SLOT_SIZE: usize = 0x2000;
/// Fixed size of one status (register readback) slot.
pub const STATUS_SLOT_SIZE: usize = 0x1000;
/// Words in the per-core register-dump DMA area.
pub const CORE_DUMP_WORDS: usize = 64;
/// Default number of discrete command-buffer slots (slot 0 is reserved).
pub const DEFAULT_CMDBUF_COUNT: usize = 256;

/// One frame-equivalent of estimated execution cost (4K luma samples).
const FRAME_EQUIVALENT: u64 = 4096 * 2160;

#[derive(Debug, Clone)]
pub struct VcmdConfig {
    pub cores: alloc::vec::Vec<CoreDesc>,
    /// Number of command-buffer slots in the pool.
    pub cmdbuf_count: usize,
    /// Per-process outstanding estimated-cost ceiling (admission gate).
    pub budget_ceiling: u64,
    /// Override for the interrupt-coalescing ceiling; `None` derives the
    /// production value from the core count.
    pub int_coalesce_ceiling: Option<u64>,
    /// Abort spin-wait: polls x interval, teardown path only.
    pub abort_poll_count: u32,
    pub abort_poll_interval_ms: u32,
    /// Deadline of the multi-core `wait_any` path, milliseconds.
    pub any_wait_timeout_ms: u32,
    /// Value programmed into the hardware timeout-cycle ceiling.
    pub timeout_cycles: u32,
}

impl VcmdConfig {
    pub fn new(cores: alloc::vec::Vec<CoreDesc>) -> Self {
        Self {
            cores,
            cmdbuf_count: DEFAULT_CMDBUF_COUNT,
            budget_ceiling: FRAME_EQUIVALENT * 8,
            int_coalesce_ceiling: None,
            abort_poll_count: 100,
            abort_poll_interval_ms: 10,
            any_wait_timeout_ms: 600,
            timeout_cycles: 0x3fff_ffff,
        }
    }

    /// Cores serving one module type.
    pub fn cores_of(&self, ty: ModuleType) -> usize {
        self.cores.iter().filter(|c| c.module_type == ty).count()
    }

    /// Ceiling on accumulated estimated cost along a run of
    /// interrupt-suppressing buffers: one frame-equivalent per core of the
    /// type (bounds worst-case completion-notification latency).
    pub fn coalesce_ceiling(&self, ty: ModuleType) -> u64 {
        match self.int_coalesce_ceiling {
            Some(v) => v,
            None => FRAME_EQUIVALENT * self.cores_of(ty).max(1) as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_decode() {
        assert_eq!(HwGeneration::from_hw_id(0x8000_010c), HwGeneration::V1_0);
        assert_eq!(HwGeneration::from_hw_id(0x8000_0110), HwGeneration::V1_1);
        assert_eq!(HwGeneration::from_hw_id(0x8000_0120), HwGeneration::V1_1);
        assert_eq!(HwGeneration::from_hw_id(0x8000_0121), HwGeneration::V1_2);
        assert!(HwGeneration::from_hw_id(0x8000_0121).has_executing_id());
        assert!(!HwGeneration::from_hw_id(0x8000_0100).has_executing_id());
    }
}
