//! Memory-mapped register definitions for the VC8000 command processor.
//!
//! The register layout is described using [`tock_registers`], which provides
//! a safe and zero-cost abstraction over volatile MMIO access. The scheduler
//! never writes hardware fields in place: it edits the software
//! [`mirror::RegisterMirror`] and flushes whole words, because several VCMD
//! registers are write-only or side-effecting on read-back.

use core::{ops::Deref, ptr::NonNull};

use tock_registers::{interfaces::Readable, register_structs, registers::*};

pub mod consts;
pub mod mirror;

use consts::*;

register_structs! {
    pub VcmdRegs {
        (0x0000 => pub hw_id: ReadOnly<u32>),
        (0x0004 => pub build_date: ReadOnly<u32>),
        (0x0008 => pub exe_cmdbuf_count: ReadOnly<u32>),
        (0x000C => pub executing_addr: ReadWrite<u32>),
        (0x0010 => pub executing_addr_msb: ReadWrite<u32>),
        (0x0014 => pub exe_length: ReadWrite<u32>),
        (0x0018 => pub control: ReadWrite<u32>),
        (0x001C => pub irq_status: ReadWrite<u32>),
        (0x0020 => pub irq_enable: ReadWrite<u32>),
        (0x0024 => pub timeout_ctrl: ReadWrite<u32>),
        (0x0028 => pub cmdbuf_rdy_num: ReadWrite<u32>),
        (0x002C => pub executing_id: ReadWrite<u32>),
        (0x0030 => pub init_program: [ReadWrite<u32>; INIT_PROGRAM_WORDS]),
        (0x006C => @END),
    }
}

/// Typed view of one core's VCMD register file.
pub struct VcmdRegisters {
    base: NonNull<VcmdRegs>,
}

unsafe impl Send for VcmdRegisters {}
unsafe impl Sync for VcmdRegisters {}

impl VcmdRegisters {
    /// Create a new facade over a core's MMIO region.
    ///
    /// # Safety
    ///
    /// The caller must ensure the pointer is a valid mapping of the VCMD
    /// register file for the lifetime of the returned object.
    pub const unsafe fn new(base_addr: NonNull<u8>) -> Self {
        Self {
            base: base_addr.cast(),
        }
    }

    /// Raw hardware id register.
    pub fn hw_id_raw(&self) -> u32 {
        self.hw_id.get()
    }

    /// Write one mirrored word by index.
    pub fn write_word(&self, index: usize, value: u32) {
        debug_assert!(index < VCMD_REGISTER_COUNT);
        unsafe {
            (self.base.as_ptr() as *mut u32)
                .add(index)
                .write_volatile(value)
        }
    }

    /// Read one mirrored word by index.
    pub fn read_word(&self, index: usize) -> u32 {
        debug_assert!(index < VCMD_REGISTER_COUNT);
        unsafe { (self.base.as_ptr() as *const u32).add(index).read_volatile() }
    }
}

impl Deref for VcmdRegisters {
    type Target = VcmdRegs;

    fn deref(&self) -> &Self::Target {
        unsafe { self.base.as_ref() }
    }
}
