//! Software shadow of the VCMD register file.
//!
//! Kickoff writes a full register image; partial-field updates use
//! read-modify-write against the shadow, never against hardware read-back.
//! Fields are described by `(word, mask, lsb)` descriptors in the manner of
//! the C driver's HWIF tables, with the generation differences captured in
//! one dispatch table instead of scattered version checks.

use super::consts::*;
use super::VcmdRegisters;
use crate::config::HwGeneration;

/// Descriptor of one register field: word index, in-word mask, shift.
#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub reg: usize,
    pub mask: u32,
    pub lsb: u32,
}

impl Field {
    pub const fn new(reg: usize, mask: u32, lsb: u32) -> Self {
        Self { reg, mask, lsb }
    }
}

pub const HWIF_START_TRIGGER: Field = Field::new(REG_CONTROL, CTRL_START_TRIGGER, 0);
pub const HWIF_ABORT_MODE: Field = Field::new(REG_CONTROL, CTRL_ABORT_MODE, 4);
pub const HWIF_RESET_CORE: Field = Field::new(REG_CONTROL, CTRL_RESET_CORE, 8);
pub const HWIF_RESET_ALL: Field = Field::new(REG_CONTROL, CTRL_RESET_ALL, 9);
pub const HWIF_CLK_GATE_DISABLE: Field = Field::new(
    REG_CONTROL,
    CTRL_AXI_CLK_GATE_DISABLE | CTRL_MASTER_CLK_GATE_DISABLE | CTRL_CORE_CLK_GATE_DISABLE,
    12,
);
pub const HWIF_EXECUTING_ADDR: Field = Field::new(REG_EXECUTING_ADDR, 0xffff_ffff, 0);
pub const HWIF_EXECUTING_ADDR_MSB: Field = Field::new(REG_EXECUTING_ADDR_MSB, 0xffff_ffff, 0);
pub const HWIF_EXE_LENGTH: Field = Field::new(REG_EXE_LENGTH, 0x0000_ffff, 0);
pub const HWIF_TIMEOUT_ENABLE: Field = Field::new(REG_TIMEOUT_CTRL, TIMEOUT_ENABLE, 31);
pub const HWIF_TIMEOUT_CYCLES: Field = Field::new(REG_TIMEOUT_CTRL, TIMEOUT_CYCLES_MASK, 0);
pub const HWIF_CMDBUF_RDY_NUM: Field = Field::new(REG_CMDBUF_RDY_NUM, 0x0000_ffff, 0);
pub const HWIF_EXECUTING_ID: Field = Field::new(REG_EXECUTING_ID, 0x0000_ffff, 0);

/// Interrupt-enable mask for one hardware generation. The bit layout moved
/// twice across the three generations; picking the mask here keeps the
/// kickoff path free of version checks.
pub const fn irq_enable_mask(gen: HwGeneration) -> u32 {
    match gen {
        HwGeneration::V1_0 => {
            IRQ_ENDCMD | IRQ_BUSERR | IRQ_TIMEOUT | IRQ_CMDERR | IRQ_ABORT | IRQ_RESET
        }
        HwGeneration::V1_1 => {
            IRQ_ENDCMD | IRQ_BUSERR | IRQ_TIMEOUT | IRQ_CMDERR | IRQ_ABORT | IRQ_JMPD
        }
        HwGeneration::V1_2 => {
            IRQ_ENDCMD
                | IRQ_BUSERR
                | IRQ_TIMEOUT
                | IRQ_CMDERR
                | IRQ_ABORT
                | IRQ_JMPD
                | (1 << IRQ_INTCMD_SHIFT)
        }
    }
}

/// Software shadow of one core's register file.
///
/// Touched only under the owning core's spinlock (or during single-threaded
/// init); the lock discipline of the surrounding code is the mirror's only
/// synchronization.
#[derive(Debug)]
pub struct RegisterMirror {
    words: [u32; VCMD_REGISTER_COUNT],
}

impl RegisterMirror {
    pub const fn new() -> Self {
        Self {
            words: [0; VCMD_REGISTER_COUNT],
        }
    }

    pub fn get(&self, field: Field) -> u32 {
        (self.words[field.reg] & field.mask) >> field.lsb
    }

    pub fn set(&mut self, field: Field, value: u32) {
        let word = &mut self.words[field.reg];
        *word = (*word & !field.mask) | ((value << field.lsb) & field.mask);
    }

    pub fn word(&self, index: usize) -> u32 {
        self.words[index]
    }

    pub fn set_word(&mut self, index: usize, value: u32) {
        self.words[index] = value;
    }

    /// Write the whole image to hardware. Status and read-only words are
    /// skipped; the interrupt status register is write-1-to-clear and must
    /// never be flushed from the shadow.
    pub fn flush(&self, regs: &VcmdRegisters) {
        for index in REG_EXECUTING_ADDR..VCMD_REGISTER_COUNT {
            if index == REG_IRQ_STATUS {
                continue;
            }
            regs.write_word(index, self.words[index]);
        }
    }

    /// Write a single mirrored word to hardware.
    pub fn flush_word(&self, regs: &VcmdRegisters, index: usize) {
        regs.write_word(index, self.words[index]);
    }
}

impl Default for RegisterMirror {
    fn default() -> Self {
        Self::new()
    }
}
