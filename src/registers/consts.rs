//! Raw offsets and word indices of the VCMD register file.

/// Word indices into the software register mirror; multiply by 4 for the
/// byte offset into the register file.
pub const REG_HW_ID: usize = 0;
pub const REG_BUILD_DATE: usize = 1;
pub const REG_EXE_CMDBUF_COUNT: usize = 2;
pub const REG_EXECUTING_ADDR: usize = 3;
pub const REG_EXECUTING_ADDR_MSB: usize = 4;
pub const REG_EXE_LENGTH: usize = 5;
pub const REG_CONTROL: usize = 6;
pub const REG_IRQ_STATUS: usize = 7;
pub const REG_IRQ_ENABLE: usize = 8;
pub const REG_TIMEOUT_CTRL: usize = 9;
pub const REG_CMDBUF_RDY_NUM: usize = 10;
pub const REG_EXECUTING_ID: usize = 11;
pub const REG_INIT_PROGRAM: usize = 12;
/// Words available in the init-program window.
pub const INIT_PROGRAM_WORDS: usize = 15;
/// Total mirrored registers per core.
pub const VCMD_REGISTER_COUNT: usize = REG_INIT_PROGRAM + INIT_PROGRAM_WORDS;

/// Interrupt status bits.
pub const IRQ_ENDCMD: u32 = 1 << 0;
pub const IRQ_BUSERR: u32 = 1 << 1;
pub const IRQ_TIMEOUT: u32 = 1 << 2;
pub const IRQ_CMDERR: u32 = 1 << 3;
pub const IRQ_ABORT: u32 = 1 << 4;
pub const IRQ_RESET: u32 = 1 << 5;
pub const IRQ_JMPD: u32 = 1 << 6;
/// Completion vector of legacy (<= 1.1.0) hardware: id of the buffer whose
/// JMP raised the interrupt lives in the upper half of the status register.
pub const IRQ_INTCMD_SHIFT: u32 = 16;
pub const IRQ_INTCMD_MASK: u32 = 0xffff_0000;

/// Value clearing every interrupt source.
pub const IRQ_CLEAR_ALL: u32 = 0xffff_ffff;

/// Control register bits.
pub const CTRL_START_TRIGGER: u32 = 1 << 0;
pub const CTRL_ABORT_MODE: u32 = 1 << 4;
pub const CTRL_RESET_CORE: u32 = 1 << 8;
pub const CTRL_RESET_ALL: u32 = 1 << 9;
pub const CTRL_AXI_CLK_GATE_DISABLE: u32 = 1 << 12;
pub const CTRL_MASTER_CLK_GATE_DISABLE: u32 = 1 << 13;
pub const CTRL_CORE_CLK_GATE_DISABLE: u32 = 1 << 14;

/// Timeout control bits.
pub const TIMEOUT_ENABLE: u32 = 1 << 31;
pub const TIMEOUT_CYCLES_MASK: u32 = 0x7fff_ffff;

/// Cells in the per-core register-dump DMA area (hardware >= 1.1 mirrors
/// its progress there so the driver can avoid MMIO reads on the hot path).
pub const DUMP_CELL_EXE_COUNT: usize = 0;
pub const DUMP_CELL_EXECUTING_ID: usize = 1;
