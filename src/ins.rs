//! Command-processor instruction codec.
//!
//! A command buffer is a sequence of 32-bit words the VCMD front-end executes
//! autonomously: register writes/reads, stalls, interrupt clears, and a
//! trailing JMP that chains to the next buffer (or an END that parks the
//! core). The scheduler patches the trailing JMP of the previous buffer at
//! link time; this module gives those raw word edits names and bounds.

/// Opcode field, bits 31:27 of the first instruction word.
pub const OPCODE_SHIFT: u32 = 27;

pub const OPCODE_WREG: u32 = 0x01;
pub const OPCODE_END: u32 = 0x02;
pub const OPCODE_NOP: u32 = 0x03;
pub const OPCODE_STALL: u32 = 0x09;
pub const OPCODE_RREG: u32 = 0x16;
pub const OPCODE_JMP: u32 = 0x19;
pub const OPCODE_CLRINT: u32 = 0x1a;

/// JMP word 0: chain-ready bit. Hardware only follows the jump once set.
pub const JMP_RDY: u32 = 1 << 26;
/// JMP word 0: raise an interrupt when the jump is taken.
pub const JMP_IE: u32 = 1 << 25;
/// JMP word 0: encoded length of the next buffer, hardware-native 64-bit
/// units, low 16 bits.
pub const JMP_LENGTH_MASK: u32 = 0xffff;

/// Words occupied by a trailing JMP: opcode, address low, address high,
/// next-buffer id.
pub const JMP_SIZE_WORDS: usize = 4;

pub const fn opcode_of(word: u32) -> u32 {
    word >> OPCODE_SHIFT
}

/// Encoded length of a buffer in the units the JMP/EXE_LENGTH fields use.
pub const fn exe_length_of(size_bytes: u32) -> u32 {
    (size_bytes + 7) / 8
}

/// Decoded form of a trailing JMP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JmpTail {
    pub rdy: bool,
    pub ie: bool,
    /// Encoded length of the *next* buffer.
    pub exe_length: u16,
    pub target_bus: u64,
    pub target_id: u16,
}

impl JmpTail {
    pub fn encode(&self, out: &mut [u32; JMP_SIZE_WORDS]) {
        let mut word0 = OPCODE_JMP << OPCODE_SHIFT;
        if self.rdy {
            word0 |= JMP_RDY;
        }
        if self.ie {
            word0 |= JMP_IE;
        }
        word0 |= self.exe_length as u32 & JMP_LENGTH_MASK;
        out[0] = word0;
        out[1] = self.target_bus as u32;
        out[2] = (self.target_bus >> 32) as u32;
        out[3] = self.target_id as u32;
    }

    pub fn decode(words: &[u32; JMP_SIZE_WORDS]) -> Option<Self> {
        if opcode_of(words[0]) != OPCODE_JMP {
            return None;
        }
        Some(Self {
            rdy: words[0] & JMP_RDY != 0,
            ie: words[0] & JMP_IE != 0,
            exe_length: (words[0] & JMP_LENGTH_MASK) as u16,
            target_bus: words[1] as u64 | ((words[2] as u64) << 32),
            target_id: words[3] as u16,
        })
    }
}

/// One command-processor instruction, high-level form.
#[derive(Debug, Clone)]
pub enum Instr<'a> {
    /// Write `values` to consecutive registers starting at `addr`.
    Wreg { fix: bool, addr: u16, values: &'a [u32] },
    /// Read `count` registers starting at `addr`, dumped to `dump_bus`.
    Rreg { addr: u16, count: u16, dump_bus: u64 },
    /// Stall until an interrupt source in `mask` fires.
    Stall { im: bool, mask: u16 },
    /// Clear interrupt bits at register `addr`.
    ClrInt { mode: u8, addr: u16, mask: u32 },
    Jmp(JmpTail),
    End,
    Nop,
}

impl Instr<'_> {
    pub fn encoded_len(&self) -> usize {
        match self {
            Instr::Wreg { values, .. } => 1 + values.len(),
            Instr::Rreg { .. } => 3,
            Instr::Stall { .. } => 1,
            Instr::ClrInt { .. } => 2,
            Instr::Jmp(_) => JMP_SIZE_WORDS,
            Instr::End | Instr::Nop => 1,
        }
    }

    /// Encode into `out`, returning the words written. Panics when `out` is
    /// too short; callers size buffers with [`Instr::encoded_len`].
    pub fn encode(&self, out: &mut [u32]) -> usize {
        match *self {
            Instr::Wreg { fix, addr, values } => {
                out[0] = (OPCODE_WREG << OPCODE_SHIFT)
                    | ((fix as u32) << 26)
                    | ((values.len() as u32 & 0x3ff) << 16)
                    | addr as u32;
                out[1..1 + values.len()].copy_from_slice(values);
                1 + values.len()
            }
            Instr::Rreg { addr, count, dump_bus } => {
                out[0] = (OPCODE_RREG << OPCODE_SHIFT)
                    | ((count as u32 & 0x3ff) << 16)
                    | addr as u32;
                out[1] = dump_bus as u32;
                out[2] = (dump_bus >> 32) as u32;
                3
            }
            Instr::Stall { im, mask } => {
                out[0] = (OPCODE_STALL << OPCODE_SHIFT) | ((im as u32) << 25) | mask as u32;
                1
            }
            Instr::ClrInt { mode, addr, mask } => {
                out[0] = (OPCODE_CLRINT << OPCODE_SHIFT)
                    | ((mode as u32 & 0x3) << 25)
                    | addr as u32;
                out[1] = mask;
                2
            }
            Instr::Jmp(ref tail) => {
                let mut words = [0u32; JMP_SIZE_WORDS];
                tail.encode(&mut words);
                out[..JMP_SIZE_WORDS].copy_from_slice(&words);
                JMP_SIZE_WORDS
            }
            Instr::End => {
                out[0] = OPCODE_END << OPCODE_SHIFT;
                1
            }
            Instr::Nop => {
                out[0] = OPCODE_NOP << OPCODE_SHIFT;
                1
            }
        }
    }
}

/// How a filled buffer terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    Jmp(JmpTail),
    End,
}

/// Classify the trailing instruction of a filled buffer.
///
/// The rest of the pipeline assumes every buffer ends in a chain-capable
/// instruction, so this runs before scheduling. `filled_words` is the
/// caller-reported payload length in words.
pub fn parse_terminator(words: &[u32], filled_words: usize) -> Option<Terminator> {
    if filled_words == 0 || filled_words > words.len() {
        return None;
    }
    if opcode_of(words[filled_words - 1]) == OPCODE_END {
        return Some(Terminator::End);
    }
    if filled_words < JMP_SIZE_WORDS {
        return None;
    }
    let mut tail = [0u32; JMP_SIZE_WORDS];
    tail.copy_from_slice(&words[filled_words - JMP_SIZE_WORDS..filled_words]);
    JmpTail::decode(&tail).map(Terminator::Jmp)
}

/// Patch the trailing JMP of a linked buffer in place.
///
/// # Safety
///
/// `jmp0` must point at the first word of a trailing JMP inside a live DMA
/// buffer, with at least [`JMP_SIZE_WORDS`] words of valid memory behind it.
/// The caller holds the owning core's lock so hardware observes either the
/// old or the new chain, never a torn one: the ready bit (word 0) is written
/// last.
pub unsafe fn patch_jmp(jmp0: *mut u32, tail: &JmpTail) {
    let mut words = [0u32; JMP_SIZE_WORDS];
    tail.encode(&mut words);
    unsafe {
        jmp0.add(1).write_volatile(words[1]);
        jmp0.add(2).write_volatile(words[2]);
        jmp0.add(3).write_volatile(words[3]);
        jmp0.write_volatile(words[0]);
    }
}

/// Read back a trailing JMP from DMA memory.
///
/// # Safety
///
/// Same aliasing/validity contract as [`patch_jmp`].
pub unsafe fn read_jmp(jmp0: *const u32) -> Option<JmpTail> {
    let mut words = [0u32; JMP_SIZE_WORDS];
    for (i, w) in words.iter_mut().enumerate() {
        *w = unsafe { jmp0.add(i).read_volatile() };
    }
    JmpTail::decode(&words)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jmp_round_trip() {
        let tail = JmpTail {
            rdy: true,
            ie: false,
            exe_length: 0x120,
            target_bus: 0x1_2345_6780,
            target_id: 42,
        };
        let mut words = [0u32; JMP_SIZE_WORDS];
        tail.encode(&mut words);
        assert_eq!(opcode_of(words[0]), OPCODE_JMP);
        assert_eq!(JmpTail::decode(&words), Some(tail));
    }

    #[test]
    fn terminator_classification() {
        let mut buf = [0u32; 8];
        let jmp = Instr::Jmp(JmpTail::default());
        let n = jmp.encode(&mut buf[4..]);
        assert_eq!(n, JMP_SIZE_WORDS);
        assert!(matches!(
            parse_terminator(&buf, 8),
            Some(Terminator::Jmp(_))
        ));

        let mut buf = [0u32; 4];
        Instr::End.encode(&mut buf[3..]);
        assert_eq!(parse_terminator(&buf, 4), Some(Terminator::End));

        // WREG payload in the tail position is rejected.
        let mut buf = [0u32; 4];
        Instr::Wreg {
            fix: false,
            addr: 0x40,
            values: &[1, 2, 3],
        }
        .encode(&mut buf);
        assert_eq!(parse_terminator(&buf, 4), None);
        assert_eq!(parse_terminator(&buf, 0), None);
    }

    #[test]
    fn wreg_encoding() {
        let mut buf = [0u32; 4];
        let n = Instr::Wreg {
            fix: true,
            addr: 0x10,
            values: &[0xdead, 0xbeef],
        }
        .encode(&mut buf);
        assert_eq!(n, 3);
        assert_eq!(opcode_of(buf[0]), OPCODE_WREG);
        assert_eq!(buf[0] & (1 << 26), 1 << 26);
        assert_eq!((buf[0] >> 16) & 0x3ff, 2);
        assert_eq!(buf[0] & 0xffff, 0x10);
        assert_eq!(&buf[1..3], &[0xdead, 0xbeef]);
    }

    #[test]
    fn exe_length_rounds_up() {
        assert_eq!(exe_length_of(0), 0);
        assert_eq!(exe_length_of(8), 1);
        assert_eq!(exe_length_of(9), 2);
        assert_eq!(exe_length_of(16), 2);
    }
}
