//! Instruction decoder for VM32.
//!
//! Instructions are one to three 32-bit words. The first word carries the
//! opcode and register fields; immediates, offsets and selectors follow in
//! the extra words.
//!
//! First word layout:
//! - bits 31-24: opcode
//! - bits 23-19: register A
//! - bits 18-14: register B or special register
//! - bits 7-0: software interrupt vector
//! - bits 1-0: segment register of memory operands

use crate::cpu::state::NUM_REGISTERS;
use serde::{Serialize, Deserialize};
use thiserror::Error;

/// Maximum number of words an instruction occupies.
pub const MAX_INSTRUCTION_WORDS: usize = 3;

/// Segment register selecting the segment of a memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegReg {
    Ds,
    Es,
    Ss,
    Rs,
}

impl SegReg {
    fn from_field(field: u32) -> Option<Self> {
        match field {
            0 => Some(SegReg::Ds),
            1 => Some(SegReg::Es),
            2 => Some(SegReg::Ss),
            3 => Some(SegReg::Rs),
            _ => None,
        }
    }

    fn to_field(self) -> u32 {
        match self {
            SegReg::Ds => 0,
            SegReg::Es => 1,
            SegReg::Ss => 2,
            SegReg::Rs => 3,
        }
    }

    /// Lower-case assembler name.
    pub fn name(self) -> &'static str {
        match self {
            SegReg::Ds => "ds",
            SegReg::Es => "es",
            SegReg::Ss => "ss",
            SegReg::Rs => "rs",
        }
    }
}

/// Special registers reachable through `movs`/`movr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpecialReg {
    Cs,
    Ds,
    Es,
    Ss,
    Rs,
    Flags,
    VmTbl,
    SegTbl,
    Counter,
    Compare,
    Int,
    InVm,
    VmId,
    PrivLvl,
}

impl SpecialReg {
    const ALL: [SpecialReg; 14] = [
        SpecialReg::Cs,
        SpecialReg::Ds,
        SpecialReg::Es,
        SpecialReg::Ss,
        SpecialReg::Rs,
        SpecialReg::Flags,
        SpecialReg::VmTbl,
        SpecialReg::SegTbl,
        SpecialReg::Counter,
        SpecialReg::Compare,
        SpecialReg::Int,
        SpecialReg::InVm,
        SpecialReg::VmId,
        SpecialReg::PrivLvl,
    ];

    fn from_field(field: u32) -> Option<Self> {
        Self::ALL.get(field as usize).copied()
    }

    fn to_field(self) -> u32 {
        Self::ALL.iter().position(|r| *r == self).unwrap_or(0) as u32
    }

    /// Lower-case assembler name.
    pub fn name(self) -> &'static str {
        match self {
            SpecialReg::Cs => "cs",
            SpecialReg::Ds => "ds",
            SpecialReg::Es => "es",
            SpecialReg::Ss => "ss",
            SpecialReg::Rs => "rs",
            SpecialReg::Flags => "flags",
            SpecialReg::VmTbl => "vmtbl",
            SpecialReg::SegTbl => "segtbl",
            SpecialReg::Counter => "counter",
            SpecialReg::Compare => "compare",
            SpecialReg::Int => "int",
            SpecialReg::InVm => "invm",
            SpecialReg::VmId => "vmid",
            SpecialReg::PrivLvl => "privlvl",
        }
    }

    /// Check if writing the register needs privilege level 0.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            SpecialReg::VmTbl
                | SpecialReg::SegTbl
                | SpecialReg::Counter
                | SpecialReg::Compare
                | SpecialReg::Int
        )
    }

    /// Check if the register cannot be written at all.
    pub fn is_read_only(self) -> bool {
        matches!(
            self,
            SpecialReg::Cs | SpecialReg::InVm | SpecialReg::VmId | SpecialReg::PrivLvl
        )
    }
}

/// Two-register ALU operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

impl AluOp {
    pub fn name(self) -> &'static str {
        match self {
            AluOp::Add => "add",
            AluOp::Sub => "sub",
            AluOp::And => "and",
            AluOp::Or => "or",
            AluOp::Xor => "xor",
            AluOp::Shl => "shl",
            AluOp::Shr => "shr",
        }
    }
}

/// Decoded VM32 instruction.
///
/// Jump targets and call targets are offsets into the code segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    // ==================== Control ====================

    /// Stop the CPU
    Hlt,
    Nop,

    // ==================== Arithmetic ====================

    /// rd := imm
    Movi { rd: u8, imm: u32 },
    /// rd := rs
    Mov { rd: u8, rs: u8 },
    /// rd := rd op rs
    Alu { op: AluOp, rd: u8, rs: u8 },
    /// rd := rd + imm
    Addi { rd: u8, imm: u32 },
    /// Flags from ra - rb
    Cmp { ra: u8, rb: u8 },
    /// Flags from ra - imm
    Cmpi { ra: u8, imm: u32 },

    // ==================== Memory ====================

    /// rd := seg:[base + offset]
    Ld { rd: u8, seg: SegReg, base: u8, offset: u32 },
    /// seg:[base + offset] := rs
    St { rs: u8, seg: SegReg, base: u8, offset: u32 },
    /// seg:[offset] := imm
    Stm { seg: SegReg, offset: u32, imm: u32 },
    Push { rs: u8 },
    Pop { rd: u8 },

    // ==================== Branches ====================

    Jmp { target: u32 },
    /// Jump if Z
    Jz { target: u32 },
    /// Jump if not Z
    Jnz { target: u32 },
    /// Jump if N
    Jn { target: u32 },
    /// Jump to the CS offset held in a register
    Jmpr { rs: u8 },
    Call { target: u32 },
    Ret,
    /// Far jump to another code segment
    Jmpf { selector: u32, offset: u32 },

    // ==================== System ====================

    /// Software interrupt
    Int { vector: u8 },
    /// Return from interrupt
    Iret,
    /// sreg := rs
    Movs { sreg: SpecialReg, rs: u8 },
    /// rd := sreg
    Movr { rd: u8, sreg: SpecialReg },
    /// Enter the guest described by entry `rs` of the VM descriptor table
    VmEnter { rs: u8 },
    /// Return to the parent context
    VmExit,
}

impl Instruction {
    /// Number of words the instruction occupies.
    pub fn word_count(&self) -> usize {
        match self {
            Instruction::Stm { .. } | Instruction::Jmpf { .. } => 3,
            Instruction::Movi { .. }
            | Instruction::Addi { .. }
            | Instruction::Cmpi { .. }
            | Instruction::Ld { .. }
            | Instruction::St { .. }
            | Instruction::Jmp { .. }
            | Instruction::Jz { .. }
            | Instruction::Jnz { .. }
            | Instruction::Jn { .. }
            | Instruction::Call { .. } => 2,
            _ => 1,
        }
    }
}

/// Opcode values (bits 31-24 of the first word).
struct Opcode;

impl Opcode {
    const HLT: u8 = 0x00;
    const NOP: u8 = 0x01;
    const MOVI: u8 = 0x02;
    const MOV: u8 = 0x03;
    const ADD: u8 = 0x04;
    const SUB: u8 = 0x05;
    const AND: u8 = 0x06;
    const OR: u8 = 0x07;
    const XOR: u8 = 0x08;
    const SHL: u8 = 0x09;
    const SHR: u8 = 0x0A;
    const ADDI: u8 = 0x0B;
    const CMP: u8 = 0x0C;
    const CMPI: u8 = 0x0D;
    const LD: u8 = 0x10;
    const ST: u8 = 0x11;
    const PUSH: u8 = 0x12;
    const POP: u8 = 0x13;
    const STM: u8 = 0x14;
    const JMP: u8 = 0x20;
    const JZ: u8 = 0x21;
    const JNZ: u8 = 0x22;
    const JN: u8 = 0x23;
    const JMPR: u8 = 0x24;
    const CALL: u8 = 0x25;
    const RET: u8 = 0x26;
    const JMPF: u8 = 0x27;
    const INT: u8 = 0x30;
    const IRET: u8 = 0x31;
    const MOVS: u8 = 0x32;
    const MOVR: u8 = 0x33;
    const VMENTER: u8 = 0x34;
    const VMEXIT: u8 = 0x35;

    fn alu(op: AluOp) -> u8 {
        match op {
            AluOp::Add => Self::ADD,
            AluOp::Sub => Self::SUB,
            AluOp::And => Self::AND,
            AluOp::Or => Self::OR,
            AluOp::Xor => Self::XOR,
            AluOp::Shl => Self::SHL,
            AluOp::Shr => Self::SHR,
        }
    }
}

fn opcode(word: u32) -> u8 {
    (word >> 24) as u8
}

fn field_a(word: u32) -> u32 {
    (word >> 19) & 0x1f
}

fn field_b(word: u32) -> u32 {
    (word >> 14) & 0x1f
}

fn reg(field: u32) -> Result<u8, DecodeError> {
    if field as usize >= NUM_REGISTERS {
        return Err(DecodeError::InvalidRegister(field as u8));
    }
    Ok(field as u8)
}

fn seg_reg(field: u32) -> Result<SegReg, DecodeError> {
    SegReg::from_field(field).ok_or(DecodeError::InvalidSegmentRegister(field as u8))
}

fn special_reg(field: u32) -> Result<SpecialReg, DecodeError> {
    SpecialReg::from_field(field).ok_or(DecodeError::InvalidSpecialRegister(field as u8))
}

/// Decode the instruction starting at `words[0]`.
///
/// Only as many words as the instruction needs are consumed; extra words
/// are ignored.
pub fn decode(words: &[u32]) -> Result<Instruction, DecodeError> {
    let first = *words.first().ok_or(DecodeError::Truncated { needed: 1, available: 0 })?;
    let a = field_a(first);
    let b = field_b(first);

    let extra = |n: usize| -> Result<u32, DecodeError> {
        words.get(n).copied().ok_or(DecodeError::Truncated {
            needed: n + 1,
            available: words.len(),
        })
    };

    let alu = |op: AluOp| -> Result<Instruction, DecodeError> {
        Ok(Instruction::Alu { op, rd: reg(a)?, rs: reg(b)? })
    };

    let instruction = match opcode(first) {
        Opcode::HLT => Instruction::Hlt,
        Opcode::NOP => Instruction::Nop,
        Opcode::MOVI => Instruction::Movi { rd: reg(a)?, imm: extra(1)? },
        Opcode::MOV => Instruction::Mov { rd: reg(a)?, rs: reg(b)? },
        Opcode::ADD => alu(AluOp::Add)?,
        Opcode::SUB => alu(AluOp::Sub)?,
        Opcode::AND => alu(AluOp::And)?,
        Opcode::OR => alu(AluOp::Or)?,
        Opcode::XOR => alu(AluOp::Xor)?,
        Opcode::SHL => alu(AluOp::Shl)?,
        Opcode::SHR => alu(AluOp::Shr)?,
        Opcode::ADDI => Instruction::Addi { rd: reg(a)?, imm: extra(1)? },
        Opcode::CMP => Instruction::Cmp { ra: reg(a)?, rb: reg(b)? },
        Opcode::CMPI => Instruction::Cmpi { ra: reg(a)?, imm: extra(1)? },
        // Memory operands put the segment register in the low bits of
        // the first word, leaving field B for the base register.
        Opcode::LD => Instruction::Ld {
            rd: reg(a)?,
            seg: seg_reg(first & 0x3)?,
            base: reg(b)?,
            offset: extra(1)?,
        },
        Opcode::ST => Instruction::St {
            rs: reg(a)?,
            seg: seg_reg(first & 0x3)?,
            base: reg(b)?,
            offset: extra(1)?,
        },
        Opcode::STM => Instruction::Stm {
            seg: seg_reg(first & 0x3)?,
            offset: extra(1)?,
            imm: extra(2)?,
        },
        Opcode::PUSH => Instruction::Push { rs: reg(a)? },
        Opcode::POP => Instruction::Pop { rd: reg(a)? },
        Opcode::JMP => Instruction::Jmp { target: extra(1)? },
        Opcode::JZ => Instruction::Jz { target: extra(1)? },
        Opcode::JNZ => Instruction::Jnz { target: extra(1)? },
        Opcode::JN => Instruction::Jn { target: extra(1)? },
        Opcode::JMPR => Instruction::Jmpr { rs: reg(a)? },
        Opcode::CALL => Instruction::Call { target: extra(1)? },
        Opcode::RET => Instruction::Ret,
        Opcode::JMPF => Instruction::Jmpf { selector: extra(1)?, offset: extra(2)? },
        Opcode::INT => Instruction::Int { vector: (first & 0xff) as u8 },
        Opcode::IRET => Instruction::Iret,
        Opcode::MOVS => Instruction::Movs { sreg: special_reg(b)?, rs: reg(a)? },
        Opcode::MOVR => Instruction::Movr { rd: reg(a)?, sreg: special_reg(b)? },
        Opcode::VMENTER => Instruction::VmEnter { rs: reg(a)? },
        Opcode::VMEXIT => Instruction::VmExit,
        op => return Err(DecodeError::InvalidOpcode(op)),
    };

    Ok(instruction)
}

/// Encode an instruction into its words.
pub fn encode(instr: &Instruction) -> Vec<u32> {
    let word = |op: u8, a: u32, b: u32, low: u32| -> u32 {
        (u32::from(op) << 24) | ((a & 0x1f) << 19) | ((b & 0x1f) << 14) | (low & 0x3fff)
    };
    let r = |r: u8| u32::from(r);

    match *instr {
        Instruction::Hlt => vec![word(Opcode::HLT, 0, 0, 0)],
        Instruction::Nop => vec![word(Opcode::NOP, 0, 0, 0)],
        Instruction::Movi { rd, imm } => vec![word(Opcode::MOVI, r(rd), 0, 0), imm],
        Instruction::Mov { rd, rs } => vec![word(Opcode::MOV, r(rd), r(rs), 0)],
        Instruction::Alu { op, rd, rs } => vec![word(Opcode::alu(op), r(rd), r(rs), 0)],
        Instruction::Addi { rd, imm } => vec![word(Opcode::ADDI, r(rd), 0, 0), imm],
        Instruction::Cmp { ra, rb } => vec![word(Opcode::CMP, r(ra), r(rb), 0)],
        Instruction::Cmpi { ra, imm } => vec![word(Opcode::CMPI, r(ra), 0, 0), imm],
        Instruction::Ld { rd, seg, base, offset } => {
            vec![word(Opcode::LD, r(rd), r(base), seg.to_field()), offset]
        }
        Instruction::St { rs, seg, base, offset } => {
            vec![word(Opcode::ST, r(rs), r(base), seg.to_field()), offset]
        }
        Instruction::Stm { seg, offset, imm } => {
            vec![word(Opcode::STM, 0, 0, seg.to_field()), offset, imm]
        }
        Instruction::Push { rs } => vec![word(Opcode::PUSH, r(rs), 0, 0)],
        Instruction::Pop { rd } => vec![word(Opcode::POP, r(rd), 0, 0)],
        Instruction::Jmp { target } => vec![word(Opcode::JMP, 0, 0, 0), target],
        Instruction::Jz { target } => vec![word(Opcode::JZ, 0, 0, 0), target],
        Instruction::Jnz { target } => vec![word(Opcode::JNZ, 0, 0, 0), target],
        Instruction::Jn { target } => vec![word(Opcode::JN, 0, 0, 0), target],
        Instruction::Jmpr { rs } => vec![word(Opcode::JMPR, r(rs), 0, 0)],
        Instruction::Call { target } => vec![word(Opcode::CALL, 0, 0, 0), target],
        Instruction::Ret => vec![word(Opcode::RET, 0, 0, 0)],
        Instruction::Jmpf { selector, offset } => vec![word(Opcode::JMPF, 0, 0, 0), selector, offset],
        Instruction::Int { vector } => vec![word(Opcode::INT, 0, 0, u32::from(vector))],
        Instruction::Iret => vec![word(Opcode::IRET, 0, 0, 0)],
        Instruction::Movs { sreg, rs } => vec![word(Opcode::MOVS, r(rs), sreg.to_field(), 0)],
        Instruction::Movr { rd, sreg } => vec![word(Opcode::MOVR, r(rd), sreg.to_field(), 0)],
        Instruction::VmEnter { rs } => vec![word(Opcode::VMENTER, r(rs), 0, 0)],
        Instruction::VmExit => vec![word(Opcode::VMEXIT, 0, 0, 0)],
    }
}

/// Errors that can occur during instruction decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("invalid opcode: 0x{0:02x}")]
    InvalidOpcode(u8),

    #[error("invalid register r{0}")]
    InvalidRegister(u8),

    #[error("invalid segment register {0}")]
    InvalidSegmentRegister(u8),

    #[error("invalid special register {0}")]
    InvalidSpecialRegister(u8),

    #[error("instruction needs {needed} words, only {available} available")]
    Truncated { needed: usize, available: usize },
}
