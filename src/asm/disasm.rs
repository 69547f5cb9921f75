//! Disassembler for VM32 programs.
//!
//! Converts raw instruction words back to readable assembly.

use crate::cpu::decode::{decode, Instruction, MAX_INSTRUCTION_WORDS};
use std::fmt::Write;

/// Instruction decoder used by the debugger and the `disasm` command.
///
/// Always consumes exactly three raw words and reports how many of them
/// the instruction actually occupies.
#[derive(Debug, Clone, Copy, Default)]
pub struct Disassembler;

impl Disassembler {
    pub fn new() -> Self {
        Self
    }

    /// Disassemble the instruction starting at `raw[0]`.
    ///
    /// Returns the mnemonic text and the number of words consumed, which is
    /// always in `1..=3`. Undecodable words render as `.word` and consume one
    /// word.
    pub fn disassemble_instruction_word(&self, raw: &[u32; MAX_INSTRUCTION_WORDS]) -> (String, usize) {
        match decode(raw) {
            Ok(instr) => (format_instruction(&instr), instr.word_count()),
            Err(_) => (format!(".word 0x{:08x}", raw[0]), 1),
        }
    }

    /// Format one listing line: address, the consumed words in hex, and the
    /// mnemonic. Returns the line and the consumed word count.
    pub fn listing_line(&self, addr: u32, raw: &[u32; MAX_INSTRUCTION_WORDS]) -> (String, usize) {
        let (text, consumed) = self.disassemble_instruction_word(raw);

        let mut line = format!("0x{addr:08x}:\t");
        for word in &raw[..consumed] {
            let _ = write!(line, "{word:08x} ");
        }
        for _ in consumed..MAX_INSTRUCTION_WORDS {
            line.push_str("\t ");
        }
        line.push('\t');
        line.push_str(&text);

        (line, consumed)
    }

    /// Disassemble a block of words loaded at `base`.
    pub fn disassemble(&self, words: &[u32], base: u32) -> String {
        let mut output = String::new();
        let mut pos = 0;

        while pos < words.len() {
            let mut raw = [0u32; MAX_INSTRUCTION_WORDS];
            for (slot, word) in raw.iter_mut().zip(&words[pos..]) {
                *slot = *word;
            }
            let (line, consumed) = self.listing_line(base.wrapping_add(pos as u32), &raw);
            output.push_str(&line);
            output.push('\n');
            pos += consumed;
        }

        output
    }
}

/// Format a decoded instruction as assembly text.
fn format_instruction(instr: &Instruction) -> String {
    match *instr {
        // Control
        Instruction::Hlt => "hlt".to_string(),
        Instruction::Nop => "nop".to_string(),

        // Arithmetic
        Instruction::Movi { rd, imm } => format!("movi r{rd}, 0x{imm:08x}"),
        Instruction::Mov { rd, rs } => format!("mov r{rd}, r{rs}"),
        Instruction::Alu { op, rd, rs } => format!("{} r{rd}, r{rs}", op.name()),
        Instruction::Addi { rd, imm } => format!("addi r{rd}, 0x{imm:08x}"),
        Instruction::Cmp { ra, rb } => format!("cmp r{ra}, r{rb}"),
        Instruction::Cmpi { ra, imm } => format!("cmpi r{ra}, 0x{imm:08x}"),

        // Memory
        Instruction::Ld { rd, seg, base, offset } => {
            format!("ld r{rd}, {}:[r{base} + 0x{offset:x}]", seg.name())
        }
        Instruction::St { rs, seg, base, offset } => {
            format!("st {}:[r{base} + 0x{offset:x}], r{rs}", seg.name())
        }
        Instruction::Stm { seg, offset, imm } => {
            format!("stm {}:[0x{offset:x}], 0x{imm:08x}", seg.name())
        }
        Instruction::Push { rs } => format!("push r{rs}"),
        Instruction::Pop { rd } => format!("pop r{rd}"),

        // Branches
        Instruction::Jmp { target } => format!("jmp 0x{target:08x}"),
        Instruction::Jz { target } => format!("jz 0x{target:08x}"),
        Instruction::Jnz { target } => format!("jnz 0x{target:08x}"),
        Instruction::Jn { target } => format!("jn 0x{target:08x}"),
        Instruction::Jmpr { rs } => format!("jmpr r{rs}"),
        Instruction::Call { target } => format!("call 0x{target:08x}"),
        Instruction::Ret => "ret".to_string(),
        Instruction::Jmpf { selector, offset } => format!("jmpf {selector}, 0x{offset:08x}"),

        // System
        Instruction::Int { vector } => format!("int {vector}"),
        Instruction::Iret => "iret".to_string(),
        Instruction::Movs { sreg, rs } => format!("movs {}, r{rs}", sreg.name()),
        Instruction::Movr { rd, sreg } => format!("movr r{rd}, {}", sreg.name()),
        Instruction::VmEnter { rs } => format!("vmenter r{rs}"),
        Instruction::VmExit => "vmexit".to_string(),
    }
}
