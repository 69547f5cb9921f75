//! CPU execution engine for VM32.
//!
//! Implements the fetch-decode-execute cycle together with segment and
//! privilege enforcement, interrupt delivery and nested VM entry/exit.
//!
//! Each call to [`Cpu::step`] is atomic: an instruction either completes
//! or faults before changing any state, so no partial effects are ever
//! visible between steps.

use crate::asm::object::ObjectFile;
use crate::cpu::decode::{self, AluOp, DecodeError, Instruction, SegReg, SpecialReg, MAX_INSTRUCTION_WORDS};
use crate::cpu::memory::Memory;
use crate::cpu::segment::{Access, SegmentTable};
use crate::cpu::state::{State, INT_GLOBAL_ENABLE, STACK_POINTER};
use crate::cpu::vm_table::{VmContext, VmTable, CONTEXT_WORDS, INTERRUPT_SLOT};
use serde::{Serialize, Deserialize};
use thiserror::Error;
use tracing::{debug, trace};

/// Interrupt vector of the timer.
pub const VECTOR_TIMER: u32 = 1;
/// Interrupt vector of protection faults.
pub const VECTOR_PROTECTION: u32 = 2;
/// Interrupt vector raised when `vmenter` finds the context table full.
pub const VECTOR_VM_EXHAUSTED: u32 = 3;
/// Interrupt vector of undecodable instructions.
pub const VECTOR_INVALID_OPCODE: u32 = 4;

/// Words between consecutive interrupt handler entry points.
pub const VECTOR_STRIDE: u32 = 4;

/// Selector interrupt handlers run in.
pub const HANDLER_CS: u32 = 0;

/// CPU execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuState {
    /// CPU is running normally.
    Running,
    /// CPU has halted: HLT, end of code, or an unhandled fault.
    Halted,
}

/// Architectural faults.
///
/// Faults never leave the engine. They are delivered as interrupts when
/// the global interrupt enable is set and halt the CPU otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("protection fault: {0}")]
    Protection(&'static str),

    #[error("VM context table exhausted")]
    VmTableExhausted,

    #[error("invalid instruction word 0x{0:08x}")]
    InvalidOpcode(u32),
}

impl Fault {
    /// Interrupt vector the fault is delivered on.
    pub fn vector(&self) -> u32 {
        match self {
            Fault::Protection(_) => VECTOR_PROTECTION,
            Fault::VmTableExhausted => VECTOR_VM_EXHAUSTED,
            Fault::InvalidOpcode(_) => VECTOR_INVALID_OPCODE,
        }
    }
}

/// An interrupt delivered during the last step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptTaken {
    pub vector: u32,
    /// The instruction at the saved IP faulted and did not execute.
    pub faulted: bool,
}

/// Why an instruction could not be fetched.
enum FetchError {
    /// IP left the code segment or memory: the program is over.
    End(&'static str),
    Fault(Fault),
}

/// The VM32 CPU.
#[derive(Clone, Serialize, Deserialize)]
pub struct Cpu {
    /// Architectural state.
    pub state: State,
    /// Main memory.
    pub mem: Memory,
    /// Saved and nested execution contexts.
    pub vms: VmTable,
    /// Current execution state.
    pub status: CpuState,
    /// Instructions completed since reset.
    pub cycles: u64,
    /// Interrupt delivered by the most recent step, if any.
    pub last_interrupt: Option<InterruptTaken>,
    /// Image and layout restored by [`Cpu::reset`].
    image: Vec<u8>,
    mem_words: usize,
    entry: u32,
}

impl Cpu {
    /// Create a CPU whose memory holds `image` (little-endian words) and
    /// at least `min_words` words, starting execution at `entry`.
    pub fn new(image: Vec<u8>, min_words: usize, entry: u32) -> Self {
        let mem = Memory::from_image(&image, min_words);
        let mem_words = mem.len();

        Self {
            state: State::new(mem_words, entry),
            mem,
            vms: VmTable::new(),
            status: CpuState::Running,
            cycles: 0,
            last_interrupt: None,
            image,
            mem_words,
            entry,
        }
    }

    /// Create a CPU from a loaded object file, with memory grown to at
    /// least `min_words` words.
    pub fn from_object(object: &ObjectFile, min_words: usize) -> Self {
        let min_words = min_words.max(object.memory_words as usize);
        Self::new(object.image.clone(), min_words, object.entry)
    }

    /// Reset state and reload memory from the original image.
    pub fn reset(&mut self) {
        self.mem = Memory::from_image(&self.image, self.mem_words);
        self.state = State::new(self.mem_words, self.entry);
        self.vms = VmTable::new();
        self.status = CpuState::Running;
        self.cycles = 0;
        self.last_interrupt = None;
        debug!("cpu reset, entry 0x{:08x}", self.entry);
    }

    /// Execute a single instruction.
    ///
    /// Returns `false` once the CPU halts; further calls are no-ops that
    /// keep returning `false`.
    pub fn step(&mut self) -> bool {
        if self.status == CpuState::Halted {
            return false;
        }
        self.last_interrupt = None;

        let ip = self.state.ip;
        let instr = match self.fetch() {
            Ok(instr) => instr,
            Err(FetchError::End(reason)) => {
                debug!("simulation ended at 0x{ip:08x}: {reason}");
                self.status = CpuState::Halted;
                return false;
            }
            Err(FetchError::Fault(fault)) => return self.raise(fault, ip),
        };

        trace!("0x{ip:08x}: {instr:?}");

        if instr == Instruction::Hlt {
            debug!("halted at 0x{ip:08x}");
            self.status = CpuState::Halted;
            return false;
        }

        let next = ip.wrapping_add(instr.word_count() as u32);
        if let Err(fault) = self.execute(instr, next) {
            return self.raise(fault, ip);
        }

        self.cycles += 1;
        self.tick_timer();
        true
    }

    /// Run until halt or until `max_steps` instructions have executed.
    ///
    /// Returns the number of steps that completed.
    pub fn run(&mut self, max_steps: u64) -> u64 {
        let mut steps = 0;
        while steps < max_steps && self.step() {
            steps += 1;
        }
        steps
    }

    /// Check if the CPU is halted.
    pub fn is_halted(&self) -> bool {
        self.status == CpuState::Halted
    }

    /// Check if the CPU is running.
    pub fn is_running(&self) -> bool {
        self.status == CpuState::Running
    }

    fn fetch(&self) -> Result<Instruction, FetchError> {
        let ip = self.state.ip;
        let cs = self
            .state
            .segments
            .check_selector(self.state.cs, self.state.priv_lvl, Access::Execute)
            .map_err(FetchError::Fault)?;

        if !cs.contains(ip) {
            return Err(FetchError::End("IP outside code segment"));
        }

        // Never read past the end of the code segment or of memory.
        let seg_left = (cs.start + cs.limit - ip) as usize;
        let mem_left = self.mem.len().saturating_sub(ip as usize);
        let count = MAX_INSTRUCTION_WORDS.min(seg_left).min(mem_left);
        if count == 0 {
            return Err(FetchError::End("IP outside memory"));
        }

        let words = self
            .mem
            .read_range(ip, count)
            .map_err(|_| FetchError::End("IP outside memory"))?;

        match decode::decode(&words) {
            Ok(instr) => Ok(instr),
            Err(DecodeError::Truncated { .. }) => Err(FetchError::End("instruction runs past end of code")),
            Err(_) => Err(FetchError::Fault(Fault::InvalidOpcode(words[0]))),
        }
    }

    /// Deliver a fault raised by the instruction at `ip`.
    fn raise(&mut self, fault: Fault, ip: u32) -> bool {
        if !self.state.interrupts_enabled() {
            debug!("{fault} at 0x{ip:08x} with interrupts disabled, halting");
            self.status = CpuState::Halted;
            return false;
        }

        debug!("{fault} at 0x{ip:08x}");
        self.dispatch_interrupt(fault.vector(), ip, true);
        true
    }

    /// Save the current context to the interrupt slot and enter the handler
    /// for `vector` at privilege level 0 with global interrupts masked.
    fn dispatch_interrupt(&mut self, vector: u32, resume_ip: u32, faulted: bool) {
        self.last_interrupt = Some(InterruptTaken { vector, faulted });
        self.vms.save(INTERRUPT_SLOT, self.state.context(resume_ip));

        let base = self.state.segments.get(HANDLER_CS).map_or(0, |seg| seg.start);
        self.state.int &= !INT_GLOBAL_ENABLE;
        self.state.priv_lvl = 0;
        self.state.cs = HANDLER_CS;
        self.state.ip = base.wrapping_add(vector.wrapping_mul(VECTOR_STRIDE));

        debug!("interrupt {vector}, handler at 0x{:08x}, resume at 0x{resume_ip:08x}", self.state.ip);
    }

    fn tick_timer(&mut self) {
        self.state.counter = self.state.counter.wrapping_add(1);
        if self.state.counter == self.state.compare && self.state.timer_armed() {
            self.dispatch_interrupt(VECTOR_TIMER, self.state.ip, false);
        }
    }

    /// Execute a decoded instruction located just before `next`.
    fn execute(&mut self, instr: Instruction, next: u32) -> Result<(), Fault> {
        let mut next_ip = next;

        match instr {
            // ==================== Control ====================

            Instruction::Hlt | Instruction::Nop => {}

            // ==================== Arithmetic ====================

            Instruction::Movi { rd, imm } => self.set_reg(rd, imm),

            Instruction::Mov { rd, rs } => self.set_reg(rd, self.reg(rs)),

            Instruction::Alu { op, rd, rs } => {
                let (a, b) = (self.reg(rd), self.reg(rs));
                let (result, carry) = match op {
                    AluOp::Add => a.overflowing_add(b),
                    AluOp::Sub => a.overflowing_sub(b),
                    AluOp::And => (a & b, false),
                    AluOp::Or => (a | b, false),
                    AluOp::Xor => (a ^ b, false),
                    AluOp::Shl => (a.wrapping_shl(b), false),
                    AluOp::Shr => (a.wrapping_shr(b), false),
                };
                self.set_reg(rd, result);
                self.state.set_flags(result, carry);
            }

            Instruction::Addi { rd, imm } => {
                let (result, carry) = self.reg(rd).overflowing_add(imm);
                self.set_reg(rd, result);
                self.state.set_flags(result, carry);
            }

            Instruction::Cmp { ra, rb } => {
                let (result, borrow) = self.reg(ra).overflowing_sub(self.reg(rb));
                self.state.set_flags(result, borrow);
            }

            Instruction::Cmpi { ra, imm } => {
                let (result, borrow) = self.reg(ra).overflowing_sub(imm);
                self.state.set_flags(result, borrow);
            }

            // ==================== Memory ====================

            Instruction::Ld { rd, seg, base, offset } => {
                let value = self.read_data(seg, self.reg(base).wrapping_add(offset))?;
                self.set_reg(rd, value);
            }

            Instruction::St { rs, seg, base, offset } => {
                self.write_data(seg, self.reg(base).wrapping_add(offset), self.reg(rs))?;
            }

            Instruction::Stm { seg, offset, imm } => {
                self.write_data(seg, offset, imm)?;
            }

            Instruction::Push { rs } => self.push(self.reg(rs))?,

            Instruction::Pop { rd } => {
                let (value, sp) = self.peek_pop()?;
                self.state.set_reg(STACK_POINTER, sp);
                self.set_reg(rd, value);
            }

            // ==================== Branches ====================

            Instruction::Jmp { target } => next_ip = self.code_target(target)?,

            Instruction::Jz { target } => {
                if self.state.zero() {
                    next_ip = self.code_target(target)?;
                }
            }

            Instruction::Jnz { target } => {
                if !self.state.zero() {
                    next_ip = self.code_target(target)?;
                }
            }

            Instruction::Jn { target } => {
                if self.state.negative() {
                    next_ip = self.code_target(target)?;
                }
            }

            Instruction::Jmpr { rs } => next_ip = self.code_target(self.reg(rs))?,

            Instruction::Call { target } => {
                let dest = self.code_target(target)?;
                let ret = next.wrapping_sub(self.code_base());
                self.push(ret)?;
                next_ip = dest;
            }

            Instruction::Ret => {
                let (offset, sp) = self.peek_pop()?;
                next_ip = self.code_target(offset)?;
                self.state.set_reg(STACK_POINTER, sp);
            }

            Instruction::Jmpf { selector, offset } => {
                let seg = *self
                    .state
                    .segments
                    .check_selector(selector, self.state.priv_lvl, Access::Execute)?;
                if offset >= seg.limit {
                    return Err(Fault::Protection("far jump beyond segment limit"));
                }
                if seg.priv_lvl != self.state.priv_lvl {
                    debug!("privilege level {} -> {}", self.state.priv_lvl, seg.priv_lvl);
                }
                self.state.cs = selector;
                self.state.priv_lvl = seg.priv_lvl;
                next_ip = seg.start + offset;
            }

            // ==================== System ====================

            Instruction::Int { vector } => {
                if !self.state.interrupts_enabled() {
                    return Err(Fault::Protection("software interrupt with interrupts disabled"));
                }
                self.dispatch_interrupt(u32::from(vector), next, false);
                return Ok(());
            }

            Instruction::Iret => {
                self.require_privileged()?;
                let ctx = self.vms.load(INTERRUPT_SLOT);
                self.state.restore(&ctx);
                self.state.int |= INT_GLOBAL_ENABLE;
                return Ok(());
            }

            Instruction::Movs { sreg, rs } => self.write_special(sreg, self.reg(rs))?,

            Instruction::Movr { rd, sreg } => self.set_reg(rd, self.read_special(sreg)),

            Instruction::VmEnter { rs } => {
                self.vm_enter(self.reg(rs), next)?;
                return Ok(());
            }

            Instruction::VmExit => {
                self.vm_exit()?;
                return Ok(());
            }
        }

        self.state.ip = next_ip;
        Ok(())
    }

    #[inline]
    fn reg(&self, index: u8) -> u32 {
        self.state.reg(usize::from(index))
    }

    #[inline]
    fn set_reg(&mut self, index: u8, value: u32) {
        self.state.set_reg(usize::from(index), value);
    }

    fn selector(&self, seg: SegReg) -> u32 {
        match seg {
            SegReg::Ds => self.state.ds,
            SegReg::Es => self.state.es,
            SegReg::Ss => self.state.ss,
            SegReg::Rs => self.state.rs,
        }
    }

    fn linear(&self, selector: u32, offset: u32, access: Access) -> Result<u32, Fault> {
        self.state
            .segments
            .translate(selector, offset, self.state.priv_lvl, access)
    }

    fn read_data(&self, seg: SegReg, offset: u32) -> Result<u32, Fault> {
        let addr = self.linear(self.selector(seg), offset, Access::Read)?;
        self.mem
            .read_word(addr)
            .map_err(|_| Fault::Protection("segment maps outside memory"))
    }

    fn write_data(&mut self, seg: SegReg, offset: u32, value: u32) -> Result<(), Fault> {
        let addr = self.linear(self.selector(seg), offset, Access::Write)?;
        self.mem
            .write_word(addr, value)
            .map_err(|_| Fault::Protection("segment maps outside memory"))
    }

    fn push(&mut self, value: u32) -> Result<(), Fault> {
        let sp = self.state.reg(STACK_POINTER).wrapping_sub(1);
        self.write_data(SegReg::Ss, sp, value)?;
        self.state.set_reg(STACK_POINTER, sp);
        Ok(())
    }

    /// Read the top of stack without committing the pop.
    fn peek_pop(&self) -> Result<(u32, u32), Fault> {
        let sp = self.state.reg(STACK_POINTER);
        let value = self.read_data(SegReg::Ss, sp)?;
        Ok((value, sp.wrapping_add(1)))
    }

    fn code_base(&self) -> u32 {
        self.state.segments.get(self.state.cs).map_or(0, |seg| seg.start)
    }

    /// Linear address of a code segment offset.
    fn code_target(&self, offset: u32) -> Result<u32, Fault> {
        self.linear(self.state.cs, offset, Access::Execute)
    }

    fn require_privileged(&self) -> Result<(), Fault> {
        if self.state.priv_lvl != 0 {
            return Err(Fault::Protection("privileged instruction"));
        }
        Ok(())
    }

    fn read_special(&self, sreg: SpecialReg) -> u32 {
        let s = &self.state;
        match sreg {
            SpecialReg::Cs => s.cs,
            SpecialReg::Ds => s.ds,
            SpecialReg::Es => s.es,
            SpecialReg::Ss => s.ss,
            SpecialReg::Rs => s.rs,
            SpecialReg::Flags => s.flags,
            SpecialReg::VmTbl => s.vm_tbl,
            SpecialReg::SegTbl => s.seg_tbl,
            SpecialReg::Counter => s.counter,
            SpecialReg::Compare => s.compare,
            SpecialReg::Int => s.int,
            SpecialReg::InVm => u32::from(s.in_vm),
            SpecialReg::VmId => s.vm_id,
            SpecialReg::PrivLvl => u32::from(s.priv_lvl),
        }
    }

    fn write_special(&mut self, sreg: SpecialReg, value: u32) -> Result<(), Fault> {
        if sreg.is_read_only() {
            return Err(Fault::Protection("read-only special register"));
        }
        if sreg.is_control() {
            self.require_privileged()?;
        }

        let access = if sreg == SpecialReg::Ss { Access::Write } else { Access::Read };
        match sreg {
            SpecialReg::Ds | SpecialReg::Es | SpecialReg::Ss | SpecialReg::Rs => {
                self.state
                    .segments
                    .check_selector(value, self.state.priv_lvl, access)?;
            }
            _ => {}
        }

        let s = &mut self.state;
        match sreg {
            SpecialReg::Ds => s.ds = value,
            SpecialReg::Es => s.es = value,
            SpecialReg::Ss => s.ss = value,
            SpecialReg::Rs => s.rs = value,
            SpecialReg::Flags => s.flags = value,
            SpecialReg::VmTbl => s.vm_tbl = value,
            SpecialReg::SegTbl => {
                let table = SegmentTable::load(&self.mem, value)?;
                s.segments = table;
                s.seg_tbl = value;
                debug!("segment table loaded from 0x{value:08x}");
            }
            SpecialReg::Counter => s.counter = value,
            SpecialReg::Compare => s.compare = value,
            SpecialReg::Int => s.int = value,
            SpecialReg::Cs | SpecialReg::InVm | SpecialReg::VmId | SpecialReg::PrivLvl => {}
        }
        Ok(())
    }

    /// Enter guest `index` of the in-memory VM descriptor table, parking the
    /// current context (resuming at `next`) in the next nesting slot.
    fn vm_enter(&mut self, index: u32, next: u32) -> Result<(), Fault> {
        self.require_privileged()?;
        if self.vms.is_full() {
            return Err(Fault::VmTableExhausted);
        }

        let addr = index
            .checked_mul(CONTEXT_WORDS as u32)
            .and_then(|off| self.state.vm_tbl.checked_add(off))
            .ok_or(Fault::Protection("VM descriptor outside memory"))?;
        let words = self
            .mem
            .read_range(addr, CONTEXT_WORDS)
            .map_err(|_| Fault::Protection("VM descriptor outside memory"))?;
        let mut raw = [0u32; CONTEXT_WORDS];
        raw.copy_from_slice(&words);
        let guest = VmContext::from_words(&raw);

        let slot = self.vms.push(self.state.context(next))?;
        self.state.restore(&guest);
        self.state.in_vm = true;
        self.state.vm_id = slot as u32;

        debug!("vmenter guest {index} at 0x{:08x}, parent in slot {slot}", guest.ip);
        Ok(())
    }

    /// Return to the parent of the innermost guest.
    fn vm_exit(&mut self) -> Result<(), Fault> {
        let (slot, parent) = self
            .vms
            .pop()
            .ok_or(Fault::Protection("vmexit outside a guest"))?;

        self.state.restore(&parent);
        self.state.vm_id = self.vms.depth() as u32;
        self.state.in_vm = self.state.vm_id != 0;

        debug!("vmexit from slot {slot} to 0x{:08x}", parent.ip);
        Ok(())
    }
}

impl std::fmt::Debug for Cpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cpu")
            .field("status", &self.status)
            .field("cycles", &self.cycles)
            .field("state", &self.state)
            .field("mem", &self.mem)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::object::image_bytes;
    use crate::cpu::decode::encode;
    use crate::cpu::segment::{Segment, SegmentType, DESCRIPTOR_WORDS};
    use crate::cpu::state::{FLAG_ZERO, INT_TIMER_ENABLE};

    /// Build a CPU with each instruction placed at its given address.
    fn cpu_with(mem_words: usize, program: &[(u32, Instruction)]) -> Cpu {
        let mut words = vec![0u32; mem_words];
        for (addr, instr) in program {
            for (i, word) in encode(instr).into_iter().enumerate() {
                words[*addr as usize + i] = word;
            }
        }
        Cpu::new(image_bytes(&words), 0, 0)
    }

    fn write_segments(cpu: &mut Cpu, base: u32, segments: &[Segment]) {
        for (i, seg) in segments.iter().enumerate() {
            for (j, word) in seg.to_descriptor().iter().enumerate() {
                let addr = base + (i * DESCRIPTOR_WORDS + j) as u32;
                cpu.mem.write_word(addr, *word).unwrap();
            }
        }
    }

    /// Kernel code/data/stack, user code (selector 3) and user data
    /// (selector 4, 0x200..0x300).
    fn user_mode_segments() -> Vec<Segment> {
        vec![
            Segment::new(0, 0x400, 0, SegmentType::Code).unwrap(),
            Segment::new(0, 0x400, 0, SegmentType::Data).unwrap(),
            Segment::new(0, 0x400, 0, SegmentType::Stack).unwrap(),
            Segment::new(0, 0x400, 3, SegmentType::Code).unwrap(),
            Segment::new(0x200, 0x100, 3, SegmentType::Data).unwrap(),
        ]
    }

    #[test]
    fn test_zero_image_halts_immediately() {
        let mut cpu = Cpu::new(vec![0; 16], 0, 0);

        assert!(!cpu.step());
        assert!(cpu.is_halted());
        assert_eq!(cpu.state.ip, 0);
    }

    #[test]
    fn test_halted_cpu_does_not_change() {
        let mut cpu = Cpu::new(vec![0; 16], 0, 0);
        cpu.step();
        let before = cpu.state.clone();

        for _ in 0..3 {
            assert!(!cpu.step());
        }
        assert_eq!(cpu.state, before);
        assert_eq!(cpu.cycles, 0);
    }

    #[test]
    fn test_straight_line_arithmetic() {
        let mut cpu = cpu_with(16, &[
            (0, Instruction::Movi { rd: 1, imm: 40 }),
            (2, Instruction::Movi { rd: 2, imm: 2 }),
            (4, Instruction::Alu { op: AluOp::Add, rd: 1, rs: 2 }),
            (5, Instruction::Cmpi { ra: 1, imm: 42 }),
            (7, Instruction::Hlt),
        ]);

        assert_eq!(cpu.run(100), 4);
        assert_eq!(cpu.state.reg(1), 42);
        assert_eq!(cpu.state.flags & FLAG_ZERO, FLAG_ZERO);
        assert_eq!(cpu.state.ip, 7);
        assert_eq!(cpu.state.counter, 4);
    }

    #[test]
    fn test_end_of_memory_halts() {
        let mut cpu = cpu_with(2, &[(0, Instruction::Nop), (1, Instruction::Nop)]);

        assert!(cpu.step());
        assert!(cpu.step());
        assert!(!cpu.step());
        assert_eq!(cpu.state.ip, 2);
    }

    #[test]
    fn test_truncated_instruction_at_end_halts() {
        let words = encode(&Instruction::Movi { rd: 1, imm: 5 });
        let mut cpu = Cpu::new(image_bytes(&words[..1]), 0, 0);

        assert!(!cpu.step());
        assert_eq!(cpu.state.reg(1), 0);
    }

    #[test]
    fn test_invalid_opcode_without_interrupts_halts() {
        let mut cpu = Cpu::new(image_bytes(&[0xff00_0000]), 0, 0);
        assert!(!cpu.step());
        assert!(cpu.is_halted());
    }

    #[test]
    fn test_call_and_ret() {
        let mut cpu = cpu_with(0x100, &[
            (0, Instruction::Movi { rd: 30, imm: 0x100 }),
            (2, Instruction::Call { target: 0x10 }),
            (4, Instruction::Hlt),
            (0x10, Instruction::Push { rs: 30 }),
            (0x11, Instruction::Pop { rd: 5 }),
            (0x12, Instruction::Movi { rd: 1, imm: 5 }),
            (0x14, Instruction::Ret),
        ]);

        assert_eq!(cpu.run(100), 6);
        assert_eq!(cpu.state.ip, 4);
        assert_eq!(cpu.state.reg(1), 5);
        assert_eq!(cpu.state.reg(5), 0xff);
        assert_eq!(cpu.state.reg(30), 0x100);
        assert_eq!(cpu.mem.read_word(0xff).unwrap(), 4);
    }

    #[test]
    fn test_store_and_load_through_segments() {
        let mut cpu = cpu_with(0x40, &[
            (0, Instruction::Stm { seg: SegReg::Ds, offset: 0x30, imm: 0xdead_beef }),
            (3, Instruction::Movi { rd: 2, imm: 0x10 }),
            (5, Instruction::Ld { rd: 1, seg: SegReg::Es, base: 2, offset: 0x20 }),
            (7, Instruction::Hlt),
        ]);

        assert_eq!(cpu.run(10), 3);
        assert_eq!(cpu.state.reg(1), 0xdead_beef);
    }

    #[test]
    fn test_code_segment_cannot_be_stack() {
        let mut cpu = cpu_with(0x40, &[
            (0, Instruction::Movi { rd: 1, imm: 0 }),
            (2, Instruction::Movs { sreg: SpecialReg::Ss, rs: 1 }),
        ]);

        assert!(cpu.step());
        assert!(!cpu.step());
        assert_eq!(cpu.state.ss, 2);
        assert_eq!(cpu.state.ip, 2);
    }

    #[test]
    fn test_privilege_drop_and_fault() {
        let mut cpu = cpu_with(0x400, &[
            (0, Instruction::Movi { rd: 1, imm: 0x300 }),
            (2, Instruction::Movs { sreg: SpecialReg::SegTbl, rs: 1 }),
            (3, Instruction::Jmpf { selector: 3, offset: 6 }),
            (6, Instruction::Ld { rd: 2, seg: SegReg::Ds, base: 0, offset: 0 }),
            (8, Instruction::Hlt),
        ]);
        write_segments(&mut cpu, 0x300, &user_mode_segments());

        assert!(cpu.step());
        assert!(cpu.step());
        assert!(cpu.step());
        assert_eq!(cpu.state.priv_lvl, 3);
        assert_eq!(cpu.state.cs, 3);

        // DS is a level 0 segment; with interrupts off the fault halts.
        assert!(!cpu.step());
        assert!(cpu.is_halted());
        assert_eq!(cpu.state.ip, 6);
        assert_eq!(cpu.state.reg(2), 0);
    }

    #[test]
    fn test_user_mode_access_to_user_segment() {
        let mut cpu = cpu_with(0x400, &[
            (0, Instruction::Movi { rd: 1, imm: 0x300 }),
            (2, Instruction::Movs { sreg: SpecialReg::SegTbl, rs: 1 }),
            (3, Instruction::Movi { rd: 1, imm: 4 }),
            (5, Instruction::Movs { sreg: SpecialReg::Ds, rs: 1 }),
            (6, Instruction::Jmpf { selector: 3, offset: 9 }),
            (9, Instruction::Ld { rd: 2, seg: SegReg::Ds, base: 0, offset: 1 }),
            (11, Instruction::Movs { sreg: SpecialReg::Int, rs: 1 }),
        ]);
        write_segments(&mut cpu, 0x300, &user_mode_segments());
        cpu.mem.write_word(0x201, 0x1234).unwrap();

        assert_eq!(cpu.run(5), 5);
        assert!(cpu.step());
        assert_eq!(cpu.state.reg(2), 0x1234);

        // Control registers stay out of reach at level 3.
        assert!(!cpu.step());
        assert_eq!(cpu.state.int, 0);
    }

    #[test]
    fn test_fault_dispatches_interrupt() {
        let mut cpu = cpu_with(0x400, &[
            (0, Instruction::Movi { rd: 1, imm: 0x300 }),
            (2, Instruction::Movs { sreg: SpecialReg::SegTbl, rs: 1 }),
            (3, Instruction::Movi { rd: 4, imm: 1 }),
            (5, Instruction::Movs { sreg: SpecialReg::Int, rs: 4 }),
            (6, Instruction::Jmp { target: 12 }),
            // protection fault handler (vector 2)
            (8, Instruction::Movi { rd: 5, imm: 0xfa17 }),
            (10, Instruction::Hlt),
            (12, Instruction::Jmpf { selector: 3, offset: 15 }),
            (15, Instruction::Ld { rd: 2, seg: SegReg::Ds, base: 0, offset: 0 }),
            (17, Instruction::Hlt),
        ]);
        write_segments(&mut cpu, 0x300, &user_mode_segments());

        assert_eq!(cpu.run(6), 6);
        assert_eq!(cpu.state.priv_lvl, 3);

        assert!(cpu.step());
        assert_eq!(cpu.state.ip, 8);
        assert_eq!(cpu.state.cs, HANDLER_CS);
        assert_eq!(cpu.state.priv_lvl, 0);
        assert!(!cpu.state.interrupts_enabled());

        let saved = cpu.vms.load(INTERRUPT_SLOT);
        assert_eq!(saved.ip, 15);
        assert_eq!(saved.cs, 3);
        assert_eq!(saved.priv_lvl, 3);

        assert!(cpu.step());
        assert_eq!(cpu.state.reg(5), 0xfa17);
        assert!(!cpu.step());
    }

    #[test]
    fn test_timer_interrupt_and_iret() {
        let mut cpu = cpu_with(0x40, &[
            (0, Instruction::Jmp { target: 0x20 }),
            // timer handler (vector 1)
            (4, Instruction::Movi { rd: 7, imm: 1 }),
            (6, Instruction::Iret),
            (0x20, Instruction::Movi { rd: 1, imm: 6 }),
            (0x22, Instruction::Movs { sreg: SpecialReg::Compare, rs: 1 }),
            (0x23, Instruction::Movi { rd: 1, imm: 3 }),
            (0x25, Instruction::Movs { sreg: SpecialReg::Int, rs: 1 }),
            (0x26, Instruction::Nop),
            (0x27, Instruction::Hlt),
        ]);

        assert_eq!(cpu.run(6), 6);
        assert_eq!(cpu.state.counter, 6);
        assert_eq!(cpu.state.ip, 4);
        assert_eq!(cpu.state.int, INT_TIMER_ENABLE);
        assert_eq!(cpu.vms.load(INTERRUPT_SLOT).ip, 0x27);
        assert_eq!(
            cpu.last_interrupt,
            Some(InterruptTaken { vector: VECTOR_TIMER, faulted: false })
        );

        assert!(cpu.step());
        assert!(cpu.step());
        assert_eq!(cpu.state.ip, 0x27);
        assert_eq!(cpu.state.int, INT_GLOBAL_ENABLE | INT_TIMER_ENABLE);
        assert_eq!(cpu.state.reg(7), 1);
        assert!(!cpu.step());
    }

    #[test]
    fn test_software_interrupt_requires_enable() {
        let mut cpu = cpu_with(0x10, &[(0, Instruction::Int { vector: 2 })]);
        assert!(!cpu.step());
        assert_eq!(cpu.state.ip, 0);
    }

    fn guest_descriptor(cpu: &mut Cpu, base: u32, ip: u32, priv_lvl: u8) {
        let guest = VmContext { cs: 0, ds: 1, es: 1, ss: 2, rs: 1, ip, flags: 0, priv_lvl };
        for (i, word) in guest.to_words().iter().enumerate() {
            cpu.mem.write_word(base + i as u32, *word).unwrap();
        }
    }

    #[test]
    fn test_vm_enter_and_exit() {
        let mut cpu = cpu_with(0x400, &[
            (0, Instruction::Movi { rd: 1, imm: 0x300 }),
            (2, Instruction::Movs { sreg: SpecialReg::VmTbl, rs: 1 }),
            (3, Instruction::Movi { rd: 2, imm: 1 }),
            (5, Instruction::VmEnter { rs: 2 }),
            (6, Instruction::Hlt),
            (0x40, Instruction::Movi { rd: 9, imm: 0x77 }),
            (0x42, Instruction::VmExit),
        ]);
        guest_descriptor(&mut cpu, 0x308, 0x40, 0);

        assert_eq!(cpu.run(4), 4);
        assert!(cpu.state.in_vm);
        assert_eq!(cpu.state.vm_id, 1);
        assert_eq!(cpu.state.ip, 0x40);
        assert_eq!(cpu.vms.load(1).ip, 6);

        assert!(cpu.step());
        assert!(cpu.step());
        assert!(!cpu.state.in_vm);
        assert_eq!(cpu.state.vm_id, 0);
        assert_eq!(cpu.state.ip, 6);
        assert_eq!(cpu.state.reg(9), 0x77);
        assert!(!cpu.step());
    }

    #[test]
    fn test_nested_vm_exhausts_table() {
        let mut cpu = cpu_with(0x400, &[
            (0, Instruction::Movi { rd: 1, imm: 0x300 }),
            (2, Instruction::Movs { sreg: SpecialReg::VmTbl, rs: 1 }),
            (3, Instruction::VmEnter { rs: 2 }),
            (0x40, Instruction::VmEnter { rs: 2 }),
        ]);
        guest_descriptor(&mut cpu, 0x300, 0x40, 0);

        let limit = crate::cpu::vm_table::VM_TABLE_SIZE as u64 - 1;
        assert_eq!(cpu.run(100), 2 + limit);
        assert!(cpu.is_halted());
        assert!(cpu.state.in_vm);
        assert_eq!(cpu.state.vm_id, limit as u32);
        assert!(cpu.vms.is_full());
    }

    #[test]
    fn test_exhausted_table_raises_interrupt() {
        let mut cpu = cpu_with(0x400, &[
            (0, Instruction::Movi { rd: 1, imm: 0x300 }),
            (2, Instruction::Movs { sreg: SpecialReg::VmTbl, rs: 1 }),
            (3, Instruction::Movi { rd: 4, imm: 1 }),
            (5, Instruction::Movs { sreg: SpecialReg::Int, rs: 4 }),
            (6, Instruction::VmEnter { rs: 2 }),
            (0x40, Instruction::VmEnter { rs: 2 }),
        ]);
        guest_descriptor(&mut cpu, 0x300, 0x40, 0);

        let limit = crate::cpu::vm_table::VM_TABLE_SIZE - 1;
        assert_eq!(cpu.run(4 + limit as u64), 4 + limit as u64);
        assert!(cpu.vms.is_full());

        assert!(cpu.step());
        assert!(cpu.is_running());
        assert_eq!(cpu.state.ip, VECTOR_VM_EXHAUSTED * VECTOR_STRIDE);
        assert_eq!(cpu.vms.load(INTERRUPT_SLOT).ip, 0x40);
        assert_eq!(cpu.state.vm_id, limit as u32);
        assert_eq!(cpu.vms.depth(), limit);
        assert_eq!(
            cpu.last_interrupt,
            Some(InterruptTaken { vector: VECTOR_VM_EXHAUSTED, faulted: true })
        );
    }

    #[test]
    fn test_vm_exit_outside_guest_faults() {
        let mut cpu = cpu_with(0x10, &[(0, Instruction::VmExit)]);
        assert!(!cpu.step());
        assert_eq!(cpu.state.ip, 0);
    }

    #[test]
    fn test_reset_restores_image() {
        let mut cpu = cpu_with(0x20, &[
            (0, Instruction::Stm { seg: SegReg::Ds, offset: 0x10, imm: 7 }),
            (3, Instruction::Hlt),
        ]);
        cpu.run(10);
        assert_eq!(cpu.mem.read_word(0x10).unwrap(), 7);

        cpu.reset();
        assert!(cpu.is_running());
        assert_eq!(cpu.state.ip, 0);
        assert_eq!(cpu.mem.read_word(0x10).unwrap(), 0);
        assert_eq!(cpu.mem.len(), 0x20);
    }

    #[test]
    fn test_from_object_uses_entry_and_size() {
        let object = ObjectFile {
            entry: 2,
            memory_words: 0x100,
            image: image_bytes(&encode(&Instruction::Nop)),
        };
        let cpu = Cpu::from_object(&object, 0);

        assert_eq!(cpu.state.ip, 2);
        assert_eq!(cpu.mem.len(), 0x100);
    }
}
