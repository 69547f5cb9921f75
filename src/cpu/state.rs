//! VM32 architectural state.
//!
//! Everything a program can observe about the CPU except memory and the
//! VM context table:
//! - selectors CS, DS, ES, SS, RS into the segment table
//! - IP, a linear address inside CS
//! - Flags, the timer (Counter/Compare) and the interrupt enables
//! - the current privilege level (0 is the most privileged)
//! - 31 general purpose registers, r30 doubling as the stack pointer

use crate::cpu::segment::SegmentTable;
use crate::cpu::vm_table::VmContext;
use serde::{Serialize, Deserialize};

/// Number of general purpose registers.
pub const NUM_REGISTERS: usize = 31;

/// Register used as stack pointer by push/pop/call/ret.
pub const STACK_POINTER: usize = 30;

/// Flags: result was zero.
pub const FLAG_ZERO: u32 = 1 << 0;
/// Flags: result had bit 31 set.
pub const FLAG_NEGATIVE: u32 = 1 << 1;
/// Flags: unsigned carry out of add, or borrow out of sub.
pub const FLAG_CARRY: u32 = 1 << 2;

/// Int: global interrupt enable.
pub const INT_GLOBAL_ENABLE: u32 = 1 << 0;
/// Int: timer interrupt enable.
pub const INT_TIMER_ENABLE: u32 = 1 << 1;

/// Reset selectors.
pub const RESET_CS: u32 = 0;
pub const RESET_DS: u32 = 1;
pub const RESET_ES: u32 = 1;
pub const RESET_SS: u32 = 2;
pub const RESET_RS: u32 = 1;

/// Architectural state of the CPU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub cs: u32,
    pub ds: u32,
    pub es: u32,
    pub ss: u32,
    pub rs: u32,

    /// Linear address of the next instruction.
    pub ip: u32,
    pub flags: u32,

    /// Linear base of the in-memory VM descriptor table.
    pub vm_tbl: u32,
    /// Linear base the segment table was last loaded from.
    pub seg_tbl: u32,

    /// Executing inside a nested context.
    pub in_vm: bool,
    /// VM context table slot holding the parent of the current context.
    pub vm_id: u32,

    pub counter: u32,
    pub compare: u32,
    /// Bit 0: global interrupt enable, bit 1: timer interrupt enable.
    pub int: u32,

    pub priv_lvl: u8,

    regs: [u32; NUM_REGISTERS],

    /// Segment table cached from memory.
    pub segments: SegmentTable,
}

impl State {
    /// Reset state for a memory of `mem_words` words, starting at `entry`.
    pub fn new(mem_words: usize, entry: u32) -> Self {
        Self {
            cs: RESET_CS,
            ds: RESET_DS,
            es: RESET_ES,
            ss: RESET_SS,
            rs: RESET_RS,
            ip: entry,
            flags: 0,
            vm_tbl: 0,
            seg_tbl: 0,
            in_vm: false,
            vm_id: 0,
            counter: 0,
            compare: 0,
            int: 0,
            priv_lvl: 0,
            regs: [0; NUM_REGISTERS],
            segments: SegmentTable::flat(mem_words),
        }
    }

    /// Read a general purpose register.
    ///
    /// # Panics
    /// Panics if `index >= 31`. The decoder never produces such indices.
    #[inline]
    pub fn reg(&self, index: usize) -> u32 {
        self.regs[index]
    }

    /// Write a general purpose register.
    ///
    /// # Panics
    /// Panics if `index >= 31`.
    #[inline]
    pub fn set_reg(&mut self, index: usize, value: u32) {
        self.regs[index] = value;
    }

    /// All general purpose registers, r0 first.
    pub fn regs(&self) -> &[u32; NUM_REGISTERS] {
        &self.regs
    }

    /// Set Z and N from a result, and C from `carry`.
    pub fn set_flags(&mut self, result: u32, carry: bool) {
        let mut flags = self.flags & !(FLAG_ZERO | FLAG_NEGATIVE | FLAG_CARRY);
        if result == 0 {
            flags |= FLAG_ZERO;
        }
        if result & 0x8000_0000 != 0 {
            flags |= FLAG_NEGATIVE;
        }
        if carry {
            flags |= FLAG_CARRY;
        }
        self.flags = flags;
    }

    pub fn zero(&self) -> bool {
        self.flags & FLAG_ZERO != 0
    }

    pub fn negative(&self) -> bool {
        self.flags & FLAG_NEGATIVE != 0
    }

    /// Check the global interrupt enable.
    pub fn interrupts_enabled(&self) -> bool {
        self.int & INT_GLOBAL_ENABLE != 0
    }

    /// Check that both the timer and the global interrupt enables are set.
    pub fn timer_armed(&self) -> bool {
        self.int & (INT_GLOBAL_ENABLE | INT_TIMER_ENABLE) == INT_GLOBAL_ENABLE | INT_TIMER_ENABLE
    }

    /// Capture the current execution context with the given resume IP.
    pub fn context(&self, ip: u32) -> VmContext {
        VmContext {
            cs: self.cs,
            ds: self.ds,
            es: self.es,
            ss: self.ss,
            rs: self.rs,
            ip,
            flags: self.flags,
            priv_lvl: self.priv_lvl,
        }
    }

    /// Switch to a saved execution context.
    pub fn restore(&mut self, ctx: &VmContext) {
        self.cs = ctx.cs;
        self.ds = ctx.ds;
        self.es = ctx.es;
        self.ss = ctx.ss;
        self.rs = ctx.rs;
        self.ip = ctx.ip;
        self.flags = ctx.flags;
        self.priv_lvl = ctx.priv_lvl;
    }
}
