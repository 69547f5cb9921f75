//! Debugger state and logic.

use crate::asm::disasm::Disassembler;
use crate::cpu::decode::MAX_INSTRUCTION_WORDS;
use crate::cpu::execute::{Cpu, InterruptTaken};
use crate::cpu::state::{INT_GLOBAL_ENABLE, INT_TIMER_ENABLE, STACK_POINTER};
use crate::debugger::commands::CommandError;
use std::fmt::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Words printed per line by `read` and `stack`.
const WORDS_PER_LINE: usize = 4;

/// Debugger control plane.
///
/// Owns the CPU being debugged and the breakpoint list. Every operation
/// returns the text it wants printed, so the REPL stays a thin shell.
pub struct Debugger {
    /// The CPU being debugged.
    pub cpu: Cpu,
    disasm: Disassembler,
    /// Breakpoint addresses in insertion order.
    breakpoints: Vec<u32>,
    /// Set from outside (SIGINT) to stop a running `continue`.
    cancel: Arc<AtomicBool>,
}

impl Debugger {
    /// Create a debugger around a loaded CPU.
    pub fn new(cpu: Cpu, disasm: Disassembler) -> Self {
        Self {
            cpu,
            disasm,
            breakpoints: Vec::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that stops `continue` after the current instruction when set.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn breakpoints(&self) -> &[u32] {
        &self.breakpoints
    }

    /// Add a breakpoint. Duplicates are refused.
    pub fn add_breakpoint(&mut self, addr: u32) -> Result<(), CommandError> {
        if self.breakpoints.contains(&addr) {
            return Err(CommandError::DuplicateBreakpoint(addr));
        }
        self.breakpoints.push(addr);
        Ok(())
    }

    /// Remove the breakpoint at position `index` of the list.
    pub fn delete_breakpoint(&mut self, index: usize) -> Result<u32, CommandError> {
        if index >= self.breakpoints.len() {
            return Err(CommandError::OutOfBounds);
        }
        Ok(self.breakpoints.remove(index))
    }

    /// List breakpoints with their indices.
    pub fn list_breakpoints(&self) -> String {
        if self.breakpoints.is_empty() {
            return "No breakpoints\n".to_string();
        }

        let mut out = String::new();
        for (idx, bp) in self.breakpoints.iter().enumerate() {
            let _ = writeln!(out, "{idx} - 0x{bp:x}");
        }
        out
    }

    /// Hex dump `len` words starting at `addr`, four per line.
    ///
    /// Reads bypass segmentation and privilege checks.
    pub fn read_memory(&self, addr: u32, len: u32) -> Result<String, CommandError> {
        let words = self.cpu.mem.read_range(addr, len as usize)?;

        let mut out = String::new();
        for line in words.chunks(WORDS_PER_LINE) {
            let hex: Vec<String> = line.iter().map(|w| format!("{w:08x}")).collect();
            out.push_str(&hex.join(" "));
            out.push('\n');
        }
        Ok(out)
    }

    pub fn write_memory(&mut self, addr: u32, value: u32) -> Result<(), CommandError> {
        self.cpu.mem.write_word(addr, value)?;
        Ok(())
    }

    /// Hex dump `len` words from the stack pointer up.
    pub fn read_stack(&self, len: u32) -> Result<String, CommandError> {
        self.read_memory(self.cpu.state.reg(STACK_POINTER), len)
    }

    /// Execute one instruction and describe it.
    ///
    /// A faulting instruction is reported as the fault it raised rather
    /// than as executed; any other interrupt taken is noted after it.
    pub fn step(&mut self) -> String {
        let ip = self.cpu.state.ip;
        let raw = self.fetch_raw(ip);

        if !self.cpu.step() {
            return "CPU Simulation ended\n".to_string();
        }

        let handler = self.cpu.state.ip;
        match self.cpu.last_interrupt {
            Some(InterruptTaken { vector, faulted: true }) => {
                format!("Fault at 0x{ip:08x}: interrupt {vector}, handler at 0x{handler:08x}\n")
            }
            Some(InterruptTaken { vector, faulted: false }) => {
                let (line, _) = self.disasm.listing_line(ip, &raw);
                format!("{line}\nInterrupt {vector}, handler at 0x{handler:08x}\n")
            }
            None => {
                let (line, _) = self.disasm.listing_line(ip, &raw);
                line + "\n"
            }
        }
    }

    /// Run until a breakpoint, halt, or cancellation.
    ///
    /// Breakpoints are checked against IP after each step, so a breakpoint
    /// at the current IP does not stop the first step.
    pub fn cont(&mut self) -> String {
        self.cancel.store(false, Ordering::SeqCst);
        let start = self.cpu.cycles;

        loop {
            if self.cancel.swap(false, Ordering::SeqCst) {
                debug!("continue cancelled after {} steps", self.cpu.cycles - start);
                return format!("Breaking at 0x{:08x}\n", self.cpu.state.ip);
            }

            if !self.cpu.step() {
                return "CPU Simulation ended\n".to_string();
            }

            let ip = self.cpu.state.ip;
            if self.breakpoints.contains(&ip) {
                let (line, _) = self.disasm.listing_line(ip, &self.fetch_raw(ip));
                return format!("Breakpoint hit at 0x{ip:08x}\n{line}\n");
            }
        }
    }

    /// Disassemble `count` instructions starting at `addr`.
    pub fn disassemble(&self, addr: u32, count: u32) -> Result<String, CommandError> {
        let mut out = String::new();
        let mut addr = addr;

        for _ in 0..count {
            self.cpu.mem.read_word(addr)?;
            let (line, consumed) = self.disasm.listing_line(addr, &self.fetch_raw(addr));
            out.push_str(&line);
            out.push('\n');
            addr = addr.wrapping_add(consumed as u32);
        }
        Ok(out)
    }

    /// Format the full architectural state.
    pub fn registers(&self) -> String {
        let s = &self.cpu.state;
        let mut out = String::new();

        let _ = writeln!(out, "CS: 0x{:08x}", s.cs);
        let _ = writeln!(out, "DS: 0x{:08x}", s.ds);
        let _ = writeln!(out, "ES: 0x{:08x}", s.es);
        let _ = writeln!(out, "SS: 0x{:08x}", s.ss);
        let _ = writeln!(out, "RS: 0x{:08x}", s.rs);
        out.push('\n');

        let _ = writeln!(out, "IP: 0x{:08x}", s.ip);
        out.push('\n');

        let _ = writeln!(out, "Flags: 0x{:08x}", s.flags);
        out.push('\n');

        let _ = writeln!(out, "VmTbl: 0x{:08x}", s.vm_tbl);
        let _ = writeln!(out, "SegTbl: 0x{:08x}", s.seg_tbl);
        out.push('\n');

        let _ = writeln!(out, "InVM: {}", s.in_vm);
        let _ = writeln!(out, "VmID: 0x{:08x}", s.vm_id);
        out.push('\n');

        let _ = writeln!(out, "Counter: {}", s.counter);
        let _ = writeln!(out, "Compare: 0x{:08x}", s.compare);
        let _ = writeln!(
            out,
            "INT: 0x{:08x} - Timer Interrupt-Enable: {}, Global Interrupt-Enable: {}",
            s.int,
            s.int & INT_TIMER_ENABLE != 0,
            s.int & INT_GLOBAL_ENABLE != 0
        );
        out.push('\n');

        let _ = writeln!(out, "privLvl: 0x{:02x}", s.priv_lvl);
        for (i, value) in s.regs().iter().enumerate() {
            let _ = writeln!(out, "r{i:02}: {value:08x}");
        }
        out
    }

    pub fn segment_table(&self) -> String {
        let mut out = String::new();
        for (idx, seg) in self.cpu.state.segments.iter().enumerate() {
            let _ = writeln!(
                out,
                "Segment {idx} - Start: 0x{:08x} - Limit: 0x{:08x} - PrivLvl: 0x{:02x} - Type: {}",
                seg.start,
                seg.limit,
                seg.priv_lvl,
                seg.kind.name()
            );
        }
        out
    }

    pub fn vm_table(&self) -> String {
        let mut out = String::new();
        for (idx, vm) in self.cpu.vms.iter() {
            let _ = writeln!(
                out,
                "VM {idx} - CS: {} - DS: {} - ES: {} - SS: {} - RS: {} - IP: 0x{:08x} - Flags: 0x{:08x} - PrivLvl: 0x{:02x}",
                vm.cs, vm.ds, vm.es, vm.ss, vm.rs, vm.ip, vm.flags, vm.priv_lvl
            );
        }
        out
    }

    /// Reset the CPU. Breakpoints are kept.
    pub fn reset(&mut self) -> String {
        self.cpu.reset();
        "Resetting CPU\n".to_string()
    }

    /// The three words at `addr`, zero past the end of memory.
    fn fetch_raw(&self, addr: u32) -> [u32; MAX_INSTRUCTION_WORDS] {
        let mut raw = [0u32; MAX_INSTRUCTION_WORDS];
        for (i, slot) in raw.iter_mut().enumerate() {
            *slot = addr
                .checked_add(i as u32)
                .and_then(|a| self.cpu.mem.read_word(a).ok())
                .unwrap_or(0);
        }
        raw
    }
}
