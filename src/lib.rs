//! # VM32
//!
//! An emulator of the VM32 32-bit CPU together with an interactive
//! debugger.
//!
//! VM32 is a word-addressed machine with segmented memory, privilege
//! levels, a programmable timer and a table of saved execution contexts
//! used both for interrupt delivery and for running nested guests.

pub mod cpu;
pub mod asm;
pub mod debugger;

// Re-export commonly used types
pub use cpu::{Cpu, CpuState, Memory, MemoryError, State, Instruction};
pub use asm::{Disassembler, ObjectFile, LoadError, load_object, save_object};
pub use debugger::{Debugger, CommandError};
