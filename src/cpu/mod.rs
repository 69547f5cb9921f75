//! CPU emulation for VM32.
//!
//! This module implements the VM32 architecture:
//! - word-addressed memory behind an 8-entry segment table
//! - privilege levels, with 0 the most privileged
//! - 31 general purpose registers plus selector, timer and interrupt state
//! - a 16-slot VM context table for interrupts and nested guests

pub mod memory;
pub mod segment;
pub mod state;
pub mod vm_table;
pub mod decode;
pub mod execute;

pub use memory::{Memory, MemoryError};
pub use segment::{Segment, SegmentTable, SegmentType};
pub use state::State;
pub use vm_table::{VmContext, VmTable};
pub use decode::{Instruction, DecodeError};
pub use execute::{Cpu, CpuState, Fault, InterruptTaken};
