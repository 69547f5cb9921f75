//! Program artifacts for VM32.
//!
//! This module provides:
//! - the object file format (header + raw memory image)
//! - a disassembler (raw words → readable text)

pub mod disasm;
pub mod object;

pub use disasm::Disassembler;
pub use object::{ObjectFile, LoadError, load_object, save_object, parse_object, check_memory_words};
