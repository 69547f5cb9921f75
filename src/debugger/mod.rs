//! Interactive debugger for VM32.
//!
//! A line-oriented REPL on top of the CPU: breakpoints, single stepping,
//! cancellable `continue` and views of memory, registers and both tables.

pub mod app;
pub mod commands;
pub mod repl;

pub use app::Debugger;
pub use commands::{execute, CommandError, Reply};
pub use repl::{run_debugger, History};
