//! Debugger command table.
//!
//! Every command names its argument arity up front; arguments are parsed as
//! integers (decimal, `0x` hex or `0`-prefixed octal) before the handler
//! runs, so a malformed line never reaches the debugger.

use crate::cpu::memory::MemoryError;
use crate::debugger::app::Debugger;
use thiserror::Error;

/// What the REPL should do after a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Print the text and read the next command.
    Output(String),
    /// Leave the command loop.
    Quit,
}

type Handler = fn(&mut Debugger, &[u32]) -> Result<Reply, CommandError>;

/// A debugger command.
pub struct Command {
    pub name: &'static str,
    pub usage: &'static str,
    pub help: &'static str,
    min_args: usize,
    max_args: usize,
    handler: Handler,
}

/// All commands, in `help` order.
pub static COMMANDS: &[Command] = &[
    Command { name: "break", usage: "break <addr>", help: "set a breakpoint", min_args: 1, max_args: 1, handler: cmd_break },
    Command { name: "del", usage: "del <idx>", help: "delete a breakpoint by list index", min_args: 1, max_args: 1, handler: cmd_del },
    Command { name: "list", usage: "list", help: "list breakpoints", min_args: 0, max_args: 0, handler: cmd_list },
    Command { name: "read", usage: "read <addr> [len]", help: "dump memory words", min_args: 1, max_args: 2, handler: cmd_read },
    Command { name: "write", usage: "write <addr> <val>", help: "write a memory word", min_args: 2, max_args: 2, handler: cmd_write },
    Command { name: "stack", usage: "stack <len>", help: "dump words at the stack pointer (r30)", min_args: 1, max_args: 1, handler: cmd_stack },
    Command { name: "reg", usage: "reg", help: "show registers", min_args: 0, max_args: 0, handler: cmd_reg },
    Command { name: "step", usage: "step", help: "execute one instruction", min_args: 0, max_args: 0, handler: cmd_step },
    Command { name: "disassemble", usage: "disassemble <addr> [count]", help: "disassemble instructions", min_args: 1, max_args: 2, handler: cmd_disassemble },
    Command { name: "continue", usage: "continue", help: "run until breakpoint, halt or Ctrl-C", min_args: 0, max_args: 0, handler: cmd_continue },
    Command { name: "segtbl", usage: "segtbl", help: "show the segment table", min_args: 0, max_args: 0, handler: cmd_segtbl },
    Command { name: "vmtbl", usage: "vmtbl", help: "show the VM context table", min_args: 0, max_args: 0, handler: cmd_vmtbl },
    Command { name: "reset", usage: "reset", help: "reset the CPU and reload memory", min_args: 0, max_args: 0, handler: cmd_reset },
    Command { name: "help", usage: "help", help: "list commands", min_args: 0, max_args: 0, handler: cmd_help },
    Command { name: "quit", usage: "quit", help: "leave the debugger", min_args: 0, max_args: 0, handler: cmd_quit },
];

/// Find a command by name.
pub fn lookup(name: &str) -> Option<&'static Command> {
    COMMANDS.iter().find(|c| c.name == name)
}

/// Run one command line against the debugger.
///
/// Errors are rendered as output; state is left untouched when a command
/// fails.
pub fn execute(dbg: &mut Debugger, line: &str) -> Reply {
    match dispatch(dbg, line) {
        Ok(reply) => reply,
        Err(e) => Reply::Output(format!("{e}\n")),
    }
}

fn dispatch(dbg: &mut Debugger, line: &str) -> Result<Reply, CommandError> {
    let mut parts = line.split_whitespace();
    let Some(name) = parts.next() else {
        return Ok(Reply::Output(String::new()));
    };

    let command = lookup(name).ok_or_else(|| CommandError::UnknownCommand(name.to_string()))?;
    let args = parts.map(parse_int).collect::<Result<Vec<_>, _>>()?;
    if args.len() < command.min_args || args.len() > command.max_args {
        return Err(CommandError::Parse);
    }

    (command.handler)(dbg, &args)
}

/// Parse an integer argument: `0x` prefix for hex, a leading `0` for
/// octal, decimal otherwise.
pub fn parse_int(s: &str) -> Result<u32, CommandError> {
    let (digits, radix) = if let Some(hex) = s.strip_prefix("0x") {
        (hex, 16)
    } else if s.len() > 1 && s.starts_with('0') {
        (&s[1..], 8)
    } else {
        (s, 10)
    };
    // from_str_radix takes a leading sign; arguments are unsigned digits only.
    if digits.starts_with(['+', '-']) {
        return Err(CommandError::Parse);
    }
    u32::from_str_radix(digits, radix).map_err(|_| CommandError::Parse)
}

fn output(text: String) -> Result<Reply, CommandError> {
    Ok(Reply::Output(text))
}

fn cmd_break(dbg: &mut Debugger, args: &[u32]) -> Result<Reply, CommandError> {
    dbg.add_breakpoint(args[0])?;
    output(String::new())
}

fn cmd_del(dbg: &mut Debugger, args: &[u32]) -> Result<Reply, CommandError> {
    dbg.delete_breakpoint(args[0] as usize)?;
    output(String::new())
}

fn cmd_list(dbg: &mut Debugger, _: &[u32]) -> Result<Reply, CommandError> {
    output(dbg.list_breakpoints())
}

fn cmd_read(dbg: &mut Debugger, args: &[u32]) -> Result<Reply, CommandError> {
    output(dbg.read_memory(args[0], args.get(1).copied().unwrap_or(1))?)
}

fn cmd_write(dbg: &mut Debugger, args: &[u32]) -> Result<Reply, CommandError> {
    dbg.write_memory(args[0], args[1])?;
    output(String::new())
}

fn cmd_stack(dbg: &mut Debugger, args: &[u32]) -> Result<Reply, CommandError> {
    output(dbg.read_stack(args[0])?)
}

fn cmd_reg(dbg: &mut Debugger, _: &[u32]) -> Result<Reply, CommandError> {
    output(dbg.registers())
}

fn cmd_step(dbg: &mut Debugger, _: &[u32]) -> Result<Reply, CommandError> {
    output(dbg.step())
}

fn cmd_disassemble(dbg: &mut Debugger, args: &[u32]) -> Result<Reply, CommandError> {
    output(dbg.disassemble(args[0], args.get(1).copied().unwrap_or(1))?)
}

fn cmd_continue(dbg: &mut Debugger, _: &[u32]) -> Result<Reply, CommandError> {
    output(dbg.cont())
}

fn cmd_segtbl(dbg: &mut Debugger, _: &[u32]) -> Result<Reply, CommandError> {
    output(dbg.segment_table())
}

fn cmd_vmtbl(dbg: &mut Debugger, _: &[u32]) -> Result<Reply, CommandError> {
    output(dbg.vm_table())
}

fn cmd_reset(dbg: &mut Debugger, _: &[u32]) -> Result<Reply, CommandError> {
    output(dbg.reset())
}

fn cmd_help(_: &mut Debugger, _: &[u32]) -> Result<Reply, CommandError> {
    let width = COMMANDS.iter().map(|c| c.usage.len()).max().unwrap_or(0);
    let text = COMMANDS
        .iter()
        .map(|c| format!("{:width$}  {}\n", c.usage, c.help))
        .collect();
    output(text)
}

fn cmd_quit(_: &mut Debugger, _: &[u32]) -> Result<Reply, CommandError> {
    Ok(Reply::Quit)
}

/// Errors reported for a single command line.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Argument parsing failed")]
    Parse,

    #[error("Argument parsing failed: {0}")]
    Memory(#[from] MemoryError),

    #[error("Argument out of bounds")]
    OutOfBounds,

    #[error("Breakpoint already set at 0x{0:08x}")]
    DuplicateBreakpoint(u32),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::disasm::Disassembler;
    use crate::cpu::execute::Cpu;

    fn debugger() -> Debugger {
        Debugger::new(Cpu::new(vec![0; 16], 0x200, 0), Disassembler::new())
    }

    fn text(reply: Reply) -> String {
        match reply {
            Reply::Output(text) => text,
            Reply::Quit => panic!("unexpected quit"),
        }
    }

    #[test]
    fn test_parse_int_bases() {
        assert_eq!(parse_int("16").unwrap(), 16);
        assert_eq!(parse_int("0x10").unwrap(), 16);
        assert_eq!(parse_int("020").unwrap(), 16);
        assert_eq!(parse_int("0").unwrap(), 0);
        assert!(parse_int("0x").is_err());
        assert!(parse_int("09").is_err());
        assert!(parse_int("-1").is_err());
        assert!(parse_int("abc").is_err());
    }

    #[test]
    fn test_parse_int_rejects_sign() {
        assert!(parse_int("+5").is_err());
        assert!(parse_int("0x+10").is_err());
        assert!(parse_int("0+7").is_err());
        assert!(parse_int("+").is_err());

        let mut dbg = debugger();
        assert_eq!(text(execute(&mut dbg, "break +5")), "Argument parsing failed\n");
        assert!(dbg.breakpoints().is_empty());
    }

    #[test]
    fn test_write_then_read() {
        let mut dbg = debugger();

        assert_eq!(text(execute(&mut dbg, "write 0x100 0xdeadbeef")), "");
        assert_eq!(text(execute(&mut dbg, "read 0x100 1")), "deadbeef\n");
    }

    #[test]
    fn test_bad_arguments_leave_state() {
        let mut dbg = debugger();

        assert_eq!(text(execute(&mut dbg, "break")), "Argument parsing failed\n");
        assert_eq!(text(execute(&mut dbg, "break zz")), "Argument parsing failed\n");
        assert_eq!(text(execute(&mut dbg, "break 1 2")), "Argument parsing failed\n");
        assert!(dbg.breakpoints().is_empty());

        let out = text(execute(&mut dbg, "write 0x1000 1"));
        assert!(out.starts_with("Argument parsing failed: "));
    }

    #[test]
    fn test_del_out_of_bounds() {
        let mut dbg = debugger();

        assert_eq!(text(execute(&mut dbg, "del 5")), "Argument out of bounds\n");
        assert_eq!(text(execute(&mut dbg, "list")), "No breakpoints\n");
    }

    #[test]
    fn test_break_del_list() {
        let mut dbg = debugger();
        execute(&mut dbg, "break 0x10");
        execute(&mut dbg, "break 0x20");
        execute(&mut dbg, "del 0");

        assert_eq!(dbg.breakpoints(), &[0x20]);
        assert_eq!(text(execute(&mut dbg, "list")), "0 - 0x20\n");
    }

    #[test]
    fn test_step_on_zero_image() {
        let mut dbg = debugger();

        assert_eq!(text(execute(&mut dbg, "step")), "CPU Simulation ended\n");
        assert!(text(execute(&mut dbg, "reg")).contains("IP: 0x00000000"));
    }

    #[test]
    fn test_unknown_and_quit() {
        let mut dbg = debugger();

        assert_eq!(text(execute(&mut dbg, "frobnicate 1")), "Unknown command: frobnicate\n");
        assert_eq!(text(execute(&mut dbg, "   ")), "");
        assert_eq!(execute(&mut dbg, "quit"), Reply::Quit);
    }

    #[test]
    fn test_help_lists_every_command() {
        let mut dbg = debugger();
        let help = text(execute(&mut dbg, "help"));

        for command in COMMANDS {
            assert!(help.contains(command.usage));
        }
        assert_eq!(help.lines().count(), COMMANDS.len());
    }
}
