//! VM32 - CLI Entry Point
//!
//! Commands:
//! - `vm32 debug <image>` - Interactive debugger
//! - `vm32 run <image>` - Run until halt or step limit
//! - `vm32 disasm <image>` - Disassemble memory
//! - `vm32 pack <raw>` - Wrap a raw memory image in an object file

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{error, info, Level};
use vm32::asm::{check_memory_words, load_object, save_object, Disassembler, ObjectFile};
use vm32::cpu::{Cpu, CpuState, State};
use vm32::debugger::commands::parse_int;
use vm32::debugger::{run_debugger, Debugger, History};

#[derive(Parser)]
#[command(name = "vm32")]
#[command(author = "Yigit")]
#[command(version = "0.1.0")]
#[command(about = "VM32 CPU emulator and debugger")]
struct Cli {
    /// Display debug information
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive debugger
    Debug {
        /// Object file or raw memory image to load
        image: PathBuf,
        /// Minimum memory size in words
        #[arg(long, value_parser = parse_memory_words, default_value = "0")]
        memory_words: u32,
        /// Do not read or write ~/.vm32history
        #[arg(long)]
        no_history: bool,
    },
    /// Run a program until it halts
    Run {
        /// Object file or raw memory image to load
        image: PathBuf,
        /// Maximum number of instructions to execute
        #[arg(long, value_parser = parse_number, default_value = "1000000")]
        max_steps: u32,
        /// Minimum memory size in words
        #[arg(long, value_parser = parse_memory_words, default_value = "0")]
        memory_words: u32,
        /// Print the final state as JSON
        #[arg(long)]
        json: bool,
    },
    /// Disassemble memory contents
    Disasm {
        /// Object file or raw memory image to load
        image: PathBuf,
        /// First address to disassemble
        #[arg(long, value_parser = parse_number, default_value = "0")]
        start: u32,
        /// Number of instructions (default: to end of memory)
        #[arg(long, value_parser = parse_number)]
        count: Option<u32>,
    },
    /// Wrap a raw memory image in an object file
    Pack {
        /// Raw memory image
        raw: PathBuf,
        /// Output object file (default: <raw>.obj)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Entry point
        #[arg(long, value_parser = parse_number, default_value = "0")]
        entry: u32,
        /// Minimum memory size in words
        #[arg(long, value_parser = parse_memory_words, default_value = "0")]
        memory_words: u32,
    },
}

/// Final state printed by `run --json`.
#[derive(Serialize)]
struct RunSummary<'a> {
    status: CpuState,
    steps: u64,
    state: &'a State,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.debug { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Debug { image, memory_words, no_history } => {
            debug_program(&image, memory_words, no_history);
        }
        Commands::Run { image, max_steps, memory_words, json } => {
            run_program(&image, max_steps, memory_words, json);
        }
        Commands::Disasm { image, start, count } => {
            disassemble_file(&image, start, count);
        }
        Commands::Pack { raw, output, entry, memory_words } => {
            pack_image(&raw, output, entry, memory_words);
        }
    }
}

/// Integer argument in the same syntax the debugger accepts.
fn parse_number(s: &str) -> Result<u32, String> {
    parse_int(s).map_err(|_| format!("invalid number: {s}"))
}

fn parse_memory_words(s: &str) -> Result<u32, String> {
    check_memory_words(parse_number(s)?).map_err(|e| e.to_string())
}

fn load_cpu(path: &Path, memory_words: u32) -> Cpu {
    match load_object(path) {
        Ok(object) => Cpu::from_object(&object, memory_words as usize),
        Err(e) => {
            error!("failed to load {}: {}", path.display(), e);
            std::process::exit(1);
        }
    }
}

fn debug_program(path: &Path, memory_words: u32, no_history: bool) {
    let cpu = load_cpu(path, memory_words);
    info!("loaded {} ({} words of memory)", path.display(), cpu.mem.len());

    let mut dbg = Debugger::new(cpu, Disassembler::new());
    let mut history = if no_history { History::disabled() } else { History::open() };

    if let Err(e) = run_debugger(&mut dbg, &mut history) {
        error!("debugger I/O error: {}", e);
        std::process::exit(1);
    }
}

fn run_program(path: &Path, max_steps: u32, memory_words: u32, json: bool) {
    let mut cpu = load_cpu(path, memory_words);
    let steps = cpu.run(u64::from(max_steps));

    if json {
        let summary = RunSummary {
            status: cpu.status,
            steps,
            state: &cpu.state,
        };
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{text}"),
            Err(e) => {
                error!("failed to serialize state: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    println!("Steps: {steps}");
    println!("State: {:?}", cpu.status);
    println!("IP: 0x{:08x}", cpu.state.ip);
    for (i, value) in cpu.state.regs().iter().enumerate().filter(|(_, v)| **v != 0) {
        println!("r{i:02}: {value:08x}");
    }

    if cpu.is_running() {
        println!();
        println!("Reached the step limit ({max_steps}). Use --max-steps to increase.");
    }
}

fn disassemble_file(path: &Path, start: u32, count: Option<u32>) {
    let cpu = load_cpu(path, 0);
    let len = cpu.mem.len().saturating_sub(start as usize);

    let words = match cpu.mem.read_range(start, len) {
        Ok(words) => words,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let listing = Disassembler::new().disassemble(&words, start);
    let limit = count.map_or(usize::MAX, |c| c as usize);
    for line in listing.lines().take(limit) {
        println!("{line}");
    }
}

fn pack_image(raw: &Path, output: Option<PathBuf>, entry: u32, memory_words: u32) {
    let out_path = output.unwrap_or_else(|| raw.with_extension("obj"));

    let image = match std::fs::read(raw) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("failed to read {}: {}", raw.display(), e);
            std::process::exit(1);
        }
    };

    let object = ObjectFile { entry, memory_words, image };
    if let Err(e) = save_object(&out_path, &object) {
        error!("failed to write {}: {}", out_path.display(), e);
        std::process::exit(1);
    }

    info!("packed {} words into {}", object.image_words(), out_path.display());
}
