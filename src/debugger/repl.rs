//! Interactive command loop.
//!
//! Reads one command per line from stdin, repeats the previous command on
//! an empty line and keeps a best-effort history file. Ctrl-C is routed to
//! the debugger's cancel flag instead of killing the process.

use crate::debugger::app::Debugger;
use crate::debugger::commands::{self, Reply};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::debug;

/// Prompt printed before each command.
pub const PROMPT: &str = "VM32> ";

/// Name of the history file in the home directory.
pub const HISTORY_FILE: &str = ".vm32history";

/// Command history, loaded on start and appended on exit.
///
/// Every failure is logged and ignored; the debugger works the same with
/// or without it.
pub struct History {
    path: Option<PathBuf>,
    entries: Vec<String>,
    loaded: usize,
}

impl History {
    /// History stored in `~/.vm32history`.
    pub fn open() -> Self {
        let path = std::env::var_os("HOME").map(|home| PathBuf::from(home).join(HISTORY_FILE));
        Self::at(path)
    }

    /// History that is never read or written.
    pub fn disabled() -> Self {
        Self::at(None)
    }

    fn at(path: Option<PathBuf>) -> Self {
        let entries: Vec<String> = match &path {
            Some(path) => match std::fs::read_to_string(path) {
                Ok(text) => text.lines().map(str::to_string).collect(),
                Err(e) => {
                    debug!("history not loaded from {}: {e}", path.display());
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        let loaded = entries.len();
        Self { path, entries, loaded }
    }

    pub fn push(&mut self, line: &str) {
        self.entries.push(line.to_string());
    }

    /// Append this session's commands to the history file.
    pub fn save(&self) {
        let Some(path) = &self.path else { return };
        let new = &self.entries[self.loaded..];
        if new.is_empty() {
            return;
        }

        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| new.iter().try_for_each(|line| writeln!(file, "{line}")));
        if let Err(e) = result {
            debug!("history not saved to {}: {e}", path.display());
        }
    }
}

/// Run the command loop until `quit` or end of input.
///
/// Lines that are not valid UTF-8 are decoded lossily and end up as
/// unknown commands; only I/O errors end the loop early.
pub fn run<R: BufRead, W: Write>(
    dbg: &mut Debugger,
    mut input: R,
    mut output: W,
    history: &mut History,
) -> io::Result<()> {
    let mut last: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        write!(output, "{PROMPT}")?;
        output.flush()?;

        buf.clear();
        if input.read_until(b'\n', &mut buf)? == 0 {
            writeln!(output)?;
            break;
        }

        let raw = String::from_utf8_lossy(&buf);
        let line = raw.trim();
        let command = if line.is_empty() {
            match &last {
                Some(previous) => previous.clone(),
                None => continue,
            }
        } else {
            history.push(line);
            line.to_string()
        };

        match commands::execute(dbg, &command) {
            Reply::Output(text) => output.write_all(text.as_bytes())?,
            Reply::Quit => break,
        }
        last = Some(command);
    }

    history.save();
    Ok(())
}

/// Run the debugger on stdin/stdout, with Ctrl-C wired to `continue`
/// cancellation.
pub fn run_debugger(dbg: &mut Debugger, history: &mut History) -> io::Result<()> {
    sigint::install(dbg.cancel_token());
    let stdin = io::stdin();
    run(dbg, stdin.lock(), io::stdout(), history)
}

#[cfg(unix)]
mod sigint {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::OnceLock;

    static CANCEL: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    extern "C" fn handler(_: libc::c_int) {
        if let Some(flag) = CANCEL.get() {
            flag.store(true, Ordering::SeqCst);
        }
    }

    /// Route SIGINT to `flag`. Only the first installed flag is used.
    pub fn install(flag: Arc<AtomicBool>) {
        if CANCEL.set(flag).is_err() {
            return;
        }

        // SAFETY: the handler only performs an atomic store on a flag that
        // lives for the rest of the process.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handler as extern "C" fn(libc::c_int) as libc::sighandler_t;
            action.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut()) != 0 {
                debug!("sigaction(SIGINT) failed: {}", io::Error::last_os_error());
            }
        }
    }
}

#[cfg(not(unix))]
mod sigint {
    use super::*;

    pub fn install(_flag: Arc<AtomicBool>) {
        debug!("Ctrl-C cancellation is not supported on this platform");
    }
}
