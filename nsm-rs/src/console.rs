//! User-facing console output.
//!
//! Every build thread writes through a [`Console`], and every write holds
//! the single process-wide console mutex for its duration so that lines from
//! concurrent builds never interleave.  A build may take the mutex for longer
//! with `console.lock()`; it then holds a [`UserLock`], and writes made
//! while it is held skip the acquisition.

use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossterm::style::Stylize;

use crate::script::error::{Location, ScriptError};

static CONSOLE: Mutex<()> = Mutex::new(());

fn acquire() -> MutexGuard<'static, ()> {
    CONSOLE.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `true` when stdout is attached to a terminal.
pub fn stdout_is_tty() -> bool {
    unsafe { libc::isatty(libc::STDOUT_FILENO) != 0 }
}

pub fn stdin_is_tty() -> bool {
    unsafe { libc::isatty(libc::STDIN_FILENO) != 0 }
}

// ── Sinks ─────────────────────────────────────────────────────────────────────

#[derive(Clone)]
enum Sink {
    Stdout,
    Captured(Arc<Mutex<String>>),
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sink::Stdout => f.write_str("Stdout"),
            Sink::Captured(_) => f.write_str("Captured"),
        }
    }
}

// ── UserLock ──────────────────────────────────────────────────────────────────

/// The console mutex, held on behalf of a build by `console.lock()`.
pub struct UserLock {
    _guard: MutexGuard<'static, ()>,
    pub location: Location,
}

impl fmt::Debug for UserLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserLock").field("location", &self.location).finish()
    }
}

// ── ConsoleGuard ──────────────────────────────────────────────────────────────

/// Exclusive access to the console for one or more writes.
///
/// Holds the mutex unless the build already holds it through a
/// [`UserLock`]; releases it on drop either way.
pub struct ConsoleGuard<'a> {
    _guard: Option<MutexGuard<'static, ()>>,
    console: &'a Console,
}

impl ConsoleGuard<'_> {
    pub fn write(&mut self, text: &str) {
        match &self.console.sink {
            Sink::Stdout => {
                let mut out = io::stdout().lock();
                // A closed stdout is not worth failing a build over.
                let _ = out.write_all(text.as_bytes());
                let _ = out.flush();
            }
            Sink::Captured(buf) => {
                buf.lock().unwrap_or_else(PoisonError::into_inner).push_str(text);
            }
        }
    }

    pub fn line(&mut self, text: &str) {
        self.write(text);
        if !text.ends_with('\n') {
            self.write("\n");
        }
    }
}

// ── Console ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Console {
    sink: Sink,
    color: bool,
}

impl Default for Console {
    fn default() -> Self {
        Self::stdout()
    }
}

impl Console {
    pub fn stdout() -> Self {
        Console { sink: Sink::Stdout, color: stdout_is_tty() }
    }

    /// A console that records everything written, for tests and for
    /// embedding.
    pub fn captured() -> (Self, Arc<Mutex<String>>) {
        let buf = Arc::new(Mutex::new(String::new()));
        (Console { sink: Sink::Captured(Arc::clone(&buf)), color: false }, buf)
    }

    pub fn with_color(mut self, color: bool) -> Self {
        self.color = color;
        self
    }

    pub fn guard(&self, held: Option<&UserLock>) -> ConsoleGuard<'_> {
        ConsoleGuard { _guard: held.is_none().then(acquire), console: self }
    }

    /// Take the console mutex on behalf of the build.
    pub fn lock(location: Location) -> UserLock {
        UserLock { _guard: acquire(), location }
    }

    pub fn print(&self, held: Option<&UserLock>, text: &str) {
        self.guard(held).write(text);
    }

    pub fn error(&self, held: Option<&UserLock>, err: &ScriptError) {
        let prefix = if self.color {
            format!("{}", "error:".red().bold())
        } else {
            "error:".to_owned()
        };
        self.guard(held).line(&format!("{prefix} {}: {}", err.location, err.kind));
    }

    /// An error with no source position, such as a failed output write.
    pub fn failure(&self, held: Option<&UserLock>, msg: &str) {
        let prefix = if self.color {
            format!("{}", "error:".red().bold())
        } else {
            "error:".to_owned()
        };
        self.guard(held).line(&format!("{prefix} {msg}"));
    }

    pub fn warning(&self, held: Option<&UserLock>, location: &Location, msg: &str) {
        let prefix = if self.color {
            format!("{}", "warning:".yellow().bold())
        } else {
            "warning:".to_owned()
        };
        self.guard(held).line(&format!("{prefix} {location}: {msg}"));
    }

    pub fn success(&self, held: Option<&UserLock>, msg: &str) {
        let text = if self.color { format!("{}", msg.green()) } else { msg.to_owned() };
        self.guard(held).line(&text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::error::{ErrorKind, SourceRef};

    #[test]
    fn captured_console_records_lines() {
        let (console, buf) = Console::captured();
        console.print(None, "hello ");
        console.success(None, "done");
        assert_eq!(*buf.lock().unwrap(), "hello done\n");
    }

    #[test]
    fn error_lines_carry_location() {
        let (console, buf) = Console::captured();
        let err = ScriptError::new(
            ErrorKind::UnknownCall("frob".into()),
            Location::new(SourceRef::new("page.html"), 3),
        );
        console.error(None, &err);
        assert_eq!(*buf.lock().unwrap(), "error: page.html: line 3: unknown call 'frob'\n");
    }

    #[test]
    fn held_lock_skips_acquisition() {
        let (console, buf) = Console::captured();
        let lock = Console::lock(Location::new(SourceRef::new("t"), 1));
        // Would deadlock if the guard tried to take the mutex again.
        console.print(Some(&lock), "inside");
        drop(lock);
        console.print(None, " after");
        assert_eq!(*buf.lock().unwrap(), "inside after");
    }
}
