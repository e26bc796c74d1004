//! Interactive mode.
//!
//! Reads entries from a line source and runs each through one shared
//! [`Interpreter`], so variables and functions persist between entries.  An
//! entry ends at the first newline where every bracket opened in it has
//! been closed.  `quit()` or `exit()` ends the session, as does end of
//! input.

use std::io::{self, BufRead};

use tracing::debug;

use crate::script::{ControlSignal, Dialect, Interpreter, SourceRef};

/// `true` while `text` has a `(`, `[` or `{` without its closer.  Brackets
/// inside double quotes or after a backslash do not count.
pub fn needs_more(text: &str) -> bool {
    let mut depth = 0i64;
    let mut in_quotes = false;
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            '(' | '[' | '{' if !in_quotes => depth += 1,
            ')' | ']' | '}' if !in_quotes => depth -= 1,
            _ => {}
        }
    }
    depth > 0
}

pub struct Shell {
    interp: Interpreter,
    dialect: Dialect,
    prompt: bool,
    source: SourceRef,
    line: usize,
    errors: usize,
}

impl Shell {
    pub fn new(interp: Interpreter, dialect: Dialect) -> Self {
        Shell { interp, dialect, prompt: false, source: SourceRef::new("<shell>"), line: 1, errors: 0 }
    }

    /// Print `nsm> ` before each entry and `...> ` before continuations.
    pub fn with_prompt(mut self, prompt: bool) -> Self {
        self.prompt = prompt;
        self
    }

    /// Entries that ended in an error so far.
    pub fn errors(&self) -> usize {
        self.errors
    }

    pub fn interpreter(&mut self) -> &mut Interpreter {
        &mut self.interp
    }

    fn show_prompt(&self, continuation: bool) {
        if self.prompt {
            self.interp.print(if continuation { "...> " } else { "nsm> " });
        }
    }

    /// Run one complete entry.  Returns `false` once the session should end.
    pub fn eval(&mut self, entry: &str) -> bool {
        let start = self.line;
        self.line += entry.matches('\n').count();
        match self.interp.process_entry(entry, self.dialect, &self.source, start) {
            Ok((text, sig)) => {
                if !text.is_empty() {
                    self.interp.print(&text);
                    if !text.ends_with('\n') {
                        self.interp.print("\n");
                    }
                }
                !matches!(sig, ControlSignal::Quit | ControlSignal::Exit)
            }
            Err(err) => {
                self.errors += 1;
                self.interp.report(&err);
                true
            }
        }
    }

    /// Read and run entries until the input ends or an entry quits.
    pub fn run<R: BufRead>(&mut self, mut input: R) -> io::Result<()> {
        let mut entry = String::new();
        loop {
            self.show_prompt(!entry.is_empty());
            let mut line = String::new();
            if input.read_line(&mut line)? == 0 {
                if !entry.trim().is_empty() {
                    self.eval(&entry);
                }
                break;
            }
            entry.push_str(&line);
            if needs_more(&entry) {
                continue;
            }
            let text = std::mem::take(&mut entry);
            debug!(line = self.line, "shell entry");
            if !text.trim().is_empty() && !self.eval(text.trim_end_matches('\n')) {
                break;
            }
            self.line += 1;
        }
        if let Err(err) = self.interp.finish() {
            self.errors += 1;
            self.interp.report(&err);
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
