//! Command-line interface.
//!
//! ```text
//! nsm [-C <dir>] build <name>...
//! nsm [-C <dir>] build-all
//! nsm [-C <dir>] run <path> [--dialect n|f]
//! nsm [-C <dir>] interactive [n|f]
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::debug;

use crate::build::{build_targets, Progress};
use crate::config::Site;
use crate::console::{stdin_is_tty, Console};
use crate::script::{Dialect, Interpreter};
use crate::shell::Shell;

// ── Arguments ─────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "nsm", version, about = "Static site builder driven by a two-dialect template language")]
pub struct Cli {
    /// Project directory (the one holding nsm.toml).
    #[arg(short = 'C', long = "dir", global = true, default_value = ".")]
    pub root: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
pub enum Command {
    /// Build the named pages.
    Build {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Build every tracked page.
    BuildAll,
    /// Process a script and print its output.
    Run {
        path: PathBuf,
        /// Dialect to read the script in; defaults to the one its
        /// extension selects.
        #[arg(long, value_enum)]
        dialect: Option<DialectArg>,
    },
    /// Read and run entries from stdin with one interpreter.
    Interactive {
        #[arg(value_enum, default_value = "n")]
        dialect: DialectArg,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DialectArg {
    N,
    F,
}

impl From<DialectArg> for Dialect {
    fn from(arg: DialectArg) -> Self {
        match arg {
            DialectArg::N => Dialect::N,
            DialectArg::F => Dialect::F,
        }
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

/// Run the parsed command.  Returns `true` on success.
pub async fn execute(cli: Cli) -> bool {
    let root = cli.root;
    match cli.command {
        Command::Build { names } => build(&root, Some(names)).await,
        Command::BuildAll => build(&root, None).await,
        Command::Run { path, dialect } => {
            blocking(move || Ok(run_script(&root, &path, dialect.map(Dialect::from)))).await
        }
        Command::Interactive { dialect } => blocking(move || interactive(&root, dialect.into())).await,
    }
}

async fn blocking<F>(f: F) -> bool
where
    F: FnOnce() -> io::Result<bool> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(ok)) => ok,
        Ok(Err(e)) => {
            Console::stdout().failure(None, &e.to_string());
            false
        }
        Err(e) => {
            Console::stdout().failure(None, &format!("task failed: {e}"));
            false
        }
    }
}

async fn build(root: &Path, names: Option<Vec<String>>) -> bool {
    let site = match Site::load(root) {
        Ok(site) => site,
        Err(e) => {
            Console::stdout().failure(None, &e.to_string());
            return false;
        }
    };
    let console = Console::stdout().with_color(site.color);

    let targets = match names {
        None => site.tracked(),
        Some(names) => {
            let mut targets = Vec::with_capacity(names.len());
            let mut unknown = false;
            for name in &names {
                match site.find(name) {
                    Some(info) => targets.push(info),
                    None => {
                        console.failure(None, &format!("'{name}' is not a tracked page"));
                        unknown = true;
                    }
                }
            }
            if unknown {
                return false;
            }
            targets
        }
    };
    debug!(targets = targets.len(), threads = site.threads, "building");

    let total = targets.len();
    let report = build_targets(Arc::new(site), targets, console.clone(), Arc::new(Progress::default())).await;
    if report.success() {
        let noun = if report.built == 1 { "page" } else { "pages" };
        console.success(None, &format!("built {} {noun}", report.built));
    } else {
        console.failure(None, &format!("{} of {total} pages failed to build", report.failed));
    }
    report.success()
}

fn run_script(root: &Path, path: &Path, dialect: Option<Dialect>) -> bool {
    let mut interp = Interpreter::new(Console::stdout(), root);
    let result = interp.run_file_as(path, dialect);
    let unlocked = interp.finish();
    let mut ok = true;
    match result {
        Ok(text) => interp.console().print(None, &text),
        Err(err) => {
            interp.console().error(None, &err);
            ok = false;
        }
    }
    if let Err(err) = unlocked {
        interp.console().error(None, &err);
        ok = false;
    }
    ok
}

fn interactive(root: &Path, dialect: Dialect) -> io::Result<bool> {
    let interp = Interpreter::new(Console::stdout(), root);
    let mut shell = Shell::new(interp, dialect).with_prompt(stdin_is_tty());
    shell.run(io::stdin().lock())?;
    Ok(true)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
