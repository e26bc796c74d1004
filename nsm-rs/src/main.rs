use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use nsm::cli::{self, Cli};

/// Worker stack size; deeply nested templates recurse through the
/// interpreter.
const STACK_SIZE: usize = 64 * 1024 * 1024;

fn main() -> ExitCode {
    let args = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("NSM_LOG").unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .thread_stack_size(STACK_SIZE)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("nsm: cannot start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    if runtime.block_on(cli::execute(args)) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
