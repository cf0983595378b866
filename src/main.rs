//! stackgate CLI - health-gated startup for single-host service stacks
//!
//! All CLI logic lives in the `cli` module. This file is just the entry point.

mod cli;

use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match cli::run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            cli::exit_code_for(&e)
        }
    }
}
