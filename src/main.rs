// File: src/main.rs
//
// Entry point. One binary: with a script path it compiles and runs the
// file; with no arguments it opens the REPL. Debug switches surface the
// disassembler, the execution trace and the collector's stress/log modes.

mod chunk;
mod compiler;
mod debug;
mod errors;
mod heap;
mod lexer;
mod object;
mod repl;
mod runner;
mod strings;
mod value;
mod vm;

use clap::Parser;
use std::io;
use std::path::PathBuf;
use std::process;

use runner::{DebugOptions, Runner};

#[derive(Parser)]
#[command(
    name = "loxide",
    about = "Loxide: a bytecode-compiled scripting language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    /// Script to run; opens the REPL when omitted
    script: Option<PathBuf>,

    /// Print a stack snapshot and each instruction while executing
    #[arg(long)]
    trace_execution: bool,

    /// Disassemble every chunk after compilation
    #[arg(long)]
    print_code: bool,

    /// Log heap allocations and collections
    #[arg(long)]
    log_gc: bool,

    /// Run the collector on nearly every allocation
    #[arg(long)]
    stress_gc: bool,
}

fn main() {
    let cli = Cli::parse();
    let options = DebugOptions {
        trace_execution: cli.trace_execution,
        print_code: cli.print_code,
        log_gc: cli.log_gc,
        stress_gc: cli.stress_gc,
    };

    match cli.script {
        Some(path) => {
            let mut runner = Runner::new(io::stdout(), options);
            match runner.run_file(&path) {
                Ok(true) => {}
                Ok(false) => process::exit(1),
                Err(err) => {
                    eprintln!("Could not read {}: {}", path.display(), err);
                    process::exit(1);
                }
            }
        }
        None => match repl::Repl::new(options) {
            Ok(mut repl) => {
                if let Err(err) = repl.run() {
                    eprintln!("REPL error: {}", err);
                    process::exit(1);
                }
            }
            Err(err) => {
                eprintln!("Failed to start REPL: {}", err);
                process::exit(1);
            }
        },
    }
}
