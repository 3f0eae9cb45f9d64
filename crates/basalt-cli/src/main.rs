//! Basalt command-line interface
//!
//! `basalt run` interprets source or executes compiled bytecode,
//! `basalt build` serializes a program, `basalt disasm` prints its
//! bytecode listing. Exit codes follow the usual interpreter
//! conventions: 65 for compile errors, 70 for runtime errors, 74 for
//! file errors.

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "basalt", version, about = "The Basalt programming language")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a source file or a compiled .bstc file
    Run {
        /// Path to a .bst source file or .bstc bytecode file
        file: PathBuf,
        /// Print compile diagnostics as JSON lines
        #[arg(long)]
        json: bool,
        /// Collect garbage at every allocation (GC debugging aid)
        #[arg(long)]
        stress_gc: bool,
    },
    /// Compile a source file to a .bstc bytecode file
    Build {
        /// Path to a .bst source file
        file: PathBuf,
        /// Output path (defaults to the input with a .bstc extension)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the bytecode listing of a source or compiled file
    Disasm {
        /// Path to a .bst source file or .bstc bytecode file
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Run {
            file,
            json,
            stress_gc,
        } => commands::run::run(&file, json, stress_gc),
        Command::Build { file, output } => commands::build::build(&file, output.as_deref()),
        Command::Disasm { file } => commands::disasm::disasm(&file),
    };
    ExitCode::from(code)
}
