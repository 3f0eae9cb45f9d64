//! CLI subcommands and shared helpers

pub mod build;
pub mod disasm;
pub mod run;

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use basalt_runtime::{ColorMode, Diagnostic};

/// Exit code for compile errors
pub const EXIT_COMPILE_ERROR: u8 = 65;
/// Exit code for runtime errors
pub const EXIT_RUNTIME_ERROR: u8 = 70;
/// Exit code for file and I/O errors
pub const EXIT_IO_ERROR: u8 = 74;

/// Read a file as raw bytes
pub fn read_bytes(file: &Path) -> Result<Vec<u8>> {
    fs::read(file).with_context(|| format!("Couldn't read file \"{}\"", file.display()))
}

/// Decode already-read bytes as UTF-8 source
pub fn source_from_bytes(file: &Path, bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes)
        .with_context(|| format!("File \"{}\" is not valid UTF-8 source", file.display()))
}

/// Print an I/O-level failure and return its exit code
pub fn report_io_error(error: &anyhow::Error) -> u8 {
    eprintln!("error: {:#}", error);
    EXIT_IO_ERROR
}

/// Print compile diagnostics, as colored human output or JSON lines
pub fn print_diagnostics(diagnostics: &[Diagnostic], file: &Path, json: bool) {
    for diagnostic in diagnostics {
        let diagnostic = diagnostic.clone().with_file(file.display().to_string());
        if json {
            println!("{}", diagnostic.to_json_string().unwrap());
        } else {
            basalt_runtime::diagnostic::emit(&diagnostic, ColorMode::Auto);
        }
    }
}
