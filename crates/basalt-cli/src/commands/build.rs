//! Build command - compile Basalt source to a .bstc bytecode file

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use basalt_runtime::{compile, encode_program, Vm};

use super::{
    print_diagnostics, read_bytes, report_io_error, source_from_bytes, EXIT_COMPILE_ERROR,
};

/// Compile `file` and write the serialized program. Returns the process
/// exit code.
pub fn build(file: &Path, output: Option<&Path>) -> u8 {
    let source = match read_bytes(file).and_then(|bytes| source_from_bytes(file, bytes)) {
        Ok(source) => source,
        Err(error) => return report_io_error(&error),
    };

    let mut vm = Vm::new();
    let function = match compile(&mut vm, &source) {
        Ok(function) => function,
        Err(diagnostics) => {
            print_diagnostics(&diagnostics, file, false);
            return EXIT_COMPILE_ERROR;
        }
    };

    let bytes = encode_program(vm.heap(), function);
    let out_path = output
        .map(PathBuf::from)
        .unwrap_or_else(|| file.with_extension("bstc"));
    let written = fs::write(&out_path, &bytes)
        .with_context(|| format!("Couldn't write \"{}\"", out_path.display()));
    match written {
        Ok(()) => {
            println!("Wrote {} ({} bytes)", out_path.display(), bytes.len());
            0
        }
        Err(error) => report_io_error(&error),
    }
}
