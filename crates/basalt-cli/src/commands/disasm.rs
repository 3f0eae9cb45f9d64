//! Disasm command - print the bytecode listing of a program

use std::path::Path;

use basalt_runtime::{compile, disassemble_program, Vm, BYTECODE_MAGIC};

use super::{
    print_diagnostics, read_bytes, report_io_error, source_from_bytes, EXIT_COMPILE_ERROR,
    EXIT_IO_ERROR,
};

/// Disassemble a source or compiled file to stdout. Returns the process
/// exit code.
pub fn disasm(file: &Path) -> u8 {
    let bytes = match read_bytes(file) {
        Ok(bytes) => bytes,
        Err(error) => return report_io_error(&error),
    };

    let mut vm = Vm::new();
    let function = if bytes.starts_with(BYTECODE_MAGIC) {
        match vm.load_program(&bytes) {
            Ok(function) => function,
            Err(error) => {
                eprintln!("error: {}", error);
                return EXIT_IO_ERROR;
            }
        }
    } else {
        let source = match source_from_bytes(file, bytes) {
            Ok(source) => source,
            Err(error) => return report_io_error(&error),
        };
        match compile(&mut vm, &source) {
            Ok(function) => function,
            Err(diagnostics) => {
                print_diagnostics(&diagnostics, file, false);
                return EXIT_COMPILE_ERROR;
            }
        }
    };

    print!("{}", disassemble_program(vm.heap(), function));
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_disasm_source_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "print 1;").unwrap();

        assert_eq!(disasm(temp_file.path()), 0);
    }

    #[test]
    fn test_disasm_missing_file() {
        assert_eq!(disasm(Path::new("nonexistent.bstc")), EXIT_IO_ERROR);
    }
}
