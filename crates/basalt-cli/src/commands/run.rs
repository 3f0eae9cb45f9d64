//! Run command - execute Basalt source files or compiled bytecode

use std::path::Path;

use basalt_runtime::{InterpretError, Vm, BYTECODE_MAGIC};

use super::{
    print_diagnostics, read_bytes, report_io_error, source_from_bytes, EXIT_COMPILE_ERROR,
    EXIT_IO_ERROR, EXIT_RUNTIME_ERROR,
};

/// Run a file: compiled bytecode if it carries the magic, source
/// otherwise. Returns the process exit code.
pub fn run(file: &Path, json: bool, stress_gc: bool) -> u8 {
    let bytes = match read_bytes(file) {
        Ok(bytes) => bytes,
        Err(error) => return report_io_error(&error),
    };

    let mut vm = Vm::new();
    vm.set_gc_stress(stress_gc);

    if bytes.starts_with(BYTECODE_MAGIC) {
        return run_compiled(&mut vm, &bytes);
    }

    let source = match source_from_bytes(file, bytes) {
        Ok(source) => source,
        Err(error) => return report_io_error(&error),
    };
    match vm.interpret(&source) {
        Ok(()) => 0,
        Err(InterpretError::Compile(diagnostics)) => {
            print_diagnostics(&diagnostics, file, json);
            EXIT_COMPILE_ERROR
        }
        Err(InterpretError::Runtime(error)) => {
            eprintln!("{}", error);
            EXIT_RUNTIME_ERROR
        }
    }
}

fn run_compiled(vm: &mut Vm, bytes: &[u8]) -> u8 {
    let function = match vm.load_program(bytes) {
        Ok(function) => function,
        Err(error) => {
            eprintln!("error: {}", error);
            return EXIT_IO_ERROR;
        }
    };
    match vm.run_function(function) {
        Ok(()) => 0,
        Err(error) => {
            eprintln!("{}", error);
            EXIT_RUNTIME_ERROR
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_run_simple_program() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "print 1 + 2;").unwrap();

        assert_eq!(run(temp_file.path(), false, false), 0);
    }

    #[test]
    fn test_run_missing_file() {
        assert_eq!(run(Path::new("nonexistent.bst"), false, false), EXIT_IO_ERROR);
    }

    #[test]
    fn test_run_compile_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "print 1").unwrap();

        assert_eq!(run(temp_file.path(), false, false), EXIT_COMPILE_ERROR);
    }

    #[test]
    fn test_run_runtime_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "print missing;").unwrap();

        assert_eq!(run(temp_file.path(), true, false), EXIT_RUNTIME_ERROR);
    }
}
