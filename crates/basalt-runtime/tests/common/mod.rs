//! Shared helpers for the integration tests
#![allow(dead_code)] // not every test binary uses every helper

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use basalt_runtime::{InterpretError, RuntimeError, Vm};

/// An output sink the test keeps a handle to after handing it to the VM
#[derive(Clone, Default)]
pub struct SharedOutput(Rc<RefCell<Vec<u8>>>);

impl SharedOutput {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Build a VM with captured output
pub fn vm_with_output() -> (Vm, SharedOutput) {
    let sink = SharedOutput::default();
    let mut vm = Vm::new();
    vm.set_output(Box::new(sink.clone()));
    (vm, sink)
}

/// Interpret a program, returning its printed output and result
pub fn run(source: &str) -> (String, Result<(), InterpretError>) {
    let (mut vm, sink) = vm_with_output();
    let result = vm.interpret(source);
    (sink.contents(), result)
}

/// Interpret with GC stress mode (collect at every allocation point)
pub fn run_stress(source: &str) -> (String, Result<(), InterpretError>) {
    let (mut vm, sink) = vm_with_output();
    vm.set_gc_stress(true);
    let result = vm.interpret(source);
    (sink.contents(), result)
}

/// Interpret a program that must succeed; returns its printed output
#[track_caller]
pub fn expect_output(source: &str) -> String {
    let (output, result) = run(source);
    match result {
        Ok(()) => output,
        Err(InterpretError::Compile(diagnostics)) => {
            panic!("program failed to compile: {:#?}", diagnostics)
        }
        Err(InterpretError::Runtime(error)) => panic!("program failed at runtime: {}", error),
    }
}

/// Interpret a program that must fail at runtime; returns the error
#[track_caller]
pub fn expect_runtime_error(source: &str) -> RuntimeError {
    let (_, result) = run(source);
    match result {
        Err(InterpretError::Runtime(error)) => error,
        Err(InterpretError::Compile(diagnostics)) => {
            panic!("expected runtime error, got compile error: {:#?}", diagnostics)
        }
        Ok(()) => panic!("expected runtime error, but program succeeded"),
    }
}

/// Compile a program that must fail; returns the first diagnostic message
#[track_caller]
pub fn expect_compile_error(source: &str) -> String {
    let (_, result) = run(source);
    match result {
        Err(InterpretError::Compile(diagnostics)) => diagnostics
            .first()
            .map(|d| d.message.clone())
            .unwrap_or_default(),
        Err(InterpretError::Runtime(error)) => {
            panic!("expected compile error, got runtime error: {}", error)
        }
        Ok(()) => panic!("expected compile error, but program succeeded"),
    }
}
