//! bytecode_roundtrip.rs — serialization round-trips and compile determinism

mod common;

use basalt_runtime::{compile, decode_program, encode_program, DecodeError, Vm};
use common::SharedOutput;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use rstest::rstest;

/// Compile a program in a fresh VM and serialize it
fn compile_to_bytes(source: &str) -> Vec<u8> {
    let mut vm = Vm::new();
    let function = compile(&mut vm, source).expect("test program must compile");
    encode_program(vm.heap(), function)
}

/// Run a program from source and capture its output
fn run_source(source: &str) -> String {
    let (mut vm, sink) = common::vm_with_output();
    vm.interpret(source).expect("test program must run");
    sink.contents()
}

/// Run a program from serialized bytecode and capture its output
fn run_bytes(bytes: &[u8]) -> String {
    let sink = SharedOutput::default();
    let mut vm = Vm::new();
    vm.set_output(Box::new(sink.clone()));
    let function = vm.load_program(bytes).expect("bytecode must decode");
    vm.run_function(function).expect("program must run");
    sink.contents()
}

const CORPUS: &[&str] = &[
    "print 1 + 2;",
    "var s = \"he\"; print s + \"llo\";",
    "fun mk() { var i = 0; fun f() { i = i + 1; return i; } return f; } \
     var f = mk(); print f(); print f();",
    "class A { hi() { print \"hi\"; } } class B < A { hi() { super.hi(); print \"there\"; } } \
     B().hi();",
    "var xs = [10, 20]; append(xs, 30); print xs[2]; xs[0] = 0; print xs[0];",
    "for (var i = 0; i < 3; i = i + 1) { if (i == 1) print \"one\"; else print i; }",
];

#[rstest]
#[case::arithmetic(CORPUS[0])]
#[case::strings(CORPUS[1])]
#[case::closures(CORPUS[2])]
#[case::classes(CORPUS[3])]
#[case::lists(CORPUS[4])]
#[case::control_flow(CORPUS[5])]
fn compiled_and_loaded_programs_behave_identically(#[case] source: &str) {
    let from_source = run_source(source);
    let from_bytes = run_bytes(&compile_to_bytes(source));
    assert_eq!(from_source, from_bytes);
}

#[rstest]
#[case::arithmetic(CORPUS[0])]
#[case::strings(CORPUS[1])]
#[case::closures(CORPUS[2])]
#[case::classes(CORPUS[3])]
#[case::lists(CORPUS[4])]
#[case::control_flow(CORPUS[5])]
fn compilation_is_deterministic_across_vms(#[case] source: &str) {
    assert_eq!(compile_to_bytes(source), compile_to_bytes(source));
}

#[rstest]
#[case::arithmetic(CORPUS[0])]
#[case::closures(CORPUS[2])]
#[case::classes(CORPUS[3])]
fn decode_then_encode_is_stable(#[case] source: &str) {
    let bytes = compile_to_bytes(source);
    let mut vm = Vm::new();
    let function = vm.load_program(&bytes).unwrap();
    let re_encoded = encode_program(vm.heap(), function);
    assert_eq!(bytes, re_encoded);
}

#[test]
fn decoding_into_a_warm_vm_reuses_interned_strings() {
    let bytes = compile_to_bytes("print \"shared\" == \"sha\" + \"red\";");
    let (mut vm, sink) = common::vm_with_output();
    // Warm the intern table first, then load
    vm.interpret("var existing = \"shared\";").unwrap();
    let function = vm.load_program(&bytes).unwrap();
    vm.run_function(function).unwrap();
    assert_eq!(sink.contents(), "true\n");
}

#[test]
fn truncated_files_never_decode() {
    let bytes = compile_to_bytes(CORPUS[2]);
    let mut vm = Vm::new();
    for length in 0..bytes.len() {
        assert!(
            vm.load_program(&bytes[..length]).is_err(),
            "{}-byte prefix must be rejected",
            length
        );
    }
}

#[test]
fn flipped_payload_bytes_fail_the_checksum() {
    let mut bytes = compile_to_bytes(CORPUS[0]);
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    let mut vm = Vm::new();
    assert_eq!(vm.load_program(&bytes), Err(DecodeError::ChecksumMismatch));
}

proptest! {
    /// Repeated compilation of the same arithmetic program yields
    /// byte-identical serialized output
    #[test]
    fn arbitrary_expressions_compile_deterministically(expr in arb_expr()) {
        let source = format!("print {};", expr);
        prop_assert_eq!(compile_to_bytes(&source), compile_to_bytes(&source));
    }

    /// Serialized programs survive a decode/encode round trip untouched
    #[test]
    fn arbitrary_expressions_round_trip(expr in arb_expr()) {
        let source = format!("print {};", expr);
        let bytes = compile_to_bytes(&source);
        let mut vm = Vm::new();
        let function = vm.load_program(&bytes).unwrap();
        prop_assert_eq!(bytes, encode_program(vm.heap(), function));
    }
}

/// Arithmetic expression trees: numbers, the four binary operators,
/// unary minus, and grouping
fn arb_expr() -> impl Strategy<Value = String> {
    let leaf = prop_oneof![
        (0u32..1000).prop_map(|n| n.to_string()),
        (0u32..100, 1u32..100).prop_map(|(a, b)| format!("{}.{}", a, b)),
    ];
    leaf.prop_recursive(4, 24, 2, |inner| {
        prop_oneof![
            (
                inner.clone(),
                prop_oneof![Just("+"), Just("-"), Just("*"), Just("/")],
                inner.clone(),
            )
                .prop_map(|(a, op, b)| format!("({} {} {})", a, op, b)),
            inner.prop_map(|e| format!("-{}", e)),
        ]
    })
}
