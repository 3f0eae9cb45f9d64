//! errors.rs — error taxonomy: compile diagnostics, runtime messages,
//! and stack traces

mod common;

use common::{expect_compile_error, expect_runtime_error, run};
use basalt_runtime::InterpretError;
use pretty_assertions::assert_eq;
use rstest::rstest;

// === Compile errors ===

#[rstest]
#[case("print 1", "Expect ';' after value.")]
#[case("var 1 = 2;", "Expect variable name.")]
#[case("1 + ;", "Expect expression.")]
#[case("a + b = c;", "Invalid assignment target.")]
#[case("return 1;", "Can't return from top-level code.")]
#[case("{ var a = 1; var a = 2; }", "Already a variable with this name in this scope.")]
#[case("{ var a = a; }", "Can't read local variable in its own initializer.")]
#[case("fun f(a, a) {}", "Already a variable with this name in this scope.")]
#[case("print \"unterminated;", "Unterminated string.")]
#[case("print @;", "Unexpected character '@'.")]
fn compile_errors(#[case] source: &str, #[case] expected: &str) {
    assert_eq!(expect_compile_error(source), expected);
}

#[test]
fn diagnostics_carry_location_and_snippet() {
    let (_, result) = run("var x = 1;\nprint y +;\n");
    let Err(InterpretError::Compile(diagnostics)) = result else {
        panic!("expected a compile error");
    };
    let diagnostic = &diagnostics[0];
    assert_eq!(diagnostic.message, "Expect expression.");
    assert_eq!(diagnostic.line, 2);
    assert_eq!(diagnostic.snippet, "print y +;");
    assert_eq!(diagnostic.label, "at ';'");
}

#[test]
fn panic_mode_recovers_at_statement_boundaries() {
    // Two independent errors, one per statement: synchronization must
    // surface both instead of cascading from the first
    let (_, result) = run("var = 1;\nvar = 2;\n");
    let Err(InterpretError::Compile(diagnostics)) = result else {
        panic!("expected a compile error");
    };
    assert_eq!(diagnostics.len(), 2);
    assert!(diagnostics.iter().all(|d| d.message == "Expect variable name."));
}

// === Runtime errors ===

#[rstest]
#[case("print -\"s\";", "Operand must be a number.")]
#[case("print 1 < \"s\";", "Operands must be numbers.")]
#[case("print 1 + \"s\";", "Operands must be two numbers or two strings.")]
#[case("print missing;", "Undefined variable 'missing'.")]
#[case("missing = 1;", "Undefined variable 'missing'.")]
#[case("var x = 4; x();", "Can only call functions and classes.")]
#[case("fun f(a) {} f();", "Expected 1 arguments but got 0.")]
#[case("fun f() {} f(1, 2);", "Expected 0 arguments but got 2.")]
#[case("var xs = [1]; print xs[1];", "List index out of range")]
#[case("var xs = [1]; print xs[0 - 1];", "List index out of range")]
#[case("var xs = [1]; xs[5] = 1;", "Invalid list index.")]
#[case("var n = 1; n[0] = 2;", "Cannot store value in non-list.")]
#[case("print 4[0];", "Invalid list to index into.")]
#[case("var xs = [1]; print xs[\"0\"];", "List index is not a number.")]
fn runtime_errors(#[case] source: &str, #[case] expected: &str) {
    assert_eq!(expect_runtime_error(source).kind.to_string(), expected);
}

#[test]
fn stack_trace_lists_frames_newest_first() {
    let source = "\
fun c() {
  boom();
}
fun b() {
  c();
}
fun a() {
  b();
}
a();
";
    let error = expect_runtime_error(source);
    assert_eq!(error.kind.to_string(), "Undefined variable 'boom'.");

    let names: Vec<Option<&str>> = error
        .trace
        .iter()
        .map(|frame| frame.function.as_deref())
        .collect();
    assert_eq!(names, vec![Some("c"), Some("b"), Some("a"), None]);

    let rendered = error.to_string();
    assert_eq!(
        rendered,
        "Undefined variable 'boom'.\n\
         [line 2] in c()\n\
         [line 5] in b()\n\
         [line 8] in a()\n\
         [line 10] in script"
    );
}

#[test]
fn unbounded_recursion_overflows_the_frame_stack() {
    let error = expect_runtime_error("fun loop() { loop(); } loop();");
    assert_eq!(error.kind.to_string(), "Stack overflow.");
    assert_eq!(error.trace.len(), 64);
}

#[test]
fn the_vm_is_reusable_after_a_runtime_error() {
    let (mut vm, sink) = common::vm_with_output();
    assert!(vm.interpret("print undefined_thing;").is_err());
    vm.interpret("print \"still alive\";").unwrap();
    assert_eq!(sink.contents(), "still alive\n");
}

// === Native errors ===

#[rstest]
#[case("append(1, 2);", "Function 'append' requires first argument to be a list.")]
#[case("append([1]);", "Function 'append' requires 2 arguments, received 1")]
#[case("delete([1], 0, 0);", "Function 'delete' requires 2 arguments, received 3")]
#[case("delete(1, 0);", "Function 'delete' requires first argument to be a list")]
#[case("delete([1], \"x\");", "Function 'delete' requires second argument to be a number")]
#[case("delete([1], 3);", "Cannot delete, no element at index 3")]
fn native_errors(#[case] source: &str, #[case] expected: &str) {
    assert_eq!(expect_runtime_error(source).kind.to_string(), expected);
}

#[test]
fn native_errors_carry_a_stack_trace() {
    let error = expect_runtime_error("fun helper() { delete([1], 9); } helper();");
    assert_eq!(
        error.trace.first().and_then(|f| f.function.as_deref()),
        Some("helper")
    );
}
