//! cli.rs — end-to-end tests of the basalt binary

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::tempdir;

fn basalt() -> Command {
    Command::cargo_bin("basalt").expect("basalt binary builds")
}

fn write_program(dir: &std::path::Path, name: &str, source: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, source).unwrap();
    path
}

#[test]
fn run_prints_program_output() {
    let dir = tempdir().unwrap();
    let file = write_program(dir.path(), "hello.bst", "print \"he\" + \"llo\";\n");

    basalt()
        .arg("run")
        .arg(&file)
        .assert()
        .success()
        .stdout("hello\n");
}

#[test]
fn run_reports_compile_errors_with_exit_65() {
    let dir = tempdir().unwrap();
    let file = write_program(dir.path(), "broken.bst", "print 1\n");

    basalt()
        .arg("run")
        .arg(&file)
        .assert()
        .code(65)
        .stderr(predicate::str::contains("Expect ';' after value."));
}

#[test]
fn run_reports_runtime_errors_with_exit_70() {
    let dir = tempdir().unwrap();
    let file = write_program(
        dir.path(),
        "crash.bst",
        "fun f() { return missing; }\nf();\n",
    );

    basalt()
        .arg("run")
        .arg(&file)
        .assert()
        .code(70)
        .stderr(predicate::str::contains("Undefined variable 'missing'."))
        .stderr(predicate::str::contains("[line 1] in f()"))
        .stderr(predicate::str::contains("[line 2] in script"));
}

#[test]
fn run_missing_file_exits_74() {
    basalt()
        .arg("run")
        .arg("does-not-exist.bst")
        .assert()
        .code(74)
        .stderr(predicate::str::contains("Couldn't read file"));
}

#[test]
fn json_diagnostics_are_machine_readable() {
    let dir = tempdir().unwrap();
    let file = write_program(dir.path(), "broken.bst", "var 1;\n");

    let output = basalt()
        .arg("run")
        .arg(&file)
        .arg("--json")
        .assert()
        .code(65)
        .get_output()
        .clone();

    let line = String::from_utf8(output.stdout).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(line.lines().next().unwrap()).unwrap();
    assert_eq!(parsed["message"], "Expect variable name.");
    assert_eq!(parsed["level"], "error");
}

#[test]
fn build_then_run_the_compiled_file() {
    let dir = tempdir().unwrap();
    let file = write_program(
        dir.path(),
        "counter.bst",
        "fun mk() { var i = 0; fun f() { i = i + 1; return i; } return f; }\n\
         var f = mk();\nprint f();\nprint f();\n",
    );

    basalt()
        .arg("build")
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::contains("counter.bstc"));

    let compiled = dir.path().join("counter.bstc");
    assert!(compiled.exists());

    basalt()
        .arg("run")
        .arg(&compiled)
        .assert()
        .success()
        .stdout("1\n2\n");
}

#[test]
fn build_honors_explicit_output_path() {
    let dir = tempdir().unwrap();
    let file = write_program(dir.path(), "p.bst", "print 7;\n");
    let out = dir.path().join("custom-name.bstc");

    basalt()
        .arg("build")
        .arg(&file)
        .arg("-o")
        .arg(&out)
        .assert()
        .success();

    basalt().arg("run").arg(&out).assert().success().stdout("7\n");
}

#[test]
fn corrupted_bytecode_is_rejected() {
    let dir = tempdir().unwrap();
    let file = write_program(dir.path(), "p.bst", "print 7;\n");
    basalt().arg("build").arg(&file).assert().success();

    let compiled = dir.path().join("p.bstc");
    let mut bytes = fs::read(&compiled).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(&compiled, &bytes).unwrap();

    basalt()
        .arg("run")
        .arg(&compiled)
        .assert()
        .code(74)
        .stderr(predicate::str::contains("checksum mismatch"));
}

#[test]
fn disasm_lists_the_program() {
    let dir = tempdir().unwrap();
    let file = write_program(dir.path(), "p.bst", "print 1 + 2;\n");

    basalt()
        .arg("disasm")
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::contains("=== script ==="))
        .stdout(predicate::str::contains("Add"))
        .stdout(predicate::str::contains("Print"));
}

#[test]
fn stress_gc_flag_does_not_change_output() {
    let dir = tempdir().unwrap();
    let file = write_program(
        dir.path(),
        "churn.bst",
        "var s = \"\";\nfor (var i = 0; i < 20; i = i + 1) { s = s + \"x\"; }\nprint s == \"\" + s;\n",
    );

    basalt()
        .arg("run")
        .arg(&file)
        .arg("--stress-gc")
        .assert()
        .success()
        .stdout("true\n");
}
