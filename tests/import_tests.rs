//! Module imports through the filesystem.

mod common;

use std::fs;
use std::path::PathBuf;

use common::printed;
use notate::compiler;
use notate::errors::ErrorCode;
use notate::interpreter::{Interpreter, RunJob, FINISHED};
use notate::program::Program;

fn run_project(files: &[(&str, &str)], entry_source: &str) -> (Program, Option<Vec<String>>) {
    let dir = tempfile::tempdir().expect("tempdir");
    for (name, source) in files {
        fs::write(dir.path().join(name), source).expect("write module");
    }

    let mut program = Program::new();
    program.project_paths.insert(0, dir.path().to_path_buf());
    let entry = program
        .set_entry_source(dir.path().join("main.nte"), entry_source)
        .model()
        .expect("entry loads");

    match compiler::compile(&mut program, entry) {
        Some(compilation) => {
            let interpreter = Interpreter::new();
            interpreter.run(RunJob::from_compilation(&compilation));
            assert_eq!(
                interpreter.status(),
                FINISHED,
                "runtime error: {:?}",
                interpreter.error_code()
            );
            let output = printed(&interpreter);
            (program, Some(output))
        }
        None => (program, None),
    }
}

#[test]
fn import_exposes_module_members() {
    let (program, output) = run_project(
        &[("m.nte", "value = 7")],
        "import m\nprint(m.value)",
    );
    assert!(program.no_errors());
    assert_eq!(output.unwrap(), vec!["7"]);
}

#[test]
fn import_with_alias() {
    let (program, output) = run_project(
        &[("linalg.nte", "tau = 6")],
        "import linalg as la\nprint(la.tau)",
    );
    assert!(program.no_errors());
    assert_eq!(output.unwrap(), vec!["6"]);
}

#[test]
fn from_import_binds_named_members() {
    let (program, output) = run_project(
        &[("consts.nte", "a = 2\nb = 3")],
        "from consts import a, b\nprint(a + b)",
    );
    assert!(program.no_errors());
    assert_eq!(output.unwrap(), vec!["5"]);
}

#[test]
fn from_import_with_alias() {
    let (program, output) = run_project(
        &[("consts.nte", "tau = 6")],
        "from consts import tau as t\nprint(t)",
    );
    assert!(program.no_errors());
    assert_eq!(output.unwrap(), vec!["6"]);
}

#[test]
fn imported_algorithms_are_callable() {
    let (program, output) = run_project(
        &[("mathlib.nte", "algorithm square(x) {\nreturn x * x\n}")],
        "from mathlib import square\nprint(square(4))",
    );
    assert!(program.no_errors());
    assert_eq!(output.unwrap(), vec!["16"]);
}

#[test]
fn module_body_executes_once() {
    let (program, output) = run_project(
        &[("noisy.nte", "print(\"loaded\")\nvalue = 1")],
        "import noisy\nimport noisy\nprint(noisy.value)",
    );
    assert!(program.no_errors());
    assert_eq!(output.unwrap(), vec!["loaded", "1"]);
}

#[test]
fn missing_file_reports_not_found() {
    let (program, output) = run_project(&[], "import nothing_here\nprint(1)");
    assert!(output.is_none());
    assert_eq!(
        program.error_stream.errors[0].code,
        ErrorCode::FileNotFound
    );
}

#[test]
fn self_import_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path: PathBuf = dir.path().join("main.nte");
    fs::write(&path, "import main\nprint(1)").unwrap();

    let mut program = Program::new();
    program.project_paths.insert(0, dir.path().to_path_buf());
    let entry = program
        .open_from_absolute_path(&path)
        .model()
        .expect("entry loads");
    program.entry = Some(entry);

    let compilation = compiler::compile(&mut program, entry);
    assert!(compilation.is_none());
    assert_eq!(program.error_stream.errors[0].code, ErrorCode::SelfImport);
}

#[test]
fn missing_module_field_is_reported() {
    let (program, output) = run_project(
        &[("m.nte", "value = 7")],
        "from m import absent\nprint(1)",
    );
    assert!(output.is_none());
    assert_eq!(
        program.error_stream.errors[0].code,
        ErrorCode::ModuleFieldNotFound
    );
}

#[test]
fn transitive_imports_resolve() {
    let (program, output) = run_project(
        &[
            ("inner.nte", "base = 10"),
            ("outer.nte", "import inner\nderived = inner.base + 1"),
        ],
        "import outer\nprint(outer.derived)",
    );
    assert!(program.no_errors());
    assert_eq!(output.unwrap(), vec!["11"]);
}

#[test]
fn reset_allows_recompilation_with_imports() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("m.nte"), "value = 3").unwrap();

    let mut program = Program::new();
    program.project_paths.insert(0, dir.path().to_path_buf());
    let entry = program
        .set_entry_source(dir.path().join("main.nte"), "import m\nprint(m.value)")
        .model()
        .unwrap();

    assert!(compiler::compile(&mut program, entry).is_some());
    // Second compilation re-walks imports after the reset
    assert!(compiler::compile(&mut program, entry).is_some());
    assert!(program.no_errors());
}
