//! Pipeline-level properties: serial well-formedness, determinism, and
//! diagnostics.

mod common;

use common::{compile_source, run_and_print};
use notate::errors::ErrorCode;
use notate::serial;

#[test]
fn every_builder_output_is_valid_serial() {
    let samples = [
        serial::binary(serial::KEY_FRACTION, "1", "x + 2"),
        serial::matrix(3, 2, &["1", "2", "3", "4", "5", "6"]),
        serial::cases(&[("x", "x > 0"), ("0", "x < 1")]),
        serial::unary(serial::KEY_SQRT, "y"),
        serial::binary(serial::KEY_BIG_SUM, "i = 1", "10"),
    ];
    for sample in samples {
        assert!(serial::is_valid_serial(&sample), "invalid: {sample:?}");
    }
}

#[test]
fn deleting_any_marker_invalidates_serial() {
    let good = format!(
        "x ← {}\n",
        serial::matrix(2, 2, &["1", "2", "3", "4"])
    );
    assert!(serial::is_valid_serial(&good));
    for (i, ch) in good.char_indices() {
        if ch == serial::OPEN || ch == serial::CLOSE || ch == serial::CONSTRUCT {
            let mut bad = String::from(&good[..i]);
            bad.push_str(&good[i + ch.len_utf8()..]);
            assert!(
                !serial::is_valid_serial(&bad),
                "deleting marker at byte {i} left serial valid"
            );
        }
    }
}

#[test]
fn newline_inside_construct_invalidates_serial() {
    let mut bad = serial::binary(serial::KEY_FRACTION, "1", "2");
    let open_pos = bad.find(serial::OPEN).unwrap();
    bad.insert(open_pos + serial::OPEN.len_utf8() + 1, '\n');
    assert!(!serial::is_valid_serial(&bad));
}

#[test]
fn compiling_twice_reports_identical_errors() {
    let source = "x ← missing + 1";
    let (program_a, _) = compile_source(source);
    let (program_b, _) = compile_source(source);
    let codes_a: Vec<ErrorCode> = program_a.error_stream.errors.iter().map(|e| e.code).collect();
    let codes_b: Vec<ErrorCode> = program_b.error_stream.errors.iter().map(|e| e.code).collect();
    assert_eq!(codes_a, codes_b);
    assert_eq!(codes_a, vec![ErrorCode::BadRead]);
}

#[test]
fn error_messages_carry_line_numbers() {
    let (program, _) = compile_source("x ← 1\ny ← nothing");
    let error = &program.error_stream.errors[0];
    assert_eq!(error.line(), 2);
    let message = program.error_stream.message(error);
    assert!(message.contains("no variable"), "message: {message}");
}

#[test]
fn warnings_do_not_block_execution() {
    // unused variable warns but the program still runs
    let output = run_and_print("x ← 1\nif(x > 0) {\nunused ← 5\n}\nprint(x)");
    assert_eq!(output, vec!["1"]);
}

#[test]
fn all_passes_run_despite_resolution_errors() {
    // parse succeeds, resolution fails; the symbol table still exists for
    // the editor and only the later stages are gated
    let (program, compilation) = compile_source("a ← 1\nb ← zz\nprint(a)");
    assert!(compilation.is_none());
    assert!(!program.no_errors());
}

#[test]
fn redefining_a_constant_is_reported() {
    let (program, _) = compile_source("x = 1\nx = 2");
    assert_eq!(
        program.error_stream.errors[0].code,
        ErrorCode::ReassignConstant
    );
}

#[test]
fn const_definition_over_mutable_is_reported() {
    let (program, _) = compile_source("x ← 1\nx = 2");
    assert_eq!(
        program.error_stream.errors[0].code,
        ErrorCode::MutableConstAssign
    );
}

#[test]
fn scanner_errors_reach_the_stream() {
    let (program, _) = compile_source("x ← 07");
    assert_eq!(
        program.error_stream.errors[0].code,
        ErrorCode::LeadingZeros
    );
}

#[test]
fn too_long_identifier_partition_fails_cleanly() {
    let (program, _) = compile_source("a ← 1\nprint(abq)");
    assert_eq!(program.error_stream.errors[0].code, ErrorCode::BadRead);
}
