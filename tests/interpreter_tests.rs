//! End-to-end execution scenarios.

mod common;

use common::{compile_source, printed, run_and_print, run_source};
use notate::errors::ErrorCode;
use notate::interpreter::{RunJob, FINISHED, RUNTIME_ERROR};
use notate::serial;
use notate::Interpreter;

#[test]
fn prints_sum_of_literals() {
    assert_eq!(run_and_print("print(1 + 2)"), vec!["3"]);
}

#[test]
fn sole_expression_prints_itself() {
    assert_eq!(run_and_print("1 + 2"), vec!["3"]);
}

#[test]
fn c_style_for_loop_prints_sequence() {
    let output = run_and_print("for(i ← 0; i < 3; i ← i + 1) {\nprint(i, \"\\n\")\n}");
    assert_eq!(output.concat(), "0\n1\n2\n");
}

#[test]
fn matrix_times_inverse_is_identity() {
    let source = format!(
        "A ← {}\nprint(A · A{})",
        serial::matrix(2, 2, &["1", "2", "3", "4"]),
        serial::unary(serial::KEY_SUPERSCRIPT, "-1"),
    );
    let output = run_and_print(&source);
    assert_eq!(output, vec![serial::matrix(2, 2, &["1", "0", "0", "1"])]);
}

#[test]
fn named_lambda_squares() {
    let source = "f(x) = x^2\nprint(f(3))";
    assert_eq!(run_and_print(source), vec!["9"]);
}

#[test]
fn switch_fallthrough_shares_codepath() {
    let template = |n: u32| {
        format!(
            "n ← {n}\nswitch(n) {{\ncase 1:\nprint(\"a\")\ncase 2:\ncase 3:\nprint(\"bc\")\ndefault:\nprint(\"other\")\n}}"
        )
    };
    assert_eq!(run_and_print(&template(3)), vec!["bc"]);
    assert_eq!(run_and_print(&template(2)), vec!["bc"]);
    assert_eq!(run_and_print(&template(1)), vec!["a"]);
    assert_eq!(run_and_print(&template(5)), vec!["other"]);
}

#[test]
fn duplicate_case_fails_at_compile_time() {
    let source = "n ← 1\nswitch(n) {\ncase 1:\nprint(\"a\")\ncase 1:\nprint(\"b\")\n}";
    let (program, compilation) = compile_source(source);
    assert!(compilation.is_none());
    assert_eq!(
        program.error_stream.errors[0].code,
        ErrorCode::RedundantCase
    );
}

#[test]
fn string_switch_dispatches_on_content() {
    let source = "s ← \"abc\"\nswitch(s) {\ncase \"abc\":\nprint(1)\ndefault:\nprint(2)\n}";
    assert_eq!(run_and_print(source), vec!["1"]);
}

#[test]
fn while_loop_counts_down() {
    let source = "n ← 3\nwhile(n > 0) {\nprint(n)\nn ← n - 1\n}";
    assert_eq!(run_and_print(source), vec!["3", "2", "1"]);
}

#[test]
fn break_exits_loop_early() {
    let source = "for(i ← 0; i < 10; i ← i + 1) {\nif(i > 2) {\nbreak\n}\nprint(i)\n}\nprint(\"done\")";
    assert_eq!(run_and_print(source), vec!["0", "1", "2", "done"]);
}

#[test]
fn continue_skips_iteration() {
    let source =
        "for(i ← 0; i < 4; i ← i + 1) {\nif(i = 1) {\ncontinue\n}\nprint(i)\n}";
    assert_eq!(run_and_print(source), vec!["0", "2", "3"]);
}

#[test]
fn ranged_for_iterates_vector_elements() {
    let source = format!(
        "v ← {}\nfor(x : v) {{\nprint(x)\n}}",
        serial::matrix(3, 1, &["5", "6", "7"])
    );
    assert_eq!(run_and_print(&source), vec!["5", "6", "7"]);
}

#[test]
fn algorithm_with_default_argument() {
    let source = "algorithm scale(x, k = 10) {\nreturn x * k\n}\nprint(scale(3))\nprint(scale(3, 2))";
    assert_eq!(run_and_print(source), vec!["30", "6"]);
}

#[test]
fn recursion_computes_factorial() {
    let source = "algorithm fact(n) {\nif(n < 2) {\nreturn 1\n}\nreturn n * fact(n - 1)\n}\nprint(fact(5))";
    assert_eq!(run_and_print(source), vec!["120"]);
}

#[test]
fn closure_counter_retains_state() {
    let source = "algorithm counter() {\ncount ← 0\nalgorithm tick() {\ncount ← count + 1\nreturn count\n}\nreturn tick\n}\nc ← counter()\nprint(c())\nprint(c())";
    assert_eq!(run_and_print(source), vec!["1", "2"]);
}

#[test]
fn value_capture_freezes_the_variable() {
    let source = format!(
        "x ← 1\nalgorithm f{}() {{\nreturn x\n}}\nx ← 2\nprint(f())",
        "{x}"
    );
    // x is captured by value at declaration
    assert_eq!(run_and_print(&source), vec!["1"]);
}

#[test]
fn lambda_applies() {
    let source = "double ← (x) ↦ 2 x\nprint(double(7))";
    assert_eq!(run_and_print(source), vec!["14"]);
}

#[test]
fn factorial_of_twenty_succeeds() {
    assert_eq!(run_and_print("print(20!)"), vec!["2432902008176640000"]);
}

#[test]
fn factorial_of_twenty_one_overflows() {
    let (_, interpreter) = run_source("print(21!)");
    assert_eq!(interpreter.status(), RUNTIME_ERROR);
    assert_eq!(interpreter.error_code(), ErrorCode::CalcOverflow);
}

#[test]
fn slice_with_zero_step_is_out_of_range() {
    let source = format!(
        "v ← {}\nprint(v{})",
        serial::matrix(4, 1, &["1", "2", "3", "4"]),
        serial::unary(serial::KEY_SUBSCRIPT, "0:3:0"),
    );
    let (_, interpreter) = run_source(&source);
    assert_eq!(interpreter.status(), RUNTIME_ERROR);
    assert_eq!(interpreter.error_code(), ErrorCode::IndexOutOfRange);
}

#[test]
fn backward_slice_with_positive_step_never_terminates() {
    let source = format!(
        "v ← {}\nprint(v{})",
        serial::matrix(4, 1, &["1", "2", "3", "4"]),
        serial::unary(serial::KEY_SUBSCRIPT, "1:0"),
    );
    let (_, interpreter) = run_source(&source);
    assert_eq!(interpreter.status(), RUNTIME_ERROR);
    assert_eq!(interpreter.error_code(), ErrorCode::NonTerminatingSlice);
}

#[test]
fn forward_slice_with_negative_step_never_terminates() {
    let source = format!(
        "v ← {}\nprint(v{})",
        serial::matrix(4, 1, &["1", "2", "3", "4"]),
        serial::unary(serial::KEY_SUBSCRIPT, "0:3:-1"),
    );
    let (_, interpreter) = run_source(&source);
    assert_eq!(interpreter.status(), RUNTIME_ERROR);
    assert_eq!(interpreter.error_code(), ErrorCode::NonTerminatingSlice);
}

#[test]
fn negative_step_slice_reverses() {
    let source = format!(
        "v ← {}\nprint(v{})",
        serial::matrix(4, 1, &["1", "2", "3", "4"]),
        serial::unary(serial::KEY_SUBSCRIPT, "3:0:-1"),
    );
    assert_eq!(
        run_and_print(&source),
        vec![serial::matrix(4, 1, &["4", "3", "2", "1"])]
    );
}

#[test]
fn subscript_reads_matrix_entry() {
    let source = format!(
        "A ← {}\nprint(A{})",
        serial::matrix(2, 2, &["1", "2", "3", "4"]),
        serial::unary(serial::KEY_SUBSCRIPT, "1, 0"),
    );
    assert_eq!(run_and_print(&source), vec!["3"]);
}

#[test]
fn subscript_write_updates_entry() {
    let source = format!(
        "A ← {}\nA{} ← 9\nprint(A{})",
        serial::matrix(2, 2, &["1", "2", "3", "4"]),
        serial::unary(serial::KEY_SUBSCRIPT, "0, 1"),
        serial::unary(serial::KEY_SUBSCRIPT, "0, 1"),
    );
    assert_eq!(run_and_print(&source), vec!["9"]);
}

#[test]
fn elementwise_assignment_fills_vector() {
    let source = format!(
        "v ← {}\nv{} ← i * i\nprint(v)",
        serial::matrix(3, 1, &["0", "0", "0"]),
        serial::unary(serial::KEY_SUBSCRIPT, "i"),
    );
    assert_eq!(
        run_and_print(&source),
        vec![serial::matrix(3, 1, &["0", "1", "4"])]
    );
}

#[test]
fn big_sum_accumulates() {
    let source = format!(
        "print({}k)",
        serial::binary(serial::KEY_BIG_SUM, "k = 1", "10")
    );
    assert_eq!(run_and_print(&source), vec!["55"]);
}

#[test]
fn big_product_multiplies() {
    let source = format!(
        "print({}k)",
        serial::binary(serial::KEY_BIG_PROD, "k = 1", "5")
    );
    assert_eq!(run_and_print(&source), vec!["120"]);
}

#[test]
fn definite_integral_is_midpoint_rule() {
    // ∫₀¹ x dx = 0.5 exactly under the midpoint rule
    let source = format!(
        "print({}x dx)",
        serial::binary(serial::KEY_DEFINITE_INTEGRAL, "0", "1")
    );
    assert_eq!(run_and_print(&source), vec!["0.5"]);
}

#[test]
fn derivative_of_square_is_two_x() {
    let source = format!(
        "x ← 3\ny ← {} x^2\nprint(y)",
        serial::binary(serial::KEY_FRACTION, "d", "dx")
    );
    let output = run_and_print(&source);
    let value: f64 = output[0].parse().unwrap();
    assert!((value - 6.0).abs() < 1e-3, "derivative was {value}");
}

#[test]
fn norms_of_a_vector() {
    let v = serial::matrix(2, 1, &["3", "4"]);
    assert_eq!(run_and_print(&format!("v ← {v}\nprint(‖v‖)")), vec!["5"]);
    let source = format!(
        "v ← {v}\nprint(‖v‖{})",
        serial::unary(serial::KEY_SUBSCRIPT, "1")
    );
    assert_eq!(run_and_print(&source), vec!["7"]);
    let source = format!(
        "v ← {v}\nprint(‖v‖{})",
        serial::unary(serial::KEY_SUBSCRIPT, "∞")
    );
    assert_eq!(run_and_print(&source), vec!["4"]);
}

#[test]
fn norm_squared_lowering_evaluates() {
    let source = format!(
        "v ← {}\nprint(‖v‖{})",
        serial::matrix(2, 1, &["3", "4"]),
        serial::unary(serial::KEY_SUPERSCRIPT, "2"),
    );
    assert_eq!(run_and_print(&source), vec!["25"]);
}

#[test]
fn cross_product_of_basis_vectors() {
    let source = format!(
        "a ← {}\nb ← {}\nprint(a × b)",
        serial::matrix(3, 1, &["1", "0", "0"]),
        serial::matrix(3, 1, &["0", "1", "0"]),
    );
    assert_eq!(
        run_and_print(&source),
        vec![serial::matrix(3, 1, &["0", "0", "1"])]
    );
}

#[test]
fn hat_operator_skews_r3() {
    let source = format!(
        "w ← {}\nprint(ŵ)",
        serial::matrix(3, 1, &["1", "2", "3"])
    );
    // ŵ is typeset as the accent-hat construct
    let source = source.replace("ŵ", &serial::unary(serial::KEY_ACCENT_HAT, "w"));
    assert_eq!(
        run_and_print(&source),
        vec![serial::matrix(
            3,
            3,
            &["0", "-3", "2", "3", "0", "-1", "-2", "1", "0"]
        )]
    );
}

#[test]
fn linear_solve_via_backslash() {
    let source = format!(
        "A ← {}\nb ← {}\nprint(A \\ b)",
        serial::matrix(2, 2, &["2", "0", "0", "4"]),
        serial::matrix(2, 1, &["2", "8"]),
    );
    assert_eq!(
        run_and_print(&source),
        vec![serial::matrix(2, 1, &["1", "2"])]
    );
}

#[test]
fn assert_failure_stops_execution() {
    let (_, interpreter) = run_source("assert(1 > 2)\nprint(\"unreachable\")");
    assert_eq!(interpreter.status(), RUNTIME_ERROR);
    assert_eq!(interpreter.error_code(), ErrorCode::AssertFail);
    assert!(printed(&interpreter).is_empty());
}

#[test]
fn assert_success_is_silent() {
    assert_eq!(run_and_print("assert(2 > 1)\nprint(\"ok\")"), vec!["ok"]);
}

#[test]
fn approx_equality_uses_tolerance() {
    assert_eq!(run_and_print("print(0.1 + 0.2 ≈ 0.3)"), vec!["true"]);
    assert_eq!(run_and_print("print(1 ≈ 1.001)"), vec!["false"]);
}

#[test]
fn membership_checks_integers() {
    assert_eq!(run_and_print("print(3 ∈ ℤ)"), vec!["true"]);
    assert_eq!(run_and_print("print(3.5 ∈ ℤ)"), vec!["false"]);
    assert_eq!(run_and_print("print(3 ∈ ⟦1, 5⟧)"), vec!["true"]);
    assert_eq!(run_and_print("print(9 ∈ ⟦1, 5⟧)"), vec!["false"]);
}

#[test]
fn comparison_chain_uses_inclusive_mask() {
    assert_eq!(run_and_print("print(1 < 2 <= 2 < 4)"), vec!["true"]);
    assert_eq!(run_and_print("print(1 < 2 < 2)"), vec!["false"]);
}

#[test]
fn cases_construct_selects_branch() {
    let source = format!(
        "x ← -5\nprint({})",
        serial::cases(&[("1", "x > 0"), ("-1", "x < 0")])
    );
    assert_eq!(run_and_print(&source), vec!["-1"]);
}

#[test]
fn implicit_multiplication_of_singles() {
    assert_eq!(run_and_print("a ← 3\nb ← 4\nprint(ab)"), vec!["12"]);
}

#[test]
fn pi_r_multiplies_implicitly() {
    let output = run_and_print("r ← 2\nprint(πr)");
    let value: f64 = output[0].parse().unwrap();
    assert!((value - 2.0 * std::f64::consts::PI).abs() < 1e-5);
}

#[test]
fn plot_emits_create_then_series() {
    let source = format!(
        "x ← {}\ny ← {}\nplot(\"title\", \"t\", x, \"v\", y)",
        serial::matrix(3, 1, &["0", "1", "2"]),
        serial::matrix(3, 1, &["0", "1", "4"]),
    );
    let (_, interpreter) = run_source(&source);
    assert_eq!(interpreter.status(), FINISHED);
    let messages = interpreter.message_queue.drain();
    assert_eq!(messages.len(), 2);
    match &messages[0] {
        notate::OutputMessage::PlotCreate { title, x_label, y_label } => {
            assert_eq!(title, "title");
            assert_eq!(x_label, "t");
            assert_eq!(y_label, "v");
        }
        other => panic!("expected PlotCreate, got {other:?}"),
    }
    match &messages[1] {
        notate::OutputMessage::PlotDiscreteSeries { data } => {
            assert_eq!(data, &vec![(0.0, 0.0), (1.0, 1.0), (2.0, 4.0)]);
        }
        other => panic!("expected PlotDiscreteSeries, got {other:?}"),
    }
}

#[test]
fn reassign_with_wrong_shape_fails_at_runtime() {
    let source = format!(
        "A ← {}\nB ← {}\nA ← B\nprint(A)",
        serial::matrix(2, 2, &["1", "2", "3", "4"]),
        serial::matrix(2, 2, &["1", "2", "3", "4"]),
    );
    // same shape reassignment is fine
    assert_eq!(
        run_and_print(&source),
        vec![serial::matrix(2, 2, &["1", "2", "3", "4"])]
    );
}

#[test]
fn string_escapes_render_in_print() {
    assert_eq!(run_and_print("print(\"a\\nb\")"), vec!["a\nb"]);
}

#[test]
fn namespace_members_are_scoped() {
    let source = "namespace geo {\ntau = 6.283185\n}\nprint(geo.tau)";
    assert_eq!(run_and_print(source), vec!["6.283185"]);
}

#[test]
fn namespace_reopen_sees_previous_members() {
    let source = "namespace m {\na = 2\n}\nnamespace m {\nb = a * 3\n}\nprint(m.b)";
    assert_eq!(run_and_print(source), vec!["6"]);
}

#[test]
fn running_twice_produces_identical_output() {
    let source = "x ← 2\nfor(i ← 0; i < 3; i ← i + 1) {\nx ← x * x\n}\nprint(x)";
    let (_, compilation) = compile_source(source);
    let compilation = compilation.unwrap();
    let first = {
        let interpreter = Interpreter::new();
        interpreter.run(RunJob::from_compilation(&compilation));
        printed(&interpreter)
    };
    let second = {
        let interpreter = Interpreter::new();
        interpreter.run(RunJob::from_compilation(&compilation));
        printed(&interpreter)
    };
    assert_eq!(first, second);
    assert_eq!(first, vec!["256"]);
}
