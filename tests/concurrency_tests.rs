//! Host/interpreter threading contract: one worker, stop(), FIFO drain.

mod common;

use std::time::{Duration, Instant};

use common::compile_source;
use notate::errors::ErrorCode;
use notate::interpreter::{Interpreter, RunJob, FINISHED, RUNTIME_ERROR};
use notate::message::OutputMessage;

fn wait_until_finished(interpreter: &Interpreter) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !interpreter.finished() {
        assert!(Instant::now() < deadline, "interpreter did not settle");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn run_thread_finishes_and_host_drains_in_order() {
    let (_, compilation) = compile_source(
        "for(i ← 0; i < 100; i ← i + 1) {\nprint(i)\n}",
    );
    let compilation = compilation.unwrap();
    let interpreter = Interpreter::new();
    interpreter.run_thread(RunJob::from_compilation(&compilation));
    wait_until_finished(&interpreter);
    assert_eq!(interpreter.status(), FINISHED);

    let messages = interpreter.message_queue.drain();
    assert_eq!(messages.len(), 100);
    for (i, message) in messages.iter().enumerate() {
        assert_eq!(
            message,
            &OutputMessage::Print {
                message: i.to_string()
            }
        );
    }
}

#[test]
fn stop_interrupts_infinite_loop() {
    let (_, compilation) = compile_source("x ← 0\nwhile(true) {\nx ← x + 1\n}");
    let compilation = compilation.unwrap();
    let interpreter = Interpreter::new();
    interpreter.run_thread(RunJob::from_compilation(&compilation));

    std::thread::sleep(Duration::from_millis(20));
    interpreter.stop();
    wait_until_finished(&interpreter);

    assert_eq!(interpreter.status(), RUNTIME_ERROR);
    assert_eq!(interpreter.error_code(), ErrorCode::UserStop);
}

#[test]
fn stop_before_start_halts_immediately() {
    let (_, compilation) = compile_source("while(true) {\nprint(1)\n}");
    let compilation = compilation.unwrap();
    let interpreter = Interpreter::new();
    interpreter.run_thread(RunJob::from_compilation(&compilation));
    interpreter.stop();
    wait_until_finished(&interpreter);
    assert_eq!(interpreter.status(), RUNTIME_ERROR);
    assert_eq!(interpreter.error_code(), ErrorCode::UserStop);
}

#[test]
fn host_edits_do_not_disturb_running_job() {
    let (_, compilation) = compile_source("for(i ← 0; i < 50; i ← i + 1) {\nprint(i)\n}");
    let mut compilation = compilation.unwrap();
    let interpreter = Interpreter::new();
    interpreter.run_thread(RunJob::from_compilation(&compilation));

    // The job owns clones; mutating the host-side artefacts is safe
    compilation.parse_tree.clear();
    compilation.instantiation_lookup.clear();

    wait_until_finished(&interpreter);
    assert_eq!(interpreter.status(), FINISHED);
    assert_eq!(interpreter.message_queue.drain().len(), 50);
}

#[test]
fn sequential_runs_reuse_the_interpreter() {
    let (_, compilation) = compile_source("print(42)");
    let compilation = compilation.unwrap();
    let interpreter = Interpreter::new();

    interpreter.run(RunJob::from_compilation(&compilation));
    assert_eq!(interpreter.status(), FINISHED);
    assert_eq!(interpreter.message_queue.drain().len(), 1);

    interpreter.run(RunJob::from_compilation(&compilation));
    assert_eq!(interpreter.status(), FINISHED);
    assert_eq!(interpreter.message_queue.drain().len(), 1);
}
