//! Shared harness: compile a source string, run it to completion, and
//! collect the interpreter's output messages.
#![allow(dead_code)]

use std::path::PathBuf;

use notate::compiler::{self, Compilation};
use notate::interpreter::{Interpreter, RunJob};
use notate::message::OutputMessage;
use notate::program::Program;

pub fn compile_source(source: &str) -> (Program, Option<Compilation>) {
    let mut program = Program::new();
    let id = program
        .set_entry_source(PathBuf::from("main.nte"), source)
        .model()
        .expect("entry source must be a valid serial");
    let compilation = compiler::compile(&mut program, id);
    (program, compilation)
}

pub fn run_source(source: &str) -> (Program, Interpreter) {
    let (program, compilation) = compile_source(source);
    let compilation = match compilation {
        Some(compilation) => compilation,
        None => panic!(
            "compilation failed: {:?}",
            program.error_stream.errors.first().map(|e| e.code)
        ),
    };
    let interpreter = Interpreter::new();
    interpreter.run(RunJob::from_compilation(&compilation));
    (program, interpreter)
}

/// Print messages only, in production order.
pub fn printed(interpreter: &Interpreter) -> Vec<String> {
    interpreter
        .message_queue
        .drain()
        .into_iter()
        .filter_map(|message| match message {
            OutputMessage::Print { message } => Some(message),
            _ => None,
        })
        .collect()
}

pub fn run_and_print(source: &str) -> Vec<String> {
    let (_, interpreter) = run_source(source);
    assert_eq!(
        interpreter.status(),
        notate::interpreter::FINISHED,
        "program should finish cleanly, got error {:?}",
        interpreter.error_code()
    );
    printed(&interpreter)
}
