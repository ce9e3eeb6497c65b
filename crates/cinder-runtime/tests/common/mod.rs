//! Shared helpers: compile+run a source string and capture its output

#![allow(dead_code)]

use cinder_runtime::{InterpretError, VM};
use std::cell::RefCell;
use std::rc::Rc;

/// Run source on a fresh VM, returning the interpret result and captured
/// print output.
pub fn run(source: &str) -> (Result<i32, InterpretError>, String) {
    let buffer: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let mut vm = VM::new();
    vm.set_output_writer(buffer.clone());
    let result = vm.interpret(source);
    let output = String::from_utf8(buffer.borrow().clone()).expect("utf8 output");
    (result, output)
}

/// Run source that must succeed; returns its print output
pub fn run_ok(source: &str) -> String {
    let (result, output) = run(source);
    assert_eq!(result.unwrap(), 0, "program failed for: {}", source);
    output
}

/// Run source that must fail at runtime; returns the error message
pub fn runtime_error(source: &str) -> String {
    let (result, _) = run(source);
    match result {
        Err(InterpretError::Runtime(error)) => error.message,
        other => panic!("expected runtime error for {:?}, got {:?}", source, other),
    }
}

/// Run source that must fail to compile; returns the rendered first error
pub fn compile_error(source: &str) -> String {
    let (result, _) = run(source);
    match result {
        Err(InterpretError::Compile(errors)) => errors[0].to_string(),
        other => panic!("expected compile error for {:?}, got {:?}", source, other),
    }
}
