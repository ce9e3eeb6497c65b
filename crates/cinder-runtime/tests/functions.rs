//! Function declarations, calls, returns, natives, and call errors

mod common;

use common::{run, run_ok, runtime_error};
use cinder_runtime::InterpretError;
use pretty_assertions::assert_eq;

#[test]
fn test_function_prints_as_fn_name() {
    assert_eq!(run_ok("fun f() {} print f;"), "<fn f>\n");
    assert_eq!(run_ok("print clock;"), "<native fn>\n");
}

#[test]
fn test_call_with_arguments() {
    let output = run_ok(
        "fun add(a, b, c) { return a + b + c; }\n\
         print add(1, 2, 3);",
    );
    assert_eq!(output, "6\n");
}

#[test]
fn test_implicit_return_is_nil() {
    assert_eq!(run_ok("fun noop() {} print noop();"), "nil\n");
    assert_eq!(run_ok("fun early() { return; } print early();"), "nil\n");
}

#[test]
fn test_recursion() {
    let output = run_ok(
        "fun fib(n) { if (n < 2) return n; return fib(n-1) + fib(n-2); }\n\
         print fib(10);",
    );
    assert_eq!(output, "55\n");
}

#[test]
fn test_mutual_recursion_through_globals() {
    let output = run_ok(
        "fun is_even(n) { if (n == 0) return true; return is_odd(n - 1); }\n\
         fun is_odd(n) { if (n == 0) return false; return is_even(n - 1); }\n\
         print is_even(10);",
    );
    assert_eq!(output, "true\n");
}

#[test]
fn test_functions_are_values() {
    let output = run_ok(
        "fun twice(f, x) { return f(f(x)); }\n\
         fun inc(n) { return n + 1; }\n\
         print twice(inc, 5);",
    );
    assert_eq!(output, "7\n");
}

#[test]
fn test_arity_mismatch_too_few() {
    assert_eq!(
        runtime_error("fun f(a, b) {} f(1);"),
        "Expected 2 arguments but got 1."
    );
}

#[test]
fn test_arity_mismatch_too_many() {
    assert_eq!(
        runtime_error("fun f(a, b) {} f(1, 2, 3);"),
        "Expected 2 arguments but got 3."
    );
}

#[test]
fn test_calling_a_non_callable() {
    assert_eq!(runtime_error("var x = 1; x();"), "Can only call functions and classes.");
    assert_eq!(runtime_error("\"str\"();"), "Can only call functions and classes.");
    assert_eq!(runtime_error("nil();"), "Can only call functions and classes.");
}

#[test]
fn test_unbounded_recursion_overflows() {
    assert_eq!(runtime_error("fun f() { f(); } f();"), "Stack overflow.");
}

#[test]
fn test_stack_overflow_trace_is_capped_at_frame_limit() {
    let (result, _) = run("fun f() { f(); } f();");
    let error = match result {
        Err(InterpretError::Runtime(error)) => error,
        other => panic!("expected runtime error, got {:?}", other),
    };
    // 64 live frames: the script plus 63 calls of f; the 64th call fails
    assert_eq!(error.trace.len(), 64);
    assert_eq!(error.trace[0].function.as_deref(), Some("f"));
    assert_eq!(error.trace[error.trace.len() - 1].function, None);
}

#[test]
fn test_native_clock_advances() {
    let output = run_ok(
        "var before = clock();\n\
         var i = 0;\n\
         while (i < 1000) { i = i + 1; }\n\
         var after = clock();\n\
         print after >= before;",
    );
    assert_eq!(output, "true\n");
}

#[test]
fn test_parameters_are_frame_locals() {
    let output = run_ok(
        "var a = \"global\";\n\
         fun show(a) { print a; }\n\
         show(\"param\");\n\
         print a;",
    );
    assert_eq!(output, "param\nglobal\n");
}
