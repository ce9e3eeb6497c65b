//! Classes, instances, fields, methods, `this`, and initializers

mod common;

use common::{compile_error, run_ok, runtime_error};
use pretty_assertions::assert_eq;

#[test]
fn test_class_prints_as_its_name() {
    assert_eq!(run_ok("class Pie {} print Pie;"), "Pie\n");
}

#[test]
fn test_instance_prints_as_name_instance() {
    assert_eq!(run_ok("class Pie {} print Pie();"), "Pie instance\n");
}

#[test]
fn test_method_call_with_argument() {
    let output = run_ok(
        "class Greeter { greet(who) { print \"hello \" + who; } }\n\
         var g = Greeter();\n\
         g.greet(\"world\");",
    );
    assert_eq!(output, "hello world\n");
}

#[test]
fn test_fields_are_created_on_write() {
    let output = run_ok(
        "class Box {}\n\
         var box = Box();\n\
         box.value = 42;\n\
         print box.value;",
    );
    assert_eq!(output, "42\n");
}

#[test]
fn test_set_expression_yields_assigned_value() {
    let output = run_ok(
        "class Box {}\n\
         var box = Box();\n\
         print box.value = 7;",
    );
    assert_eq!(output, "7\n");
}

#[test]
fn test_fields_shadow_methods() {
    let output = run_ok(
        "class Thing { describe() { return \"method\"; } }\n\
         var t = Thing();\n\
         print t.describe();\n\
         t.describe = \"field\";\n\
         print t.describe;",
    );
    assert_eq!(output, "method\nfield\n");
}

#[test]
fn test_this_refers_to_the_receiver() {
    let output = run_ok(
        "class Counter {\n\
           init() { this.n = 0; }\n\
           bump() { this.n = this.n + 1; return this.n; }\n\
         }\n\
         var c = Counter();\n\
         c.bump();\n\
         print c.bump();",
    );
    assert_eq!(output, "2\n");
}

#[test]
fn test_initializer_with_arguments() {
    let output = run_ok(
        "class Point {\n\
           init(x, y) { this.x = x; this.y = y; }\n\
           sum() { return this.x + this.y; }\n\
         }\n\
         print Point(3, 4).sum();",
    );
    assert_eq!(output, "7\n");
}

#[test]
fn test_initializer_returns_the_instance() {
    let output = run_ok(
        "class Chatty { init() { this.greeting = \"hi\"; } }\n\
         print Chatty().greeting;",
    );
    assert_eq!(output, "hi\n");
}

#[test]
fn test_plain_return_in_initializer_still_yields_instance() {
    let output = run_ok(
        "class Early {\n\
           init(skip) { if (skip) return; this.done = true; }\n\
         }\n\
         print Early(true);",
    );
    assert_eq!(output, "Early instance\n");
}

#[test]
fn test_bound_method_remembers_its_receiver() {
    let output = run_ok(
        "class Speaker {\n\
           init(word) { this.word = word; }\n\
           say() { print this.word; }\n\
         }\n\
         var hi = Speaker(\"hi\").say;\n\
         hi();",
    );
    assert_eq!(output, "hi\n");
}

#[test]
fn test_bound_method_prints_as_fn() {
    let output = run_ok(
        "class C { m() {} }\n\
         print C().m;",
    );
    assert_eq!(output, "<fn m>\n");
}

#[test]
fn test_methods_close_over_surrounding_scope() {
    let output = run_ok(
        "var make = nil;\n\
         {\n\
           var prefix = \">> \";\n\
           class Logger { log(msg) { print prefix + msg; } }\n\
           make = Logger;\n\
         }\n\
         make().log(\"ready\");",
    );
    assert_eq!(output, ">> ready\n");
}

#[test]
fn test_class_arity_checks() {
    assert_eq!(
        runtime_error("class C {} C(1);"),
        "Expected 0 arguments but got 1."
    );
    assert_eq!(
        runtime_error("class C { init(a) {} } C();"),
        "Expected 1 arguments but got 0."
    );
}

#[test]
fn test_undefined_property_read() {
    assert_eq!(
        runtime_error("class C {} print C().missing;"),
        "Undefined property 'missing'."
    );
}

#[test]
fn test_property_access_on_non_instances() {
    assert_eq!(runtime_error("print (1).x;"), "Only instances have properties.");
    assert_eq!(runtime_error("\"s\".x = 1;"), "Only instances have fields.");
    assert_eq!(runtime_error("nil.x;"), "Only instances have properties.");
}

#[test]
fn test_value_returns_from_initializers_are_rejected() {
    assert_eq!(
        compile_error("class C { init() { return 1; } }"),
        "[line 1] Error at 'return': Can't return a value from an initializer."
    );
}

#[test]
fn test_this_outside_a_class_is_rejected() {
    assert_eq!(
        compile_error("print this;"),
        "[line 1] Error at 'this': Can't use 'this' outside of a class."
    );
    assert_eq!(
        compile_error("fun f() { return this; }"),
        "[line 1] Error at 'this': Can't use 'this' outside of a class."
    );
}
