// Integration tests for the Loxide pipeline.
//
// These run complete programs through scan → compile → interpret and
// assert on the captured output stream or the reported errors. Covers
// expressions and statements, control flow, functions, closures and
// upvalue semantics, runtime errors, and behavior under GC stress.

use loxide::runner::{DebugOptions, Runner};

struct RunOutcome {
    ok: bool,
    output: String,
    errors: Vec<String>,
}

fn run_with_options(source: &str, options: DebugOptions) -> RunOutcome {
    let mut runner = Runner::new(Vec::new(), options);
    let ok = runner.run(source);
    let errors = runner
        .reporter()
        .errors()
        .iter()
        .map(|err| err.message.clone())
        .collect();
    let output = String::from_utf8(runner.into_output()).expect("output is valid utf-8");
    RunOutcome { ok, output, errors }
}

fn run_program(source: &str) -> RunOutcome {
    run_with_options(source, DebugOptions::default())
}

/// Asserts a program runs cleanly and produces exactly `expected` on the
/// output stream.
fn assert_output(source: &str, expected: &str) {
    let outcome = run_program(source);
    assert!(
        outcome.ok,
        "program failed unexpectedly; errors: {:?}",
        outcome.errors
    );
    assert_eq!(outcome.output, expected);
}

fn assert_runtime_error(source: &str, expected_fragment: &str) {
    let outcome = run_program(source);
    assert!(!outcome.ok, "program succeeded but a runtime error was expected");
    assert!(
        outcome.errors.iter().any(|msg| msg.contains(expected_fragment)),
        "no error containing {:?} in {:?}",
        expected_fragment,
        outcome.errors
    );
}

// === Expressions and statements ===

#[test]
fn arithmetic_precedence() {
    assert_output("print 1 + 2 * 3;", "7\n");
}

#[test]
fn grouping_overrides_precedence() {
    assert_output("print (1 + 2) * 3;", "9\n");
}

#[test]
fn unary_operators() {
    assert_output("print -4;", "-4\n");
    assert_output("print !true;", "false\n");
    assert_output("print !nil;", "true\n");
    assert_output("print !!0;", "true\n");
}

#[test]
fn number_formatting_round_trips() {
    assert_output("print 2.5;", "2.5\n");
    assert_output("print 0.5 + 1;", "1.5\n");
    assert_output("print 10 / 4;", "2.5\n");
}

#[test]
fn comparison_operators() {
    assert_output("print 1 < 2;", "true\n");
    assert_output("print 2 <= 2;", "true\n");
    assert_output("print 3 > 4;", "false\n");
    assert_output("print 4 >= 5;", "false\n");
}

#[test]
fn equality_across_types_is_false() {
    assert_output("print 1 == \"1\";", "false\n");
    assert_output("print nil == false;", "false\n");
    assert_output("print nil == nil;", "true\n");
}

#[test]
fn nan_is_not_equal_to_itself() {
    assert_output("var n = 0/0; print n == n;", "false\n");
}

#[test]
fn string_concatenation() {
    assert_output("var a = \"foo\"; var b = \"bar\"; print a + b;", "foobar\n");
}

#[test]
fn interned_concatenation_equals_literal() {
    assert_output("print \"ab\" == \"a\" + \"b\";", "true\n");
}

#[test]
fn assignment_is_an_expression() {
    assert_output("var a = 1; print a = 8;", "8\n");
}

#[test]
fn and_or_short_circuit_values() {
    assert_output("print nil and 1;", "nil\n");
    assert_output("print 1 and 2;", "2\n");
    assert_output("print false or \"x\";", "x\n");
    assert_output("print 1 or 2;", "1\n");
    assert_output("print nil or nil;", "nil\n");
}

#[test]
fn and_does_not_evaluate_rhs_when_falsey() {
    assert_output("fun boom() { print \"boom\"; return true; } print false and boom();", "false\n");
}

// === Control flow ===

#[test]
fn if_else_branches() {
    assert_output("if (true) print \"then\"; else print \"else\";", "then\n");
    assert_output("if (false) print \"then\"; else print \"else\";", "else\n");
    assert_output("if (false) print \"then\";", "");
}

#[test]
fn while_loop() {
    assert_output(
        "var i = 3; while (i > 0) { print i; i = i - 1; }",
        "3\n2\n1\n",
    );
}

#[test]
fn for_loop_counts() {
    assert_output("for (var i = 0; i < 3; i = i + 1) print i;", "0\n1\n2\n");
}

#[test]
fn for_loop_without_clauses_exits_via_return() {
    assert_output("fun run() { for (;;) { return \"done\"; } } print run();", "done\n");
}

#[test]
fn for_loop_without_initializer() {
    assert_output("var i = 5; for (; i > 3; i = i - 1) print i;", "5\n4\n");
}

#[test]
fn block_scoping_and_shadowing() {
    assert_output(
        "var a = \"outer\"; { var a = \"inner\"; print a; } print a;",
        "inner\nouter\n",
    );
}

// === Functions and closures ===

#[test]
fn function_call_and_return() {
    assert_output("fun add(a, b) { return a + b; } print add(1, 2);", "3\n");
}

#[test]
fn function_without_return_yields_nil() {
    assert_output("fun noop() {} print noop();", "nil\n");
}

#[test]
fn function_prints_as_named_value() {
    assert_output("fun f() {} print f;", "<fn f>\n");
    assert_output("print clock;", "<native fn>\n");
}

#[test]
fn recursion_fibonacci() {
    assert_output(
        "fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } print fib(10);",
        "55\n",
    );
}

#[test]
fn closure_counter_retains_state() {
    assert_output(
        "fun make() { var i = 0; fun inc() { i = i + 1; return i; } return inc; } \
         var c = make(); print c(); print c(); print c();",
        "1\n2\n3\n",
    );
}

#[test]
fn separate_closures_do_not_share_state() {
    assert_output(
        "fun make() { var i = 0; fun inc() { i = i + 1; return i; } return inc; } \
         var a = make(); var b = make(); print a(); print a(); print b();",
        "1\n2\n1\n",
    );
}

#[test]
fn globals_bind_late_in_function_bodies() {
    assert_output(
        "var a = \"global\"; { fun show() { print a; } show(); var a = \"block\"; show(); }",
        "global\nglobal\n",
    );
}

#[test]
fn closures_in_same_scope_share_one_upvalue_while_open() {
    assert_output(
        "var result; \
         { var x = 1; fun bump() { x = x + 1; } fun read() { return x; } bump(); result = read(); } \
         print result;",
        "2\n",
    );
}

#[test]
fn shared_upvalue_survives_scope_exit() {
    assert_output(
        "var getter; var setter; \
         { var x = 10; fun get() { return x; } fun set(v) { x = v; } getter = get; setter = set; } \
         setter(42); print getter();",
        "42\n",
    );
}

#[test]
fn upvalue_closed_in_loop_body() {
    assert_output(
        "var first; var second; \
         for (var i = 0; i < 2; i = i + 1) { \
           var j = i; fun capture() { return j; } \
           if (i == 0) first = capture; else second = capture; \
         } \
         print first(); print second();",
        "0\n1\n",
    );
}

#[test]
fn nested_functions_capture_through_intermediate_scopes() {
    assert_output(
        "fun outer() { var x = \"captured\"; fun middle() { fun inner() { return x; } return inner; } return middle(); } \
         print outer()();",
        "captured\n",
    );
}

// === Native functions ===

#[test]
fn clock_returns_monotonic_number() {
    assert_output("var a = clock(); var b = clock(); print b >= a;", "true\n");
    assert_output("print clock() > 0;", "true\n");
}

// === Runtime errors ===

#[test]
fn arity_mismatch_is_a_runtime_error() {
    assert_runtime_error(
        "fun f(a, b) { return a; } f(1);",
        "expected 2 parameters, but got 1",
    );
}

#[test]
fn arity_mismatch_does_not_execute_callee() {
    let outcome = run_program("fun f(a) { print \"ran\"; } f();");
    assert!(!outcome.ok);
    assert_eq!(outcome.output.contains("ran"), false);
}

#[test]
fn calling_a_non_callable_is_a_runtime_error() {
    assert_runtime_error("var x = 1; x();", "Did not receive a callable.");
}

#[test]
fn undefined_global_read_is_a_runtime_error() {
    assert_runtime_error("print missing;", "Undefined variable 'missing'.");
}

#[test]
fn undefined_global_assignment_is_a_runtime_error() {
    assert_runtime_error("missing = 1;", "Undefined variable 'missing'.");
}

#[test]
fn defined_global_supports_read_and_assignment() {
    assert_output("var x = 1; x = x + 1; print x;", "2\n");
}

#[test]
fn numeric_operators_reject_other_types() {
    assert_runtime_error("print 1 - \"a\";", "Operands must be numbers.");
    assert_runtime_error("print true * 2;", "Operands must be numbers.");
    assert_runtime_error("print 1 < \"a\";", "Operands must be numbers.");
    assert_runtime_error("print -\"a\";", "Operand must be a number.");
}

#[test]
fn add_rejects_mixed_operands() {
    assert_runtime_error("print 1 + \"a\";", "Operands must be two numbers or strings.");
    assert_runtime_error("print nil + nil;", "Operands must be two numbers or strings.");
}

#[test]
fn deep_recursion_overflows_the_frame_stack() {
    assert_runtime_error("fun spin() { spin(); } spin();", "Stackoverflow.");
}

// === Statement stack neutrality ===

#[test]
fn long_statement_sequences_stay_balanced() {
    // Each statement leaves the stack where it found it, so arbitrarily
    // long sequences neither leak nor underflow.
    let mut source = String::new();
    let mut expected = String::new();
    for i in 0..50 {
        source.push_str(&format!("var v{} = {}; print v{};", i, i, i));
        expected.push_str(&format!("{}\n", i));
    }
    assert_output(&source, &expected);
}

// === GC stress equivalence ===

fn assert_stress_matches(source: &str) {
    let plain = run_program(source);
    let stressed = run_with_options(
        source,
        DebugOptions { stress_gc: true, ..Default::default() },
    );
    assert!(plain.ok, "baseline run failed: {:?}", plain.errors);
    assert!(stressed.ok, "stressed run failed: {:?}", stressed.errors);
    assert_eq!(plain.output, stressed.output);
}

#[test]
fn stress_gc_does_not_change_closure_behavior() {
    assert_stress_matches(
        "fun make() { var i = 0; fun inc() { i = i + 1; return i; } return inc; } \
         var c = make(); print c(); print c(); print c();",
    );
}

#[test]
fn stress_gc_does_not_change_string_behavior() {
    assert_stress_matches(
        "var s = \"\"; for (var i = 0; i < 5; i = i + 1) { s = s + \"x\"; print s; }",
    );
}

#[test]
fn stress_gc_does_not_change_recursion_behavior() {
    assert_stress_matches(
        "fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } print fib(12);",
    );
}
