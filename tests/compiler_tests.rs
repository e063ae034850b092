// Compiler-facing tests: scanner diagnostics, parse and resolution
// errors, compile-time limits, emitted bytecode shape and the
// disassembler's rendering of it.

use loxide::compiler;
use loxide::errors::{ErrorReporter, Stage};
use loxide::heap::Heap;
use loxide::lexer::{Scanner, TokenKind};
use loxide::runner::{DebugOptions, Runner};
use loxide::strings::StringPool;
use loxide::{chunk::OpCode, debug};

fn compile_errors(source: &str) -> Vec<(Stage, String)> {
    let mut runner = Runner::new(Vec::new(), DebugOptions::default());
    let ok = runner.run(source);
    assert!(!ok, "expected compilation of {:?} to fail", source);
    runner
        .reporter()
        .errors()
        .iter()
        .map(|err| (err.stage, err.message.clone()))
        .collect()
}

fn assert_compile_error(source: &str, stage: Stage, fragment: &str) {
    let errors = compile_errors(source);
    assert!(
        errors.iter().any(|(s, msg)| *s == stage && msg.contains(fragment)),
        "no {:?} error containing {:?} in {:?}",
        stage,
        fragment,
        errors
    );
}

// === Scanner ===

#[test]
fn scanner_produces_expected_kinds() {
    let mut reporter = ErrorReporter::new();
    let tokens = Scanner::new("var x = 1.5; // comment\nprint x;", &mut reporter).tokenize();
    assert!(!reporter.has_error());
    let kinds: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
    assert_eq!(
        kinds,
        vec![
            TokenKind::Var,
            TokenKind::Identifier,
            TokenKind::Equal,
            TokenKind::Number,
            TokenKind::Semicolon,
            TokenKind::Print,
            TokenKind::Identifier,
            TokenKind::Semicolon,
            TokenKind::Eof,
        ]
    );
    assert_eq!(tokens[3].lexeme, "1.5");
    assert_eq!(tokens[5].line, 2);
}

#[test]
fn scanner_reports_unterminated_string() {
    assert_compile_error("print \"oops;", Stage::Scanning, "Unterminated string.");
}

#[test]
fn scanner_reports_unexpected_character() {
    assert_compile_error("print 1 @ 2;", Stage::Scanning, "Unexpected character");
}

#[test]
fn scan_errors_skip_compilation_but_report_every_line() {
    let errors = compile_errors("@\n#\n");
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|(stage, _)| *stage == Stage::Scanning));
}

// === Parse errors ===

#[test]
fn missing_expression_is_reported() {
    assert_compile_error("print ;", Stage::Parsing, "Expected expression.");
}

#[test]
fn missing_semicolon_is_reported() {
    assert_compile_error("print 1", Stage::Parsing, "Expecting ; after print statement.");
}

#[test]
fn invalid_assignment_target() {
    assert_compile_error("var a = 1; var b = 2; a * b = 3;", Stage::Parsing, "Invalid assignment target.");
}

#[test]
fn return_at_top_level_is_rejected() {
    assert_compile_error("return;", Stage::Parsing, "Cannot return from top-level code.");
}

#[test]
fn return_inside_function_is_allowed() {
    let mut runner = Runner::new(Vec::new(), DebugOptions::default());
    assert!(runner.run("fun f() { return 1; } print f();"));
}

#[test]
fn classes_are_rejected() {
    assert_compile_error("class Foo {}", Stage::Parsing, "Classes are not supported.");
}

#[test]
fn this_and_super_do_not_parse_as_expressions() {
    assert_compile_error("print this;", Stage::Parsing, "Expected expression.");
    assert_compile_error("print super;", Stage::Parsing, "Expected expression.");
}

#[test]
fn duplicate_local_in_same_scope_is_rejected() {
    assert_compile_error(
        "{ var a = 1; var a = 2; }",
        Stage::Parsing,
        "Variable with this name already in scope.",
    );
}

#[test]
fn local_cannot_read_itself_in_initializer() {
    assert_compile_error(
        "{ var a = \"outer\"; { var a = a; } }",
        Stage::Resolving,
        "Can't read local variable in its own initializer.",
    );
}

#[test]
fn shadowing_in_inner_scope_is_allowed() {
    let mut runner = Runner::new(Vec::new(), DebugOptions::default());
    assert!(runner.run("var a = 1; { var a = 2; } { var a = 3; }"));
}

#[test]
fn panic_mode_recovers_at_statement_boundaries() {
    // Two independent syntax errors in separate statements both surface.
    let errors = compile_errors("print ;\nvar = 3;\n");
    let parse_errors: Vec<_> =
        errors.iter().filter(|(stage, _)| *stage == Stage::Parsing).collect();
    assert_eq!(parse_errors.len(), 2);
}

#[test]
fn error_messages_carry_the_offending_line() {
    let mut runner = Runner::new(Vec::new(), DebugOptions::default());
    assert!(!runner.run("var ok = 1;\nprint ;\n"));
    let errors = runner.reporter().errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].line, 2);
}

// === Compile-time limits ===

#[test]
fn too_many_constants_in_one_chunk() {
    // Each distinct literal takes a constant slot; 300 exceeds the
    // one-byte operand space.
    let mut source = String::new();
    for i in 0..300 {
        source.push_str(&format!("var v{} = {};", i, i));
    }
    assert_compile_error(&source, Stage::Parsing, "Too many constants in code chunk.");
}

#[test]
fn too_many_arguments_in_one_call() {
    // Local-variable arguments so the argument-count limit trips before
    // the constant-pool limit does.
    let args = vec!["a"; 260].join(", ");
    let source = format!("fun f() {{}} {{ var a = 1; f({}); }}", args);
    assert_compile_error(&source, Stage::Parsing, "Cannot have more than 255 arguments.");
}

// === Emitted bytecode ===

fn compile_source(
    source: &str,
    heap: &mut Heap,
    pool: &mut StringPool,
) -> loxide::heap::Gc<loxide::object::Function> {
    let mut reporter = ErrorReporter::new();
    let tokens = Scanner::new(source, &mut reporter).tokenize();
    assert!(!reporter.has_error());
    let options = DebugOptions::default();
    let function = compiler::compile(&tokens, heap, pool, &mut reporter, &options)
        .expect("compilation should succeed");
    assert!(!reporter.has_error());
    function
}

#[test]
fn line_table_tracks_every_emitted_byte() {
    let mut heap = Heap::new();
    let mut pool = StringPool::new();
    let function = compile_source("var a = 1;\nprint a;\nprint\na;\n", &mut heap, &mut pool);
    let chunk = &heap.get(function).chunk;
    assert_eq!(chunk.code.len(), chunk.lines.len());
    assert!(chunk.lines.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[test]
fn expression_statement_compiles_to_expression_plus_pop() {
    let mut heap = Heap::new();
    let mut pool = StringPool::new();
    let function = compile_source("1;", &mut heap, &mut pool);
    let code = &heap.get(function).chunk.code;
    // OP_CONSTANT 0, OP_POP, then the implicit OP_NIL OP_RETURN.
    assert_eq!(
        code.as_slice(),
        &[
            OpCode::Constant as u8,
            0,
            OpCode::Pop as u8,
            OpCode::Nil as u8,
            OpCode::Return as u8,
        ]
    );
}

#[test]
fn jump_offsets_are_big_endian_and_skip_operands() {
    let mut heap = Heap::new();
    let mut pool = StringPool::new();
    let function = compile_source("if (true) print 1;", &mut heap, &mut pool);
    let code = &heap.get(function).chunk.code;
    assert_eq!(code[0], OpCode::True as u8);
    assert_eq!(code[1], OpCode::JumpIfFalse as u8);
    let offset = ((code[2] as usize) << 8) | code[3] as usize;
    // Landing point is measured from past the operand bytes.
    let target = 4 + offset;
    assert_eq!(code[target], OpCode::Pop as u8);
}

#[test]
fn function_declaration_emits_closure_with_upvalue_pairs() {
    let mut heap = Heap::new();
    let mut pool = StringPool::new();
    let function = compile_source(
        "fun outer() { var x = 1; fun inner() { return x; } return inner; }",
        &mut heap,
        &mut pool,
    );
    // The script chunk closes over `outer`.
    let script_chunk = &heap.get(function).chunk;
    assert!(script_chunk.code.contains(&(OpCode::Closure as u8)));

    // outer's chunk builds `inner` with exactly one captured local.
    let outer = script_chunk
        .constants
        .iter()
        .find_map(|value| match value {
            loxide::value::Value::Function(handle) => Some(*handle),
            _ => None,
        })
        .expect("outer function in constants");
    let inner = heap
        .get(outer)
        .chunk
        .constants
        .iter()
        .find_map(|value| match value {
            loxide::value::Value::Function(handle) => Some(*handle),
            _ => None,
        })
        .expect("inner function in constants");
    assert_eq!(heap.get(inner).upvalue_count, 1);

    let outer_code = &heap.get(outer).chunk.code;
    let closure_at = outer_code
        .iter()
        .position(|byte| *byte == OpCode::Closure as u8)
        .expect("OP_CLOSURE in outer");
    // opcode, constant index, then the (is_local, index) pair for x.
    assert_eq!(outer_code[closure_at + 2], 1); // is_local
    assert_eq!(outer_code[closure_at + 3], 1); // slot of x
}

// === Disassembler ===

#[test]
fn disassembler_renders_instructions_and_constants() {
    let mut heap = Heap::new();
    let mut pool = StringPool::new();
    let function = compile_source("var greeting = \"hi\"; print greeting;", &mut heap, &mut pool);
    let chunk = &heap.get(function).chunk;
    let mut out = Vec::new();
    debug::disassemble_chunk(&heap, chunk, "script", &mut out);
    let rendered = String::from_utf8(out).expect("disassembly is utf-8");
    assert!(rendered.contains("OP_CONSTANT"));
    assert!(rendered.contains("OP_DEFINE_GLOBAL"));
    assert!(rendered.contains("OP_GET_GLOBAL"));
    assert!(rendered.contains("OP_PRINT"));
    assert!(rendered.contains("OP_RETURN"));
    assert!(rendered.contains("'hi'"));
    assert!(rendered.contains("=== constants script ==="));
}

#[test]
fn disassembler_marks_repeated_lines_with_a_bar() {
    let mut heap = Heap::new();
    let mut pool = StringPool::new();
    let function = compile_source("print 1 + 2;", &mut heap, &mut pool);
    let chunk = &heap.get(function).chunk;
    let mut out = Vec::new();
    debug::disassemble_chunk(&heap, chunk, "script", &mut out);
    let rendered = String::from_utf8(out).expect("disassembly is utf-8");
    assert!(rendered.contains("   | "));
}
