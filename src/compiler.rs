// File: src/compiler.rs
//
// Single-pass bytecode compiler for Loxide. Parsing and code generation
// happen together: a Pratt parser walks the token stream and emits
// instructions directly into the chunk of the function being built, with
// no syntax tree in between. Lexical scope is tracked in a stack of
// per-function states; nested function declarations push a state, compile
// their body, and hand the finished function back to the parent, which
// wires up upvalue capture.

use crate::chunk::{Chunk, OpCode};
use crate::debug;
use crate::errors::{ErrorReporter, Stage};
use crate::heap::{Gc, Heap};
use crate::lexer::{Token, TokenKind};
use crate::object::Function;
use crate::runner::DebugOptions;
use crate::strings::StringPool;
use crate::value::Value;

/// Expression precedence, lowest to highest. Parsing at level P consumes
/// every infix operator whose precedence is at least P.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // ()
    Primary,
}

impl Precedence {
    /// The next-higher level; used to make binary operators
    /// left-associative when parsing their right operand.
    fn one_higher(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn = for<'c, 't> fn(&'c mut Compiler<'t>, bool);

/// One row of the Pratt table: how a token parses in prefix position, how
/// it parses in infix position, and its infix precedence.
#[derive(Clone, Copy)]
struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

const fn rule_entry(
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
) -> ParseRule {
    ParseRule { prefix, infix, precedence }
}

/// Indexed by TokenKind discriminant; order must agree with the TokenKind
/// declaration. The parse functions live as free functions so they coerce
/// to plain higher-ranked fn pointers.
static RULES: [ParseRule; 39] = [
    /* LeftParen    */ rule_entry(Some(grouping), Some(call), Precedence::Call),
    /* RightParen   */ rule_entry(None, None, Precedence::None),
    /* LeftBrace    */ rule_entry(None, None, Precedence::None),
    /* RightBrace   */ rule_entry(None, None, Precedence::None),
    /* Comma        */ rule_entry(None, None, Precedence::None),
    /* Dot          */ rule_entry(None, None, Precedence::None),
    /* Minus        */ rule_entry(Some(unary), Some(binary), Precedence::Term),
    /* Plus         */ rule_entry(None, Some(binary), Precedence::Term),
    /* Semicolon    */ rule_entry(None, None, Precedence::None),
    /* Slash        */ rule_entry(None, Some(binary), Precedence::Factor),
    /* Star         */ rule_entry(None, Some(binary), Precedence::Factor),
    /* Bang         */ rule_entry(Some(unary), None, Precedence::None),
    /* BangEqual    */ rule_entry(None, Some(binary), Precedence::Equality),
    /* Equal        */ rule_entry(None, None, Precedence::None),
    /* EqualEqual   */ rule_entry(None, Some(binary), Precedence::Equality),
    /* Greater      */ rule_entry(None, Some(binary), Precedence::Comparison),
    /* GreaterEqual */ rule_entry(None, Some(binary), Precedence::Comparison),
    /* Less         */ rule_entry(None, Some(binary), Precedence::Comparison),
    /* LessEqual    */ rule_entry(None, Some(binary), Precedence::Comparison),
    /* Identifier   */ rule_entry(Some(variable), None, Precedence::None),
    /* Str          */ rule_entry(Some(string), None, Precedence::None),
    /* Number       */ rule_entry(Some(number), None, Precedence::None),
    /* And          */ rule_entry(None, Some(and_), Precedence::And),
    /* Class        */ rule_entry(None, None, Precedence::None),
    /* Else         */ rule_entry(None, None, Precedence::None),
    /* False        */ rule_entry(Some(literal), None, Precedence::None),
    /* Fun          */ rule_entry(None, None, Precedence::None),
    /* For          */ rule_entry(None, None, Precedence::None),
    /* If           */ rule_entry(None, None, Precedence::None),
    /* Nil          */ rule_entry(Some(literal), None, Precedence::None),
    /* Or           */ rule_entry(None, Some(or_), Precedence::Or),
    /* Print        */ rule_entry(None, None, Precedence::None),
    /* Return       */ rule_entry(None, None, Precedence::None),
    /* Super        */ rule_entry(None, None, Precedence::None),
    /* This         */ rule_entry(None, None, Precedence::None),
    /* True         */ rule_entry(Some(literal), None, Precedence::None),
    /* Var          */ rule_entry(None, None, Precedence::None),
    /* While        */ rule_entry(None, None, Precedence::None),
    /* Eof          */ rule_entry(None, None, Precedence::None),
];

fn rule(kind: TokenKind) -> ParseRule {
    RULES[kind as usize]
}

// === Pratt parse functions ===
//
// Prefix functions compile an expression that starts with their token;
// the token is already consumed when they run. Infix functions compile an
// expression whose left operand is on the stack and whose operator token
// is already consumed.

fn number(compiler: &mut Compiler, _can_assign: bool) {
    let value: f64 = compiler.tokens[compiler.previous].lexeme.parse().unwrap_or(0.0);
    compiler.emit_constant(Value::Number(value));
}

fn string(compiler: &mut Compiler, _can_assign: bool) {
    let lexeme = &compiler.tokens[compiler.previous].lexeme;
    let text = lexeme[1..lexeme.len() - 1].to_string(); // strip quotes
    let handle = compiler.intern(&text);
    compiler.emit_constant(Value::Str(handle));
}

fn grouping(compiler: &mut Compiler, _can_assign: bool) {
    compiler.expression();
    compiler.consume(TokenKind::RightParen, "Expecting right paren ) after expression.");
}

fn unary(compiler: &mut Compiler, _can_assign: bool) {
    let operator = compiler.tokens[compiler.previous].kind;
    compiler.parse_precedence(Precedence::Unary);
    match operator {
        TokenKind::Bang => compiler.emit_opcode(OpCode::Not),
        TokenKind::Minus => compiler.emit_opcode(OpCode::Negate),
        _ => unreachable!("unary dispatched on non-unary token"),
    }
}

fn binary(compiler: &mut Compiler, _can_assign: bool) {
    let operator = compiler.tokens[compiler.previous].kind;
    // Left associativity: the right operand only includes operators that
    // bind tighter than this one.
    compiler.parse_precedence(rule(operator).precedence.one_higher());
    match operator {
        TokenKind::BangEqual => compiler.emit_opcodes(OpCode::Equal, OpCode::Not),
        TokenKind::EqualEqual => compiler.emit_opcode(OpCode::Equal),
        TokenKind::Greater => compiler.emit_opcode(OpCode::Greater),
        TokenKind::GreaterEqual => compiler.emit_opcodes(OpCode::Less, OpCode::Not),
        TokenKind::Less => compiler.emit_opcode(OpCode::Less),
        TokenKind::LessEqual => compiler.emit_opcodes(OpCode::Greater, OpCode::Not),
        TokenKind::Plus => compiler.emit_opcode(OpCode::Add),
        TokenKind::Minus => compiler.emit_opcode(OpCode::Subtract),
        TokenKind::Star => compiler.emit_opcode(OpCode::Multiply),
        TokenKind::Slash => compiler.emit_opcode(OpCode::Divide),
        _ => unreachable!("binary dispatched on non-binary token"),
    }
}

fn and_(compiler: &mut Compiler, _can_assign: bool) {
    // LHS is on the stack. Falsey: skip the RHS, the LHS is the result
    // (OP_JUMP_IF_FALSE does not pop). Truthy: pop it and let the RHS
    // become the result.
    let jump_over_rhs = compiler.emit_jump(OpCode::JumpIfFalse);
    compiler.emit_opcode(OpCode::Pop);
    compiler.parse_precedence(Precedence::And);
    compiler.patch_jump(jump_over_rhs);
}

fn or_(compiler: &mut Compiler, _can_assign: bool) {
    // Falsey LHS falls through to the RHS; truthy LHS jumps over it and
    // remains the result.
    let jump_to_rhs = compiler.emit_jump(OpCode::JumpIfFalse);
    let jump_over_rhs = compiler.emit_jump(OpCode::Jump);
    compiler.patch_jump(jump_to_rhs);
    compiler.emit_opcode(OpCode::Pop);
    compiler.parse_precedence(Precedence::Or);
    compiler.patch_jump(jump_over_rhs);
}

fn literal(compiler: &mut Compiler, _can_assign: bool) {
    match compiler.tokens[compiler.previous].kind {
        TokenKind::False => compiler.emit_opcode(OpCode::False),
        TokenKind::True => compiler.emit_opcode(OpCode::True),
        TokenKind::Nil => compiler.emit_opcode(OpCode::Nil),
        _ => unreachable!("literal dispatched on non-literal token"),
    }
}

fn call(compiler: &mut Compiler, _can_assign: bool) {
    let mut arg_count: u16 = 0;
    if !compiler.check(TokenKind::RightParen) {
        loop {
            if arg_count >= u8::MAX as u16 {
                compiler.error_at_current("Cannot have more than 255 arguments.");
                return;
            }
            arg_count += 1;
            compiler.expression();
            if !compiler.match_token(TokenKind::Comma) {
                break;
            }
        }
    }
    compiler.consume(TokenKind::RightParen, "Expected ')' at the end of function call.");
    compiler.emit_opcode(OpCode::Call);
    compiler.emit_byte(arg_count as u8);
}

fn variable(compiler: &mut Compiler, can_assign: bool) {
    let name = compiler.tokens[compiler.previous].lexeme.clone();
    compiler.named_variable(&name, can_assign);
}

/// A local variable slot. `ready` stays false while the initializer is
/// compiling, which is what rejects `var a = a;`.
struct Local {
    name: String,
    depth: i32,
    ready: bool,
    is_captured: bool,
}

/// Compile-time record of a captured variable. When `is_local` the index
/// is a stack slot of the enclosing function; otherwise it is an index
/// into the enclosing function's own upvalue table.
#[derive(Clone, Copy, PartialEq, Eq)]
struct CompileUpvalue {
    index: u8,
    is_local: bool,
}

/// Per-function compilation state. The innermost function under
/// compilation is the top of the Compiler's state stack; upvalue
/// resolution walks down the stack instead of through parent pointers.
struct FunctionState {
    function: Gc<Function>,
    locals: Vec<Local>,
    upvalues: Vec<CompileUpvalue>,
    scope_depth: i32,
}

impl FunctionState {
    fn new(function: Gc<Function>) -> Self {
        // Slot 0 of every call frame belongs to the callable itself, so
        // the locals stack starts with an unnamed placeholder to keep
        // compile-time slot indices aligned with the runtime stack.
        let reserved = Local {
            name: String::new(),
            depth: 0,
            ready: false,
            is_captured: false,
        };
        Self {
            function,
            locals: vec![reserved],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

pub struct Compiler<'a> {
    tokens: &'a [Token],
    heap: &'a mut Heap,
    pool: &'a mut StringPool,
    reporter: &'a mut ErrorReporter,
    options: &'a DebugOptions,
    states: Vec<FunctionState>,
    current: usize,
    previous: usize,
    had_error: bool,
    panic_mode: bool,
}

/// Compiles a token stream into the top-level function. Returns `None` if
/// any error was reported; the reporter then holds the diagnostics.
pub fn compile(
    tokens: &[Token],
    heap: &mut Heap,
    pool: &mut StringPool,
    reporter: &mut ErrorReporter,
    options: &DebugOptions,
) -> Option<Gc<Function>> {
    let mut compiler = Compiler {
        tokens,
        heap,
        pool,
        reporter,
        options,
        states: Vec::new(),
        current: 0,
        previous: 0,
        had_error: false,
        panic_mode: false,
    };
    compiler.push_state("script");
    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration();
    }
    let state = compiler.end_function();
    if compiler.had_error {
        None
    } else {
        Some(state.function)
    }
}

impl<'a> Compiler<'a> {
    // === Declarations and statements ===

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Class) {
            self.error_at(self.previous, "Classes are not supported.");
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        let global_index = self.parse_variable("Expected variable name after 'var'.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_opcode(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expected ; after variable declaration.");
        self.define_variable(global_index);
    }

    fn fun_declaration(&mut self) {
        let global_index = self.parse_variable("Expected function name after 'fun'.");
        if self.scope_depth() > 0 {
            // A function may refer to its own name recursively, and the
            // declaration is fully compiled before the body can run, so the
            // local is usable right away.
            let depth = self.scope_depth();
            let local = self.state_mut().locals.last_mut().expect("local for function name");
            local.depth = depth;
            local.ready = true;
        }
        self.function_body();
        self.define_variable(global_index);
    }

    /// Compiles a parameter list and block body into a fresh function, then
    /// emits the OP_CLOSURE that builds it at runtime, followed by one
    /// (is_local, index) operand pair per captured upvalue.
    fn function_body(&mut self) {
        let name = self.tokens[self.previous].lexeme.clone();
        self.push_state(&name);
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expected '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.heap.get(self.state().function).arity == u8::MAX {
                    self.error_at_current("Functions accept at most 255 parameters.");
                    return;
                }
                let function = self.state().function;
                self.heap.get_mut(function).arity += 1;
                let param_index = self.parse_variable("Expected variable name.");
                self.define_variable(param_index);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expected ')' after function parameter list.");
        self.consume(TokenKind::LeftBrace, "Expected '{' as function body definition.");
        self.block();
        // No end_scope here: popping the scope would emit OP_POP for the
        // function's locals, including the slot holding the return value.
        // The VM unwinds the whole frame window on OP_RETURN instead.

        let state = self.end_function();
        self.emit_closure(state.function);
        for upvalue in &state.upvalues {
            self.emit_byte(if upvalue.is_local { 1 } else { 0 });
            self.emit_byte(upvalue.index);
        }
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else {
            self.expression_statement();
        }
    }

    fn expression_statement(&mut self) {
        // Expressions leave one value on the stack; statements are stack
        // neutral, so the value is discarded.
        self.expression();
        self.consume(TokenKind::Semicolon, "Expression statements must end with ';'");
        self.emit_opcode(OpCode::Pop);
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expecting ; after print statement.");
        self.emit_opcode(OpCode::Print);
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expecting } after block.");
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expected '(' after if");
        self.expression();
        self.consume(TokenKind::RightParen, "Expected ')' after condition");
        let jump_over_then = self.emit_jump(OpCode::JumpIfFalse);
        // The condition value stays on the stack across the jump; each
        // branch pops it on its own side.
        self.emit_opcode(OpCode::Pop);
        self.statement();
        let jump_over_else = self.emit_jump(OpCode::Jump);
        self.patch_jump(jump_over_then);
        self.emit_opcode(OpCode::Pop);
        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(jump_over_else);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().code.len();
        self.consume(TokenKind::LeftParen, "Expected '(' after while");
        self.expression();
        self.consume(TokenKind::RightParen, "Expected ')' after condition");
        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_opcode(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_opcode(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        // A loop variable declared in the initializer belongs to the loop.
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expected '(' after for");
        if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else if self.match_token(TokenKind::Semicolon) {
            // No initializer.
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().code.len();
        let mut exit_jump = None;
        if !self.check(TokenKind::Semicolon) {
            self.expression();
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_opcode(OpCode::Pop);
        }
        self.consume(TokenKind::Semicolon, "for loop condition must be followed by ';'");

        if !self.check(TokenKind::RightParen) {
            // The increment clause textually precedes the body but runs
            // after it: jump over it now, run it after the body, then loop
            // back to the condition.
            let jump_over_increment = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().code.len();
            self.expression();
            self.emit_opcode(OpCode::Pop);
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(jump_over_increment);
        }
        self.consume(TokenKind::RightParen, "for loop clauses must be followed by ')");
        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_opcode(OpCode::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.states.len() == 1 {
            self.error_at(self.previous, "Cannot return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expected ';' after return value.");
            self.emit_opcode(OpCode::Return);
        }
    }

    // === Expressions ===

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    /// Core of the Pratt parser. Parses the prefix expression starting at
    /// the current token, then folds in every infix operator of at least
    /// the requested precedence.
    fn parse_precedence(&mut self, precedence: Precedence) {
        let prefix_fn = match rule(self.tokens[self.current].kind).prefix {
            Some(prefix_fn) => prefix_fn,
            None => {
                self.error_at_current("Expected expression.");
                return;
            }
        };
        self.advance();
        // Only the lowest precedence levels may treat a trailing '=' as
        // assignment; in "a * b = c" the 'b' must not consume the '='.
        let can_assign = precedence <= Precedence::Assignment;
        prefix_fn(self, can_assign);

        while precedence <= rule(self.tokens[self.current].kind).precedence {
            self.advance();
            let infix_fn = rule(self.tokens[self.previous].kind)
                .infix
                .expect("rule table lists a precedence without an infix fn");
            infix_fn(self, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            // Nothing consumed the '=': whatever preceded it is not a
            // valid assignment target.
            self.error_at(self.previous, "Invalid assignment target.");
        }
    }

    /// Resolves an identifier to a local slot, an upvalue, or a global by
    /// name, and emits the matching get or set instruction.
    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let innermost = self.states.len() - 1;
        let (get_op, set_op, index) = if let Some(slot) = self.resolve_local(innermost, name) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(slot) = self.resolve_upvalue(innermost, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, slot)
        } else {
            let index = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, index)
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_opcode(set_op);
        } else {
            self.emit_opcode(get_op);
        }
        self.emit_byte(index);
    }

    // === Variable resolution ===

    fn parse_variable(&mut self, err_msg: &str) -> u8 {
        self.consume(TokenKind::Identifier, err_msg);
        self.declare_variable();
        if self.scope_depth() == 0 {
            // Globals are resolved by name at runtime; store the name in
            // the constants table and refer to it by index.
            let name = self.tokens[self.previous].lexeme.clone();
            self.identifier_constant(&name)
        } else {
            // Locals are addressed by stack slot; no constant needed.
            0
        }
    }

    fn declare_variable(&mut self) {
        if self.scope_depth() == 0 {
            // Globals are late bound and may be redeclared (handy in the
            // REPL); the compiler tracks nothing for them here.
            return;
        }
        let name = self.tokens[self.previous].lexeme.clone();
        let depth = self.scope_depth();
        let mut duplicate = false;
        for local in self.state().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            // Redefinition in the same scope is an error; shadowing in an
            // inner scope is fine.
            self.error_at(self.previous, "Variable with this name already in scope.");
        }
        if self.state().locals.len() > u8::MAX as usize {
            // Local-addressing instructions carry one-byte slot operands.
            self.error_at(self.previous, "Too many local variables.");
            return;
        }
        self.state_mut().locals.push(Local {
            name,
            depth: -1, // declared, not ready until the initializer is done
            ready: false,
            is_captured: false,
        });
    }

    fn define_variable(&mut self, global_name_index: u8) {
        if self.scope_depth() > 0 {
            // The initializer's value is already in the local's stack
            // slot; the variable just becomes readable.
            let depth = self.scope_depth();
            let local = self.state_mut().locals.last_mut().expect("declared local");
            local.depth = depth;
            local.ready = true;
        } else {
            self.emit_opcode(OpCode::DefineGlobal);
            self.emit_byte(global_name_index);
        }
    }

    fn resolve_local(&mut self, state_index: usize, name: &str) -> Option<u8> {
        let mut not_ready = false;
        let mut found = None;
        for (slot, local) in self.states[state_index].locals.iter().enumerate().rev() {
            if local.name == name {
                not_ready = !local.ready;
                found = Some(slot as u8);
                break;
            }
        }
        if not_ready {
            self.error_with_stage(
                self.previous,
                "Can't read local variable in its own initializer.",
                Stage::Resolving,
            );
        }
        found
    }

    /// Looks for `name` in enclosing function states. A hit in a direct
    /// parent marks that local captured and records a local upvalue; a hit
    /// further out chains through the parent's own upvalue table.
    fn resolve_upvalue(&mut self, state_index: usize, name: &str) -> Option<u8> {
        if state_index == 0 {
            return None;
        }
        if let Some(local_slot) = self.resolve_local(state_index - 1, name) {
            self.states[state_index - 1].locals[local_slot as usize].is_captured = true;
            return Some(self.add_upvalue(state_index, local_slot, true));
        }
        if let Some(upvalue_slot) = self.resolve_upvalue(state_index - 1, name) {
            return Some(self.add_upvalue(state_index, upvalue_slot, false));
        }
        None
    }

    fn add_upvalue(&mut self, state_index: usize, index: u8, is_local: bool) -> u8 {
        let upvalue = CompileUpvalue { index, is_local };
        // The same variable may be referenced several times; reuse the
        // existing slot.
        if let Some(existing) =
            self.states[state_index].upvalues.iter().position(|u| *u == upvalue)
        {
            return existing as u8;
        }
        self.states[state_index].upvalues.push(upvalue);
        let slot = self.states[state_index].upvalues.len() - 1;
        if slot > u8::MAX as usize {
            self.error_at(self.previous, "Too many closure variables in function.");
        }
        let function = self.states[state_index].function;
        self.heap.get_mut(function).upvalue_count += 1;
        slot as u8
    }

    // === Scopes ===

    fn begin_scope(&mut self) {
        self.state_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.state_mut().scope_depth -= 1;
        let depth = self.scope_depth();
        let mut dropped = 0;
        let mut closing = Vec::new();
        for local in self.state().locals.iter().rev() {
            if local.depth <= depth {
                break;
            }
            closing.push(local.is_captured);
            dropped += 1;
        }
        for is_captured in closing {
            // A captured local must survive its stack slot: the VM lifts
            // it into the shared upvalue cell instead of discarding it.
            if is_captured {
                self.emit_opcode(OpCode::CloseUpvalue);
            } else {
                self.emit_opcode(OpCode::Pop);
            }
        }
        let state = self.state_mut();
        let new_len = state.locals.len() - dropped;
        state.locals.truncate(new_len);
    }

    fn scope_depth(&self) -> i32 {
        self.state().scope_depth
    }

    // === Function state stack ===

    fn push_state(&mut self, name: &str) {
        self.maybe_collect();
        let name = self.pool.insert_or_get(self.heap, name);
        let function = self.heap.alloc(Function::new(name));
        self.states.push(FunctionState::new(function));
    }

    /// Seals the innermost function with an implicit `return nil` and pops
    /// its state.
    fn end_function(&mut self) -> FunctionState {
        self.emit_return();
        let state = self.states.pop().expect("function state stack empty");
        if self.options.print_code && !self.had_error {
            let function = self.heap.get(state.function);
            let name = self.heap.get(function.name).clone();
            debug::disassemble_chunk(self.heap, &function.chunk, &name, &mut std::io::stderr());
        }
        state
    }

    fn state(&self) -> &FunctionState {
        self.states.last().expect("function state stack empty")
    }

    fn state_mut(&mut self) -> &mut FunctionState {
        self.states.last_mut().expect("function state stack empty")
    }

    // === Emission ===

    fn current_chunk(&mut self) -> &mut Chunk {
        let function = self.state().function;
        &mut self.heap.get_mut(function).chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.tokens[self.previous].line;
        self.current_chunk().write_byte(byte, line);
    }

    fn emit_opcode(&mut self, opcode: OpCode) {
        self.emit_byte(opcode as u8);
    }

    fn emit_opcodes(&mut self, first: OpCode, second: OpCode) {
        self.emit_opcode(first);
        self.emit_opcode(second);
    }

    fn emit_constant(&mut self, value: Value) {
        self.emit_opcode(OpCode::Constant);
        let index = self.make_constant(value);
        self.emit_byte(index);
    }

    fn emit_closure(&mut self, function: Gc<Function>) {
        self.emit_opcode(OpCode::Closure);
        let index = self.make_constant(Value::Function(function));
        self.emit_byte(index);
    }

    fn emit_return(&mut self) {
        self.emit_opcodes(OpCode::Nil, OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let index = self.current_chunk().add_constant(value);
        if index > u8::MAX as usize {
            self.error_at(
                self.previous,
                "Too many constants in code chunk. OP_CONSTANT uses a single byte operand.",
            );
            return 0;
        }
        index as u8
    }

    /// Emits a jump with a two-byte placeholder offset and returns the
    /// instruction's address for backpatching.
    fn emit_jump(&mut self, opcode: OpCode) -> usize {
        self.emit_opcode(opcode);
        self.emit_byte(0);
        self.emit_byte(0);
        self.current_chunk().code.len() - 3
    }

    /// Points a previously emitted jump at the current end of code. The VM
    /// reads the operand bytes before applying the offset, so the distance
    /// is measured from past the operand.
    fn patch_jump(&mut self, jump_index: usize) {
        let jump_dist = self.current_chunk().code.len() - 3 - jump_index;
        if jump_dist > u16::MAX as usize {
            self.error_at_current("Too much code to jump over.");
        }
        let code = &mut self.current_chunk().code;
        code[jump_index + 1] = ((jump_dist >> 8) & 0xff) as u8;
        code[jump_index + 2] = (jump_dist & 0xff) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_opcode(OpCode::Loop);
        // +2 accounts for this instruction's own operand bytes, which the
        // VM consumes before jumping back.
        let jump_dist = self.current_chunk().code.len() + 2 - loop_start;
        if jump_dist > u16::MAX as usize {
            self.error_at(self.previous, "Loop body too large, too much code to jump over.");
        }
        self.emit_byte(((jump_dist >> 8) & 0xff) as u8);
        self.emit_byte((jump_dist & 0xff) as u8);
    }

    // === Heap cooperation ===

    /// Interns a string, collecting first if the heap policy asks for it.
    /// Everything the compiler has produced so far is reachable from the
    /// function state stack, which is exactly what the root pass marks.
    fn intern(&mut self, text: &str) -> Gc<String> {
        self.maybe_collect();
        self.pool.insert_or_get(self.heap, text)
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let handle = self.intern(name);
        self.make_constant(Value::Str(handle))
    }

    fn maybe_collect(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        let states = &self.states;
        self.heap.collect(self.pool, |marker| {
            for state in states {
                marker.mark(state.function);
            }
        });
    }

    // === Token plumbing ===

    fn advance(&mut self) {
        self.previous = self.current;
        if self.current < self.tokens.len() - 1 {
            self.current += 1;
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.tokens[self.current].kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, err_msg: &str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_at_current(err_msg);
        }
    }

    /// Skips tokens until a statement boundary so that one syntax error
    /// does not cascade into a flood of follow-on errors.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.tokens[self.current].kind != TokenKind::Eof {
            if self.tokens[self.previous].kind == TokenKind::Semicolon {
                return;
            }
            match self.tokens[self.current].kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // === Error reporting ===

    fn error_at_current(&mut self, err_msg: &str) {
        self.error_at(self.current, err_msg);
    }

    fn error_at(&mut self, token_index: usize, err_msg: &str) {
        self.error_with_stage(token_index, err_msg, Stage::Parsing);
    }

    fn error_with_stage(&mut self, token_index: usize, err_msg: &str, stage: Stage) {
        if self.panic_mode {
            // The parser is lost in the grammar; suppress follow-on errors
            // until it resynchronizes.
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let token = &self.tokens[token_index];
        let message = if token.kind == TokenKind::Eof {
            format!("at end: {}", err_msg)
        } else {
            format!(
                "bad syntax while parsing: got {:?} with lexeme '{}'. {}",
                token.kind, token.lexeme, err_msg
            )
        };
        self.reporter.report(stage, token.line, message);
    }
}
