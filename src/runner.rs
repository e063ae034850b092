// File: src/runner.rs
//
// Driver glue: wires scanner → compiler → VM over one garbage-collected
// heap and string pool. A Runner lives for a whole session (one file run,
// or many REPL entries), so the heap and pool outlive each compiler and
// VM instance it creates.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use crate::compiler;
use crate::errors::ErrorReporter;
use crate::heap::Heap;
use crate::lexer::Scanner;
use crate::strings::StringPool;
use crate::vm::{InterpretResult, Vm};

/// Runtime debug switches, off by default. These replace compile-time
/// trace defines so one binary serves both uses.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugOptions {
    /// Print a stack snapshot and the current instruction on every
    /// dispatch iteration.
    pub trace_execution: bool,
    /// Disassemble each chunk after it compiles.
    pub print_code: bool,
    /// Log heap allocations and collections.
    pub log_gc: bool,
    /// Force a collection on nearly every allocation.
    pub stress_gc: bool,
}

pub struct Runner<W: Write> {
    heap: Heap,
    pool: StringPool,
    reporter: ErrorReporter,
    options: DebugOptions,
    output: W,
}

impl<W: Write> Runner<W> {
    pub fn new(output: W, options: DebugOptions) -> Self {
        let mut heap = Heap::new();
        heap.set_stress(options.stress_gc);
        heap.set_log(options.log_gc);
        Self {
            heap,
            pool: StringPool::new(),
            reporter: ErrorReporter::new(),
            options,
            output,
        }
    }

    pub fn run_file(&mut self, path: &Path) -> io::Result<bool> {
        let source = fs::read_to_string(path)?;
        Ok(self.run(&source))
    }

    /// Runs one source text through the whole pipeline. Errors accumulated
    /// at any stage are printed to the output stream and abort the stages
    /// after them. Returns whether the program ran to completion.
    pub fn run(&mut self, source: &str) -> bool {
        self.reporter.clear();

        let tokens = Scanner::new(source, &mut self.reporter).tokenize();
        if self.reporter.has_error() {
            let _ = write!(self.output, "{}", self.reporter.render());
            return false;
        }

        let function = match compiler::compile(
            &tokens,
            &mut self.heap,
            &mut self.pool,
            &mut self.reporter,
            &self.options,
        ) {
            Some(function) => function,
            None => {
                let _ = write!(self.output, "{}", self.reporter.render());
                return false;
            }
        };

        let result = Vm::new(
            &mut self.heap,
            &mut self.pool,
            &mut self.reporter,
            &self.options,
            &mut self.output,
        )
        .interpret(function);
        if self.reporter.has_error() {
            let _ = write!(self.output, "{}", self.reporter.render());
        }
        result == InterpretResult::Ok
    }

    pub fn reporter(&self) -> &ErrorReporter {
        &self.reporter
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn output(&self) -> &W {
        &self.output
    }

    pub fn into_output(self) -> W {
        self.output
    }
}
