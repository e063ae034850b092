// File: src/errors.rs
//
// Error reporting for the Loxide pipeline. Each stage (scanner, compiler,
// VM) pushes structured errors into a shared ErrorReporter; the driver
// surfaces them in bulk at stage boundaries and the REPL clears the
// reporter between entries.

use colored::Colorize;
use std::fmt;

/// Pipeline stage a diagnostic originated from. Used as the bracketed tag
/// in rendered messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Scanning,
    Parsing,
    Resolving,
    Runtime,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Stage::Scanning => write!(f, "[Scanning error]"),
            Stage::Parsing => write!(f, "[Parsing error]"),
            Stage::Resolving => write!(f, "[Resolving error]"),
            Stage::Runtime => write!(f, "[Runtime error]"),
        }
    }
}

/// A single diagnostic with the line it was reported at.
#[derive(Debug, Clone, PartialEq)]
pub struct LoxError {
    pub stage: Stage,
    pub line: usize,
    pub message: String,
}

impl LoxError {
    pub fn new(stage: Stage, line: usize, message: String) -> Self {
        Self { stage, line, message }
    }
}

impl fmt::Display for LoxError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let tag = format!("{}", self.stage);
        write!(
            f,
            "{} {} {}",
            tag.red().bold(),
            format!("[line {}]", self.line).bright_blue(),
            self.message
        )
    }
}

impl std::error::Error for LoxError {}

/// Accumulates errors across one stage of the pipeline.
///
/// The driver checks `has_error` after scanning, after compiling and after
/// interpreting, prints everything accumulated so far and aborts the rest
/// of the pipeline. A REPL session calls `clear` before each entry.
#[derive(Debug, Default)]
pub struct ErrorReporter {
    errors: Vec<LoxError>,
}

impl ErrorReporter {
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    pub fn report(&mut self, stage: Stage, line: usize, message: String) {
        self.errors.push(LoxError::new(stage, line, message));
    }

    pub fn has_error(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors(&self) -> &[LoxError] {
        &self.errors
    }

    pub fn clear(&mut self) {
        self.errors.clear();
    }

    /// All accumulated diagnostics, one per line, ready for printing.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for err in &self.errors {
            out.push_str(&format!("{}\n", err));
        }
        out
    }

    /// Like `render` but without color codes, for tests and log files.
    pub fn render_plain(&self) -> String {
        let mut out = String::new();
        for err in &self.errors {
            out.push_str(&format!(
                "{} [line {}] {}\n",
                err.stage, err.line, err.message
            ));
        }
        out
    }
}
