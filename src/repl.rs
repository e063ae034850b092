// File: src/repl.rs
//
// Interactive shell. Each accepted line joins an accumulated program and
// the whole accumulation is re-run against the session's heap and string
// pool, which is how global state carries across entries. Lines that fail
// to run are rolled back so one bad entry cannot poison the session.

use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::io;

use crate::runner::{DebugOptions, Runner};

pub struct Repl {
    editor: DefaultEditor,
    runner: Runner<io::Stdout>,
    source: String,
}

impl Repl {
    pub fn new(options: DebugOptions) -> Result<Self, ReadlineError> {
        let editor = DefaultEditor::new()?;
        Ok(Self {
            editor,
            runner: Runner::new(io::stdout(), options),
            source: String::new(),
        })
    }

    pub fn run(&mut self) -> Result<(), ReadlineError> {
        loop {
            match self.editor.readline("> ") {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());
                    let before = self.source.len();
                    self.source.push('\n');
                    self.source.push_str(&line);
                    let program = self.source.clone();
                    if !self.runner.run(&program) {
                        self.source.truncate(before);
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "^C".bright_yellow());
                }
                Err(ReadlineError::Eof) => break,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}
