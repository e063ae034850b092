// File: src/lexer.rs
//
// Scanner for Loxide source text. Produces a flat vector of line-tagged
// tokens; malformed lexemes are reported through the ErrorReporter and
// scanning continues so that all lexical errors in a file surface at once.

use crate::errors::{ErrorReporter, Stage};
use ahash::AHashMap;
use once_cell::sync::Lazy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    // Single-character tokens.
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    Comma,
    Dot,
    Minus,
    Plus,
    Semicolon,
    Slash,
    Star,

    // One or two character tokens.
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,

    // Literals.
    Identifier,
    Str,
    Number,

    // Keywords.
    And,
    Class,
    Else,
    False,
    Fun,
    For,
    If,
    Nil,
    Or,
    Print,
    Return,
    Super,
    This,
    True,
    Var,
    While,

    Eof,
}

/// One lexeme with its source line. String tokens keep their surrounding
/// quotes in `lexeme`; the compiler strips them.
#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    pub line: usize,
}

static KEYWORDS: Lazy<AHashMap<&'static str, TokenKind>> = Lazy::new(|| {
    let mut map = AHashMap::new();
    map.insert("and", TokenKind::And);
    map.insert("class", TokenKind::Class);
    map.insert("else", TokenKind::Else);
    map.insert("false", TokenKind::False);
    map.insert("fun", TokenKind::Fun);
    map.insert("for", TokenKind::For);
    map.insert("if", TokenKind::If);
    map.insert("nil", TokenKind::Nil);
    map.insert("or", TokenKind::Or);
    map.insert("print", TokenKind::Print);
    map.insert("return", TokenKind::Return);
    map.insert("super", TokenKind::Super);
    map.insert("this", TokenKind::This);
    map.insert("true", TokenKind::True);
    map.insert("var", TokenKind::Var);
    map.insert("while", TokenKind::While);
    map
});

pub struct Scanner<'r> {
    chars: Vec<char>,
    tokens: Vec<Token>,
    start: usize,
    current: usize,
    line: usize,
    reporter: &'r mut ErrorReporter,
}

impl<'r> Scanner<'r> {
    pub fn new(source: &str, reporter: &'r mut ErrorReporter) -> Self {
        Self {
            chars: source.chars().collect(),
            tokens: Vec::new(),
            start: 0,
            current: 0,
            line: 1,
            reporter,
        }
    }

    /// Scans the whole source, always ending the stream with an Eof token.
    pub fn tokenize(mut self) -> Vec<Token> {
        while self.can_read_more() {
            self.start = self.current;
            self.scan_token();
        }
        self.tokens.push(Token {
            kind: TokenKind::Eof,
            lexeme: String::new(),
            line: self.line,
        });
        self.tokens
    }

    fn scan_token(&mut self) {
        let c = self.advance();
        match c {
            '(' => self.add_token(TokenKind::LeftParen),
            ')' => self.add_token(TokenKind::RightParen),
            '{' => self.add_token(TokenKind::LeftBrace),
            '}' => self.add_token(TokenKind::RightBrace),
            ',' => self.add_token(TokenKind::Comma),
            '.' => self.add_token(TokenKind::Dot),
            '-' => self.add_token(TokenKind::Minus),
            '+' => self.add_token(TokenKind::Plus),
            ';' => self.add_token(TokenKind::Semicolon),
            '*' => self.add_token(TokenKind::Star),
            '!' => {
                let kind = if self.match_next('=') { TokenKind::BangEqual } else { TokenKind::Bang };
                self.add_token(kind);
            }
            '=' => {
                let kind = if self.match_next('=') { TokenKind::EqualEqual } else { TokenKind::Equal };
                self.add_token(kind);
            }
            '<' => {
                let kind = if self.match_next('=') { TokenKind::LessEqual } else { TokenKind::Less };
                self.add_token(kind);
            }
            '>' => {
                let kind =
                    if self.match_next('=') { TokenKind::GreaterEqual } else { TokenKind::Greater };
                self.add_token(kind);
            }
            '/' => {
                if self.match_next('/') {
                    // Line comment runs to end of line.
                    while self.peek() != '\n' && self.can_read_more() {
                        self.advance();
                    }
                } else {
                    self.add_token(TokenKind::Slash);
                }
            }
            ' ' | '\r' | '\t' => {}
            '\n' => self.line += 1,
            '"' => self.consume_string(),
            _ => {
                if c.is_ascii_digit() {
                    self.consume_number();
                } else if is_alpha(c) {
                    self.consume_identifier();
                } else {
                    self.reporter.report(
                        Stage::Scanning,
                        self.line,
                        format!("Unexpected character: '{}'.", c),
                    );
                }
            }
        }
    }

    fn consume_string(&mut self) {
        while self.peek() != '"' && self.can_read_more() {
            if self.peek() == '\n' {
                self.line += 1;
            }
            self.advance();
        }
        if !self.can_read_more() {
            self.reporter
                .report(Stage::Scanning, self.line, "Unterminated string.".to_string());
            return;
        }
        self.advance(); // closing quote
        self.add_token(TokenKind::Str);
    }

    fn consume_number(&mut self) {
        while self.peek().is_ascii_digit() {
            self.advance();
        }
        if self.peek() == '.' && self.peek_next().is_ascii_digit() {
            self.advance(); // the '.'
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }
        self.add_token(TokenKind::Number);
    }

    fn consume_identifier(&mut self) {
        while is_alphanumeric(self.peek()) {
            self.advance();
        }
        let lexeme: String = self.chars[self.start..self.current].iter().collect();
        let kind = KEYWORDS.get(lexeme.as_str()).copied().unwrap_or(TokenKind::Identifier);
        self.add_token(kind);
    }

    fn add_token(&mut self, kind: TokenKind) {
        let lexeme: String = self.chars[self.start..self.current].iter().collect();
        self.tokens.push(Token { kind, lexeme, line: self.line });
    }

    fn advance(&mut self) -> char {
        let c = self.chars[self.current];
        self.current += 1;
        c
    }

    fn match_next(&mut self, expected: char) -> bool {
        if self.can_read_more() && self.chars[self.current] == expected {
            self.current += 1;
            true
        } else {
            false
        }
    }

    fn peek(&self) -> char {
        if self.can_read_more() {
            self.chars[self.current]
        } else {
            '\0'
        }
    }

    fn peek_next(&self) -> char {
        if self.current + 1 < self.chars.len() {
            self.chars[self.current + 1]
        } else {
            '\0'
        }
    }

    fn can_read_more(&self) -> bool {
        self.current < self.chars.len()
    }
}

fn is_alpha(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_alphanumeric(c: char) -> bool {
    is_alpha(c) || c.is_ascii_digit()
}
