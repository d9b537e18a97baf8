//! Character-level scanning for the metalanguage: trivia, identifiers,
//! string/class escapes and balanced code blocks. The grammar productions
//! in the parent module drive this cursor directly.

use crate::ast::{CodeBlock, Ident};
use crate::error::{Code, ErrorAccumulator};
use crate::span::Span;

pub struct Cursor<'a> {
    src: &'a str,
    pos: usize,
    err: &'a ErrorAccumulator,
}

impl<'a> Cursor<'a> {
    pub fn new(src: &'a str, err: &'a ErrorAccumulator) -> Cursor<'a> {
        Cursor { src, pos: 0, err }
    }

    pub fn pos(&self) -> u32 {
        self.pos as u32
    }

    pub fn src(&self) -> &'a str {
        self.src
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    pub fn span_from(&self, start: u32) -> Span {
        Span::new(start, self.pos())
    }

    pub fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    pub fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    pub fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    pub fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    pub fn eat_str(&mut self, s: &str) -> bool {
        if self.rest().starts_with(s) {
            self.pos += s.len();
            true
        } else {
            false
        }
    }

    pub fn set_pos(&mut self, pos: u32) {
        self.pos = pos as usize;
    }

    pub fn error(&self, span: Span, message: impl ToString) {
        self.err.report(Code::Syntax, span, message);
    }

    pub fn report(&self, code: Code, span: Span, message: impl ToString) {
        self.err.report(code, span, message);
    }

    pub fn error_here(&self, message: impl ToString) {
        self.error(Span::at(self.pos()), message);
    }

    /// Skip whitespace and both comment forms.
    pub fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') if self.rest().starts_with("//") => {
                    while let Some(c) = self.bump() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                Some('/') if self.rest().starts_with("/*") => {
                    let start = self.pos();
                    self.pos += 2;
                    loop {
                        if self.at_end() {
                            self.error(self.span_from(start), "Unterminated block comment");
                            break;
                        }
                        if self.eat_str("*/") {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => break,
            }
        }
    }

    pub fn ident(&mut self) -> Option<Ident> {
        let start = self.pos();
        match self.peek() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => return None,
        }
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                self.bump();
            } else {
                break;
            }
        }
        let span = self.span_from(start);
        Some(Ident {
            value: span.as_str(self.src).to_string(),
            span,
        })
    }

    /// A quoted literal; the opening quote has been peeked, not consumed.
    pub fn string_literal(&mut self) -> Option<(String, Span)> {
        let start = self.pos();
        let quote = self.bump()?;
        let mut out = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => {
                    self.error(self.span_from(start), "Unterminated string literal");
                    return None;
                }
                Some('\\') => {
                    if let Some(c) = self.escape() {
                        out.push(c);
                    }
                }
                Some(c) if c == quote => break,
                Some(c) => out.push(c),
            }
        }
        Some((out, self.span_from(start)))
    }

    /// One escape sequence, after the backslash.
    pub fn escape(&mut self) -> Option<char> {
        let start = self.pos().saturating_sub(1);
        let c = match self.bump() {
            Some(c) => c,
            None => {
                self.error_here("Expected escape sequence");
                return None;
            }
        };
        let escaped = match c {
            'n' => '\n',
            'r' => '\r',
            't' => '\t',
            '0' => '\0',
            '\\' | '"' | '\'' | ']' | '[' | '-' | '^' | '.' => c,
            'x' => return self.hex_escape(start, 2),
            'u' => {
                if !self.eat('{') {
                    self.error(self.span_from(start), "Expected '{' after \\u");
                    return None;
                }
                let mut value = 0u32;
                let mut digits = 0;
                while let Some(d) = self.peek().and_then(|c| c.to_digit(16)) {
                    value = value * 16 + d;
                    digits += 1;
                    self.bump();
                }
                if !self.eat('}') || digits == 0 {
                    self.error(self.span_from(start), "Malformed \\u{...} escape");
                    return None;
                }
                return match char::from_u32(value) {
                    Some(c) => Some(c),
                    None => {
                        self.error(self.span_from(start), "Escape is not a valid code point");
                        None
                    }
                };
            }
            other => {
                self.error(
                    self.span_from(start),
                    format!("Unknown character escape '{}'", other.escape_default()),
                );
                return None;
            }
        };
        Some(escaped)
    }

    fn hex_escape(&mut self, start: u32, digits: u32) -> Option<char> {
        let mut value = 0u32;
        for _ in 0..digits {
            match self.peek().and_then(|c| c.to_digit(16)) {
                Some(d) => {
                    value = value * 16 + d;
                    self.bump();
                }
                None => {
                    self.error(self.span_from(start), "Malformed \\xHH escape");
                    return None;
                }
            }
        }
        char::from_u32(value)
    }

    /// A balanced `{ … }` block, quote- and comment-aware so braces inside
    /// host code do not end it early. Returns the inner text verbatim.
    pub fn code_block(&mut self) -> Option<CodeBlock> {
        let start = self.pos();
        if !self.eat('{') {
            return None;
        }
        let inner_start = self.pos;
        let mut depth = 1usize;
        loop {
            let c = match self.bump() {
                Some(c) => c,
                None => {
                    self.error(self.span_from(start), "Unterminated code block");
                    return None;
                }
            };
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                '"' | '\'' | '`' => self.skip_host_string(c),
                '/' if self.rest().starts_with('/') => {
                    while let Some(c) = self.bump() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                '/' if self.rest().starts_with('*') => {
                    self.bump();
                    while !self.at_end() && !self.eat_str("*/") {
                        self.bump();
                    }
                }
                _ => {}
            }
        }
        let span = self.span_from(start);
        Some(CodeBlock {
            code: self.src[inner_start..self.pos - 1].to_string(),
            span,
        })
    }

    fn skip_host_string(&mut self, quote: char) {
        while let Some(c) = self.bump() {
            match c {
                '\\' => {
                    self.bump();
                }
                c if c == quote => break,
                '\n' if quote != '`' => break,
                _ => {}
            }
        }
    }
}

#[cfg(test)]
fn cursor_fixture(src: &'static str) -> (&'static str, ErrorAccumulator) {
    (src, ErrorAccumulator::new())
}

#[test]
fn test_string_escapes() {
    let (src, err) = cursor_fixture(r#""a\n\x41\u{1F600}b""#);
    let mut c = Cursor::new(src, &err);
    let (value, _) = c.string_literal().unwrap();
    assert_eq!(value, "a\nA\u{1F600}b");
    assert!(err.is_empty());
}

#[test]
fn test_code_block_balances_braces_and_strings() {
    let (src, err) = cursor_fixture(r#"{ if (x) { return "}"; } else { return 1; } }rest"#);
    let mut c = Cursor::new(src, &err);
    let block = c.code_block().unwrap();
    assert_eq!(block.code, r#" if (x) { return "}"; } else { return 1; } "#);
    assert_eq!(c.rest(), "rest");
    assert!(err.is_empty());
}

#[test]
fn test_trivia_skips_comments() {
    let (src, err) = cursor_fixture("  // line\n /* block */ x");
    let mut c = Cursor::new(src, &err);
    c.skip_trivia();
    assert_eq!(c.peek(), Some('x'));
    assert!(err.is_empty());
}
