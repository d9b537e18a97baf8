/// What the parser was prepared to accept at a failure position.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Expectation {
    Literal(String),
    Class(String),
    Any,
    End,
    Other(String),
}

impl Expectation {
    pub fn description(&self) -> String {
        match self {
            Expectation::Literal(text) => format!("{:?}", text),
            Expectation::Class(text) => text.clone(),
            Expectation::Any => "any character".to_string(),
            Expectation::End => "end of input".to_string(),
            Expectation::Other(desc) => desc.clone(),
        }
    }

    /// Tag mirrored by the emitted parser's expectation objects.
    pub fn kind(&self) -> &'static str {
        match self {
            Expectation::Literal(_) => "literal",
            Expectation::Class(_) => "class",
            Expectation::Any => "any",
            Expectation::End => "end",
            Expectation::Other(_) => "other",
        }
    }
}

/// A position in the parsed input.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Position {
    pub offset: usize,
    /// 1-based.
    pub line: usize,
    /// 1-based, in code points.
    pub column: usize,
}

impl Position {
    pub fn from_offset(input: &str, offset: usize) -> Position {
        let mut line = 1;
        let mut column = 1;
        for c in input[..offset].chars() {
            if c == '\n' {
                line += 1;
                column = 1;
            } else {
                column += 1;
            }
        }
        Position {
            offset,
            line,
            column,
        }
    }
}

/// Parse failure, shaped exactly like the `PegSyntaxError` thrown by
/// emitted parsers: farthest failure offset, the character found there and
/// the merged expectations.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{message}")]
pub struct ParseError {
    pub message: String,
    pub start: Position,
    pub end: Position,
    pub found: Option<char>,
    pub expected: Vec<Expectation>,
}

impl ParseError {
    /// Build from the VM's farthest-failure record. Expectations are
    /// deduplicated preserving first occurrence.
    pub fn from_failure(
        input: &str,
        offset: usize,
        expected: Vec<Expectation>,
    ) -> ParseError {
        let mut merged: Vec<Expectation> = Vec::new();
        for e in expected {
            if !merged.contains(&e) {
                merged.push(e);
            }
        }
        let found = input[offset..].chars().next();
        let start = Position::from_offset(input, offset);
        let end = match found {
            Some(c) => Position {
                offset: offset + c.len_utf8(),
                line: if c == '\n' { start.line + 1 } else { start.line },
                column: if c == '\n' { 1 } else { start.column + 1 },
            },
            None => start,
        };
        ParseError {
            message: build_message(&merged, found),
            start,
            end,
            found,
            expected: merged,
        }
    }

    /// A synthetic error raised from user code via `error(msg)`.
    pub fn user(input: &str, offset: usize, message: impl Into<String>) -> ParseError {
        let start = Position::from_offset(input, offset);
        ParseError {
            message: message.into(),
            start,
            end: start,
            found: input[offset..].chars().next(),
            expected: Vec::new(),
        }
    }

    /// Mirrors the `name` property of the emitted JavaScript error.
    pub fn name(&self) -> &'static str {
        "PegSyntaxError"
    }
}

fn build_message(expected: &[Expectation], found: Option<char>) -> String {
    let found = match found {
        Some(c) => format!("{:?}", c.to_string()),
        None => "end of input".to_string(),
    };
    let mut msg = String::from("Expected ");
    match expected.len() {
        0 => msg.push_str("nothing"),
        1 => msg.push_str(&expected[0].description()),
        n => {
            for (i, e) in expected[..n - 1].iter().enumerate() {
                if i > 0 {
                    msg.push_str(", ");
                }
                msg.push_str(&e.description());
            }
            msg.push_str(" or ");
            msg.push_str(&expected[n - 1].description());
        }
    }
    msg.push_str(" but ");
    msg.push_str(&found);
    msg.push_str(" found.");
    msg
}

#[test]
fn test_message_single() {
    let err = ParseError::from_failure("x", 0, vec![Expectation::Literal("a".into())]);
    assert_eq!(err.message, "Expected \"a\" but \"x\" found.");
    assert_eq!(err.name(), "PegSyntaxError");
}

#[test]
fn test_message_merges_duplicates() {
    let err = ParseError::from_failure(
        "",
        0,
        vec![
            Expectation::Literal("b".into()),
            Expectation::Class("[a-z]".into()),
            Expectation::Literal("b".into()),
        ],
    );
    assert_eq!(err.expected.len(), 2);
    assert_eq!(
        err.message,
        "Expected \"b\" or [a-z] but end of input found."
    );
}

#[test]
fn test_position_tracks_lines() {
    let pos = Position::from_offset("ab\ncd", 4);
    assert_eq!((pos.line, pos.column), (2, 2));
}
