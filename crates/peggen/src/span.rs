use std::fmt::Display;

use serde::Serialize;

/// A byte range into the grammar source.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize)]
pub struct Span {
    start: u32,
    end: u32,
}

impl Span {
    pub fn new(start: u32, end: u32) -> Span {
        Self { start, end }
    }
    pub fn at(pos: u32) -> Span {
        Self {
            start: pos,
            end: pos,
        }
    }
    pub fn empty() -> Span {
        Self { start: 0, end: 0 }
    }
    pub fn to(self, other: Span) -> Span {
        Span {
            start: self.start,
            end: other.end,
        }
    }
    pub fn is_empty(self) -> bool {
        self.start >= self.end
    }
    #[track_caller]
    pub fn as_str(self, src: &str) -> &str {
        &src[self.start as usize..self.end as usize]
    }
    pub fn start(self) -> u32 {
        self.start
    }
    pub fn end(self) -> u32 {
        self.end
    }
}

impl Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// A resolved source position, the shape diagnostics are reported in.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub struct Location {
    pub offset: u32,
    /// 1-based.
    pub line: u32,
    /// 1-based, in code points.
    pub column: u32,
}

/// Offset-to-line/column resolution over one source text. Line starts are
/// collected once; lookups binary-search them.
pub struct LineMap {
    line_starts: Vec<u32>,
}

impl LineMap {
    pub fn new(src: &str) -> LineMap {
        let mut line_starts = vec![0];
        for (i, b) in src.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i as u32 + 1);
            }
        }
        LineMap { line_starts }
    }

    pub fn location(&self, src: &str, offset: u32) -> Location {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let start = self.line_starts[line] as usize;
        let column = src[start..offset as usize].chars().count() as u32 + 1;
        Location {
            offset,
            line: line as u32 + 1,
            column,
        }
    }
}

#[test]
fn test_linemap_lookup() {
    let src = "ab\ncde\n\nf";
    let map = LineMap::new(src);
    assert_eq!(map.location(src, 0), Location { offset: 0, line: 1, column: 1 });
    assert_eq!(map.location(src, 2), Location { offset: 2, line: 1, column: 3 });
    assert_eq!(map.location(src, 3), Location { offset: 3, line: 2, column: 1 });
    assert_eq!(map.location(src, 5), Location { offset: 5, line: 2, column: 3 });
    assert_eq!(map.location(src, 7), Location { offset: 7, line: 3, column: 1 });
    assert_eq!(map.location(src, 8), Location { offset: 8, line: 4, column: 1 });
}

#[test]
fn test_linemap_counts_codepoint_columns() {
    let src = "é=x";
    let map = LineMap::new(src);
    assert_eq!(map.location(src, 2).column, 2);
}
