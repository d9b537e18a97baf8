//! Bootstrap parser for the PEG metalanguage: hand-written recursive
//! descent over [`lexer::Cursor`], producing the grammar AST.

pub mod lexer;

use crate::ast::{Annotation, AnnotationValue, Expr, ExprKind, Grammar, NodeId, Rule};
use crate::error::{Code, ErrorAccumulator};
use crate::span::Span;

use lexer::Cursor;

pub fn parse(src: &str, err: &ErrorAccumulator) -> Grammar {
    let mut p = GrammarParser {
        c: Cursor::new(src, err),
        grammar: Grammar::new(),
    };
    p.file();
    p.grammar
}

struct GrammarParser<'a> {
    c: Cursor<'a>,
    grammar: Grammar,
}

impl<'a> GrammarParser<'a> {
    fn node(&mut self) -> NodeId {
        self.grammar.alloc_node()
    }

    fn file(&mut self) {
        self.c.skip_trivia();
        if self.c.peek() == Some('{') {
            self.grammar.initializer = self.c.code_block();
            self.c.skip_trivia();
        }
        loop {
            let mut annotations = self.annotations();
            self.take_parameters(&mut annotations);
            self.c.skip_trivia();
            if self.c.at_end() {
                if let Some(a) = annotations.first() {
                    self.c.error(a.span(), "Annotation is not attached to a rule");
                }
                break;
            }
            if !self.rule(annotations) {
                break;
            }
        }
    }

    /// `@parameters(a, b)` before the first rule declares the identifiers
    /// the grammar responds to in `@if`.
    fn take_parameters(&mut self, annotations: &mut Vec<Annotation>) {
        annotations.retain(|a| match a {
            Annotation::Generic { name, parameters, span }
                if name.value == "parameters" =>
            {
                if !self.grammar.rules.is_empty() {
                    self.c
                        .error(*span, "@parameters must precede the first rule");
                }
                for (key, _) in parameters {
                    self.grammar.parameters.push(key.clone());
                }
                false
            }
            _ => true,
        });
    }

    fn annotations(&mut self) -> Vec<Annotation> {
        let mut out = Vec::new();
        loop {
            self.c.skip_trivia();
            let start = self.c.pos();
            if !self.c.eat('@') {
                break;
            }
            let Some(name) = self.c.ident() else {
                self.c.error_here("Expected annotation name after '@'");
                break;
            };
            let mut entries = Vec::new();
            self.c.skip_trivia();
            if self.c.eat('(') {
                loop {
                    self.c.skip_trivia();
                    if self.c.eat(')') {
                        break;
                    }
                    let Some(key) = self.c.ident() else {
                        self.c.error_here("Expected annotation parameter");
                        break;
                    };
                    self.c.skip_trivia();
                    let value = if self.c.eat(':') {
                        self.c.skip_trivia();
                        self.annotation_value()
                    } else {
                        None
                    };
                    entries.push((key, value));
                    self.c.skip_trivia();
                    if !self.c.eat(',') && self.c.peek() != Some(')') {
                        self.c.error_here("Expected ',' or ')' in annotation");
                        break;
                    }
                }
            }
            let span = self.c.span_from(start);
            if name.value == "if" {
                let conditions = entries.into_iter().map(|(key, _)| key).collect();
                out.push(Annotation::If { conditions, span });
            } else {
                let parameters = entries
                    .into_iter()
                    .map(|(key, value)| (key, value.unwrap_or(AnnotationValue::Bool(true))))
                    .collect();
                out.push(Annotation::Generic {
                    name,
                    parameters,
                    span,
                });
            }
        }
        out
    }

    fn annotation_value(&mut self) -> Option<AnnotationValue> {
        match self.c.peek()? {
            '"' | '\'' => {
                let (value, _) = self.c.string_literal()?;
                Some(AnnotationValue::Str(value))
            }
            '[' => {
                self.c.bump();
                let mut items = Vec::new();
                loop {
                    self.c.skip_trivia();
                    if self.c.eat(']') {
                        break;
                    }
                    items.push(self.annotation_value()?);
                    self.c.skip_trivia();
                    self.c.eat(',');
                }
                Some(AnnotationValue::Array(items))
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = self.c.pos();
                self.c.eat('-');
                while matches!(self.c.peek(), Some(c) if c.is_ascii_digit() || c == '.') {
                    self.c.bump();
                }
                let span = self.c.span_from(start);
                match span.as_str(self.c.src()).parse::<f64>() {
                    Ok(n) => Some(AnnotationValue::Number(n)),
                    Err(_) => {
                        self.c.error(span, "Malformed number");
                        None
                    }
                }
            }
            _ => {
                let ident = self.c.ident()?;
                Some(match ident.value.as_str() {
                    "true" => AnnotationValue::Bool(true),
                    "false" => AnnotationValue::Bool(false),
                    _ => AnnotationValue::Raw(ident.value),
                })
            }
        }
    }

    fn rule(&mut self, annotations: Vec<Annotation>) -> bool {
        let start = self.c.pos();
        let Some(name) = self.c.ident() else {
            self.c.error_here("Expected rule name");
            return false;
        };
        self.c.skip_trivia();
        let display_name = match self.c.peek() {
            Some('"') | Some('\'') => self.c.string_literal().map(|(s, _)| s),
            _ => None,
        };
        self.c.skip_trivia();
        if !self.c.eat('=') {
            self.c.error_here(format!("Expected '=' after rule name {}", name));
            return false;
        }
        let expr = self.choice();
        self.c.skip_trivia();
        self.c.eat(';');
        let span = self.c.span_from(start);
        self.grammar.rules.push(Rule {
            name,
            display_name,
            annotations,
            expr,
            span,
        });
        true
    }

    fn choice(&mut self) -> Expr {
        let start = self.c.pos();
        let mut alternatives = vec![self.alternative()];
        loop {
            self.c.skip_trivia();
            if !self.c.eat('/') {
                break;
            }
            alternatives.push(self.alternative());
        }
        if alternatives.len() == 1 {
            return alternatives.pop().unwrap();
        }
        let id = self.node();
        Expr::new(id, ExprKind::Choice, self.c.span_from(start), alternatives)
    }

    fn alternative(&mut self) -> Expr {
        let annotations = self.annotations();
        self.c.skip_trivia();
        let start = self.c.pos();
        let mut elements = Vec::new();
        while let Some(e) = self.prefixed() {
            elements.push(e);
            self.c.skip_trivia();
        }
        let action = match self.c.peek() {
            Some('{') => self.c.code_block(),
            _ => None,
        };
        let span = self.c.span_from(start);
        let mut expr = match elements.len() {
            0 => {
                self.c.error(span, "Expected expression");
                let id = self.node();
                Expr::new(id, ExprKind::Sequence, span, Vec::new())
            }
            1 => elements.pop().unwrap(),
            _ => {
                let id = self.node();
                Expr::new(id, ExprKind::Sequence, span, elements)
            }
        };
        if let Some(code) = action {
            let id = self.node();
            expr = Expr::new(id, ExprKind::Action { code }, span, vec![expr]);
        }
        expr.annotations = annotations;
        expr
    }

    fn prefixed(&mut self) -> Option<Expr> {
        self.c.skip_trivia();
        let start = self.c.pos();
        match self.c.peek()? {
            '/' | ')' | ';' | '{' | '}' => None,
            ':' if self.c.rest().starts_with("::") => {
                self.c.eat_str("::");
                let child = self.require_prefixed("Expected expression after '::'")?;
                let id = self.node();
                Some(Expr::new(
                    id,
                    ExprKind::Labeled {
                        label: None,
                        pick: true,
                    },
                    self.c.span_from(start),
                    vec![child],
                ))
            }
            '&' => {
                self.c.bump();
                self.c.skip_trivia();
                if self.c.peek() == Some('{') {
                    let code = self.c.code_block()?;
                    let id = self.node();
                    return Some(Expr::leaf(
                        id,
                        ExprKind::SemanticAnd { code },
                        self.c.span_from(start),
                    ));
                }
                let child = self.require_suffixed("Expected expression after '&'")?;
                let id = self.node();
                Some(Expr::new(
                    id,
                    ExprKind::SimpleAnd,
                    self.c.span_from(start),
                    vec![child],
                ))
            }
            '!' => {
                self.c.bump();
                self.c.skip_trivia();
                if self.c.peek() == Some('{') {
                    let code = self.c.code_block()?;
                    let id = self.node();
                    return Some(Expr::leaf(
                        id,
                        ExprKind::SemanticNot { code },
                        self.c.span_from(start),
                    ));
                }
                let child = self.require_suffixed("Expected expression after '!'")?;
                let id = self.node();
                Some(Expr::new(
                    id,
                    ExprKind::SimpleNot,
                    self.c.span_from(start),
                    vec![child],
                ))
            }
            '$' => {
                self.c.bump();
                let child = self.require_suffixed("Expected expression after '$'")?;
                let id = self.node();
                Some(Expr::new(
                    id,
                    ExprKind::Text,
                    self.c.span_from(start),
                    vec![child],
                ))
            }
            '#' => {
                self.c.bump();
                self.c.skip_trivia();
                if !self.c.eat('(') {
                    self.c.error_here("Expected '(' after '#'");
                    return None;
                }
                let mut names = Vec::new();
                loop {
                    self.c.skip_trivia();
                    if self.c.eat(')') {
                        break;
                    }
                    match self.c.ident() {
                        Some(name) => names.push(name),
                        None => {
                            self.c.error_here("Expected binding name");
                            return None;
                        }
                    }
                    self.c.skip_trivia();
                    self.c.eat(',');
                }
                if names.is_empty() {
                    self.c
                        .error(self.c.span_from(start), "Scope binds no names");
                }
                self.c.skip_trivia();
                let code = match self.c.code_block() {
                    Some(code) => code,
                    None => {
                        self.c.error_here("Expected code block after scope bindings");
                        return None;
                    }
                };
                let child = self.require_prefixed("Expected scoped expression")?;
                let id = self.node();
                Some(Expr::new(
                    id,
                    ExprKind::Scope { names, code },
                    self.c.span_from(start),
                    vec![child],
                ))
            }
            '@' => {
                // either an inline annotation, or the annotations of the
                // next rule definition; rewind in the latter case
                let mut annotations = self.annotations();
                match self.prefixed() {
                    Some(mut expr) => {
                        annotations.append(&mut expr.annotations);
                        expr.annotations = annotations;
                        Some(expr)
                    }
                    None => {
                        self.c.set_pos(start);
                        None
                    }
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                // a label if ':' follows, otherwise an ordinary reference
                let ident_start = self.c.pos();
                let ident = self.c.ident().unwrap();
                self.c.skip_trivia();
                if self.c.peek() == Some(':') && !self.c.rest().starts_with("::") {
                    self.c.bump();
                    let child = self.require_prefixed("Expected labeled expression")?;
                    let id = self.node();
                    return Some(Expr::new(
                        id,
                        ExprKind::Labeled {
                            label: Some(ident),
                            pick: false,
                        },
                        self.c.span_from(start),
                        vec![child],
                    ));
                }
                self.c.set_pos(ident_start);
                self.suffixed()
            }
            _ => self.suffixed(),
        }
    }

    /// After an identifier: does `["display"] =` follow, meaning the
    /// identifier starts the next rule definition?
    fn at_rule_boundary(&mut self, ident_start: u32) -> bool {
        let saved = self.c.pos();
        self.c.skip_trivia();
        if matches!(self.c.peek(), Some('"') | Some('\'')) {
            // tentative display name; errors here belong to a real parse
            if self.c.string_literal().is_none() {
                self.c.set_pos(saved);
                return false;
            }
            self.c.skip_trivia();
        }
        let boundary = self.c.peek() == Some('=');
        if boundary {
            self.c.set_pos(ident_start);
        } else {
            self.c.set_pos(saved);
        }
        boundary
    }

    fn require_prefixed(&mut self, msg: &str) -> Option<Expr> {
        match self.prefixed() {
            Some(e) => Some(e),
            None => {
                self.c.error_here(msg);
                None
            }
        }
    }

    fn require_suffixed(&mut self, msg: &str) -> Option<Expr> {
        match self.suffixed() {
            Some(e) => Some(e),
            None => {
                self.c.error_here(msg);
                None
            }
        }
    }

    fn suffixed(&mut self) -> Option<Expr> {
        let expr = self.primary()?;
        self.suffix_loop(expr)
    }

    fn suffix_loop(&mut self, mut expr: Expr) -> Option<Expr> {
        loop {
            self.c.skip_trivia();
            let kind = match self.c.peek() {
                Some('?') => ExprKind::Optional,
                Some('*') => ExprKind::ZeroOrMore { separated: false },
                Some('+') => ExprKind::OneOrMore { separated: false },
                _ => break,
            };
            self.c.bump();
            let span = Span::new(expr.span.start(), self.c.pos());
            let id = self.node();
            expr = Expr::new(id, kind, span, vec![expr]);
        }
        Some(expr)
    }

    fn primary(&mut self) -> Option<Expr> {
        self.c.skip_trivia();
        let start = self.c.pos();
        match self.c.peek()? {
            '"' | '\'' => {
                let (value, _) = self.c.string_literal()?;
                let ignore_case = self.c.eat('i');
                let id = self.node();
                Some(Expr::leaf(
                    id,
                    ExprKind::Literal { value, ignore_case },
                    self.c.span_from(start),
                ))
            }
            '[' => self.class(),
            '.' => {
                self.c.bump();
                let id = self.node();
                Some(Expr::leaf(id, ExprKind::Any, self.c.span_from(start)))
            }
            '~' => {
                self.c.bump();
                let id = self.node();
                Some(Expr::leaf(id, ExprKind::End, self.c.span_from(start)))
            }
            '(' => {
                self.c.bump();
                let expr = self.choice();
                self.c.skip_trivia();
                if !self.c.eat(')') {
                    self.c.error_here("Expected ')'");
                }
                Some(expr)
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let ident_start = self.c.pos();
                let ident = self.c.ident().unwrap();
                let after_ident = self.c.pos();
                if self.at_rule_boundary(ident_start) {
                    return None;
                }
                let id = self.node();
                Some(Expr::leaf(
                    id,
                    ExprKind::RuleRef {
                        name: ident,
                        resolved: None,
                    },
                    Span::new(ident_start, after_ident),
                ))
            }
            _ => None,
        }
    }

    fn class(&mut self) -> Option<Expr> {
        let start = self.c.pos();
        self.c.bump();
        let inverted = self.c.eat('^');
        let mut parts = Vec::new();
        loop {
            match self.c.peek() {
                None => {
                    self.c
                        .error(self.c.span_from(start), "Unterminated character class");
                    return None;
                }
                Some(']') => {
                    self.c.bump();
                    break;
                }
                _ => {}
            }
            let Some(lo) = self.class_char() else {
                continue;
            };
            if self.c.peek() == Some('-') && !self.c.rest()[1..].starts_with(']') {
                let dash_start = self.c.pos();
                self.c.bump();
                let Some(hi) = self.class_char() else {
                    continue;
                };
                if lo > hi {
                    self.c.report(
                        Code::InvalidRange,
                        Span::new(dash_start, self.c.pos()),
                        format!("Invalid character range {:?}-{:?}", lo, hi),
                    );
                    parts.push((lo, lo));
                } else {
                    parts.push((lo, hi));
                }
            } else {
                parts.push((lo, lo));
            }
        }
        let ignore_case = self.c.eat('i');
        let id = self.node();
        Some(Expr::leaf(
            id,
            ExprKind::Class {
                parts,
                inverted,
                ignore_case,
            },
            self.c.span_from(start),
        ))
    }

    fn class_char(&mut self) -> Option<char> {
        match self.c.bump()? {
            '\\' => self.c.escape(),
            c => Some(c),
        }
    }
}

#[cfg(test)]
fn parse_ok(src: &str) -> Grammar {
    let err = ErrorAccumulator::new();
    let grammar = parse(src, &err);
    assert!(err.is_empty(), "diagnostics: {:?}", err.get());
    grammar
}

#[test]
fn test_parse_sequence_of_literals() {
    let grammar = parse_ok(r#"start = "a" "b""#);
    assert_eq!(grammar.rules.len(), 1);
    let rule = grammar.rules.values().next().unwrap();
    assert_eq!(rule.name.value, "start");
    assert_eq!(rule.expr.kind, ExprKind::Sequence);
    assert_eq!(rule.expr.children.len(), 2);
    assert_eq!(
        rule.expr.children[0].kind,
        ExprKind::Literal {
            value: "a".into(),
            ignore_case: false
        }
    );
}

#[test]
fn test_parse_rule_boundaries_without_semicolons() {
    let grammar = parse_ok("a = b c\nc = \"x\"\nb = .");
    assert_eq!(grammar.rules.len(), 3);
    let first = grammar.rules.values().next().unwrap();
    assert_eq!(first.expr.children.len(), 2);
}

#[test]
fn test_parse_labeled_action() {
    let grammar = parse_ok(r#"start = n:([0-9]+) { return parseInt(n.join(""), 10); }"#);
    let rule = grammar.rules.values().next().unwrap();
    let ExprKind::Action { ref code } = rule.expr.kind else {
        panic!("expected action, got {:?}", rule.expr.kind);
    };
    assert!(code.code.contains("parseInt"));
    let labeled = &rule.expr.children[0];
    let ExprKind::Labeled {
        label: Some(ref ident),
        pick: false,
    } = labeled.kind
    else {
        panic!("expected label, got {:?}", labeled.kind);
    };
    assert_eq!(ident.value, "n");
    assert!(matches!(
        labeled.children[0].kind,
        ExprKind::OneOrMore { separated: false }
    ));
}

#[test]
fn test_parse_choice_with_if_annotation() {
    let grammar = parse_ok("start = @if(debug) \"d\" / \"r\"");
    let rule = grammar.rules.values().next().unwrap();
    assert_eq!(rule.expr.kind, ExprKind::Choice);
    assert_eq!(rule.expr.children.len(), 2);
    let first = &rule.expr.children[0];
    assert_eq!(first.annotations.len(), 1);
    assert!(matches!(first.annotations[0], Annotation::If { .. }));
    assert!(rule.expr.children[1].annotations.is_empty());
}

#[test]
fn test_parse_prefix_operators() {
    let grammar = parse_ok(r#"start = !"x" . &{ return ok; } $foo ~"#);
    let rule = grammar.rules.values().next().unwrap();
    let kinds: Vec<_> = rule
        .expr
        .children
        .iter()
        .map(|c| std::mem::discriminant(&c.kind))
        .collect();
    assert_eq!(kinds.len(), 5);
    assert!(matches!(rule.expr.children[0].kind, ExprKind::SimpleNot));
    assert!(matches!(rule.expr.children[1].kind, ExprKind::Any));
    assert!(matches!(
        rule.expr.children[2].kind,
        ExprKind::SemanticAnd { .. }
    ));
    assert!(matches!(rule.expr.children[3].kind, ExprKind::Text));
    assert!(matches!(rule.expr.children[4].kind, ExprKind::End));
}

#[test]
fn test_parse_scope_and_picks() {
    let grammar = parse_ok(r#"start = #(depth){ return 0; } (::"a" "," :: "b")"#);
    let rule = grammar.rules.values().next().unwrap();
    let ExprKind::Scope { ref names, .. } = rule.expr.kind else {
        panic!("expected scope");
    };
    assert_eq!(names.len(), 1);
    assert_eq!(names[0].value, "depth");
    let seq = &rule.expr.children[0];
    assert_eq!(seq.kind, ExprKind::Sequence);
    assert!(matches!(
        seq.children[0].kind,
        ExprKind::Labeled { label: None, pick: true }
    ));
    assert!(matches!(
        seq.children[2].kind,
        ExprKind::Labeled { label: None, pick: true }
    ));
}

#[test]
fn test_parse_display_name_and_initializer() {
    let grammar = parse_ok("{ let tally = 0; }\n@parameters(debug)\ndigit \"a digit\" = [0-9]");
    assert!(grammar.initializer.is_some());
    assert_eq!(grammar.parameters.len(), 1);
    assert_eq!(grammar.parameters[0].value, "debug");
    let rule = grammar.rules.values().next().unwrap();
    assert_eq!(rule.display_name.as_deref(), Some("a digit"));
    let ExprKind::Class { ref parts, inverted, ignore_case } = rule.expr.kind else {
        panic!("expected class");
    };
    assert_eq!(parts, &vec![('0', '9')]);
    assert!(!inverted && !ignore_case);
}

#[test]
fn test_parse_class_reversed_range_reports() {
    let err = ErrorAccumulator::new();
    parse("start = [z-a]", &err);
    let diagnostics = err.get();
    assert!(diagnostics
        .iter()
        .any(|d| d.code == Code::InvalidRange));
}

#[test]
fn test_parse_token_annotation_on_rule() {
    let grammar = parse_ok("@token(type: \"Num\")\nnum = [0-9]+\nstart = num");
    let rule = grammar.rules.values().next().unwrap();
    assert_eq!(rule.annotations.len(), 1);
    let Annotation::Generic { ref name, ref parameters, .. } = rule.annotations[0] else {
        panic!("expected generic annotation");
    };
    assert_eq!(name.value, "token");
    assert_eq!(parameters[0].1, AnnotationValue::Str("Num".into()));
}

#[test]
fn test_parse_separator_annotation_inline() {
    let grammar = parse_ok(r#"start = @separator(expr: ",") id+ ; id = [a-z]+"#);
    let rule = grammar.rules.values().next().unwrap();
    assert!(matches!(
        rule.expr.kind,
        ExprKind::OneOrMore { separated: false }
    ));
    assert_eq!(rule.expr.annotations.len(), 1);
}
