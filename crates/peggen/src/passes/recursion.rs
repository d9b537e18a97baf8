//! Left-recursion detection. The VM enters a rule again at the same cursor
//! position if the rule can reach itself without consuming input, so these
//! cycles are compile errors rather than runtime stack overflows.

use std::collections::{HashMap, HashSet};

use cranelift_entity::EntitySet;

use crate::ast::{Expr, ExprKind, Grammar, RuleHandle};
use crate::error::{Code, ErrorAccumulator};
use crate::span::Span;

pub fn run(grammar: &Grammar, err: &ErrorAccumulator) {
    let mut consumes = Consumes {
        grammar,
        memo: HashMap::new(),
        visiting: HashSet::new(),
    };

    let mut prefix_rules = Vec::new();
    for (handle, rule) in grammar.rules.iter() {
        let mut refs = HashMap::new();
        collect_prefix_refs(&rule.expr, &mut refs, &mut consumes);
        prefix_rules.push((handle, refs));
    }
    let prefix_rules: HashMap<_, _> = prefix_rules.into_iter().collect();

    let mut visited = EntitySet::new();
    let mut stack = Vec::new();
    for (handle, _) in grammar.rules.iter() {
        find_prefix_cycles(
            handle,
            grammar.rules.get(handle).unwrap().name.span,
            &prefix_rules,
            &mut visited,
            &mut stack,
            grammar,
            err,
        );
        debug_assert!(stack.is_empty());
    }

    for (_, rule) in grammar.rules.iter() {
        check_repetition_progress(&rule.expr, &mut consumes, err);
    }
}

/// A repetition whose body can succeed without consuming would loop
/// forever at match time; the same non-termination family as left
/// recursion, caught the same way.
fn check_repetition_progress(expr: &Expr, consumes: &mut Consumes<'_>, err: &ErrorAccumulator) {
    if let ExprKind::ZeroOrMore { .. } | ExprKind::OneOrMore { .. } = expr.kind {
        if !consumes.expr(&expr.children[0]) {
            err.report(
                Code::LeftRecursion,
                expr.span,
                "Repetition body can match without consuming input",
            );
        }
    }
    for child in &expr.children {
        check_repetition_progress(child, consumes, err);
    }
}

struct Consumes<'a> {
    grammar: &'a Grammar,
    memo: HashMap<RuleHandle, bool>,
    visiting: HashSet<RuleHandle>,
}

impl Consumes<'_> {
    /// Whether a successful match of the rule always advances the cursor.
    fn rule(&mut self, handle: RuleHandle) -> bool {
        if let Some(&known) = self.memo.get(&handle) {
            return known;
        }
        // a cycle reached while answering is reported elsewhere; be
        // conservative here
        if !self.visiting.insert(handle) {
            return false;
        }
        let expr = &self.grammar.rules.get(handle).unwrap().expr;
        let result = self.expr(expr);
        self.visiting.remove(&handle);
        self.memo.insert(handle, result);
        result
    }

    fn expr(&mut self, expr: &Expr) -> bool {
        match &expr.kind {
            ExprKind::Literal { value, .. } => !value.is_empty(),
            ExprKind::Class { .. } | ExprKind::Any => true,
            ExprKind::End
            | ExprKind::Optional
            | ExprKind::ZeroOrMore { .. }
            | ExprKind::SimpleAnd
            | ExprKind::SimpleNot
            | ExprKind::SemanticAnd { .. }
            | ExprKind::SemanticNot { .. } => false,
            ExprKind::RuleRef { resolved, .. } => match resolved {
                Some(handle) => self.rule(*handle),
                None => false,
            },
            ExprKind::Sequence => expr.children.iter().any(|c| self.expr(c)),
            ExprKind::Choice => expr.children.iter().all(|c| self.expr(c)),
            ExprKind::OneOrMore { .. }
            | ExprKind::Text
            | ExprKind::Labeled { .. }
            | ExprKind::Action { .. }
            | ExprKind::Scope { .. }
            | ExprKind::Named { .. } => self.expr(&expr.children[0]),
        }
    }
}

/// Rules reachable from `expr` before any input is consumed.
fn collect_prefix_refs(
    expr: &Expr,
    refs: &mut HashMap<RuleHandle, Span>,
    consumes: &mut Consumes<'_>,
) {
    match &expr.kind {
        ExprKind::RuleRef { resolved, .. } => {
            if let Some(handle) = resolved {
                refs.entry(*handle).or_insert(expr.span);
            }
        }
        ExprKind::Sequence => {
            for child in &expr.children {
                collect_prefix_refs(child, refs, consumes);
                if consumes.expr(child) {
                    break;
                }
            }
        }
        ExprKind::Choice => {
            for child in &expr.children {
                collect_prefix_refs(child, refs, consumes);
            }
        }
        ExprKind::ZeroOrMore { .. } | ExprKind::OneOrMore { .. } => {
            // the separator only runs after an item has matched
            collect_prefix_refs(&expr.children[0], refs, consumes);
        }
        _ => {
            for child in &expr.children {
                collect_prefix_refs(child, refs, consumes);
            }
        }
    }
}

fn find_prefix_cycles(
    handle: RuleHandle,
    span: Span,
    prefix_rules: &HashMap<RuleHandle, HashMap<RuleHandle, Span>>,
    visited: &mut EntitySet<RuleHandle>,
    stack: &mut Vec<(RuleHandle, Span)>,
    grammar: &Grammar,
    err: &ErrorAccumulator,
) {
    if stack.iter().any(|(rule, _)| *rule == handle) {
        let name = &grammar.rules.get(handle).unwrap().name;
        err.report(
            Code::LeftRecursion,
            span,
            format!("Rule is left-recursive through \"{}\"", name),
        );
        return;
    }

    if visited.insert(handle) {
        return;
    }

    stack.push((handle, span));
    for (&child, &span) in &prefix_rules[&handle] {
        find_prefix_cycles(child, span, prefix_rules, visited, stack, grammar, err);
    }
    stack.pop();
}

#[cfg(test)]
use crate::frontend;
#[cfg(test)]
use crate::passes::check;

#[cfg(test)]
fn run_on(src: &str) -> ErrorAccumulator {
    let err = ErrorAccumulator::new();
    let mut grammar = frontend::parse(src, &err);
    check::run(&mut grammar, &err);
    assert!(err.is_empty(), "setup diagnostics: {:?}", err.get());
    run(&grammar, &err);
    err
}

#[test]
fn test_direct_left_recursion() {
    let err = run_on("a = a \"x\" / \"y\"");
    assert!(err.get().iter().any(|d| d.code == Code::LeftRecursion));
}

#[test]
fn test_indirect_left_recursion_through_nullable() {
    let err = run_on("a = b a\nb = \"x\"?");
    assert!(err.get().iter().any(|d| d.code == Code::LeftRecursion));
}

#[test]
fn test_consuming_prefix_is_fine() {
    let err = run_on("a = b a / \"y\"\nb = \"x\"");
    assert!(err.is_empty(), "{:?}", err.get());
}

#[test]
fn test_nullable_repetition_body() {
    let err = run_on("a = (\"x\"?)*");
    assert!(err.get().iter().any(|d| d.code == Code::LeftRecursion));
}
