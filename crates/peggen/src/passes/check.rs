//! Reference checking: duplicate rule names, then resolution of every
//! `RuleRef` to its handle in the rule table. Both keep collecting over the
//! whole grammar so a single run reports every offender.

use std::collections::{hash_map::Entry, HashMap};

use crate::ast::{ExprKind, Grammar, RuleHandle};
use crate::error::{Code, ErrorAccumulator};

pub fn run(grammar: &mut Grammar, err: &ErrorAccumulator) {
    let names = rule_table(grammar, err);
    resolve_references(grammar, &names, err);
}

/// Name table of the grammar; reports `E-DUPLICATE-RULE` for every rule
/// shadowing an earlier one. The first definition wins, matching the order
/// the emitted rule table uses.
pub fn rule_table(grammar: &Grammar, err: &ErrorAccumulator) -> HashMap<String, RuleHandle> {
    let mut names = HashMap::new();
    for (handle, rule) in grammar.rules.iter() {
        match names.entry(rule.name.value.clone()) {
            Entry::Occupied(_) => err.report(
                Code::DuplicateRule,
                rule.name.span,
                format!("Rule \"{}\" is defined more than once", rule.name),
            ),
            Entry::Vacant(v) => {
                v.insert(handle);
            }
        }
    }
    names
}

fn resolve_references(
    grammar: &mut Grammar,
    names: &HashMap<String, RuleHandle>,
    err: &ErrorAccumulator,
) {
    for (_, rule) in grammar.rules.iter_mut() {
        rule.expr.visit_mut(|expr| {
            if let ExprKind::RuleRef { name, resolved } = &mut expr.kind {
                match names.get(&name.value) {
                    Some(&handle) => *resolved = Some(handle),
                    None => err.report(
                        Code::UndefinedRule,
                        name.span,
                        format!("Reference to undefined rule \"{}\"", name),
                    ),
                }
            }
        });
    }
}

#[cfg(test)]
use crate::frontend;

#[test]
fn test_undefined_references_all_reported() {
    let err = ErrorAccumulator::new();
    let mut grammar = frontend::parse("start = foo bar foo", &err);
    assert!(err.is_empty());
    run(&mut grammar, &err);
    let undefined = err
        .get()
        .iter()
        .filter(|d| d.code == Code::UndefinedRule)
        .count();
    assert_eq!(undefined, 3);
}

#[test]
fn test_duplicate_rules_reported() {
    let err = ErrorAccumulator::new();
    let mut grammar = frontend::parse("a = \"x\"\na = \"y\"\na = \"z\"", &err);
    run(&mut grammar, &err);
    let duplicates = err
        .get()
        .iter()
        .filter(|d| d.code == Code::DuplicateRule)
        .count();
    assert_eq!(duplicates, 2);
}

#[test]
fn test_references_resolve_to_handles() {
    let err = ErrorAccumulator::new();
    let mut grammar = frontend::parse("start = item+\nitem = \"i\"", &err);
    run(&mut grammar, &err);
    assert!(err.is_empty());
    let start = grammar.rules.values().next().unwrap();
    let item_handle = grammar.rule_by_name("item").unwrap();
    let mut seen = None;
    start.expr.visit(|e| {
        if let ExprKind::RuleRef { resolved, .. } = &e.kind {
            seen = *resolved;
        }
    });
    assert_eq!(seen, Some(item_handle));
}
