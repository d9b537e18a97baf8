//! Symbolic type inference. Types are plain strings propagated over the
//! tree; rule types iterate to a fixed point. References that sit on a
//! reference cycle resolve to the rule's alias name instead of its
//! expanded type, which both terminates the iteration and produces the
//! self-referential aliases the declaration output needs.

use std::collections::{HashMap, HashSet};

use crate::ast::{Expr, ExprKind, Grammar, NodeId, RuleHandle};
use crate::passes::labels::LabelInfo;

pub struct TypeInfo {
    pub rules: HashMap<RuleHandle, String>,
    pub nodes: HashMap<NodeId, String>,
}

impl TypeInfo {
    /// Manifest entries without a backing node (scope bindings) are `any`.
    pub fn node_type(&self, node: Option<NodeId>) -> &str {
        node.and_then(|id| self.nodes.get(&id))
            .map(String::as_str)
            .unwrap_or("any")
    }
}

/// The exported alias name of a rule: `expr_list` becomes `ExprList`.
pub fn alias_name(rule: &str) -> String {
    let mut out = String::new();
    for segment in rule.split('_') {
        let mut chars = segment.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            out.push_str(chars.as_str());
        }
    }
    if out.is_empty() {
        out.push('_');
    }
    out
}

pub fn run(
    grammar: &Grammar,
    overrides: &HashMap<NodeId, String>,
    labels: &LabelInfo,
) -> TypeInfo {
    let cyclic = cyclic_rules(grammar);

    let mut rules: HashMap<RuleHandle, String> = grammar
        .rules
        .iter()
        .map(|(handle, _)| (handle, "unknown".to_string()))
        .collect();

    let mut nodes = HashMap::new();
    // monotone over the finite set of alias/override strings; the cap is a
    // backstop, acyclic chains settle within one pass per reference depth
    for _ in 0..grammar.rules.len() + 2 {
        let mut changed = false;
        nodes.clear();
        for (handle, rule) in grammar.rules.iter() {
            let cx = Cx {
                grammar,
                overrides,
                labels,
                rules: &rules,
                cyclic: &cyclic,
            };
            let inferred = cx.infer(&rule.expr, &mut nodes);
            if rules.get(&handle) != Some(&inferred) {
                rules.insert(handle, inferred);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    TypeInfo { rules, nodes }
}

fn cyclic_rules(grammar: &Grammar) -> HashSet<RuleHandle> {
    let mut edges: HashMap<RuleHandle, Vec<RuleHandle>> = HashMap::new();
    for (handle, rule) in grammar.rules.iter() {
        let refs = edges.entry(handle).or_default();
        rule.expr.visit(|e| {
            if let ExprKind::RuleRef {
                resolved: Some(target),
                ..
            } = &e.kind
            {
                refs.push(*target);
            }
        });
    }

    let mut cyclic = HashSet::new();
    for (&root, _) in &edges {
        let mut seen = HashSet::new();
        let mut stack = edges[&root].clone();
        while let Some(next) = stack.pop() {
            if next == root {
                cyclic.insert(root);
                break;
            }
            if seen.insert(next) {
                stack.extend(edges.get(&next).into_iter().flatten().copied());
            }
        }
    }
    cyclic
}

struct Cx<'a> {
    grammar: &'a Grammar,
    overrides: &'a HashMap<NodeId, String>,
    labels: &'a LabelInfo,
    rules: &'a HashMap<RuleHandle, String>,
    cyclic: &'a HashSet<RuleHandle>,
}

impl Cx<'_> {
    fn infer(&self, expr: &Expr, nodes: &mut HashMap<NodeId, String>) -> String {
        // an override terminates propagation at this node
        if let Some(ty) = self.overrides.get(&expr.id) {
            nodes.insert(expr.id, ty.clone());
            return ty.clone();
        }
        let ty = match &expr.kind {
            ExprKind::Literal { .. } | ExprKind::Class { .. } | ExprKind::Any => {
                "string".to_string()
            }
            ExprKind::Text => {
                self.infer(&expr.children[0], nodes);
                "string".to_string()
            }
            ExprKind::End
            | ExprKind::SimpleAnd
            | ExprKind::SimpleNot
            | ExprKind::SemanticAnd { .. }
            | ExprKind::SemanticNot { .. } => {
                for child in &expr.children {
                    self.infer(child, nodes);
                }
                "undefined".to_string()
            }
            ExprKind::Optional => nullable(&self.infer(&expr.children[0], nodes)),
            ExprKind::ZeroOrMore { .. } | ExprKind::OneOrMore { .. } => {
                let item = self.infer(&expr.children[0], nodes);
                if let Some(separator) = expr.children.get(1) {
                    self.infer(separator, nodes);
                }
                format!("Array<{}>", item)
            }
            ExprKind::Sequence => {
                let types: Vec<String> = expr
                    .children
                    .iter()
                    .map(|child| self.infer(child, nodes))
                    .collect();
                let kept: Vec<usize> = match self.labels.picks.get(&expr.id) {
                    Some(picks) => picks.clone(),
                    None => (0..expr.children.len())
                        .filter(|&i| expr.children[i].kind.is_capturing())
                        .collect(),
                };
                match kept.len() {
                    0 => "undefined".to_string(),
                    1 => types[kept[0]].clone(),
                    _ => {
                        let picked: Vec<&str> =
                            kept.iter().map(|&i| types[i].as_str()).collect();
                        format!("[{}]", picked.join(", "))
                    }
                }
            }
            ExprKind::Choice => {
                let mut parts: Vec<String> = Vec::new();
                for child in &expr.children {
                    let ty = self.infer(child, nodes);
                    if !parts.contains(&ty) {
                        parts.push(ty);
                    }
                }
                parts.join(" | ")
            }
            ExprKind::RuleRef { resolved, name } => match resolved {
                Some(handle) if self.cyclic.contains(handle) => {
                    alias_name(&self.grammar.rules.get(*handle).unwrap().name.value)
                }
                Some(handle) => self.rules[handle].clone(),
                None => alias_name(&name.value),
            },
            ExprKind::Action { .. } => {
                self.infer(&expr.children[0], nodes);
                "any".to_string()
            }
            ExprKind::Labeled { .. } | ExprKind::Scope { .. } | ExprKind::Named { .. } => {
                self.infer(&expr.children[0], nodes)
            }
        };
        nodes.insert(expr.id, ty.clone());
        ty
    }
}

fn nullable(ty: &str) -> String {
    if ty.contains(" | ") {
        format!("({}) | null", ty)
    } else {
        format!("{} | null", ty)
    }
}

#[cfg(test)]
use crate::error::ErrorAccumulator;
#[cfg(test)]
use crate::frontend;
#[cfg(test)]
use crate::passes::{annotations, check};
#[cfg(test)]
use std::collections::BTreeSet;

#[cfg(test)]
fn infer_start(src: &str) -> String {
    let err = ErrorAccumulator::new();
    let mut grammar = frontend::parse(src, &err);
    check::run(&mut grammar, &err);
    let (grammar, outcome) = annotations::run(grammar, &BTreeSet::new(), &err);
    assert!(!err.has_fatal(), "diagnostics: {:?}", err.get());
    let labels = super::labels::run(&grammar);
    let info = run(&grammar, &outcome.type_overrides, &labels);
    let start = grammar.start_rule().unwrap();
    info.rules[&start].clone()
}

#[test]
fn test_sequence_tuple_type() {
    assert_eq!(infer_start(r#"start = "a" "b""#), "[string, string]");
}

#[test]
fn test_repetition_and_optional_types() {
    assert_eq!(
        infer_start(r#"start = "a"? "b"*"#),
        "[string | null, Array<string>]"
    );
}

#[test]
fn test_choice_union_deduplicates() {
    assert_eq!(infer_start(r#"start = "a" / [0-9] / &"x""#), "string | undefined");
}

#[test]
fn test_reference_chain_fixed_point() {
    assert_eq!(infer_start("start = a\na = b\nb = \"x\""), "string");
}

#[test]
fn test_cycle_uses_alias() {
    assert_eq!(
        infer_start(r#"start = "x" start?"#),
        "[string, Start | null]"
    );
}

#[test]
fn test_action_is_any_and_type_override_wins() {
    assert_eq!(infer_start(r#"start = n:[0-9] { return +n; }"#), "any");
    assert_eq!(
        infer_start("@type(type: \"number\")\nstart = n:[0-9] { return +n; }"),
        "number"
    );
}

#[test]
fn test_single_pick_takes_element_type() {
    assert_eq!(infer_start(r#"start = ::"a" "b"*"#), "string");
}
