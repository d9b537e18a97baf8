//! Annotation processing. `@if` guards are evaluated against the build
//! parameters first and prune rules or choice alternatives; the generic
//! annotations `@separator`, `@token` and `@type` then rewrite or mark the
//! surviving subtrees. Evaluation is single-pass and top-down: a rewritten
//! subtree is not re-scanned.

use std::collections::{BTreeSet, HashMap};

use cranelift_entity::PrimaryMap;

use crate::ast::{
    Annotation, AnnotationValue, Expr, ExprKind, Grammar, Ident, NodeId, Rule, RuleHandle,
};
use crate::error::{Code, ErrorAccumulator};
use crate::span::Span;

#[derive(Default)]
pub struct AnnotationOutcome {
    /// `@type` results, keyed by the annotated node.
    pub type_overrides: HashMap<NodeId, String>,
    /// `@token`-marked rules in declaration order, with their token type.
    pub token_rules: Vec<(RuleHandle, String)>,
    /// `@token` on an inner expression: atomic naming only.
    pub token_nodes: HashMap<NodeId, String>,
}

pub fn run(
    mut grammar: Grammar,
    parameters: &BTreeSet<String>,
    err: &ErrorAccumulator,
) -> (Grammar, AnnotationOutcome) {
    let mut outcome = AnnotationOutcome::default();
    let start_name = grammar
        .rules
        .values()
        .next()
        .map(|rule| rule.name.value.clone());

    // phase 1: @if pruning
    let mut survivors: Vec<(RuleHandle, Rule)> = Vec::new();
    for (old_handle, rule) in grammar.rules.iter() {
        let mut rule = rule.clone();
        if !eval_if_annotations(&mut rule.annotations, parameters) {
            continue;
        }
        if prune_alternatives(&mut rule.expr, parameters) {
            continue;
        }
        survivors.push((old_handle, rule));
    }
    grammar.rules = PrimaryMap::new();

    match &start_name {
        None => {
            err.report(Code::EmptyGrammar, Span::empty(), "Grammar has no rules");
            return (grammar, outcome);
        }
        Some(start) => {
            if !survivors.iter().any(|(_, rule)| rule.name.value == *start) {
                err.report(
                    Code::EmptyGrammar,
                    Span::empty(),
                    format!("Start rule \"{}\" was removed by @if", start),
                );
                return (grammar, outcome);
            }
        }
    }

    let remap: HashMap<RuleHandle, RuleHandle> = survivors
        .iter()
        .enumerate()
        .map(|(i, (old_handle, _))| (*old_handle, RuleHandle::from_u32(i as u32)))
        .collect();
    let names: HashMap<String, RuleHandle> = survivors
        .iter()
        .enumerate()
        .map(|(i, (_, rule))| (rule.name.value.clone(), RuleHandle::from_u32(i as u32)))
        .collect();

    // phase 2: generic annotations and reference remapping
    let mut cx = Cx {
        err,
        names: &names,
        next_node: grammar.node_count(),
        outcome: &mut outcome,
    };
    for (i, (_, rule)) in survivors.iter_mut().enumerate() {
        let handle = RuleHandle::from_u32(i as u32);
        let annotations = std::mem::take(&mut rule.annotations);
        for annotation in annotations {
            cx.apply(annotation, Target::Rule(handle, &rule.name, &mut rule.expr));
        }
        cx.process_expr(&mut rule.expr);

        rule.expr.visit_mut(|expr| {
            if let ExprKind::RuleRef { name, resolved } = &mut expr.kind {
                if let Some(old) = *resolved {
                    match remap.get(&old) {
                        Some(&new) => *resolved = Some(new),
                        None => {
                            err.report(
                                Code::UndefinedRule,
                                name.span,
                                format!("Rule \"{}\" was removed by @if", name),
                            );
                            *resolved = None;
                        }
                    }
                }
            }
        });
    }
    let next_node = cx.next_node;

    for (_, rule) in survivors {
        grammar.rules.push(rule);
    }
    grammar.set_node_count(next_node);
    (grammar, outcome)
}

/// Evaluate and strip every `@if` in the list; all conditions of all lists
/// must be present in the build parameters.
fn eval_if_annotations(annotations: &mut Vec<Annotation>, parameters: &BTreeSet<String>) -> bool {
    let mut keep = true;
    annotations.retain(|annotation| match annotation {
        Annotation::If { conditions, .. } => {
            keep &= conditions.iter().all(|c| parameters.contains(&c.value));
            false
        }
        Annotation::Generic { .. } => true,
    });
    keep
}

/// Prune `@if`-guarded choice alternatives. Returns true when the rule can
/// no longer match anything and must be removed.
fn prune_alternatives(expr: &mut Expr, parameters: &BTreeSet<String>) -> bool {
    // the rule body itself is the degenerate one-alternative case
    if !eval_if_annotations(&mut expr.annotations, parameters) {
        return true;
    }
    prune_choices(expr, parameters)
}

fn prune_choices(expr: &mut Expr, parameters: &BTreeSet<String>) -> bool {
    if let ExprKind::Choice = expr.kind {
        expr.children
            .retain_mut(|alt| eval_if_annotations(&mut alt.annotations, parameters));
        if expr.children.is_empty() {
            return true;
        }
    }
    expr.children
        .iter_mut()
        .any(|child| prune_choices(child, parameters))
}

enum Target<'a> {
    Rule(RuleHandle, &'a Ident, &'a mut Expr),
    Node(&'a mut Expr),
}

struct Cx<'a> {
    err: &'a ErrorAccumulator,
    names: &'a HashMap<String, RuleHandle>,
    next_node: u32,
    outcome: &'a mut AnnotationOutcome,
}

impl Cx<'_> {
    fn node(&mut self) -> NodeId {
        let id = NodeId::from_u32(self.next_node);
        self.next_node += 1;
        id
    }

    /// Process one node's annotations, then descend — unless a rewrite
    /// replaced the subtree.
    fn process_expr(&mut self, expr: &mut Expr) {
        let annotations = std::mem::take(&mut expr.annotations);
        let mut rewritten = false;
        for annotation in annotations {
            rewritten |= self.apply_node(annotation, expr);
        }
        if rewritten {
            return;
        }
        for child in &mut expr.children {
            self.process_expr(child);
        }
    }

    fn apply_node(&mut self, annotation: Annotation, expr: &mut Expr) -> bool {
        self.apply(annotation, Target::Node(expr))
    }

    /// Returns true when the annotation rewrote the target subtree.
    fn apply(&mut self, annotation: Annotation, target: Target<'_>) -> bool {
        let span = annotation.span();
        let (name, parameters) = match annotation {
            Annotation::If { .. } => {
                self.err.report(
                    Code::UnknownAnnotation,
                    span,
                    "@if only applies to rules and choice alternatives; ignored",
                );
                return false;
            }
            Annotation::Generic {
                name, parameters, ..
            } => (name, parameters),
        };
        match name.value.as_str() {
            "separator" => {
                let expr = match target {
                    Target::Rule(_, _, expr) => expr,
                    Target::Node(expr) => expr,
                };
                self.apply_separator(&parameters, span, expr)
            }
            "token" => {
                let token_type = |fallback: &str| {
                    param_str(&parameters, "type").unwrap_or_else(|| fallback.to_string())
                };
                match target {
                    Target::Rule(handle, rule_name, _) => {
                        let ty = token_type(&rule_name.value);
                        self.outcome.token_rules.push((handle, ty));
                    }
                    Target::Node(expr) => {
                        let ty = token_type("token");
                        self.outcome.token_nodes.insert(expr.id, ty);
                    }
                }
                false
            }
            "type" => {
                let node = match target {
                    Target::Rule(_, _, expr) => expr.id,
                    Target::Node(expr) => expr.id,
                };
                match param_str(&parameters, "type") {
                    Some(ty) => {
                        if let Some(previous) = self.outcome.type_overrides.get(&node) {
                            if *previous != ty {
                                self.err.report(
                                    Code::TypeConflict,
                                    span,
                                    format!(
                                        "@type \"{}\" conflicts with earlier @type \"{}\"",
                                        ty, previous
                                    ),
                                );
                                return false;
                            }
                        }
                        self.outcome.type_overrides.insert(node, ty);
                    }
                    None => self.err.report(
                        Code::UnknownAnnotation,
                        span,
                        "@type requires a string `type` parameter; ignored",
                    ),
                }
                false
            }
            other => {
                self.err.report(
                    Code::UnknownAnnotation,
                    span,
                    format!("Unknown annotation @{}; ignored", other),
                );
                false
            }
        }
    }

    /// `X+ @separator(expr: E)` becomes, semantically,
    /// `sequence(X, zeroOrMore(sequence(E, X)))` while keeping the flat
    /// array-of-items result; internally the repetition just carries the
    /// separator as a second child.
    fn apply_separator(
        &mut self,
        parameters: &[(Ident, AnnotationValue)],
        span: Span,
        expr: &mut Expr,
    ) -> bool {
        let separated = match &mut expr.kind {
            ExprKind::ZeroOrMore { separated } | ExprKind::OneOrMore { separated } => separated,
            _ => {
                self.err.report(
                    Code::UnknownAnnotation,
                    span,
                    "@separator only applies to repetitions; ignored",
                );
                return false;
            }
        };
        if *separated {
            self.err.report(
                Code::UnknownAnnotation,
                span,
                "Repetition already has a separator; ignored",
            );
            return false;
        }
        let value = parameters
            .iter()
            .find(|(key, _)| key.value == "expr")
            .map(|(_, value)| value);
        let separator = match value {
            Some(AnnotationValue::Str(text)) => {
                let id = self.node();
                Expr::leaf(
                    id,
                    ExprKind::Literal {
                        value: text.clone(),
                        ignore_case: false,
                    },
                    span,
                )
            }
            Some(AnnotationValue::Raw(name)) => match self.names.get(name) {
                Some(&handle) => {
                    let id = self.node();
                    Expr::leaf(
                        id,
                        ExprKind::RuleRef {
                            name: Ident {
                                value: name.clone(),
                                span,
                            },
                            resolved: Some(handle),
                        },
                        span,
                    )
                }
                None => {
                    self.err.report(
                        Code::UndefinedRule,
                        span,
                        format!("Separator references undefined rule \"{}\"", name),
                    );
                    return false;
                }
            },
            _ => {
                self.err.report(
                    Code::UnknownAnnotation,
                    span,
                    "@separator requires an `expr` parameter (string or rule); ignored",
                );
                return false;
            }
        };
        *separated = true;
        expr.children.push(separator);
        true
    }
}

fn param_str(parameters: &[(Ident, AnnotationValue)], key: &str) -> Option<String> {
    parameters.iter().find_map(|(k, value)| {
        if k.value == key {
            match value {
                AnnotationValue::Str(s) => Some(s.clone()),
                _ => None,
            }
        } else {
            None
        }
    })
}

#[cfg(test)]
use crate::frontend;
#[cfg(test)]
use crate::passes::check;

#[cfg(test)]
fn process(src: &str, params: &[&str]) -> (Grammar, AnnotationOutcome, ErrorAccumulator) {
    let err = ErrorAccumulator::new();
    let mut grammar = frontend::parse(src, &err);
    check::run(&mut grammar, &err);
    assert!(!err.has_fatal(), "setup diagnostics: {:?}", err.get());
    let params: BTreeSet<String> = params.iter().map(|s| s.to_string()).collect();
    let (grammar, outcome) = run(grammar, &params, &err);
    (grammar, outcome, err)
}

#[test]
fn test_if_removes_start_rule() {
    let (_, _, err) = process("@if(debug)\nstart = \"a\"", &[]);
    assert!(err.get().iter().any(|d| d.code == Code::EmptyGrammar));
}

#[test]
fn test_if_prunes_alternative() {
    let (grammar, _, err) = process("start = @if(debug) \"d\" / \"r\"", &[]);
    assert!(!err.has_fatal(), "{:?}", err.get());
    let rule = grammar.rules.values().next().unwrap();
    assert_eq!(rule.expr.children.len(), 1);

    let (grammar, _, err) = process("start = @if(debug) \"d\" / \"r\"", &["debug"]);
    assert!(!err.has_fatal(), "{:?}", err.get());
    let rule = grammar.rules.values().next().unwrap();
    assert_eq!(rule.expr.children.len(), 2);
}

#[test]
fn test_pruned_rule_orphans_references() {
    let (_, _, err) = process("start = extra?\n@if(never)\nextra = \"e\"", &[]);
    assert!(err.get().iter().any(|d| d.code == Code::UndefinedRule));
}

#[test]
fn test_separator_rewrites_repetition() {
    let (grammar, _, err) = process("start = @separator(expr: \",\") id+ ;\nid = [a-z]", &[]);
    assert!(err.is_empty(), "{:?}", err.get());
    let rule = grammar.rules.values().next().unwrap();
    assert_eq!(rule.expr.kind, ExprKind::OneOrMore { separated: true });
    assert_eq!(rule.expr.children.len(), 2);
    assert_eq!(
        rule.expr.children[1].kind,
        ExprKind::Literal {
            value: ",".into(),
            ignore_case: false
        }
    );
}

#[test]
fn test_separator_rule_reference() {
    let (grammar, _, err) =
        process("start = @separator(expr: comma) id+ ;\nid = [a-z]\ncomma = \",\"", &[]);
    assert!(err.is_empty(), "{:?}", err.get());
    let rule = grammar.rules.values().next().unwrap();
    let comma = grammar.rule_by_name("comma");
    let ExprKind::RuleRef { ref resolved, .. } = rule.expr.children[1].kind else {
        panic!("expected rule reference separator");
    };
    assert_eq!(*resolved, comma);
}

#[test]
fn test_unknown_annotation_is_nonfatal() {
    let (grammar, _, err) = process("@wat\nstart = \"a\"", &[]);
    assert_eq!(grammar.rules.len(), 1);
    assert!(!err.has_fatal());
    assert!(err
        .get()
        .iter()
        .any(|d| d.code == Code::UnknownAnnotation));
}

#[test]
fn test_conflicting_type_overrides() {
    let (_, _, err) = process("@type(type: \"A\")\n@type(type: \"B\")\nstart = \"a\"", &[]);
    assert!(err.get().iter().any(|d| d.code == Code::TypeConflict));
}

#[test]
fn test_token_rule_registration() {
    let (grammar, outcome, err) =
        process("start = num\n@token(type: \"Num\")\nnum = [0-9]+", &[]);
    assert!(err.is_empty(), "{:?}", err.get());
    let num = grammar.rule_by_name("num").unwrap();
    assert_eq!(outcome.token_rules, vec![(num, "Num".to_string())]);
}
