//! Label analysis. For every code-bearing node this computes the label
//! manifest: the in-scope labels the code text actually references, in
//! binding order, innermost binding winning for shadowed names. The
//! manifest becomes the positional parameter list of the emitted closure.
//! Code blocks are only scanned for identifiers, never parsed.
//!
//! The pass also records `::` pick positions per sequence.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;

use crate::ast::{Expr, ExprKind, Grammar, NodeId};

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ManifestEntry {
    pub label: String,
    /// The bound node; `None` for scope bindings, which have no backing
    /// expression (their type is `any`).
    pub node: Option<NodeId>,
}

#[derive(Default)]
pub struct LabelInfo {
    /// Keyed by the `Action`/`SemanticAnd`/`SemanticNot`/`Scope` node.
    pub manifests: HashMap<NodeId, Vec<ManifestEntry>>,
    /// `::` pick element indices, keyed by the sequence node.
    pub picks: HashMap<NodeId, Vec<usize>>,
}

impl LabelInfo {
    pub fn manifest(&self, node: NodeId) -> &[ManifestEntry] {
        self.manifests.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }
}

type Env = Vec<(String, Option<NodeId>)>;

pub fn run(grammar: &Grammar) -> LabelInfo {
    let mut info = LabelInfo::default();
    for (_, rule) in grammar.rules.iter() {
        let mut env = Env::new();
        walk_scoped(&rule.expr, &mut env, &mut info);
        debug_assert!(env.is_empty());
    }
    info
}

/// Walk a subtree whose bindings must not leak to the caller.
fn walk_scoped(expr: &Expr, env: &mut Env, info: &mut LabelInfo) {
    let mark = env.len();
    walk(expr, env, info);
    register_label(expr, env);
    env.truncate(mark);
}

/// Direct labeled children are registered by whoever owns the scope, so a
/// binding becomes visible right after the element that introduced it.
fn register_label(expr: &Expr, env: &mut Env) {
    if let ExprKind::Labeled {
        label: Some(label), ..
    } = &expr.kind
    {
        env.push((label.value.clone(), Some(expr.id)));
    }
}

fn walk(expr: &Expr, env: &mut Env, info: &mut LabelInfo) {
    match &expr.kind {
        ExprKind::Sequence => {
            let mut picks = Vec::new();
            for (i, child) in expr.children.iter().enumerate() {
                walk(child, env, info);
                register_label(child, env);
                if matches!(child.kind, ExprKind::Labeled { pick: true, .. }) {
                    picks.push(i);
                }
            }
            // bindings stay visible: an enclosing action consumes them and
            // the enclosing alternative boundary drops them
            if !picks.is_empty() {
                info.picks.insert(expr.id, picks);
            }
        }
        ExprKind::Choice => {
            for alternative in &expr.children {
                walk_scoped(alternative, env, info);
            }
        }
        ExprKind::Labeled { .. } => {
            walk_scoped(&expr.children[0], env, info);
        }
        ExprKind::Action { code } => {
            let mark = env.len();
            walk(&expr.children[0], env, info);
            register_label(&expr.children[0], env);
            info.manifests
                .insert(expr.id, manifest(&code.code, env));
            env.truncate(mark);
        }
        ExprKind::SemanticAnd { code } | ExprKind::SemanticNot { code } => {
            info.manifests
                .insert(expr.id, manifest(&code.code, env));
        }
        ExprKind::Scope { names, code } => {
            // the scope code sees outer labels only; its bindings cover
            // everything inside the scoped expression
            info.manifests
                .insert(expr.id, manifest(&code.code, env));
            let mark = env.len();
            for name in names {
                env.push((name.value.clone(), None));
            }
            walk(&expr.children[0], env, info);
            register_label(&expr.children[0], env);
            env.truncate(mark);
        }
        _ => {
            for child in &expr.children {
                walk_scoped(child, env, info);
            }
        }
    }
}

fn manifest(code: &str, env: &Env) -> Vec<ManifestEntry> {
    let referenced = referenced_idents(code);
    let mut visible: IndexMap<&str, Option<NodeId>> = IndexMap::new();
    for (name, node) in env {
        // later bindings shadow; IndexMap keeps the first position
        visible.insert(name.as_str(), *node);
    }
    visible
        .into_iter()
        .filter(|(name, _)| referenced.contains(*name))
        .map(|(name, node)| ManifestEntry {
            label: name.to_string(),
            node,
        })
        .collect()
}

/// Identifiers referenced by a code block, skipping string literals,
/// comments and property accesses (`x.y` references `x`, not `y`).
fn referenced_idents(code: &str) -> HashSet<String> {
    let mut out = HashSet::new();
    let bytes = code.as_bytes();
    let mut i = 0;
    let mut after_dot = false;
    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b'"' | b'\'' | b'`' => {
                let quote = b;
                i += 1;
                while i < bytes.len() {
                    match bytes[i] {
                        b'\\' => i += 2,
                        c if c == quote => {
                            i += 1;
                            break;
                        }
                        _ => i += 1,
                    }
                }
                after_dot = false;
            }
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i = (i + 2).min(bytes.len());
            }
            c if c.is_ascii_alphabetic() || c == b'_' || c == b'$' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'$')
                {
                    i += 1;
                }
                if !after_dot {
                    out.insert(code[start..i].to_string());
                }
                after_dot = false;
                continue;
            }
            b'.' => {
                after_dot = true;
            }
            c if c.is_ascii_whitespace() => {}
            _ => after_dot = false,
        }
        i += 1;
    }
    out
}

#[cfg(test)]
use crate::error::ErrorAccumulator;
#[cfg(test)]
use crate::frontend;
#[cfg(test)]
use crate::passes::check;

#[cfg(test)]
fn analyze(src: &str) -> (Grammar, LabelInfo) {
    let err = ErrorAccumulator::new();
    let mut grammar = frontend::parse(src, &err);
    check::run(&mut grammar, &err);
    assert!(err.is_empty(), "diagnostics: {:?}", err.get());
    let info = run(&grammar);
    (grammar, info)
}

#[cfg(test)]
fn single_manifest(grammar: &Grammar, info: &LabelInfo) -> Vec<String> {
    let mut found = None;
    for (_, rule) in grammar.rules.iter() {
        rule.expr.visit(|e| {
            if info.manifests.contains_key(&e.id) {
                found = Some(e.id);
            }
        });
    }
    info.manifest(found.expect("no code-bearing node"))
        .iter()
        .map(|entry| entry.label.clone())
        .collect()
}

#[test]
fn test_manifest_in_binding_order() {
    let (grammar, info) = analyze(r#"start = a:"x" b:"y" { return b + a; }"#);
    assert_eq!(single_manifest(&grammar, &info), vec!["a", "b"]);
}

#[test]
fn test_manifest_only_referenced_labels() {
    let (grammar, info) = analyze(r#"start = a:"x" b:"y" { return b; }"#);
    assert_eq!(single_manifest(&grammar, &info), vec!["b"]);
}

#[test]
fn test_property_access_is_not_a_reference() {
    let (grammar, info) = analyze(r#"start = n:"1" join:"2" { return n.join(); }"#);
    assert_eq!(single_manifest(&grammar, &info), vec!["n"]);
}

#[test]
fn test_labels_do_not_escape_repetition() {
    let (grammar, info) = analyze(r#"start = (a:"x")* &{ return a; }"#);
    assert_eq!(single_manifest(&grammar, &info), Vec::<String>::new());
}

#[test]
fn test_scope_bindings_visible_inside() {
    let (grammar, info) = analyze(
        r#"start = #(depth){ return 0; } (x:"a" &{ return depth < x; } "b")"#,
    );
    let mut predicate = None;
    for (_, rule) in grammar.rules.iter() {
        rule.expr.visit(|e| {
            if matches!(e.kind, ExprKind::SemanticAnd { .. }) {
                predicate = Some(e.id);
            }
        });
    }
    let labels: Vec<_> = info
        .manifest(predicate.unwrap())
        .iter()
        .map(|e| (e.label.clone(), e.node.is_some()))
        .collect();
    assert_eq!(labels, vec![("depth".to_string(), false), ("x".to_string(), true)]);
}

#[test]
fn test_inner_binding_shadows_outer() {
    let (grammar, info) = analyze(r#"start = a:"x" (a:"y" { return a; })"#);
    let mut action = None;
    for (_, rule) in grammar.rules.iter() {
        rule.expr.visit(|e| {
            if matches!(e.kind, ExprKind::Action { .. }) {
                action = Some(e.id);
            }
        });
    }
    let entries = info.manifest(action.unwrap());
    assert_eq!(entries.len(), 1);
    // the manifest must point at the inner binding
    let mut inner_label = None;
    for (_, rule) in grammar.rules.iter() {
        rule.expr.visit(|e| {
            if let ExprKind::Labeled { label: Some(l), .. } = &e.kind {
                if l.value == "a" && e.span.start() > 10 {
                    inner_label = Some(e.id);
                }
            }
        });
    }
    assert_eq!(entries[0].node, inner_label);
}

#[test]
fn test_picks_recorded_in_source_order() {
    let (grammar, info) = analyze(r#"start = ::"a" "," ::"b""#);
    let rule = grammar.rules.values().next().unwrap();
    assert_eq!(info.picks.get(&rule.expr.id), Some(&vec![0, 2]));
}
