//! Bytecode generation. Each rule lowers to one flat `u32` stream with the
//! standard PEG stack discipline: every expression's code has a net stack
//! effect of +1 (its result or the failure marker) and restores the cursor
//! on failure. Constants deduplicate into first-occurrence-ordered pools so
//! emission stays byte-deterministic.

use std::collections::HashMap;

use indexmap::IndexSet;
use peggen_runtime::{
    CharClass, ClassPart, Expectation, Op, Program, RuleCode, TokenRule, UserCode, UserCodeKind,
};

use crate::ast::{CodeBlock, Expr, ExprKind, Grammar, NodeId, RuleHandle};
use crate::passes::annotations::AnnotationOutcome;
use crate::passes::labels::LabelInfo;

pub fn run(
    grammar: &Grammar,
    annotations: &AnnotationOutcome,
    labels: &LabelInfo,
    start: RuleHandle,
) -> Program {
    let token_types: HashMap<RuleHandle, &str> = annotations
        .token_rules
        .iter()
        .map(|(handle, ty)| (*handle, ty.as_str()))
        .collect();

    let mut gen = Generator {
        labels,
        token_nodes: &annotations.token_nodes,
        literals: IndexSet::new(),
        classes: IndexSet::new(),
        expectations: IndexSet::new(),
        functions: IndexSet::new(),
    };

    let mut rules = Vec::with_capacity(grammar.rules.len());
    for (handle, rule) in grammar.rules.iter() {
        let mut env = Env::new();
        let mut code = gen.compile(&rule.expr, 0, &mut env);
        debug_assert!(env.is_empty());
        if let Some(token_type) = token_types.get(&handle) {
            code = gen.named(code, Expectation::Other(token_type.to_string()));
        } else if let Some(display) = &rule.display_name {
            code = gen.named(code, Expectation::Other(display.clone()));
        }
        rules.push(RuleCode {
            name: rule.name.value.clone(),
            code,
        });
    }

    Program {
        rules,
        start: start.as_u32(),
        literals: gen.literals.into_iter().collect(),
        classes: gen.classes.into_iter().collect(),
        expectations: gen.expectations.into_iter().collect(),
        functions: gen.functions.into_iter().collect(),
        tokens: annotations
            .token_rules
            .iter()
            .map(|(handle, ty)| TokenRule {
                rule: handle.as_u32(),
                token_type: ty.clone(),
            })
            .collect(),
        ws_rule: grammar.rule_by_name("ws").map(|h| h.as_u32()),
        initializer: grammar.initializer.as_ref().map(|block| block.code.clone()),
    }
}

/// Label name → absolute value-stack slot within the rule frame.
type Env = Vec<(String, usize)>;

struct Generator<'a> {
    labels: &'a LabelInfo,
    token_nodes: &'a HashMap<NodeId, String>,
    literals: IndexSet<String>,
    classes: IndexSet<CharClass>,
    expectations: IndexSet<Expectation>,
    functions: IndexSet<UserCode>,
}

impl Generator<'_> {
    fn lit(&mut self, value: &str) -> u32 {
        self.literals.insert_full(value.to_string()).0 as u32
    }

    fn class(&mut self, class: CharClass) -> u32 {
        self.classes.insert_full(class).0 as u32
    }

    fn expect(&mut self, expectation: Expectation) -> u32 {
        self.expectations.insert_full(expectation).0 as u32
    }

    fn func(&mut self, code: UserCode) -> u32 {
        self.functions.insert_full(code).0 as u32
    }

    /// `sp` is the number of rule-frame stack slots live before this
    /// expression runs; the expression's result lands in slot `sp`.
    fn compile(&mut self, expr: &Expr, sp: usize, env: &mut Env) -> Vec<u32> {
        let code = self.compile_kind(expr, sp, env);
        match self.token_nodes.get(&expr.id) {
            Some(token_type) => self.named(code, Expectation::Other(token_type.clone())),
            None => code,
        }
    }

    fn compile_kind(&mut self, expr: &Expr, sp: usize, env: &mut Env) -> Vec<u32> {
        match &expr.kind {
            ExprKind::Literal { value, ignore_case } => self.literal(value, *ignore_case),
            ExprKind::Class {
                parts,
                inverted,
                ignore_case,
            } => {
                let class = CharClass {
                    parts: parts
                        .iter()
                        .map(|&(lo, hi)| {
                            if lo == hi {
                                ClassPart::Single(lo)
                            } else {
                                ClassPart::Range(lo, hi)
                            }
                        })
                        .collect(),
                    inverted: *inverted,
                    ignore_case: *ignore_case,
                };
                let text = class_text(parts, *inverted, *ignore_case);
                let k = self.class(class);
                let e = self.expect(Expectation::Class(text));
                let mut code = vec![Op::MatchClass as u32, k];
                code.extend(if_else(
                    Op::If,
                    vec![Op::AcceptN as u32, 1],
                    vec![Op::Fail as u32, e],
                ));
                code
            }
            ExprKind::Any => {
                let e = self.expect(Expectation::Any);
                let mut code = vec![Op::MatchAny as u32];
                code.extend(if_else(
                    Op::If,
                    vec![Op::AcceptN as u32, 1],
                    vec![Op::Fail as u32, e],
                ));
                code
            }
            ExprKind::End => {
                let e = self.expect(Expectation::End);
                let mut code = vec![Op::MatchEnd as u32];
                code.extend(if_else(
                    Op::If,
                    vec![Op::PushUndefined as u32],
                    vec![Op::Fail as u32, e],
                ));
                code
            }
            ExprKind::RuleRef { resolved, .. } => {
                let handle = resolved.expect("unresolved reference survived checking");
                vec![Op::Call as u32, handle.as_u32()]
            }
            ExprKind::Sequence => self.sequence(expr, sp, env, None),
            ExprKind::Choice => {
                let mut alternatives = expr.children.iter().rev();
                let last = alternatives.next().expect("empty choice survived pruning");
                let mark = env.len();
                let mut code = self.compile(last, sp, env);
                env.truncate(mark);
                for alternative in alternatives {
                    let mut attempt = self.compile(alternative, sp, env);
                    env.truncate(mark);
                    let mut rest = vec![Op::Pop as u32];
                    rest.extend(code);
                    attempt.extend(if_else(Op::IfError, rest, vec![]));
                    code = attempt;
                }
                code
            }
            ExprKind::Optional => {
                let mut code = self.scoped_child(&expr.children[0], sp, env);
                code.extend(if_else(
                    Op::IfError,
                    vec![Op::Pop as u32, Op::PushNull as u32],
                    vec![],
                ));
                code
            }
            ExprKind::ZeroOrMore { .. } => self.repetition(expr, sp, env, 0),
            ExprKind::OneOrMore { .. } => self.repetition(expr, sp, env, 1),
            ExprKind::Text => {
                let mut code = vec![Op::PushCurrPos as u32];
                code.extend(self.scoped_child(&expr.children[0], sp + 1, env));
                code.extend(if_else(
                    Op::IfNotError,
                    vec![Op::Pop as u32, Op::Text as u32],
                    vec![Op::Nip as u32, 1],
                ));
                code
            }
            ExprKind::SimpleAnd => {
                let mut code = vec![Op::PushCurrPos as u32, Op::SilentFailsOn as u32];
                code.extend(self.scoped_child(&expr.children[0], sp + 1, env));
                code.push(Op::SilentFailsOff as u32);
                code.extend(if_else(
                    Op::IfNotError,
                    vec![
                        Op::Pop as u32,
                        Op::PopCurrPos as u32,
                        Op::PushUndefined as u32,
                    ],
                    vec![Op::Nip as u32, 1],
                ));
                code
            }
            ExprKind::SimpleNot => {
                let mut code = vec![Op::PushCurrPos as u32, Op::SilentFailsOn as u32];
                code.extend(self.scoped_child(&expr.children[0], sp + 1, env));
                code.push(Op::SilentFailsOff as u32);
                code.extend(if_else(
                    Op::IfNotError,
                    vec![
                        Op::Pop as u32,
                        Op::PopCurrPos as u32,
                        Op::PushFailed as u32,
                    ],
                    vec![Op::PopN as u32, 2, Op::PushUndefined as u32],
                ));
                code
            }
            ExprKind::SemanticAnd { code } => self.predicate(expr, code, sp, env, Op::If),
            ExprKind::SemanticNot { code } => self.predicate(expr, code, sp, env, Op::IfNot),
            ExprKind::Labeled { .. } => {
                // registration happens in the enclosing frame builder
                let mark = env.len();
                let code = self.compile(&expr.children[0], sp, env);
                env.truncate(mark);
                code
            }
            ExprKind::Action { code } => {
                let child = &expr.children[0];
                if let ExprKind::Sequence = child.kind {
                    self.sequence(child, sp, env, Some((expr.id, code)))
                } else {
                    let mut out = vec![Op::PushCurrPos as u32];
                    let mark = env.len();
                    out.extend(self.compile(child, sp + 1, env));
                    register_label(child, sp + 1, env);
                    let execute = self.execute(expr.id, code, UserCodeKind::Action, 1, sp + 2, env);
                    env.truncate(mark);
                    out.extend(if_else(Op::IfNotError, execute, vec![]));
                    out.push(Op::Nip as u32);
                    out.push(1);
                    out
                }
            }
            ExprKind::Scope { names, code } => {
                let manifest = self.labels.manifest(expr.id);
                let params: Vec<String> =
                    manifest.iter().map(|entry| entry.label.clone()).collect();
                let f = self.func(UserCode {
                    kind: UserCodeKind::Scope,
                    params,
                    bindings: names.iter().map(|n| n.value.clone()).collect(),
                    body: code.code.clone(),
                });
                let nb = names.len();
                let depths = self.depths(expr.id, sp, env);
                let mut out = vec![
                    Op::ExecuteScope as u32,
                    f,
                    nb as u32,
                    depths.len() as u32,
                ];
                out.extend(depths);

                let mark = env.len();
                for (i, name) in names.iter().enumerate() {
                    env.push((name.value.clone(), sp + i));
                }
                let child = &expr.children[0];
                out.extend(self.compile(child, sp + nb, env));
                register_label(child, sp + nb, env);
                env.truncate(mark);

                out.extend(if_else(
                    Op::IfNotError,
                    vec![Op::RollbackDrop as u32],
                    vec![Op::RollbackFire as u32],
                ));
                out.push(Op::Nip as u32);
                out.push(nb as u32);
                out
            }
            ExprKind::Named { display } => {
                let mark = env.len();
                let code = self.compile(&expr.children[0], sp, env);
                env.truncate(mark);
                self.named(code, Expectation::Other(display.clone()))
            }
        }
    }

    fn literal(&mut self, value: &str, ignore_case: bool) -> Vec<u32> {
        if value.is_empty() {
            let k = self.lit("");
            return vec![Op::Load as u32, k];
        }
        let k = self.lit(value);
        let e = self.expect(Expectation::Literal(value.to_string()));
        let mut code = vec![
            if ignore_case {
                Op::MatchStringIc as u32
            } else {
                Op::MatchString as u32
            },
            k,
        ];
        let accept = if ignore_case {
            vec![Op::AcceptN as u32, value.chars().count() as u32]
        } else {
            vec![Op::AcceptString as u32, k]
        };
        code.extend(if_else(Op::If, accept, vec![Op::Fail as u32, e]));
        code
    }

    /// Compile a child whose label bindings must not leak.
    fn scoped_child(&mut self, child: &Expr, sp: usize, env: &mut Env) -> Vec<u32> {
        let mark = env.len();
        let code = self.compile(child, sp, env);
        env.truncate(mark);
        code
    }

    fn predicate(
        &mut self,
        expr: &Expr,
        code: &CodeBlock,
        sp: usize,
        env: &mut Env,
        branch: Op,
    ) -> Vec<u32> {
        let mut out = self.execute(expr.id, code, UserCodeKind::Predicate, 0, sp, env);
        out.extend(if_else(
            branch,
            vec![Op::PushUndefined as u32],
            vec![Op::PushFailed as u32],
        ));
        out
    }

    /// `EXECUTE f pop argc depths…` with depths taken from the environment
    /// at stack height `height`.
    fn execute(
        &mut self,
        node: NodeId,
        code: &CodeBlock,
        kind: UserCodeKind,
        pop: usize,
        height: usize,
        env: &Env,
    ) -> Vec<u32> {
        let manifest = self.labels.manifest(node);
        let params: Vec<String> = manifest.iter().map(|entry| entry.label.clone()).collect();
        let f = self.func(UserCode {
            kind,
            params,
            bindings: Vec::new(),
            body: code.code.clone(),
        });
        let depths = self.depths(node, height, env);
        let mut out = vec![Op::Execute as u32, f, pop as u32, depths.len() as u32];
        out.extend(depths);
        out
    }

    fn depths(&self, node: NodeId, height: usize, env: &Env) -> Vec<u32> {
        self.labels
            .manifest(node)
            .iter()
            .map(|entry| {
                let slot = env
                    .iter()
                    .rev()
                    .find(|(name, _)| *name == entry.label)
                    .map(|(_, slot)| *slot)
                    .expect("manifest label missing from environment");
                (height - 1 - slot) as u32
            })
            .collect()
    }

    fn sequence(
        &mut self,
        seq: &Expr,
        sp: usize,
        env: &mut Env,
        action: Option<(NodeId, &CodeBlock)>,
    ) -> Vec<u32> {
        let mark = env.len();
        let mut code = vec![Op::PushCurrPos as u32];
        code.extend(self.sequence_tail(seq, 0, sp, env, action));
        env.truncate(mark);
        code
    }

    /// Elements from `index` on; `sp` is the frame base (the saved cursor
    /// sits in slot `sp`, element `i` in slot `sp + 1 + i`).
    fn sequence_tail(
        &mut self,
        seq: &Expr,
        index: usize,
        sp: usize,
        env: &mut Env,
        action: Option<(NodeId, &CodeBlock)>,
    ) -> Vec<u32> {
        let n = seq.children.len();
        if index == n {
            let height = sp + 1 + n;
            return match action {
                Some((node, block)) => {
                    let mut out =
                        self.execute(node, block, UserCodeKind::Action, n, height, env);
                    out.push(Op::Nip as u32);
                    out.push(1);
                    out
                }
                None => {
                    let kept: Vec<usize> = match self.labels.picks.get(&seq.id) {
                        Some(picks) => picks.clone(),
                        None => (0..n)
                            .filter(|&i| seq.children[i].kind.is_capturing())
                            .collect(),
                    };
                    if kept.len() == n {
                        vec![Op::Wrap as u32, n as u32, Op::Nip as u32, 1]
                    } else if kept.is_empty() {
                        vec![
                            Op::PopN as u32,
                            (n + 1) as u32,
                            Op::PushUndefined as u32,
                        ]
                    } else {
                        let mut out = vec![
                            Op::Pluck as u32,
                            (n + 1) as u32,
                            kept.len() as u32,
                        ];
                        // depth of element i from the pre-pluck top
                        out.extend(kept.iter().map(|&i| (n - 1 - i) as u32));
                        out
                    }
                }
            };
        }

        let child = &seq.children[index];
        let mut code = self.compile(child, sp + 1 + index, env);
        register_label(child, sp + 1 + index, env);
        let rest = self.sequence_tail(seq, index + 1, sp, env, action);
        let cleanup = vec![
            Op::PopN as u32,
            (index + 1) as u32,
            Op::PopCurrPos as u32,
            Op::PushFailed as u32,
        ];
        code.extend(if_else(Op::IfNotError, rest, cleanup));
        code
    }

    fn repetition(&mut self, expr: &Expr, sp: usize, env: &mut Env, min: usize) -> Vec<u32> {
        let item = &expr.children[0];
        let separator = expr.children.get(1);

        // the array lives in slot sp, items match into slot sp + 1
        let item_code = self.scoped_child(item, sp + 1, env);
        let mut body = vec![Op::Append as u32];
        match separator {
            None => body.extend(item_code.clone()),
            Some(separator) => {
                body.push(Op::PushCurrPos as u32);
                body.extend(self.scoped_child(separator, sp + 2, env));
                let mut matched_sep = vec![Op::Pop as u32];
                matched_sep.extend(self.scoped_child(item, sp + 2, env));
                matched_sep.extend(if_else(
                    Op::IfNotError,
                    vec![Op::Nip as u32, 1],
                    vec![
                        Op::Pop as u32,
                        Op::PopCurrPos as u32,
                        Op::PushFailed as u32,
                    ],
                ));
                body.extend(if_else(Op::IfNotError, matched_sep, vec![Op::Nip as u32, 1]));
            }
        }

        let mut code = vec![Op::PushEmptyArray as u32];
        code.extend(item_code);
        code.push(Op::WhileNotError as u32);
        code.push(body.len() as u32);
        code.extend(body);
        code.push(Op::Pop as u32);
        if min > 0 {
            code.push(Op::IfArrlenMin as u32);
            code.push(min as u32);
            code.push(0);
            code.push(2);
            code.push(Op::Pop as u32);
            code.push(Op::PushFailed as u32);
        }
        code
    }

    fn named(&mut self, inner: Vec<u32>, expectation: Expectation) -> Vec<u32> {
        let e = self.expect(expectation);
        let mut code = vec![Op::SilentFailsOn as u32];
        code.extend(inner);
        code.push(Op::SilentFailsOff as u32);
        code.extend(if_else(
            Op::IfError,
            vec![Op::Pop as u32, Op::Fail as u32, e],
            vec![],
        ));
        code
    }
}

fn register_label(child: &Expr, slot: usize, env: &mut Env) {
    if let ExprKind::Labeled {
        label: Some(label), ..
    } = &child.kind
    {
        env.push((label.value.clone(), slot));
    }
}

fn if_else(op: Op, then: Vec<u32>, els: Vec<u32>) -> Vec<u32> {
    let mut code = vec![op as u32, then.len() as u32, els.len() as u32];
    code.extend(then);
    code.extend(els);
    code
}

fn class_text(parts: &[(char, char)], inverted: bool, ignore_case: bool) -> String {
    let mut text = String::from("[");
    if inverted {
        text.push('^');
    }
    for &(lo, hi) in parts {
        if lo == hi {
            text.extend(lo.escape_default());
        } else {
            text.extend(lo.escape_default());
            text.push('-');
            text.extend(hi.escape_default());
        }
    }
    text.push(']');
    if ignore_case {
        text.push('i');
    }
    text
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
fn generate(src: &str) -> Program {
    let err = ErrorAccumulator::new();
    let mut grammar = frontend::parse(src, &err);
    check::run(&mut grammar, &err);
    let (grammar, outcome) = annotations::run(grammar, &BTreeSet::new(), &err);
    assert!(!err.has_fatal(), "diagnostics: {:?}", err.get());
    let labels = crate::passes::labels::run(&grammar);
    let start = grammar.start_rule().unwrap();
    run(&grammar, &outcome, &labels, start)
}

#[test]
fn test_literal_bytecode_shape() {
    let program = generate(r#"start = "a""#);
    assert_eq!(
        program.rules[0].code,
        vec![
            Op::MatchString as u32,
            0,
            Op::If as u32,
            2,
            2,
            Op::AcceptString as u32,
            0,
            Op::Fail as u32,
            0,
        ]
    );
    assert_eq!(program.literals, vec!["a".to_string()]);
    assert_eq!(
        program.expectations,
        vec![Expectation::Literal("a".into())]
    );
}

#[test]
fn test_constant_pools_deduplicate() {
    let program = generate(r#"start = "a" "b" "a""#);
    assert_eq!(program.literals, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(program.expectations.len(), 2);
}

#[test]
fn test_generation_is_deterministic() {
    let src = "start = item (\",\" item)* { return item; }\nitem = [a-z]+";
    assert_eq!(generate(src), generate(src));
}

#[test]
fn test_rule_display_name_wraps_body() {
    let program = generate("digit \"a digit\" = [0-9]");
    assert_eq!(program.rules[0].code[0], Op::SilentFailsOn as u32);
    assert!(program
        .expectations
        .contains(&Expectation::Other("a digit".into())));
}
