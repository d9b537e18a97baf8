use serde::Serialize;

use super::{CodeBlock, Ident, NodeId, RuleHandle};
use crate::span::Span;

/// The expression variants of the grammar AST. Child expressions live in
/// [`Expr::children`]; the kind only carries per-variant data so the tree
/// can be walked uniformly.
#[derive(Clone, PartialEq, Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ExprKind {
    Literal {
        value: String,
        ignore_case: bool,
    },
    /// `parts` are inclusive code point ranges; singletons are `(c, c)`.
    Class {
        parts: Vec<(char, char)>,
        inverted: bool,
        ignore_case: bool,
    },
    Any,
    End,
    RuleRef {
        name: Ident,
        /// Filled by the reference-checking pass.
        resolved: Option<RuleHandle>,
    },
    Sequence,
    Choice,
    Optional,
    /// `separated` repetitions hold `[item, separator]` children; the
    /// internal form of the `@separator` rewrite. The result is still the
    /// flat array of item results.
    ZeroOrMore {
        separated: bool,
    },
    OneOrMore {
        separated: bool,
    },
    /// `$e` — match the child, produce the consumed text.
    Text,
    SimpleAnd,
    SimpleNot,
    SemanticAnd {
        code: CodeBlock,
    },
    SemanticNot {
        code: CodeBlock,
    },
    /// A label binding, or a `::` pick marker when `pick` is set.
    Labeled {
        label: Option<Ident>,
        pick: bool,
    },
    Action {
        code: CodeBlock,
    },
    /// Run `code` before matching the child; binds `names` for everything
    /// inside it.
    Scope {
        names: Vec<Ident>,
        code: CodeBlock,
    },
    /// Rebrand failures inside the child with a display name.
    Named {
        display: String,
    },
}

impl ExprKind {
    /// Whether the expression contributes a value to an enclosing sequence
    /// tuple. Lookaheads, predicates and end-of-input match without
    /// producing anything; a sequence result is the tuple of its capturing
    /// elements, unwrapped when only one remains.
    pub fn is_capturing(&self) -> bool {
        !matches!(
            self,
            ExprKind::SimpleAnd
                | ExprKind::SimpleNot
                | ExprKind::SemanticAnd { .. }
                | ExprKind::SemanticNot { .. }
                | ExprKind::End
        )
    }
}

#[derive(Clone, PartialEq, Debug, Serialize)]
pub struct Expr {
    pub id: NodeId,
    #[serde(flatten)]
    pub kind: ExprKind,
    #[serde(rename = "location")]
    pub span: Span,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Expr>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<super::Annotation>,
}

impl Expr {
    pub fn new(id: NodeId, kind: ExprKind, span: Span, children: Vec<Expr>) -> Expr {
        Expr {
            id,
            kind,
            span,
            children,
            annotations: Vec::new(),
        }
    }

    pub fn leaf(id: NodeId, kind: ExprKind, span: Span) -> Expr {
        Expr::new(id, kind, span, Vec::new())
    }

    /// Replace this node with an empty sequence, returning the original.
    pub fn take(&mut self) -> Expr {
        let placeholder = Expr::new(self.id, ExprKind::Sequence, self.span, Vec::new());
        std::mem::replace(self, placeholder)
    }

    pub fn child(&self) -> &Expr {
        &self.children[0]
    }

    pub fn child_mut(&mut self) -> &mut Expr {
        &mut self.children[0]
    }

    fn visit_impl(&self, f: &mut dyn FnMut(&Expr)) {
        for child in &self.children {
            child.visit_impl(f);
        }
        f(self)
    }

    /// Post-order traversal.
    pub fn visit(&self, mut f: impl FnMut(&Expr)) {
        self.visit_impl(&mut f)
    }

    fn visit_mut_impl(&mut self, f: &mut dyn FnMut(&mut Expr)) {
        for child in &mut self.children {
            child.visit_mut_impl(f);
        }
        f(self)
    }

    pub fn visit_mut(&mut self, mut f: impl FnMut(&mut Expr)) {
        self.visit_mut_impl(&mut f)
    }
}
