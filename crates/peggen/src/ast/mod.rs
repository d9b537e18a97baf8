pub mod display;
pub mod expr;

use cranelift_entity::{entity_impl, PrimaryMap};
use serde::ser::SerializeStruct;
use serde::Serialize;

use crate::span::Span;

pub use expr::{Expr, ExprKind};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize)]
pub struct RuleHandle(u32);

entity_impl! { RuleHandle }

/// Identity of one AST node. Pass-derived metadata (label manifests, type
/// assignments, `@type` overrides) lives in side tables keyed by this, so
/// the expression variant stays free of transient fields.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize)]
pub struct NodeId(u32);

entity_impl! { NodeId }

#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
pub struct Ident {
    pub value: String,
    #[serde(skip)]
    pub span: Span,
}

impl std::fmt::Display for Ident {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.value)
    }
}

/// Host-language text carried verbatim. The compiler only ever scans it
/// for identifier references; it is never parsed.
#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
pub struct CodeBlock {
    pub code: String,
    #[serde(skip)]
    pub span: Span,
}

#[derive(Clone, PartialEq, Debug, Serialize)]
#[serde(untagged)]
pub enum AnnotationValue {
    Str(String),
    Number(f64),
    Bool(bool),
    Array(Vec<AnnotationValue>),
    /// A bare identifier, e.g. a rule reference in `@separator(expr: comma)`.
    Raw(String),
}

#[derive(Clone, PartialEq, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Annotation {
    If {
        conditions: Vec<Ident>,
        #[serde(skip)]
        span: Span,
    },
    Generic {
        name: Ident,
        parameters: Vec<(Ident, AnnotationValue)>,
        #[serde(skip)]
        span: Span,
    },
}

impl Annotation {
    pub fn span(&self) -> Span {
        match self {
            Annotation::If { span, .. } => *span,
            Annotation::Generic { span, .. } => *span,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub name: Ident,
    pub display_name: Option<String>,
    pub annotations: Vec<Annotation>,
    pub expr: Expr,
    #[serde(skip)]
    pub span: Span,
}

/// A parsed grammar: the flat rule table every later stage indexes into,
/// plus the pieces that live outside any rule.
pub struct Grammar {
    pub rules: PrimaryMap<RuleHandle, Rule>,
    pub initializer: Option<CodeBlock>,
    pub parameters: Vec<Ident>,
    node_count: u32,
}

impl Grammar {
    pub fn new() -> Grammar {
        Grammar {
            rules: PrimaryMap::new(),
            initializer: None,
            parameters: Vec::new(),
            node_count: 0,
        }
    }

    /// Mint a fresh node identity; used by the frontend and by passes that
    /// rewrite subtrees.
    pub fn alloc_node(&mut self) -> NodeId {
        let id = NodeId::from_u32(self.node_count);
        self.node_count += 1;
        id
    }

    pub fn node_count(&self) -> u32 {
        self.node_count
    }

    /// Restore the allocator after a pass minted node ids outside the
    /// grammar (rebuild-style passes).
    pub fn set_node_count(&mut self, count: u32) {
        debug_assert!(count >= self.node_count);
        self.node_count = count;
    }

    pub fn rule_by_name(&self, name: &str) -> Option<RuleHandle> {
        self.rules
            .iter()
            .find(|(_, rule)| rule.name.value == name)
            .map(|(handle, _)| handle)
    }

    pub fn start_rule(&self) -> Option<RuleHandle> {
        self.rules.iter().next().map(|(handle, _)| handle)
    }
}

impl Default for Grammar {
    fn default() -> Self {
        Grammar::new()
    }
}

impl Serialize for Grammar {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Grammar", 3)?;
        let rules: Vec<&Rule> = self.rules.values().collect();
        s.serialize_field("rules", &rules)?;
        s.serialize_field("initializer", &self.initializer)?;
        s.serialize_field("parameters", &self.parameters)?;
        s.end()
    }
}
