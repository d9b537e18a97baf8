use std::fmt::Write;

use super::{Expr, ExprKind, Grammar};

impl ExprKind {
    pub fn display_into(&self, buf: &mut dyn Write) -> std::fmt::Result {
        match self {
            ExprKind::Literal { value, ignore_case } => {
                write!(buf, "Literal({:?}", value)?;
                if *ignore_case {
                    write!(buf, " ignore-case")?;
                }
                write!(buf, ")")
            }
            ExprKind::Class {
                parts,
                inverted,
                ignore_case,
            } => {
                write!(buf, "Class([")?;
                for &(lo, hi) in parts {
                    if lo == hi {
                        write!(buf, "{:?}", lo)?;
                    } else {
                        write!(buf, "{:?}-{:?}", lo, hi)?;
                    }
                }
                write!(buf, "]")?;
                if *inverted {
                    write!(buf, " inverted")?;
                }
                if *ignore_case {
                    write!(buf, " ignore-case")?;
                }
                write!(buf, ")")
            }
            ExprKind::Any => write!(buf, "Any"),
            ExprKind::End => write!(buf, "End"),
            ExprKind::RuleRef { name, resolved } => match resolved {
                Some(handle) => write!(buf, "RuleRef({} -> {})", name, handle.as_u32()),
                None => write!(buf, "RuleRef({})", name),
            },
            ExprKind::Sequence => write!(buf, "Sequence"),
            ExprKind::Choice => write!(buf, "Choice"),
            ExprKind::Optional => write!(buf, "Optional"),
            ExprKind::ZeroOrMore { separated } => match separated {
                true => write!(buf, "ZeroOrMore(separated)"),
                false => write!(buf, "ZeroOrMore"),
            },
            ExprKind::OneOrMore { separated } => match separated {
                true => write!(buf, "OneOrMore(separated)"),
                false => write!(buf, "OneOrMore"),
            },
            ExprKind::Text => write!(buf, "Text"),
            ExprKind::SimpleAnd => write!(buf, "SimpleAnd"),
            ExprKind::SimpleNot => write!(buf, "SimpleNot"),
            ExprKind::SemanticAnd { .. } => write!(buf, "SemanticAnd"),
            ExprKind::SemanticNot { .. } => write!(buf, "SemanticNot"),
            ExprKind::Labeled { label, pick } => {
                write!(buf, "Labeled(")?;
                if let Some(label) = label {
                    write!(buf, "{}", label)?;
                }
                if *pick {
                    write!(buf, "::")?;
                }
                write!(buf, ")")
            }
            ExprKind::Action { .. } => write!(buf, "Action"),
            ExprKind::Scope { names, .. } => {
                write!(buf, "Scope(")?;
                for (i, name) in names.iter().enumerate() {
                    if i > 0 {
                        write!(buf, ", ")?;
                    }
                    write!(buf, "{}", name)?;
                }
                write!(buf, ")")
            }
            ExprKind::Named { display } => write!(buf, "Named({:?})", display),
        }
    }
}

impl Expr {
    pub fn display_into_indent(&self, buf: &mut dyn Write, indent: u32) -> std::fmt::Result {
        for _ in 0..indent {
            write!(buf, "  ")?;
        }
        self.kind.display_into(buf)?;
        writeln!(buf)?;
        for child in &self.children {
            child.display_into_indent(buf, indent + 1)?;
        }
        Ok(())
    }

    /// Indented tree rendering, used by tests and debug dumps.
    pub fn debug_tree(&self) -> String {
        let mut buf = String::new();
        let _ = self.display_into_indent(&mut buf, 0);
        buf
    }
}

impl Grammar {
    pub fn display_into(&self, buf: &mut dyn Write) -> std::fmt::Result {
        for (_, rule) in self.rules.iter() {
            writeln!(buf)?;
            writeln!(buf, "{} =", rule.name)?;
            rule.expr.display_into_indent(buf, 1)?;
        }
        Ok(())
    }
}
