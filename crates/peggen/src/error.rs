use std::cell::RefCell;

use serde::Serialize;

use crate::span::{Location, Span};

/// Stable diagnostic codes, part of the compiler's public surface.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub enum Code {
    #[serde(rename = "E-UNDEFINED-RULE")]
    UndefinedRule,
    #[serde(rename = "E-DUPLICATE-RULE")]
    DuplicateRule,
    #[serde(rename = "E-UNKNOWN-ANNOTATION")]
    UnknownAnnotation,
    #[serde(rename = "E-EMPTY-GRAMMAR")]
    EmptyGrammar,
    #[serde(rename = "E-INVALID-RANGE")]
    InvalidRange,
    #[serde(rename = "E-TYPE-CONFLICT")]
    TypeConflict,
    #[serde(rename = "E-LEFT-RECURSION")]
    LeftRecursion,
    #[serde(rename = "E-SYNTAX")]
    Syntax,
}

impl Code {
    pub fn as_str(self) -> &'static str {
        match self {
            Code::UndefinedRule => "E-UNDEFINED-RULE",
            Code::DuplicateRule => "E-DUPLICATE-RULE",
            Code::UnknownAnnotation => "E-UNKNOWN-ANNOTATION",
            Code::EmptyGrammar => "E-EMPTY-GRAMMAR",
            Code::InvalidRange => "E-INVALID-RANGE",
            Code::TypeConflict => "E-TYPE-CONFLICT",
            Code::LeftRecursion => "E-LEFT-RECURSION",
            Code::Syntax => "E-SYNTAX",
        }
    }

    /// Unknown annotations are dropped and reported; everything else stops
    /// the pipeline once its pass has finished collecting.
    pub fn is_fatal(self) -> bool {
        !matches!(self, Code::UnknownAnnotation)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Diagnostic {
    pub code: Code,
    pub message: String,
    pub span: Span,
    /// Resolved when the pipeline hands diagnostics out.
    pub location: Option<Location>,
}

impl Diagnostic {
    pub fn is_fatal(&self) -> bool {
        self.code.is_fatal()
    }
}

/// Shared by `&` through every pass; passes report, the pipeline decides.
#[derive(Default)]
pub struct ErrorAccumulator {
    diagnostics: RefCell<Vec<Diagnostic>>,
}

impl ErrorAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, code: Code, span: Span, message: impl ToString) {
        self.diagnostics.borrow_mut().push(Diagnostic {
            code,
            message: message.to_string(),
            span,
            location: None,
        });
    }

    pub fn has_fatal(&self) -> bool {
        self.diagnostics.borrow().iter().any(Diagnostic::is_fatal)
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.borrow().is_empty()
    }

    pub fn get(&self) -> std::cell::Ref<'_, Vec<Diagnostic>> {
        self.diagnostics.borrow()
    }

    pub fn into_diagnostics(self) -> Vec<Diagnostic> {
        self.diagnostics.into_inner()
    }
}

/// Compiler entry-point error.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("grammar compilation failed with {} diagnostic(s)", .0.len())]
    Failed(Vec<Diagnostic>),
}

impl CompileError {
    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            CompileError::Failed(d) => d,
        }
    }
}
