//! peggen — a compiler for a PEG metalanguage.
//!
//! The pipeline parses `.peg` source into a grammar AST, runs the analysis
//! passes (reference checking, annotation processing, left-recursion
//! detection, label analysis, type inference), lowers every rule to
//! bytecode for a stack VM and emits one of three artifacts: a
//! self-contained JavaScript parser, the TypeScript declarations for its
//! results, or an in-process [`peggen_runtime::Parser`] interpreting the
//! same bytecode.

pub mod ast;
pub mod emit;
pub mod error;
pub mod frontend;
pub mod generate;
pub mod passes;
pub mod pipeline;
pub mod span;

pub use error::{Code, CompileError, Diagnostic};
pub use pipeline::{compile, parse_grammar, Artifact, CompileOptions, Format, Output};
