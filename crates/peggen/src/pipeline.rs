//! The compiler pipeline: bootstrap parse, the fixed pass order, bytecode
//! generation and artifact emission. A pass that reports a fatal
//! diagnostic finishes collecting, then aborts the pipeline.

use std::collections::BTreeSet;

use peggen_runtime::{Parser, Program};

use crate::error::{Code, CompileError, Diagnostic, ErrorAccumulator};
use crate::passes::{annotations, check, labels, recursion, types};
use crate::span::LineMap;
use crate::{emit, frontend, generate};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Format {
    #[default]
    Bare,
    CommonJs,
    Esm,
}

impl std::str::FromStr for Format {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bare" => Ok(Format::Bare),
            "commonjs" => Ok(Format::CommonJs),
            "esm" => Ok(Format::Esm),
            other => Err(format!("unknown format \"{}\"", other)),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Output {
    #[default]
    Source,
    Types,
    Parser,
}

impl std::str::FromStr for Output {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "source" => Ok(Output::Source),
            "types" => Ok(Output::Types),
            "parser" => Ok(Output::Parser),
            other => Err(format!("unknown output \"{}\"", other)),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct CompileOptions {
    /// Identifiers visible to `@if` annotations.
    pub parameters: BTreeSet<String>,
    /// Emit the streaming tokenizer surface alongside `parse`.
    pub tokenizer: bool,
    /// Module wrapping of the emitted source.
    pub format: Format,
    /// Start rule override; the first rule otherwise.
    pub start_rule: Option<String>,
}

#[derive(Debug)]
pub enum Artifact {
    Source(String),
    Types(String),
    Parser(Parser),
}

/// Everything the emitters need, produced by a full analysis run.
pub struct Analysis {
    pub program: Program,
    /// `(rule name, inferred type)` in rule order.
    pub rule_types: Vec<(String, String)>,
    pub warnings: Vec<Diagnostic>,
}

/// Compile a grammar to the requested artifact. Warnings are returned
/// alongside; fatal diagnostics abort with `CompileError::Failed`.
pub fn compile(
    source: &str,
    options: &CompileOptions,
    output: Output,
) -> Result<(Artifact, Vec<Diagnostic>), CompileError> {
    let analysis = analyze(source, options)?;
    let artifact = match output {
        Output::Source => Artifact::Source(emit::source::render(
            &analysis.program,
            options.format,
            options.tokenizer,
        )),
        Output::Types => Artifact::Types(emit::types::render(
            &analysis.rule_types,
            &analysis.program,
            options.tokenizer,
        )),
        Output::Parser => Artifact::Parser(Parser::new(analysis.program)),
    };
    Ok((artifact, analysis.warnings))
}

/// Bootstrap-parse only; the `--ast` surface.
pub fn parse_grammar(source: &str) -> Result<crate::ast::Grammar, CompileError> {
    let err = ErrorAccumulator::new();
    let grammar = frontend::parse(source, &err);
    if err.has_fatal() {
        return Err(fail(source, err));
    }
    Ok(grammar)
}

pub fn analyze(source: &str, options: &CompileOptions) -> Result<Analysis, CompileError> {
    let err = ErrorAccumulator::new();

    let mut grammar = frontend::parse(source, &err);
    if err.has_fatal() {
        return Err(fail(source, err));
    }

    check::run(&mut grammar, &err);
    if err.has_fatal() {
        return Err(fail(source, err));
    }

    let (grammar, outcome) = annotations::run(grammar, &options.parameters, &err);
    if err.has_fatal() {
        return Err(fail(source, err));
    }

    recursion::run(&grammar, &err);
    if err.has_fatal() {
        return Err(fail(source, err));
    }

    let start = match &options.start_rule {
        None => grammar.start_rule().expect("non-empty grammar has a start"),
        Some(name) => match grammar.rule_by_name(name) {
            Some(handle) => handle,
            None => {
                err.report(
                    Code::UndefinedRule,
                    crate::span::Span::empty(),
                    format!("Start rule \"{}\" is not defined", name),
                );
                return Err(fail(source, err));
            }
        },
    };

    let label_info = labels::run(&grammar);
    let type_info = types::run(&grammar, &outcome.type_overrides, &label_info);
    let program = generate::run(&grammar, &outcome, &label_info, start);

    let rule_types = grammar
        .rules
        .iter()
        .map(|(handle, rule)| {
            (
                rule.name.value.clone(),
                type_info.rules[&handle].clone(),
            )
        })
        .collect();

    let linemap = LineMap::new(source);
    let warnings = err
        .into_diagnostics()
        .into_iter()
        .map(|d| locate(d, source, &linemap))
        .collect();

    Ok(Analysis {
        program,
        rule_types,
        warnings,
    })
}

fn locate(mut diagnostic: Diagnostic, source: &str, linemap: &LineMap) -> Diagnostic {
    diagnostic.location = Some(linemap.location(source, diagnostic.span.start()));
    diagnostic
}

fn fail(source: &str, err: ErrorAccumulator) -> CompileError {
    let linemap = LineMap::new(source);
    CompileError::Failed(
        err.into_diagnostics()
            .into_iter()
            .map(|d| locate(d, source, &linemap))
            .collect(),
    )
}

#[cfg(test)]
use peggen_runtime::{ActionCx, ActionHost, Expectation, HostAbort, UserCode, Value};

/// Test host: dispatches on the code block text the way an embedder would
/// dispatch on function indices.
#[cfg(test)]
#[derive(Default)]
struct ScriptedHost {
    rollbacks: Vec<u32>,
}

#[cfg(test)]
impl ActionHost for ScriptedHost {
    fn run(
        &mut self,
        cx: &mut ActionCx<'_>,
        _index: usize,
        code: &UserCode,
        args: &[Value],
    ) -> Result<Value, HostAbort> {
        let body = code.body.trim();
        if body.contains("parseInt") {
            let Value::Array(digits) = &args[0] else {
                panic!("expected an array argument, got {:?}", args);
            };
            let joined: String = digits
                .iter()
                .map(|d| match d {
                    Value::Str(s) => s.as_str(),
                    other => panic!("expected digit strings, got {:?}", other),
                })
                .collect();
            Ok(Value::Number(joined.parse().unwrap()))
        } else if body.contains("text()") {
            Ok(Value::Str(cx.text().to_string()))
        } else if body.contains("onRollback") {
            cx.on_rollback(7);
            Ok(Value::Number(1.0))
        } else if body.contains("error(") {
            Err(cx.error("boom"))
        } else {
            Ok(cx.matched().clone())
        }
    }

    fn rollback(&mut self, token: u32) {
        self.rollbacks.push(token);
    }
}

#[cfg(test)]
fn parser_for(src: &str) -> Parser {
    match compile(src, &CompileOptions::default(), Output::Parser) {
        Ok((Artifact::Parser(parser), warnings)) => {
            assert!(warnings.is_empty(), "warnings: {:?}", warnings);
            parser
        }
        Ok(_) => unreachable!(),
        Err(error) => panic!("compilation failed: {:?}", error.diagnostics()),
    }
}

#[test]
fn test_scenario_single_literal() {
    let parser = parser_for(r#"start = "a""#);
    assert_eq!(parser.parse("a").unwrap(), Value::Str("a".into()));
}

#[test]
fn test_scenario_sequence_and_eof_failure() {
    let parser = parser_for(r#"start = "a" "b""#);
    assert_eq!(
        parser.parse("ab").unwrap(),
        Value::Array(vec![Value::Str("a".into()), Value::Str("b".into())])
    );
    let err = parser.parse("a").unwrap_err();
    assert_eq!(err.start.offset, 1);
    assert_eq!(err.found, None);
    assert_eq!(err.expected, vec![Expectation::Literal("b".into())]);
    assert_eq!(err.message, "Expected \"b\" but end of input found.");
}

#[test]
fn test_scenario_action_parses_number() {
    let parser = parser_for(r#"start = n:([0-9]+) { return parseInt(n.join(""), 10); }"#);
    let mut host = ScriptedHost::default();
    assert_eq!(
        parser.parse_with("042", &mut host).unwrap(),
        Value::Number(42.0)
    );
}

#[test]
fn test_scenario_repetition_merges_expectations() {
    let parser = parser_for(r#"start = "a"* "b""#);
    assert_eq!(
        parser.parse("aaab").unwrap(),
        Value::Array(vec![
            Value::Array(vec![
                Value::Str("a".into()),
                Value::Str("a".into()),
                Value::Str("a".into()),
            ]),
            Value::Str("b".into()),
        ])
    );
    let err = parser.parse("aaac").unwrap_err();
    assert_eq!(err.start.offset, 3);
    assert_eq!(err.found, Some('c'));
    assert_eq!(
        err.expected,
        vec![
            Expectation::Literal("a".into()),
            Expectation::Literal("b".into()),
        ]
    );
}

#[test]
fn test_scenario_negative_lookahead() {
    let parser = parser_for(r#"start = !"x" ."#);
    assert_eq!(parser.parse("y").unwrap(), Value::Str("y".into()));
    let err = parser.parse("x").unwrap_err();
    assert_eq!(err.start.offset, 0);
}

#[test]
fn test_scenario_separated_list() {
    let parser =
        parser_for("start = @separator(expr: \",\") id+ ;\nid = [a-z]+ { return text(); }");
    let mut host = ScriptedHost::default();
    assert_eq!(
        parser.parse_with("a,bc,d", &mut host).unwrap(),
        Value::Array(vec![
            Value::Str("a".into()),
            Value::Str("bc".into()),
            Value::Str("d".into()),
        ])
    );
    // the dangling separator rolls back; the farthest failure is the
    // missing item after it
    let err = parser.parse_with("a,", &mut host).unwrap_err();
    assert_eq!(err.start.offset, 2);
}

#[test]
fn test_choice_commits_to_first_success() {
    let parser = parser_for(r#"start = "a" / "ab""#);
    assert_eq!(parser.parse("a").unwrap(), Value::Str("a".into()));
    // ordered choice: "a" wins, the trailing input is a parse error
    let err = parser.parse("ab").unwrap_err();
    assert_eq!(err.start.offset, 1);
    assert_eq!(err.expected, vec![Expectation::End]);
}

#[test]
fn test_positive_lookahead_consumes_nothing() {
    let parser = parser_for(r#"start = &"ab" $(. .)"#);
    assert_eq!(parser.parse("ab").unwrap(), Value::Str("ab".into()));
}

#[test]
fn test_scope_rollback_fires_on_failure() {
    let parser = parser_for(r#"start = (#(d){ onRollback(free); return 1; } "x") / "y""#);
    let mut host = ScriptedHost::default();
    assert_eq!(
        parser.parse_with("y", &mut host).unwrap(),
        Value::Str("y".into())
    );
    assert_eq!(host.rollbacks, vec![7]);

    let mut host = ScriptedHost::default();
    assert_eq!(
        parser.parse_with("x", &mut host).unwrap(),
        Value::Str("x".into())
    );
    assert!(host.rollbacks.is_empty());
}

#[test]
fn test_user_error_aborts_parse() {
    let parser = parser_for(r#"start = "a" { error("boom"); }"#);
    let mut host = ScriptedHost::default();
    let err = parser.parse_with("a", &mut host).unwrap_err();
    assert_eq!(err.message, "boom");
    assert_eq!(err.name(), "PegSyntaxError");
}

#[test]
fn test_tokenizer_streams_tokens() {
    let src = "start = (num / name)*\n\
               @token(type: \"Num\")\n\
               num = [0-9]+\n\
               @token(type: \"Name\")\n\
               name = [a-z]+\n\
               ws = \" \"*";
    let parser = parser_for(src);
    let tokens: Vec<_> = parser
        .tokens("ab 12")
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let summary: Vec<(&str, &str)> = tokens
        .iter()
        .map(|t| (t.token_type.as_str(), t.text.as_str()))
        .collect();
    assert_eq!(summary, vec![("Name", "ab"), ("Num", "12")]);
}

#[test]
fn test_meta_grammar_compiles_clean() {
    let src = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/../../demos/peg.peg"));
    let analysis = analyze(src, &CompileOptions::default()).expect("meta grammar compiles");
    assert!(analysis.warnings.is_empty(), "{:?}", analysis.warnings);
    assert!(analysis.program.rules.len() > 20);
    let grammar = parse_grammar(src).unwrap();
    assert_eq!(
        grammar.rules.values().next().unwrap().name.value,
        "grammar"
    );
}

#[test]
fn test_compile_reports_all_reference_errors() {
    let err = compile(
        "start = missing other\nother = also_missing",
        &CompileOptions::default(),
        Output::Source,
    )
    .unwrap_err();
    let undefined = err
        .diagnostics()
        .iter()
        .filter(|d| d.code == Code::UndefinedRule)
        .count();
    assert_eq!(undefined, 2);
    assert!(err.diagnostics().iter().all(|d| d.location.is_some()));
}

#[test]
fn test_start_rule_override() {
    let options = CompileOptions {
        start_rule: Some("item".to_string()),
        ..Default::default()
    };
    let (artifact, _) = compile("start = item \",\" item\nitem = [a-z]+", &options, Output::Parser)
        .unwrap();
    let Artifact::Parser(parser) = artifact else {
        unreachable!();
    };
    assert_eq!(
        parser.parse("ab").unwrap(),
        Value::Array(vec![Value::Str("a".into()), Value::Str("b".into())])
    );
}
