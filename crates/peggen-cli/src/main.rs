use std::env::args;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use peggen::pipeline::{analyze, Analysis};
use peggen::{emit, parse_grammar, CompileError, CompileOptions, Diagnostic, Format, Output};

const USAGE: &str = "\
Usage: peggen [options] <grammar.peg>

Options:
  --format <bare|commonjs|esm>   module wrapping of the emitted source
  --output <source|types>        artifact to produce (default: source)
  --param <ident>                build parameter for @if (repeatable)
  --start <rule>                 override the start rule
  --tokenizer                    emit the streaming tokenizer surface
  -o <file>                      write to a file instead of stdout
  --ast                          dump the parsed grammar AST as JSON
  --timings                      report per-phase wall time on stderr
  -h, --help                     show this help
";

fn main() {
    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("error: {:#}", e);
            std::process::exit(1);
        }
    }
}

struct Timer {
    enabled: bool,
}

impl Timer {
    fn run<T>(&self, name: &str, fun: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let result = fun();
        if self.enabled {
            eprintln!("{}\t{:.3?}", name, start.elapsed());
        }
        result
    }
}

fn run() -> Result<bool> {
    let args: Vec<String> = args().skip(1).collect();

    let mut options = CompileOptions::default();
    let mut output = Output::Source;
    let mut out_path: Option<PathBuf> = None;
    let mut dump_ast = false;
    let mut timings = false;
    let mut files: Vec<&str> = Vec::new();

    let mut iter = args.iter().map(String::as_str);
    while let Some(arg) = iter.next() {
        match arg {
            "--format" => {
                options.format = Format::from_str(expect_value(&mut iter, "--format")?)
                    .map_err(anyhow::Error::msg)?;
            }
            "--output" => {
                output = Output::from_str(expect_value(&mut iter, "--output")?)
                    .map_err(anyhow::Error::msg)?;
                if output == Output::Parser {
                    bail!("the in-memory parser artifact is only available through the library");
                }
            }
            "--param" => {
                options
                    .parameters
                    .insert(expect_value(&mut iter, "--param")?.to_string());
            }
            "--start" => {
                options.start_rule = Some(expect_value(&mut iter, "--start")?.to_string());
            }
            "--tokenizer" => options.tokenizer = true,
            "-o" => out_path = Some(PathBuf::from(expect_value(&mut iter, "-o")?)),
            "--ast" => dump_ast = true,
            "--timings" => timings = true,
            "-h" | "--help" => {
                print!("{}", USAGE);
                return Ok(true);
            }
            _ if arg.starts_with('-') => bail!("unknown option {}; try --help", arg),
            _ => files.push(arg),
        }
    }

    let path: PathBuf = match files.as_slice() {
        [one] => one.into(),
        [] => bail!("no grammar file provided; try --help"),
        _ => bail!("only one grammar file may be provided"),
    };

    let source = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read `{}`", path.display()))?;
    let timer = Timer { enabled: timings };

    if dump_ast {
        let grammar = match timer.run("parse", || parse_grammar(&source)) {
            Ok(grammar) => grammar,
            Err(error) => return report_failure(&path, error),
        };
        let json = serde_json::to_string_pretty(&grammar).context("failed to serialize AST")?;
        return write_artifact(out_path.as_deref(), &json);
    }

    let analysis = match timer.run("analyze", || analyze(&source, &options)) {
        Ok(analysis) => analysis,
        Err(error) => return report_failure(&path, error),
    };
    report_diagnostics(&path, &analysis.warnings);

    let rendered = timer.run("emit", || render(&analysis, &options, output));
    write_artifact(out_path.as_deref(), &rendered)
}

fn render(analysis: &Analysis, options: &CompileOptions, output: Output) -> String {
    match output {
        Output::Source => {
            emit::source::render(&analysis.program, options.format, options.tokenizer)
        }
        Output::Types => {
            emit::types::render(&analysis.rule_types, &analysis.program, options.tokenizer)
        }
        Output::Parser => unreachable!("rejected during argument parsing"),
    }
}

fn expect_value<'a>(iter: &mut impl Iterator<Item = &'a str>, flag: &str) -> Result<&'a str> {
    match iter.next() {
        Some(value) => Ok(value),
        None => bail!("{} expects a value", flag),
    }
}

fn report_failure(path: &Path, error: CompileError) -> Result<bool> {
    match &error {
        CompileError::Failed(diagnostics) => report_diagnostics(path, diagnostics),
    }
    Ok(false)
}

fn report_diagnostics(path: &Path, diagnostics: &[Diagnostic]) {
    for d in diagnostics {
        match d.location {
            Some(location) => eprintln!(
                "{}:{}:{} [{}] {}",
                path.display(),
                location.line,
                location.column,
                d.code.as_str(),
                d.message
            ),
            None => eprintln!("{} [{}] {}", path.display(), d.code.as_str(), d.message),
        }
    }
}

fn write_artifact(out_path: Option<&Path>, content: &str) -> Result<bool> {
    match out_path {
        Some(path) => {
            std::fs::write(path, content)
                .with_context(|| format!("failed to write `{}`", path.display()))?;
        }
        None => print!("{}", content),
    }
    Ok(true)
}
