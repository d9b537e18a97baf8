//! TypeScript declaration output: one exported alias per rule from the
//! inferred type strings, plus the parser surface.

use std::fmt::Write;

use peggen_runtime::Program;

use crate::passes::types::alias_name;

pub fn render(rule_types: &[(String, String)], program: &Program, tokenizer: bool) -> String {
    let mut out = String::new();
    out.push_str("// Generated by peggen. Do not edit.\n\n");
    out.push_str(
        "export interface Location {\n  offset: number;\n  line: number;\n  column: number;\n}\n\n",
    );
    out.push_str(
        "export interface LocationRange {\n  start: Location;\n  end: Location;\n}\n\n",
    );
    out.push_str(
        "export interface Expectation {\n  type: string;\n  description: string;\n}\n\n",
    );
    out.push_str("export interface ParseOptions {\n  startRule?: string;\n}\n\n");

    let mut aliases = Vec::new();
    for (i, (name, ty)) in rule_types.iter().enumerate() {
        let mut alias = alias_name(name);
        // rules whose names collapse to the same alias get a suffix
        if aliases.contains(&alias) {
            alias = format!("{}{}", alias, i);
        }
        writeln!(out, "export type {} = {};", alias, ty).unwrap();
        aliases.push(alias);
    }
    out.push('\n');

    let start_alias = aliases
        .get(program.start as usize)
        .cloned()
        .unwrap_or_else(|| "unknown".to_string());

    out.push_str("export declare class SyntaxError extends Error {\n");
    out.push_str("  readonly name: \"PegSyntaxError\";\n");
    out.push_str("  expected: Expectation[];\n");
    out.push_str("  found: string | null;\n");
    out.push_str("  location: LocationRange;\n");
    out.push_str("}\n\n");
    writeln!(
        out,
        "export declare function parse(input: string, options?: ParseOptions): {};",
        start_alias
    )
    .unwrap();

    if tokenizer {
        out.push('\n');
        out.push_str(
            "export interface Token {\n  type: string;\n  text: string;\n  location: LocationRange;\n}\n\n",
        );
        out.push_str(
            "export declare function tokenize(input: string): IterableIterator<Token>;\n",
        );
    }
    out
}

#[test]
fn test_types_render_aliases_and_parse() {
    use peggen_runtime::Program;
    let program = Program {
        rules: vec![],
        start: 0,
        literals: vec![],
        classes: vec![],
        expectations: vec![],
        functions: vec![],
        tokens: vec![],
        ws_rule: None,
        initializer: None,
    };
    let rendered = render(
        &[
            ("start".into(), "[string, Item | null]".into()),
            ("item".into(), "string".into()),
        ],
        &program,
        false,
    );
    assert!(rendered.contains("export type Start = [string, Item | null];"));
    assert!(rendered.contains("export type Item = string;"));
    assert!(rendered.contains("parse(input: string, options?: ParseOptions): Start;"));
    assert!(!rendered.contains("tokenize"));
}
