//! JavaScript source emission. The emitted parser carries the constants
//! tables and bytecode verbatim, a compact mirror of the runtime VM, and
//! the user code blocks as closures over the parse-state helpers
//! (`text`, `location`, `error`, `expected`, `onRollback`). The three
//! module formats differ only in preamble and export lines.

use std::fmt::Write;

use peggen_runtime::{ClassPart, Expectation, Op, Program, UserCode};

use super::js_string;
use crate::pipeline::Format;

pub fn render(program: &Program, format: Format, tokenizer: bool) -> String {
    let module = render_module(program, tokenizer);
    let mut out = String::new();
    out.push_str("// Generated by peggen. Do not edit.\n");
    match format {
        Format::Bare => {
            out.push_str(&module);
            out.push('\n');
        }
        Format::CommonJs => {
            out.push_str("\"use strict\";\n\n");
            out.push_str("module.exports = ");
            out.push_str(&module);
            out.push_str(";\n");
        }
        Format::Esm => {
            out.push_str("const peg$module = ");
            out.push_str(&module);
            out.push_str(";\n\n");
            out.push_str("export const SyntaxError = peg$module.SyntaxError;\n");
            out.push_str("export const parse = peg$module.parse;\n");
            if tokenizer {
                out.push_str("export const tokenize = peg$module.tokenize;\n");
            }
            out.push_str("export default peg$module;\n");
        }
    }
    out
}

fn render_module(program: &Program, tokenizer: bool) -> String {
    let mut out = String::new();
    out.push_str("(function() {\n  \"use strict\";\n\n");
    render_tables(program, &mut out);
    render_opcodes(&mut out);
    render_support(&mut out);
    render_machine(program, &mut out);
    render_parse(&mut out);
    if tokenizer {
        render_tokenize(&mut out);
    }
    out.push_str("  return {\n    SyntaxError: peg$SyntaxError,\n    parse: peg$parse");
    if tokenizer {
        out.push_str(",\n    tokenize: peg$tokenize");
    }
    out.push_str("\n  };\n})()");
    out
}

fn render_tables(program: &Program, out: &mut String) {
    out.push_str("  var peg$literals = [");
    for (i, literal) in program.literals.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&js_string(literal));
    }
    out.push_str("];\n");

    out.push_str("  var peg$classes = [");
    for (i, class) in program.classes.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str("[[");
        for (j, part) in class.parts.iter().enumerate() {
            if j > 0 {
                out.push_str(", ");
            }
            let (lo, hi) = match *part {
                ClassPart::Single(c) => (c, c),
                ClassPart::Range(lo, hi) => (lo, hi),
            };
            write!(
                out,
                "[{}, {}]",
                js_string(&lo.to_string()),
                js_string(&hi.to_string())
            )
            .unwrap();
        }
        write!(out, "], {}, {}]", class.inverted, class.ignore_case).unwrap();
    }
    out.push_str("];\n");

    out.push_str("  var peg$expected = [");
    for (i, expectation) in program.expectations.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        match expectation {
            Expectation::Literal(text) => {
                write!(out, "{{ type: \"literal\", text: {} }}", js_string(text)).unwrap()
            }
            Expectation::Class(text) => {
                write!(out, "{{ type: \"class\", text: {} }}", js_string(text)).unwrap()
            }
            Expectation::Any => out.push_str("{ type: \"any\" }"),
            Expectation::End => out.push_str("{ type: \"end\" }"),
            Expectation::Other(description) => write!(
                out,
                "{{ type: \"other\", description: {} }}",
                js_string(description)
            )
            .unwrap(),
        }
    }
    out.push_str("];\n");

    out.push_str("  var peg$bytecode = [\n");
    for rule in &program.rules {
        out.push_str("    [");
        for (i, word) in rule.code.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            write!(out, "{}", word).unwrap();
        }
        out.push_str("],\n");
    }
    out.push_str("  ];\n");

    out.push_str("  var peg$ruleNames = [");
    for (i, rule) in program.rules.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&js_string(&rule.name));
    }
    out.push_str("];\n");

    writeln!(out, "  var peg$startRule = {};", program.start).unwrap();

    out.push_str("  var peg$tokenRules = [");
    for (i, token) in program.tokens.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write!(out, "[{}, {}]", token.rule, js_string(&token.token_type)).unwrap();
    }
    out.push_str("];\n");

    match program.ws_rule {
        Some(rule) => writeln!(out, "  var peg$wsRule = {};", rule).unwrap(),
        None => out.push_str("  var peg$wsRule = -1;\n"),
    }
    out.push('\n');
}

fn render_opcodes(out: &mut String) {
    let ops: &[(&str, Op)] = &[
        ("PUSH_CURR_POS", Op::PushCurrPos),
        ("POP", Op::Pop),
        ("POP_CURR_POS", Op::PopCurrPos),
        ("POP_N", Op::PopN),
        ("NIP", Op::Nip),
        ("PUSH_EMPTY_ARRAY", Op::PushEmptyArray),
        ("PUSH_UNDEFINED", Op::PushUndefined),
        ("PUSH_NULL", Op::PushNull),
        ("PUSH_FAILED", Op::PushFailed),
        ("LOAD", Op::Load),
        ("APPEND", Op::Append),
        ("WRAP", Op::Wrap),
        ("TEXT", Op::Text),
        ("PLUCK", Op::Pluck),
        ("MATCH_STRING", Op::MatchString),
        ("MATCH_STRING_IC", Op::MatchStringIc),
        ("MATCH_CLASS", Op::MatchClass),
        ("MATCH_ANY", Op::MatchAny),
        ("MATCH_END", Op::MatchEnd),
        ("ACCEPT_N", Op::AcceptN),
        ("ACCEPT_STRING", Op::AcceptString),
        ("FAIL", Op::Fail),
        ("IF", Op::If),
        ("IF_NOT", Op::IfNot),
        ("IF_ERROR", Op::IfError),
        ("IF_NOT_ERROR", Op::IfNotError),
        ("IF_ARRLEN_MIN", Op::IfArrlenMin),
        ("WHILE_NOT_ERROR", Op::WhileNotError),
        ("CALL", Op::Call),
        ("SILENT_FAILS_ON", Op::SilentFailsOn),
        ("SILENT_FAILS_OFF", Op::SilentFailsOff),
        ("EXECUTE", Op::Execute),
        ("EXECUTE_SCOPE", Op::ExecuteScope),
        ("ROLLBACK_DROP", Op::RollbackDrop),
        ("ROLLBACK_FIRE", Op::RollbackFire),
    ];
    out.push_str("  var peg$op = {\n");
    for (name, op) in ops {
        writeln!(out, "    {}: {},", name, *op as u32).unwrap();
    }
    out.push_str("  };\n\n");
}

fn render_support(out: &mut String) {
    out.push_str(
        r#"  var peg$FAILED = {};

  function peg$describe(expectation) {
    switch (expectation.type) {
      case "literal": return "\"" + expectation.text + "\"";
      case "class": return expectation.text;
      case "any": return "any character";
      case "end": return "end of input";
      default: return expectation.description;
    }
  }

  function peg$buildMessage(expected, found) {
    var descriptions = [];
    for (var i = 0; i < expected.length; i++) {
      var d = peg$describe(expected[i]);
      if (descriptions.indexOf(d) < 0) { descriptions.push(d); }
    }
    var list = descriptions.length === 0 ? "nothing"
      : descriptions.length === 1 ? descriptions[0]
      : descriptions.slice(0, -1).join(", ") + " or " + descriptions[descriptions.length - 1];
    return "Expected " + list + " but " + (found ? "\"" + found + "\"" : "end of input") + " found.";
  }

  function peg$SyntaxError(message, expected, found, location) {
    var self = new Error(message);
    if (Object.setPrototypeOf) { Object.setPrototypeOf(self, peg$SyntaxError.prototype); }
    self.expected = expected;
    self.found = found;
    self.location = location;
    return self;
  }
  peg$SyntaxError.prototype = Object.create(Error.prototype);
  peg$SyntaxError.prototype.constructor = peg$SyntaxError;
  peg$SyntaxError.prototype.name = "PegSyntaxError";

  function peg$charAt(input, pos) {
    if (pos >= input.length) { return ""; }
    return input.codePointAt(pos) > 0xffff ? input.substr(pos, 2) : input.charAt(pos);
  }

  function peg$classMatches(cls, ch) {
    var candidates = cls[2] ? [ch, ch.toLowerCase(), ch.toUpperCase()] : [ch];
    var hit = false;
    for (var i = 0; i < cls[0].length && !hit; i++) {
      for (var j = 0; j < candidates.length; j++) {
        if (cls[0][i][0] <= candidates[j] && candidates[j] <= cls[0][i][1]) { hit = true; break; }
      }
    }
    return hit !== cls[1];
  }

"#,
    );
}

fn render_machine(program: &Program, out: &mut String) {
    out.push_str(
        r#"  function peg$machine(input) {
    var peg$currPos = 0;
    var peg$savedPos = 0;
    var peg$silentFails = 0;
    var peg$maxFailPos = 0;
    var peg$maxFailExpected = [];
    var peg$failCache = {};
    var peg$failCacheSize = 0;
    var peg$rollbackFrames = [];

    function text() { return input.substring(peg$savedPos, peg$currPos); }
    function offset() { return peg$savedPos; }
    function range() { return { start: peg$savedPos, end: peg$currPos }; }
    function location() { return peg$computeLocation(peg$savedPos, peg$currPos); }

    function expected(description, loc) {
      loc = loc !== undefined ? loc : peg$computeLocation(peg$savedPos, peg$currPos);
      var exp = [{ type: "other", description: description }];
      var found = peg$charAt(input, peg$savedPos) || null;
      throw new peg$SyntaxError(peg$buildMessage(exp, found), exp, found, loc);
    }

    function error(message, loc) {
      loc = loc !== undefined ? loc : peg$computeLocation(peg$savedPos, peg$currPos);
      throw new peg$SyntaxError(message, [], null, loc);
    }

    function onRollback(hook) {
      if (peg$rollbackFrames.length > 0) {
        peg$rollbackFrames[peg$rollbackFrames.length - 1].push(hook);
      }
    }

"#,
    );

    if let Some(initializer) = &program.initializer {
        out.push_str("    // grammar initializer\n");
        out.push_str(initializer);
        out.push_str("\n\n");
    }

    render_functions(&program.functions, out);

    out.push_str(
        r#"    function peg$computePosDetails(pos) {
      var line = 1;
      var column = 1;
      for (var i = 0; i < pos; i++) {
        if (input.charAt(i) === "\n") { line++; column = 1; } else { column++; }
      }
      return { line: line, column: column };
    }

    function peg$computeLocation(start, end) {
      var s = peg$computePosDetails(start);
      var e = peg$computePosDetails(end);
      return {
        start: { offset: start, line: s.line, column: s.column },
        end: { offset: end, line: e.line, column: e.column }
      };
    }

    function peg$fail(index) {
      if (peg$silentFails > 0) { return; }
      if (peg$currPos > peg$maxFailPos) {
        peg$maxFailPos = peg$currPos;
        peg$maxFailExpected = [];
      }
      if (peg$currPos === peg$maxFailPos) {
        peg$maxFailExpected.push(peg$expected[index]);
      }
    }

    function peg$truthy(value) {
      return value !== peg$FAILED && !!value;
    }

    function peg$callRule(index) {
      var key = index + "@" + peg$currPos;
      if (peg$failCache[key]) { return peg$FAILED; }
      var stack = [];
      peg$run(peg$bytecode[index], stack);
      var result = stack.pop();
      if (result === peg$FAILED && peg$silentFails === 0 && peg$failCacheSize < 65536) {
        peg$failCache[key] = true;
        peg$failCacheSize++;
      }
      return result;
    }

    function peg$run(code, stack) {
      var ip = 0;
      while (ip < code.length) {
        var op = code[ip++];
        var n, k, t, e, argc, cond, value, ret, frame, args, i;
        switch (op) {
          case peg$op.PUSH_CURR_POS: stack.push(peg$currPos); break;
          case peg$op.POP: stack.pop(); break;
          case peg$op.POP_CURR_POS: peg$currPos = stack.pop(); break;
          case peg$op.POP_N: stack.length -= code[ip++]; break;
          case peg$op.NIP:
            n = code[ip++];
            value = stack.pop();
            stack.length -= n;
            stack.push(value);
            break;
          case peg$op.PUSH_EMPTY_ARRAY: stack.push([]); break;
          case peg$op.PUSH_UNDEFINED: stack.push(undefined); break;
          case peg$op.PUSH_NULL: stack.push(null); break;
          case peg$op.PUSH_FAILED: stack.push(peg$FAILED); break;
          case peg$op.LOAD: stack.push(peg$literals[code[ip++]]); break;
          case peg$op.APPEND:
            value = stack.pop();
            stack[stack.length - 1].push(value);
            break;
          case peg$op.WRAP:
            n = code[ip++];
            stack.push(stack.splice(stack.length - n, n));
            break;
          case peg$op.TEXT:
            value = stack.pop();
            stack.push(input.substring(value, peg$currPos));
            break;
          case peg$op.PLUCK:
            n = code[ip++];
            k = code[ip++];
            args = [];
            for (i = 0; i < k; i++) { args.push(stack[stack.length - 1 - code[ip++]]); }
            stack.length -= n;
            stack.push(k === 1 ? args[0] : args);
            break;
          case peg$op.MATCH_STRING:
            value = peg$literals[code[ip++]];
            stack.push(input.substr(peg$currPos, value.length) === value);
            break;
          case peg$op.MATCH_STRING_IC:
            value = peg$literals[code[ip++]];
            stack.push(input.substr(peg$currPos, value.length).toLowerCase() === value.toLowerCase());
            break;
          case peg$op.MATCH_CLASS:
            value = peg$charAt(input, peg$currPos);
            stack.push(value !== "" && peg$classMatches(peg$classes[code[ip++]], value));
            break;
          case peg$op.MATCH_ANY: stack.push(peg$currPos < input.length); break;
          case peg$op.MATCH_END: stack.push(peg$currPos === input.length); break;
          case peg$op.ACCEPT_N:
            n = code[ip++];
            value = peg$currPos;
            for (i = 0; i < n; i++) {
              peg$currPos += input.codePointAt(peg$currPos) > 0xffff ? 2 : 1;
            }
            stack.push(input.substring(value, peg$currPos));
            break;
          case peg$op.ACCEPT_STRING:
            value = peg$literals[code[ip++]];
            stack.push(value);
            peg$currPos += value.length;
            break;
          case peg$op.FAIL:
            peg$fail(code[ip++]);
            stack.push(peg$FAILED);
            break;
          case peg$op.IF:
          case peg$op.IF_NOT:
            t = code[ip++];
            e = code[ip++];
            cond = peg$truthy(stack.pop());
            if (op === peg$op.IF_NOT) { cond = !cond; }
            peg$run(cond ? code.slice(ip, ip + t) : code.slice(ip + t, ip + t + e), stack);
            ip += t + e;
            break;
          case peg$op.IF_ERROR:
          case peg$op.IF_NOT_ERROR:
            t = code[ip++];
            e = code[ip++];
            cond = stack[stack.length - 1] === peg$FAILED;
            if (op === peg$op.IF_NOT_ERROR) { cond = !cond; }
            peg$run(cond ? code.slice(ip, ip + t) : code.slice(ip + t, ip + t + e), stack);
            ip += t + e;
            break;
          case peg$op.IF_ARRLEN_MIN:
            n = code[ip++];
            t = code[ip++];
            e = code[ip++];
            value = stack[stack.length - 1];
            cond = Array.isArray(value) && value.length >= n;
            peg$run(cond ? code.slice(ip, ip + t) : code.slice(ip + t, ip + t + e), stack);
            ip += t + e;
            break;
          case peg$op.WHILE_NOT_ERROR:
            n = code[ip++];
            value = code.slice(ip, ip + n);
            ip += n;
            while (stack[stack.length - 1] !== peg$FAILED) { peg$run(value, stack); }
            break;
          case peg$op.CALL: stack.push(peg$callRule(code[ip++])); break;
          case peg$op.SILENT_FAILS_ON: peg$silentFails++; break;
          case peg$op.SILENT_FAILS_OFF: peg$silentFails--; break;
          case peg$op.EXECUTE:
            k = code[ip++];
            n = code[ip++];
            argc = code[ip++];
            args = [];
            for (i = 0; i < argc; i++) { args.push(stack[stack.length - 1 - code[ip++]]); }
            value = peg$savedPos;
            peg$savedPos = n > 0 ? stack[stack.length - 1 - n] : peg$currPos;
            ret = peg$functions[k].apply(null, args);
            peg$savedPos = value;
            stack.length -= n;
            stack.push(ret);
            break;
          case peg$op.EXECUTE_SCOPE:
            k = code[ip++];
            n = code[ip++];
            argc = code[ip++];
            args = [];
            for (i = 0; i < argc; i++) { args.push(stack[stack.length - 1 - code[ip++]]); }
            peg$rollbackFrames.push([]);
            value = peg$savedPos;
            peg$savedPos = peg$currPos;
            ret = peg$functions[k].apply(null, args);
            peg$savedPos = value;
            if (n === 1) {
              stack.push(ret);
            } else {
              for (i = 0; i < n; i++) { stack.push(ret[i]); }
            }
            break;
          case peg$op.ROLLBACK_DROP: peg$rollbackFrames.pop(); break;
          case peg$op.ROLLBACK_FIRE:
            frame = peg$rollbackFrames.pop();
            for (i = frame.length - 1; i >= 0; i--) { frame[i](); }
            break;
        }
      }
    }

    function peg$buildError() {
      var pos = peg$maxFailPos;
      var found = pos < input.length ? peg$charAt(input, pos) : null;
      return new peg$SyntaxError(
        peg$buildMessage(peg$maxFailExpected, found),
        peg$maxFailExpected,
        found,
        peg$computeLocation(pos, found ? pos + found.length : pos)
      );
    }

    return {
      FAILED: peg$FAILED,
      callRule: peg$callRule,
      getPos: function() { return peg$currPos; },
      setPos: function(pos) { peg$currPos = pos; },
      silent: function(delta) { peg$silentFails += delta; },
      registerEndFail: function() {
        if (peg$currPos > peg$maxFailPos) {
          peg$maxFailPos = peg$currPos;
          peg$maxFailExpected = [];
        }
        if (peg$currPos === peg$maxFailPos) {
          peg$maxFailExpected.push({ type: "end" });
        }
      },
      buildError: peg$buildError,
      computeLocation: peg$computeLocation
    };
  }

"#,
    );
}

fn render_functions(functions: &[UserCode], out: &mut String) {
    out.push_str("    var peg$functions = [\n");
    for function in functions {
        write!(out, "      function({}) {{", function.params.join(", ")).unwrap();
        out.push_str(&function.body);
        out.push_str("},\n");
    }
    out.push_str("    ];\n\n");
}

fn render_parse(out: &mut String) {
    out.push_str(
        r#"  function peg$parse(input, options) {
    options = options !== undefined ? options : {};
    var m = peg$machine(input);
    var startIndex = peg$startRule;
    if (options.startRule !== undefined) {
      startIndex = peg$ruleNames.indexOf(options.startRule);
      if (startIndex < 0) {
        throw new Error("Can't start parsing from rule \"" + options.startRule + "\".");
      }
    }
    var result = m.callRule(startIndex);
    if (result !== m.FAILED && m.getPos() === input.length) { return result; }
    if (result !== m.FAILED) { m.registerEndFail(); }
    throw m.buildError();
  }

"#,
    );
}

fn render_tokenize(out: &mut String) {
    out.push_str(
        r#"  function peg$tokenize(input) {
    var m = peg$machine(input);
    var pos = 0;
    var done = peg$tokenRules.length === 0;
    var iterator = {
      next: function() {
        if (done) { return { done: true, value: undefined }; }
        if (peg$wsRule >= 0) {
          m.silent(1);
          m.setPos(pos);
          var ws = m.callRule(peg$wsRule);
          m.silent(-1);
          if (ws !== m.FAILED) { pos = m.getPos(); }
        }
        if (pos >= input.length) { done = true; return { done: true, value: undefined }; }
        for (var i = 0; i < peg$tokenRules.length; i++) {
          m.setPos(pos);
          var result = m.callRule(peg$tokenRules[i][0]);
          if (result !== m.FAILED && m.getPos() > pos) {
            var token = {
              type: peg$tokenRules[i][1],
              text: input.substring(pos, m.getPos()),
              location: m.computeLocation(pos, m.getPos())
            };
            pos = m.getPos();
            return { done: false, value: token };
          }
        }
        done = true;
        throw m.buildError();
      }
    };
    if (typeof Symbol !== "undefined" && Symbol.iterator) {
      iterator[Symbol.iterator] = function() { return iterator; };
    }
    return iterator;
  }

"#,
    );
}

#[cfg(test)]
use crate::pipeline::{compile, Artifact, CompileOptions, Output};

#[cfg(test)]
fn source_for(src: &str, options: &CompileOptions) -> String {
    let (artifact, warnings) = compile(src, options, Output::Source).unwrap();
    assert!(warnings.is_empty(), "warnings: {:?}", warnings);
    match artifact {
        Artifact::Source(source) => source,
        _ => unreachable!(),
    }
}

#[test]
fn test_bare_source_is_self_contained_expression() {
    let source = source_for(r#"start = "a" "b""#, &CompileOptions::default());
    assert!(source.starts_with("// Generated by peggen"));
    assert!(source.contains("(function() {"));
    assert!(source.contains("peg$SyntaxError.prototype.name = \"PegSyntaxError\";"));
    assert!(source.contains("var peg$bytecode"));
    assert!(!source.contains("module.exports"));
    assert!(!source.contains("export default"));
}

#[test]
fn test_module_formats_differ_only_in_wrapping() {
    let src = r#"start = n:[0-9]+ { return n; }"#;
    let bare = source_for(src, &CompileOptions::default());
    let cjs = source_for(
        src,
        &CompileOptions {
            format: crate::pipeline::Format::CommonJs,
            ..Default::default()
        },
    );
    let esm = source_for(
        src,
        &CompileOptions {
            format: crate::pipeline::Format::Esm,
            ..Default::default()
        },
    );
    assert!(cjs.contains("module.exports = (function() {"));
    assert!(esm.contains("export const parse = peg$module.parse;"));
    let body = bare
        .trim_start_matches("// Generated by peggen. Do not edit.\n")
        .trim_end();
    assert!(cjs.contains(body));
    assert!(esm.contains(body));
}

#[test]
fn test_action_closure_uses_manifest_params() {
    let source = source_for(
        r#"start = n:[0-9]+ { return parseInt(n.join(""), 10); }"#,
        &CompileOptions::default(),
    );
    assert!(source.contains("function(n) { return parseInt(n.join(\"\"), 10); }"));
}

#[test]
fn test_tokenizer_surface_emitted_on_request() {
    let src = "start = num+\n@token(type: \"Num\")\nnum = [0-9]+\nws = \" \"*";
    let plain = source_for(src, &CompileOptions::default());
    let tokenizing = source_for(
        src,
        &CompileOptions {
            tokenizer: true,
            ..Default::default()
        },
    );
    assert!(!plain.contains("peg$tokenize"));
    assert!(tokenizing.contains("tokenize: peg$tokenize"));
    assert!(tokenizing.contains("var peg$tokenRules = [[1, \"Num\"]];"));
}

#[test]
fn test_emission_is_deterministic() {
    let src = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/../../demos/peg.peg"));
    let options = CompileOptions::default();
    assert_eq!(source_for(src, &options), source_for(src, &options));
}
