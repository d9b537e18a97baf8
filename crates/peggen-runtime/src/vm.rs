//! Interpreter for compiled grammars. One `Vm` lives for the duration of a
//! single `parse` call and owns the value stack, the farthest-failure
//! record, the fast-fail cache and the rollback frames; nothing is shared
//! between invocations.

use std::collections::HashMap;

use crate::error::{Expectation, ParseError};
use crate::host::{ActionCx, ActionHost, HostAbort, StructuralHost};
use crate::{Op, Program, Value};

/// Failure entries kept per parse; entries past the cap are not recorded.
const FAIL_CACHE_CAP: usize = 64 * 1024;

/// An in-memory parser: a compiled [`Program`] plus the machinery to run
/// it. The "compile + link in one step" output artifact.
#[derive(Debug)]
pub struct Parser {
    program: Program,
}

#[derive(Clone, PartialEq, Debug)]
pub struct Token {
    pub token_type: String,
    pub text: String,
    pub start: usize,
    pub end: usize,
}

impl Parser {
    pub fn new(program: Program) -> Parser {
        Parser { program }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Parse from the start rule without running user code; actions pass
    /// their matched value through. See [`StructuralHost`].
    pub fn parse(&self, input: &str) -> Result<Value, ParseError> {
        self.parse_with(input, &mut StructuralHost)
    }

    pub fn parse_with(
        &self,
        input: &str,
        host: &mut dyn ActionHost,
    ) -> Result<Value, ParseError> {
        self.run(input, self.program.start, host)
    }

    /// Parse from a published rule, the `startRule` option of the emitted
    /// parser.
    pub fn parse_rule(
        &self,
        rule: &str,
        input: &str,
        host: &mut dyn ActionHost,
    ) -> Result<Value, ParseError> {
        match self.program.rule_index(rule) {
            Some(idx) => self.run(input, idx, host),
            None => Err(ParseError::user(
                input,
                0,
                format!("Can't start parsing from rule \"{}\".", rule),
            )),
        }
    }

    /// Stream `@token`-marked rules over the input, skipping the grammar's
    /// `ws` rule between tokens when it defines one.
    pub fn tokens<'a>(&'a self, input: &'a str) -> Tokens<'a> {
        Tokens {
            parser: self,
            input,
            pos: 0,
            done: self.program.tokens.is_empty(),
        }
    }

    fn run(
        &self,
        input: &str,
        rule: u32,
        host: &mut dyn ActionHost,
    ) -> Result<Value, ParseError> {
        let mut vm = Vm::new(&self.program, input, host);
        vm.call_rule(rule)?;
        let result = vm.stack.pop().expect("rule left no result");
        if !result.is_failed() && vm.pos == input.len() {
            return Ok(result);
        }
        if !result.is_failed() {
            // matched a prefix; the only acceptable continuation was EOF
            vm.record_fail(Expectation::End);
        }
        Err(ParseError::from_failure(
            input,
            vm.max_fail_pos,
            vm.max_fail_expected,
        ))
    }
}

struct Vm<'a> {
    program: &'a Program,
    input: &'a str,
    host: &'a mut dyn ActionHost,
    pos: usize,
    stack: Vec<Value>,
    silent: u32,
    max_fail_pos: usize,
    max_fail_expected: Vec<Expectation>,
    fail_cache: HashMap<(u32, u32), ()>,
    rollback_frames: Vec<Vec<u32>>,
}

impl<'a> Vm<'a> {
    fn new(program: &'a Program, input: &'a str, host: &'a mut dyn ActionHost) -> Vm<'a> {
        Vm {
            program,
            input,
            host,
            pos: 0,
            stack: Vec::new(),
            silent: 0,
            max_fail_pos: 0,
            max_fail_expected: Vec::new(),
            fail_cache: HashMap::new(),
            rollback_frames: Vec::new(),
        }
    }

    fn record_fail(&mut self, expectation: Expectation) {
        if self.pos > self.max_fail_pos {
            self.max_fail_pos = self.pos;
            self.max_fail_expected.clear();
        }
        if self.pos == self.max_fail_pos {
            self.max_fail_expected.push(expectation);
        }
    }

    fn call_rule(&mut self, rule: u32) -> Result<(), ParseError> {
        let key = (rule, self.pos as u32);
        if self.fail_cache.contains_key(&key) {
            self.stack.push(Value::Failed);
            return Ok(());
        }
        let program = self.program;
        self.run(&program.rules[rule as usize].code)?;
        // only cache failures observed with reporting on, so a later
        // non-silent attempt still contributes its expectations
        if self.silent == 0
            && self.fail_cache.len() < FAIL_CACHE_CAP
            && matches!(self.stack.last(), Some(Value::Failed))
        {
            self.fail_cache.insert(key, ());
        }
        Ok(())
    }

    fn run(&mut self, code: &[u32]) -> Result<(), ParseError> {
        let mut ip = 0;
        while ip < code.len() {
            let op = Op::from_u32(code[ip]).expect("invalid opcode");
            ip += 1;
            match op {
                Op::PushCurrPos => self.stack.push(Value::Pos(self.pos)),
                Op::Pop => {
                    self.stack.pop();
                }
                Op::PopCurrPos => match self.stack.pop() {
                    Some(Value::Pos(p)) => self.pos = p,
                    other => unreachable!("POP_CURR_POS on {:?}", other),
                },
                Op::PopN => {
                    let n = code[ip] as usize;
                    ip += 1;
                    self.stack.truncate(self.stack.len() - n);
                }
                Op::Nip => {
                    let n = code[ip] as usize;
                    ip += 1;
                    let top = self.stack.pop().expect("NIP on empty stack");
                    self.stack.truncate(self.stack.len() - n);
                    self.stack.push(top);
                }
                Op::PushEmptyArray => self.stack.push(Value::Array(Vec::new())),
                Op::PushUndefined => self.stack.push(Value::Undefined),
                Op::PushNull => self.stack.push(Value::Null),
                Op::PushFailed => self.stack.push(Value::Failed),
                Op::Load => {
                    let k = code[ip] as usize;
                    ip += 1;
                    self.stack.push(Value::Str(self.program.literals[k].clone()));
                }
                Op::Append => {
                    let v = self.stack.pop().expect("APPEND on empty stack");
                    match self.stack.last_mut() {
                        Some(Value::Array(items)) => items.push(v),
                        other => unreachable!("APPEND onto {:?}", other),
                    }
                }
                Op::Wrap => {
                    let n = code[ip] as usize;
                    ip += 1;
                    let items = self.stack.split_off(self.stack.len() - n);
                    self.stack.push(Value::Array(items));
                }
                Op::Text => match self.stack.pop() {
                    Some(Value::Pos(p)) => {
                        self.stack.push(Value::Str(self.input[p..self.pos].into()))
                    }
                    other => unreachable!("TEXT on {:?}", other),
                },
                Op::Pluck => {
                    let n = code[ip] as usize;
                    let k = code[ip + 1] as usize;
                    ip += 2;
                    let top = self.stack.len() - 1;
                    let mut picked = Vec::with_capacity(k);
                    for i in 0..k {
                        let depth = code[ip + i] as usize;
                        picked.push(self.stack[top - depth].clone());
                    }
                    ip += k;
                    self.stack.truncate(self.stack.len() - n);
                    match k {
                        1 => self.stack.push(picked.pop().unwrap()),
                        _ => self.stack.push(Value::Array(picked)),
                    }
                }
                Op::MatchString => {
                    let lit = &self.program.literals[code[ip] as usize];
                    ip += 1;
                    let hit = self.input[self.pos..].starts_with(lit.as_str());
                    self.stack.push(Value::Bool(hit));
                }
                Op::MatchStringIc => {
                    let lit = &self.program.literals[code[ip] as usize];
                    ip += 1;
                    let hit = self.matches_ignore_case(lit);
                    self.stack.push(Value::Bool(hit));
                }
                Op::MatchClass => {
                    let class = &self.program.classes[code[ip] as usize];
                    ip += 1;
                    let hit = match self.input[self.pos..].chars().next() {
                        Some(c) => class.matches(c),
                        None => false,
                    };
                    self.stack.push(Value::Bool(hit));
                }
                Op::MatchAny => {
                    self.stack.push(Value::Bool(self.pos < self.input.len()));
                }
                Op::MatchEnd => {
                    self.stack.push(Value::Bool(self.pos == self.input.len()));
                }
                Op::AcceptN => {
                    let n = code[ip] as usize;
                    ip += 1;
                    let consumed: usize = self.input[self.pos..]
                        .chars()
                        .take(n)
                        .map(char::len_utf8)
                        .sum();
                    let text = &self.input[self.pos..self.pos + consumed];
                    self.stack.push(Value::Str(text.into()));
                    self.pos += consumed;
                }
                Op::AcceptString => {
                    let lit = &self.program.literals[code[ip] as usize];
                    ip += 1;
                    self.stack.push(Value::Str(lit.clone()));
                    self.pos += lit.len();
                }
                Op::Fail => {
                    let k = code[ip] as usize;
                    ip += 1;
                    if self.silent == 0 {
                        let expectation = self.program.expectations[k].clone();
                        self.record_fail(expectation);
                    }
                    self.stack.push(Value::Failed);
                }
                Op::If | Op::IfNot => {
                    let (t, e) = (code[ip] as usize, code[ip + 1] as usize);
                    ip += 2;
                    let mut cond = self.stack.pop().expect("IF on empty stack").truthy();
                    if op == Op::IfNot {
                        cond = !cond;
                    }
                    self.branch(code, &mut ip, t, e, cond)?;
                }
                Op::IfError | Op::IfNotError => {
                    let (t, e) = (code[ip] as usize, code[ip + 1] as usize);
                    ip += 2;
                    let mut cond = self.stack.last().expect("IF_ERROR on empty stack").is_failed();
                    if op == Op::IfNotError {
                        cond = !cond;
                    }
                    self.branch(code, &mut ip, t, e, cond)?;
                }
                Op::IfArrlenMin => {
                    let min = code[ip] as usize;
                    let (t, e) = (code[ip + 1] as usize, code[ip + 2] as usize);
                    ip += 3;
                    let cond = match self.stack.last() {
                        Some(Value::Array(items)) => items.len() >= min,
                        _ => false,
                    };
                    self.branch(code, &mut ip, t, e, cond)?;
                }
                Op::WhileNotError => {
                    let len = code[ip] as usize;
                    ip += 1;
                    let body = &code[ip..ip + len];
                    ip += len;
                    while !self.stack.last().expect("loop on empty stack").is_failed() {
                        self.run(body)?;
                    }
                }
                Op::Call => {
                    let rule = code[ip];
                    ip += 1;
                    self.call_rule(rule)?;
                }
                Op::SilentFailsOn => self.silent += 1,
                Op::SilentFailsOff => self.silent -= 1,
                Op::Execute => {
                    let f = code[ip] as usize;
                    let pop = code[ip + 1] as usize;
                    let argc = code[ip + 2] as usize;
                    ip += 3;
                    let depths = &code[ip..ip + argc];
                    ip += argc;
                    self.execute(f, pop, depths)?;
                }
                Op::ExecuteScope => {
                    let f = code[ip] as usize;
                    let nb = code[ip + 1] as usize;
                    let argc = code[ip + 2] as usize;
                    ip += 3;
                    let depths = &code[ip..ip + argc];
                    ip += argc;
                    self.execute_scope(f, nb, depths)?;
                }
                Op::RollbackDrop => {
                    self.rollback_frames.pop();
                }
                Op::RollbackFire => {
                    if let Some(frame) = self.rollback_frames.pop() {
                        for token in frame.into_iter().rev() {
                            self.host.rollback(token);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn branch(
        &mut self,
        code: &[u32],
        ip: &mut usize,
        then_len: usize,
        else_len: usize,
        cond: bool,
    ) -> Result<(), ParseError> {
        if cond {
            self.run(&code[*ip..*ip + then_len])?;
        } else {
            self.run(&code[*ip + then_len..*ip + then_len + else_len])?;
        }
        *ip += then_len + else_len;
        Ok(())
    }

    fn collect_args(&self, depths: &[u32]) -> Vec<Value> {
        let top = self.stack.len() - 1;
        depths
            .iter()
            .map(|&d| self.stack[top - d as usize].clone())
            .collect()
    }

    fn execute(&mut self, f: usize, pop: usize, depths: &[u32]) -> Result<(), ParseError> {
        let args = self.collect_args(depths);
        let code = &self.program.functions[f];
        let (start, matched) = if pop > 0 {
            let base = self.stack.len() - 1 - pop;
            let start = match self.stack[base] {
                Value::Pos(p) => p,
                ref other => unreachable!("EXECUTE frame base is {:?}", other),
            };
            let matched = match pop {
                1 => self.stack[base + 1].clone(),
                _ => Value::Array(self.stack[base + 1..].to_vec()),
            };
            (start, matched)
        } else {
            (self.pos, Value::Undefined)
        };
        let mut cx = ActionCx::new(self.input, start, self.pos, matched);
        let result = self.host.run(&mut cx, f, code, &args);
        let hooks = cx.take_rollbacks();
        if let Some(frame) = self.rollback_frames.last_mut() {
            frame.extend(hooks);
        }
        let value = result.map_err(|abort| self.abort_error(abort, start))?;
        self.stack.truncate(self.stack.len() - pop);
        self.stack.push(value);
        Ok(())
    }

    fn execute_scope(&mut self, f: usize, nb: usize, depths: &[u32]) -> Result<(), ParseError> {
        let args = self.collect_args(depths);
        let code = &self.program.functions[f];
        let mut cx = ActionCx::new(self.input, self.pos, self.pos, Value::Undefined);
        let result = self.host.run(&mut cx, f, code, &args);
        self.rollback_frames.push(cx.take_rollbacks());
        let value = result.map_err(|abort| self.abort_error(abort, self.pos))?;
        match (nb, value) {
            (1, v) => self.stack.push(v),
            (_, Value::Array(items)) if items.len() == nb => self.stack.extend(items),
            (_, other) => {
                return Err(ParseError::user(
                    self.input,
                    self.pos,
                    format!(
                        "scope code returned {:?}, expected {} binding values",
                        other, nb
                    ),
                ))
            }
        }
        Ok(())
    }

    fn abort_error(&self, abort: HostAbort, default_offset: usize) -> ParseError {
        match abort {
            HostAbort::Error { message, offset } => {
                ParseError::user(self.input, offset.unwrap_or(default_offset), message)
            }
            HostAbort::Expected {
                description,
                offset,
            } => ParseError::from_failure(
                self.input,
                offset.unwrap_or(default_offset),
                vec![Expectation::Other(description)],
            ),
        }
    }

    fn matches_ignore_case(&self, lit: &str) -> bool {
        let mut input = self.input[self.pos..].chars();
        for lc in lit.chars() {
            match input.next() {
                Some(ic) if crate::chars_eq_ignore_case(lc, ic) => {}
                _ => return false,
            }
        }
        true
    }
}

/// Streaming tokenizer over `@token` rules. Yields tokens lazily; fails
/// with the farthest-failure error of the attempt that got the furthest.
pub struct Tokens<'a> {
    parser: &'a Parser,
    input: &'a str,
    pos: usize,
    done: bool,
}

impl<'a> Iterator for Tokens<'a> {
    type Item = Result<Token, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let program = self.parser.program();
        let mut host = StructuralHost;
        let mut vm = Vm::new(program, self.input, &mut host);

        if let Some(ws) = program.ws_rule {
            vm.pos = self.pos;
            vm.silent = 1;
            if vm.call_rule(ws).is_err() {
                self.done = true;
                return None;
            }
            if !vm.stack.pop().expect("ws rule left no result").is_failed() {
                self.pos = vm.pos;
            }
            vm.silent = 0;
        }
        if self.pos == self.input.len() {
            self.done = true;
            return None;
        }

        for token in &program.tokens {
            vm.pos = self.pos;
            vm.stack.clear();
            match vm.call_rule(token.rule) {
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
                Ok(()) => {
                    let failed = vm.stack.pop().expect("token rule left no result").is_failed();
                    // zero-width matches would never advance the stream
                    if !failed && vm.pos > self.pos {
                        let (start, end) = (self.pos, vm.pos);
                        self.pos = end;
                        return Some(Ok(Token {
                            token_type: token.token_type.clone(),
                            text: self.input[start..end].into(),
                            start,
                            end,
                        }));
                    }
                }
            }
        }

        self.done = true;
        Some(Err(ParseError::from_failure(
            self.input,
            vm.max_fail_pos.max(self.pos),
            std::mem::take(&mut vm.max_fail_expected),
        )))
    }
}

#[cfg(test)]
fn literal_program(lit: &str) -> Program {
    use crate::{Op, RuleCode};
    // MATCH_STRING 0; IF [ACCEPT_STRING 0] [FAIL 0]
    let code = vec![
        Op::MatchString as u32,
        0,
        Op::If as u32,
        2,
        2,
        Op::AcceptString as u32,
        0,
        Op::Fail as u32,
        0,
    ];
    Program {
        rules: vec![RuleCode {
            name: "start".into(),
            code,
        }],
        start: 0,
        literals: vec![lit.to_string()],
        classes: vec![],
        expectations: vec![Expectation::Literal(lit.to_string())],
        functions: vec![],
        tokens: vec![],
        ws_rule: None,
        initializer: None,
    }
}

#[test]
fn test_literal_match() {
    let parser = Parser::new(literal_program("a"));
    assert_eq!(parser.parse("a").unwrap(), Value::Str("a".into()));
}

#[test]
fn test_literal_failure_reports_expectation() {
    let parser = Parser::new(literal_program("a"));
    let err = parser.parse("b").unwrap_err();
    assert_eq!(err.start.offset, 0);
    assert_eq!(err.found, Some('b'));
    assert_eq!(err.expected, vec![Expectation::Literal("a".into())]);
}

#[test]
fn test_trailing_input_expects_end() {
    let parser = Parser::new(literal_program("a"));
    let err = parser.parse("ab").unwrap_err();
    assert_eq!(err.start.offset, 1);
    assert_eq!(err.expected, vec![Expectation::End]);
}

#[test]
fn test_load_pushes_literal_constant() {
    use crate::RuleCode;
    let mut program = literal_program("a");
    program.rules.push(RuleCode {
        name: "empty".into(),
        code: vec![Op::Load as u32, 0],
    });
    let parser = Parser::new(program);
    let mut host = StructuralHost;
    let err = parser.parse_rule("missing", "", &mut host).unwrap_err();
    assert!(err.message.contains("missing"));
    assert_eq!(
        parser.parse_rule("empty", "", &mut host).unwrap(),
        Value::Str("a".into())
    );
}
