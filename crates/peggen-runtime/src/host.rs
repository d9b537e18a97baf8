use crate::error::Position;
use crate::{UserCode, UserCodeKind, Value};

/// How a user code block bails out of a parse.
#[derive(Clone, Debug)]
pub enum HostAbort {
    /// `error(msg, loc?)` — abort with a synthetic syntax error.
    Error {
        message: String,
        offset: Option<usize>,
    },
    /// `expected(desc, loc?)` — fail with an expectation description.
    Expected {
        description: String,
        offset: Option<usize>,
    },
}

/// Context handed to a host while one code block runs. Mirrors the helper
/// functions available to actions in the emitted JavaScript parser.
pub struct ActionCx<'a> {
    input: &'a str,
    start: usize,
    end: usize,
    matched: Value,
    rollbacks: Vec<u32>,
}

impl<'a> ActionCx<'a> {
    pub(crate) fn new(input: &'a str, start: usize, end: usize, matched: Value) -> ActionCx<'a> {
        ActionCx {
            input,
            start,
            end,
            matched,
            rollbacks: Vec::new(),
        }
    }

    /// The input consumed by the expression the code block is attached to.
    pub fn text(&self) -> &'a str {
        &self.input[self.start..self.end]
    }

    pub fn offset(&self) -> usize {
        self.start
    }

    pub fn location(&self) -> (Position, Position) {
        (
            Position::from_offset(self.input, self.start),
            Position::from_offset(self.input, self.end),
        )
    }

    /// The structural result of the matched expression: what the parse
    /// would produce if this code block were absent. `Undefined` for
    /// predicates and scopes.
    pub fn matched(&self) -> &Value {
        &self.matched
    }

    /// Register a rollback token; the host's `rollback` is called with it,
    /// in reverse registration order, if the scoped expression fails.
    pub fn on_rollback(&mut self, token: u32) {
        self.rollbacks.push(token);
    }

    pub(crate) fn take_rollbacks(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.rollbacks)
    }

    pub fn error(&self, message: impl Into<String>) -> HostAbort {
        HostAbort::Error {
            message: message.into(),
            offset: None,
        }
    }

    pub fn expected(&self, description: impl Into<String>) -> HostAbort {
        HostAbort::Expected {
            description: description.into(),
            offset: None,
        }
    }
}

/// Evaluates user code blocks for the in-memory parser.
///
/// The compiler never interprets code blocks, so an in-process parse has to
/// route them somewhere: embedders implement this trait and dispatch on the
/// function index (stable across compilations of the same grammar) or on
/// `code.body`. Predicates return `Value::Bool`; scopes return one value
/// per binding (`Value::Array` when there are several).
pub trait ActionHost {
    fn run(
        &mut self,
        cx: &mut ActionCx<'_>,
        index: usize,
        code: &UserCode,
        args: &[Value],
    ) -> Result<Value, HostAbort>;

    /// Fired for tokens registered through [`ActionCx::on_rollback`].
    fn rollback(&mut self, token: u32) {
        let _ = token;
    }
}

/// Default host: actions evaluate to their matched value, predicates
/// succeed, scope bindings are `undefined`. Gives a parse the structure a
/// grammar describes without running any user code.
pub struct StructuralHost;

impl ActionHost for StructuralHost {
    fn run(
        &mut self,
        cx: &mut ActionCx<'_>,
        _index: usize,
        code: &UserCode,
        _args: &[Value],
    ) -> Result<Value, HostAbort> {
        Ok(match code.kind {
            UserCodeKind::Action => cx.matched().clone(),
            UserCodeKind::Predicate => Value::Bool(true),
            UserCodeKind::Scope => match code.bindings.len() {
                1 => Value::Undefined,
                n => Value::Array(vec![Value::Undefined; n]),
            },
        })
    }
}
