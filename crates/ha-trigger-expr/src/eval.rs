//! Stack machine that runs compiled guards
//!
//! Evaluation is read-only: it looks up entity states through a
//! [`StateLookup`] and never mutates anything outside its own stack. Every
//! exception is converted into a [`Diagnostic`] mapped onto the guard's
//! origin; nothing unwinds into the caller.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::trace;

use crate::builtins;
use crate::compiler::{CompiledGuard, ContextShape, Instr, Op};
use crate::diagnostic::{Diagnostic, DiagnosticKind};
use crate::value::{RaiseResult, Raised, Value};

/// Read access to entity states during evaluation
pub trait StateLookup {
    fn state(&self, entity_id: &str) -> Option<StateSnapshot>;

    /// Previous state of an entity, for `.old` references
    fn old_state(&self, _entity_id: &str) -> Option<StateSnapshot> {
        None
    }
}

/// The parts of an entity state an expression can see
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StateSnapshot {
    pub value: String,
    pub attributes: serde_json::Map<String, serde_json::Value>,
    pub last_changed: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl StateSnapshot {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    fn attribute(&self, entity_id: &str, name: &str) -> RaiseResult<Value> {
        let timestamp = |t: &Option<DateTime<Utc>>| {
            t.map(|t| Value::Str(t.to_rfc3339()))
                .unwrap_or(Value::None)
        };
        match name {
            "last_changed" => Ok(timestamp(&self.last_changed)),
            "last_updated" => Ok(timestamp(&self.last_updated)),
            _ => self
                .attributes
                .get(name)
                .map(Value::from_json)
                .ok_or_else(|| {
                    Raised::attribute_error(format!(
                        "'{entity_id}' has no attribute '{name}'"
                    ))
                }),
        }
    }
}

impl StateLookup for HashMap<String, StateSnapshot> {
    fn state(&self, entity_id: &str) -> Option<StateSnapshot> {
        self.get(entity_id).cloned()
    }
}

/// Lookup with no entities, for contexts that never read state
pub struct NoStates;

impl StateLookup for NoStates {
    fn state(&self, _entity_id: &str) -> Option<StateSnapshot> {
        None
    }
}

/// Everything an evaluation can read
pub struct EvalContext<'a> {
    shape: ContextShape,
    states: &'a dyn StateLookup,
    locals: HashMap<String, Value>,
}

impl<'a> EvalContext<'a> {
    pub fn new(shape: ContextShape, states: &'a dyn StateLookup) -> Self {
        Self {
            shape,
            states,
            locals: HashMap::new(),
        }
    }

    pub fn with_local(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_local(name, value);
        self
    }

    pub fn set_local(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.locals.insert(name.into(), value.into());
    }

    pub fn shape(&self) -> ContextShape {
        self.shape
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GuardOutcome {
    Satisfied,
    NotSatisfied,
    Errored(Diagnostic),
}

impl GuardOutcome {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, GuardOutcome::Satisfied)
    }
}

/// Evaluate a guard and reduce the result to its truthiness
pub fn evaluate(guard: &CompiledGuard, ctx: &EvalContext<'_>) -> GuardOutcome {
    match evaluate_value(guard, ctx) {
        Ok(value) if value.is_truthy() => GuardOutcome::Satisfied,
        Ok(_) => GuardOutcome::NotSatisfied,
        Err(diagnostic) => GuardOutcome::Errored(diagnostic),
    }
}

/// Evaluate a guard to its value
pub fn evaluate_value(guard: &CompiledGuard, ctx: &EvalContext<'_>) -> Result<Value, Diagnostic> {
    if guard.shape() != ctx.shape() {
        return Err(Diagnostic::unpositioned(
            DiagnosticKind::TypeError,
            guard.origin(),
            format!(
                "expression compiled for {:?} context evaluated in {:?} context",
                guard.shape(),
                ctx.shape()
            ),
        ));
    }
    let mut machine = Machine {
        ctx,
        stack: Vec::with_capacity(8),
        last_load: None,
    };
    let result = machine.run(guard.ops()).map_err(|(raised, offset)| {
        Diagnostic::runtime(
            raised.kind,
            guard.origin(),
            guard.source(),
            &raised.message,
            offset,
        )
    });
    trace!(expr = guard.source(), result = ?result.as_ref().map(|v| v.repr()), "Evaluated");
    result
}

struct Machine<'c, 'a> {
    ctx: &'c EvalContext<'a>,
    stack: Vec<Value>,
    /// Span of the most recent successful name load
    last_load: Option<crate::ast::Span>,
}

impl Machine<'_, '_> {
    fn run(&mut self, ops: &[Op]) -> Result<Value, (Raised, usize)> {
        let mut pc = 0;
        while let Some(op) = ops.get(pc) {
            pc += 1;
            match self.step(op) {
                Ok(Some(target)) => pc = target,
                Ok(None) => {}
                Err(raised) => return Err((raised, self.caret(op))),
            }
        }
        self.pop().map_err(|raised| (raised, 0))
    }

    /// Byte offset the caret points at when `op` raises
    ///
    /// The innermost name read by the failing expression is the most useful
    /// position; without one, the start of the expression itself.
    fn caret(&self, op: &Op) -> usize {
        if matches!(op.instr, Instr::Load(_)) {
            return op.span.start;
        }
        match self.last_load {
            Some(load) if load.start >= op.span.start && load.end <= op.span.end => load.start,
            _ => op.span.start,
        }
    }

    fn pop(&mut self) -> RaiseResult<Value> {
        self.stack
            .pop()
            .ok_or_else(|| Raised::type_error("evaluation stack underflow"))
    }

    fn pop_n(&mut self, n: usize) -> RaiseResult<Vec<Value>> {
        if self.stack.len() < n {
            return Err(Raised::type_error("evaluation stack underflow"));
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    fn top(&self) -> RaiseResult<&Value> {
        self.stack
            .last()
            .ok_or_else(|| Raised::type_error("evaluation stack underflow"))
    }

    /// Run one instruction; returns a jump target when control moves
    fn step(&mut self, op: &Op) -> RaiseResult<Option<usize>> {
        match &op.instr {
            Instr::Const(value) => self.stack.push(value.clone()),
            Instr::Load(path) => {
                let value = self.resolve(path)?;
                self.last_load = Some(op.span);
                self.stack.push(value);
            }
            Instr::Attr(name) => {
                let value = self.pop()?;
                return Err(Raised::no_attribute(&value, name));
            }
            Instr::Neg => {
                let value = self.pop()?.negate()?;
                self.stack.push(value);
            }
            Instr::Pos => {
                let value = self.pop()?.positive()?;
                self.stack.push(value);
            }
            Instr::Not => {
                let value = self.pop()?;
                self.stack.push(Value::Bool(!value.is_truthy()));
            }
            Instr::Binary(bin) => {
                let right = self.pop()?;
                let left = self.pop()?;
                self.stack.push(left.binary(*bin, &right)?);
            }
            Instr::Compare(cmp) => {
                let right = self.pop()?;
                let left = self.pop()?;
                self.stack.push(Value::Bool(left.compare(*cmp, &right)?));
            }
            Instr::CallBuiltin {
                name,
                argc,
                keywords,
            } => {
                let keyword_values = self.pop_n(keywords.len())?;
                let args = self.pop_n(*argc)?;
                if let Some(local) = self.ctx.locals.get(name) {
                    return Err(not_callable(local));
                }
                if !builtins::is_builtin(name) {
                    return Err(Raised::new(
                        DiagnosticKind::NameError,
                        format!("name '{name}' is not defined"),
                    ));
                }
                let keywords: Vec<(String, Value)> =
                    keywords.iter().cloned().zip(keyword_values).collect();
                self.stack.push(builtins::call(name, &args, &keywords)?);
            }
            Instr::CallMethod { name, argc } => {
                let args = self.pop_n(*argc)?;
                let receiver = self.pop()?;
                self.stack
                    .push(builtins::call_method(&receiver, name, &args)?);
            }
            Instr::CallValue { argc } => {
                self.pop_n(*argc)?;
                let callee = self.pop()?;
                return Err(not_callable(&callee));
            }
            Instr::Subscript => {
                let index = self.pop()?;
                let value = self.pop()?;
                self.stack.push(value.subscript(&index)?);
            }
            Instr::BuildList(n) => {
                let items = self.pop_n(*n)?;
                self.stack.push(Value::List(items));
            }
            Instr::BuildTuple(n) => {
                let items = self.pop_n(*n)?;
                self.stack.push(Value::Tuple(items));
            }
            Instr::BuildDict(n) => {
                let flat = self.pop_n(n * 2)?;
                let mut map = std::collections::BTreeMap::new();
                let mut iter = flat.into_iter();
                while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
                    map.insert(key.key_string(), value);
                }
                self.stack.push(Value::Dict(map));
            }
            Instr::JumpIfFalseOrPop(target) => {
                if !self.top()?.is_truthy() {
                    return Ok(Some(*target));
                }
                self.pop()?;
            }
            Instr::JumpIfTrueOrPop(target) => {
                if self.top()?.is_truthy() {
                    return Ok(Some(*target));
                }
                self.pop()?;
            }
            Instr::PopJumpIfFalse(target) => {
                if !self.pop()?.is_truthy() {
                    return Ok(Some(*target));
                }
            }
            Instr::Jump(target) => return Ok(Some(*target)),
            Instr::Dup => {
                let top = self.top()?.clone();
                self.stack.push(top);
            }
            Instr::Rot2 => {
                let len = self.stack.len();
                if len < 2 {
                    return Err(Raised::type_error("evaluation stack underflow"));
                }
                self.stack.swap(len - 1, len - 2);
            }
            Instr::Rot3 => {
                let top = self.pop()?;
                let len = self.stack.len();
                if len < 2 {
                    return Err(Raised::type_error("evaluation stack underflow"));
                }
                self.stack.insert(len - 2, top);
            }
            Instr::Pop => {
                self.pop()?;
            }
        }
        Ok(None)
    }

    /// Resolve a dotted name: locals first, then `domain.entity` states with
    /// an optional `.old` or attribute suffix
    fn resolve(&self, path: &[String]) -> RaiseResult<Value> {
        let Some((head, rest)) = path.split_first() else {
            return Err(Raised::type_error("empty name"));
        };
        if let Some(local) = self.ctx.locals.get(head) {
            return rest.iter().try_fold(local.clone(), |value, attr| {
                Err(Raised::no_attribute(&value, attr))
            });
        }
        let Some((object, attrs)) = rest.split_first() else {
            return Err(Raised::new(
                DiagnosticKind::NameError,
                format!("name '{head}' is not defined"),
            ));
        };
        let entity_id = format!("{head}.{object}");
        let Some(state) = self.ctx.states.state(&entity_id) else {
            return Err(Raised::new(
                DiagnosticKind::NameError,
                format!("name '{entity_id}' is not defined"),
            ));
        };
        let (value, more) = match attrs.split_first() {
            None => return Ok(Value::Str(state.value)),
            Some((attr, more)) if attr == "old" => {
                let old = self
                    .ctx
                    .states
                    .old_state(&entity_id)
                    .map(|old| Value::Str(old.value))
                    .unwrap_or(Value::None);
                (old, more)
            }
            Some((attr, more)) => (state.attribute(&entity_id, attr)?, more),
        };
        more.iter()
            .try_fold(value, |value, attr| Err(Raised::no_attribute(&value, attr)))
    }
}

fn not_callable(value: &Value) -> Raised {
    Raised::type_error(format!("'{}' object is not callable", value.type_name()))
}
