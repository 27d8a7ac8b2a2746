//! Trigger expression engine
//!
//! Trigger and guard decorators carry small Python-style expressions such as
//! `pyscript.var1 == "on" and int(sensor.temp) > 20`. This crate turns that
//! text into something the watcher runtime can evaluate safely:
//!
//! ```text
//! text ──parse──▶ ConditionTree ──compile──▶ CompiledGuard ──evaluate──▶ GuardOutcome
//! ```
//!
//! - [`parse`] produces a [`ConditionTree`] or a `SyntaxError` [`Diagnostic`]
//! - [`compile`] lowers the tree into a flat instruction list
//! - [`evaluate`] runs the instructions on a stack machine against an
//!   [`EvalContext`]; errors come back as [`GuardOutcome::Errored`]
//!
//! Every diagnostic is mapped onto the decorator it came from (see
//! [`Origin`]) so log output points at the script, not at this crate.

pub mod ast;
pub mod compiler;
pub mod diagnostic;
pub mod eval;
pub mod lexer;
pub mod parser;
pub mod value;

mod builtins;

pub use ast::{ConditionTree, Expr, ExprKind, Span};
pub use compiler::{compile, BareRef, CompiledGuard, ContextShape, Instr, Op};
pub use diagnostic::{Diagnostic, DiagnosticKind, Origin, Site};
pub use eval::{
    evaluate, evaluate_value, EvalContext, GuardOutcome, NoStates, StateLookup, StateSnapshot,
};
pub use lexer::SyntaxError;
pub use parser::{parse, parse_arguments, parse_expression, Arguments};
pub use value::Value;
