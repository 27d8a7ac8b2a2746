//! Lowering of condition trees into flat instruction lists
//!
//! A [`CompiledGuard`] is a linear program for a small stack machine. Control
//! flow (`and`/`or`, chained comparisons, conditional expressions) becomes
//! explicit jumps, so the evaluator is a single loop with no recursion and no
//! closures. Every instruction keeps the span of the expression it came from
//! for diagnostics.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::ast::{BinOp, BoolOp, CmpOp, ConditionTree, Expr, ExprKind, Span, UnaryOp};
use crate::diagnostic::Origin;
use crate::value::Value;

/// Shape of the context a guard will be evaluated against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextShape {
    /// Entity state values, with `.old` available for the changed entity
    State,
    /// Event payload fields as local names
    Event,
    /// Wall-clock trigger time
    Time,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Const(Value),
    /// Resolve a (possibly dotted) name
    Load(Vec<String>),
    Attr(String),
    Neg,
    Pos,
    Not,
    Binary(BinOp),
    Compare(CmpOp),
    /// Pops `argc` positional values then one value per keyword name
    CallBuiltin {
        name: String,
        argc: usize,
        keywords: Vec<String>,
    },
    /// Pops `argc` arguments then the receiver
    CallMethod { name: String, argc: usize },
    /// Pops `argc` arguments then the callee; values are never callable
    CallValue { argc: usize },
    Subscript,
    BuildList(usize),
    BuildTuple(usize),
    BuildDict(usize),
    /// Jump keeping the top if it is falsy, otherwise pop it
    JumpIfFalseOrPop(usize),
    /// Jump keeping the top if it is truthy, otherwise pop it
    JumpIfTrueOrPop(usize),
    /// Pop the top and jump if it was falsy
    PopJumpIfFalse(usize),
    Jump(usize),
    Dup,
    /// Swap the two top values
    Rot2,
    /// Move the top value below the next two
    Rot3,
    Pop,
}

/// One instruction with the span of its source expression
#[derive(Debug, Clone, PartialEq)]
pub struct Op {
    pub instr: Instr,
    pub span: Span,
}

/// An expression consisting of a single entity reference, e.g.
/// `pyscript.var7` or `sensor.outside.temperature`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BareRef {
    pub entity_id: String,
    pub attribute: Option<String>,
}

/// A compiled expression ready for evaluation
#[derive(Debug, Clone)]
pub struct CompiledGuard {
    source: Arc<str>,
    origin: Origin,
    shape: ContextShape,
    ops: Vec<Op>,
    entities: BTreeSet<String>,
    bare: Option<BareRef>,
}

impl CompiledGuard {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn shape(&self) -> ContextShape {
        self.shape
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// Entity ids the expression reads, as `domain.object_id`
    pub fn entities(&self) -> &BTreeSet<String> {
        &self.entities
    }

    pub fn bare(&self) -> Option<&BareRef> {
        self.bare.as_ref()
    }
}

/// Compile a condition tree for a context shape
///
/// Names are resolved at evaluation time, so compilation never fails.
pub fn compile(tree: &ConditionTree, shape: ContextShape) -> CompiledGuard {
    let mut compiler = Compiler::default();
    compiler.expr(tree.root());
    CompiledGuard {
        source: tree.source().clone(),
        origin: tree.origin().clone(),
        shape,
        ops: compiler.ops,
        entities: compiler.entities,
        bare: bare_ref(tree.root()),
    }
}

fn bare_ref(expr: &Expr) -> Option<BareRef> {
    let ExprKind::Name(path) = &expr.kind else {
        return None;
    };
    match path.as_slice() {
        [domain, object] => Some(BareRef {
            entity_id: format!("{domain}.{object}"),
            attribute: None,
        }),
        [domain, object, attr] if attr != "old" => Some(BareRef {
            entity_id: format!("{domain}.{object}"),
            attribute: Some(attr.clone()),
        }),
        _ => None,
    }
}

#[derive(Default)]
struct Compiler {
    ops: Vec<Op>,
    entities: BTreeSet<String>,
}

impl Compiler {
    fn emit(&mut self, instr: Instr, span: Span) -> usize {
        self.ops.push(Op { instr, span });
        self.ops.len() - 1
    }

    /// Point the jump at `at` to the next instruction
    fn patch(&mut self, at: usize) {
        let target = self.ops.len();
        match &mut self.ops[at].instr {
            Instr::JumpIfFalseOrPop(t)
            | Instr::JumpIfTrueOrPop(t)
            | Instr::PopJumpIfFalse(t)
            | Instr::Jump(t) => *t = target,
            other => unreachable!("patching non-jump {other:?}"),
        }
    }

    fn load(&mut self, path: &[String], span: Span) {
        if path.len() >= 2 {
            self.entities.insert(format!("{}.{}", path[0], path[1]));
        }
        self.emit(Instr::Load(path.to_vec()), span);
    }

    fn expr(&mut self, expr: &Expr) {
        let span = expr.span;
        match &expr.kind {
            ExprKind::Literal(value) => {
                self.emit(Instr::Const(value.clone()), span);
            }
            ExprKind::Name(path) => self.load(path, span),
            ExprKind::Attribute { value, attr } => {
                self.expr(value);
                self.emit(Instr::Attr(attr.clone()), span);
            }
            ExprKind::Unary { op, operand } => {
                self.expr(operand);
                let instr = match op {
                    UnaryOp::Neg => Instr::Neg,
                    UnaryOp::Pos => Instr::Pos,
                    UnaryOp::Not => Instr::Not,
                };
                self.emit(instr, span);
            }
            ExprKind::Binary { op, left, right } => {
                self.expr(left);
                self.expr(right);
                self.emit(Instr::Binary(*op), span);
            }
            ExprKind::BoolOp { op, values } => {
                let mut jumps = Vec::with_capacity(values.len());
                let (last, rest) = values
                    .split_last()
                    .unwrap_or_else(|| unreachable!("parser never builds an empty BoolOp"));
                for value in rest {
                    self.expr(value);
                    let jump = match op {
                        BoolOp::And => Instr::JumpIfFalseOrPop(0),
                        BoolOp::Or => Instr::JumpIfTrueOrPop(0),
                    };
                    jumps.push(self.emit(jump, value.span));
                }
                self.expr(last);
                for jump in jumps {
                    self.patch(jump);
                }
            }
            ExprKind::Compare { left, ops } => self.compare(left, ops, span),
            ExprKind::IfExp { test, body, orelse } => {
                self.expr(test);
                let to_else = self.emit(Instr::PopJumpIfFalse(0), test.span);
                self.expr(body);
                let to_end = self.emit(Instr::Jump(0), span);
                self.patch(to_else);
                self.expr(orelse);
                self.patch(to_end);
            }
            ExprKind::Call {
                func,
                args,
                keywords,
            } => self.call(func, args, keywords, span),
            ExprKind::Subscript { value, index } => {
                self.expr(value);
                self.expr(index);
                self.emit(Instr::Subscript, span);
            }
            ExprKind::List(items) => {
                for item in items {
                    self.expr(item);
                }
                self.emit(Instr::BuildList(items.len()), span);
            }
            ExprKind::Tuple(items) => {
                for item in items {
                    self.expr(item);
                }
                self.emit(Instr::BuildTuple(items.len()), span);
            }
            ExprKind::Dict(pairs) => {
                for (key, value) in pairs {
                    self.expr(key);
                    self.expr(value);
                }
                self.emit(Instr::BuildDict(pairs.len()), span);
            }
        }
    }

    /// `a < b < c` evaluates `b` once and stops at the first false link
    fn compare(&mut self, left: &Expr, ops: &[(CmpOp, Expr)], span: Span) {
        self.expr(left);
        let Some(((last_op, last), links)) = ops.split_last() else {
            return;
        };
        let mut cleanups = Vec::with_capacity(links.len());
        for (op, right) in links {
            self.expr(right);
            self.emit(Instr::Dup, right.span);
            self.emit(Instr::Rot3, right.span);
            self.emit(Instr::Compare(*op), span);
            cleanups.push(self.emit(Instr::JumpIfFalseOrPop(0), span));
        }
        self.expr(last);
        self.emit(Instr::Compare(*last_op), span);
        if cleanups.is_empty() {
            return;
        }
        let to_end = self.emit(Instr::Jump(0), span);
        for cleanup in cleanups {
            self.patch(cleanup);
        }
        // Drop the leftover middle operand under the false result
        self.emit(Instr::Rot2, span);
        self.emit(Instr::Pop, span);
        self.patch(to_end);
    }

    fn call(&mut self, func: &Expr, args: &[Expr], keywords: &[(String, Expr)], span: Span) {
        match &func.kind {
            ExprKind::Name(path) if path.len() == 1 => {
                self.args(args, keywords);
                self.emit(
                    Instr::CallBuiltin {
                        name: path[0].clone(),
                        argc: args.len(),
                        keywords: keywords.iter().map(|(k, _)| k.clone()).collect(),
                    },
                    span,
                );
            }
            // `pyscript.var1.lower()`: load the receiver, then call the method
            ExprKind::Name(path) => {
                let (method, receiver) = path
                    .split_last()
                    .unwrap_or_else(|| unreachable!("dotted name has segments"));
                self.load(receiver, func.span);
                self.method(method, args, keywords, span);
            }
            ExprKind::Attribute { value, attr } => {
                self.expr(value);
                self.method(attr, args, keywords, span);
            }
            _ => {
                self.expr(func);
                self.args(args, keywords);
                self.emit(
                    Instr::CallValue {
                        argc: args.len() + keywords.len(),
                    },
                    span,
                );
            }
        }
    }

    fn method(&mut self, name: &str, args: &[Expr], keywords: &[(String, Expr)], span: Span) {
        self.args(args, keywords);
        self.emit(
            Instr::CallMethod {
                name: name.to_string(),
                argc: args.len() + keywords.len(),
            },
            span,
        );
    }

    fn args(&mut self, args: &[Expr], keywords: &[(String, Expr)]) {
        for arg in args {
            self.expr(arg);
        }
        for (_, value) in keywords {
            self.expr(value);
        }
    }
}
