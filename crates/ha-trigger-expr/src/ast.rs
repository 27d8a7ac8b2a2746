//! Condition trees produced by the parser

use std::sync::Arc;

use crate::diagnostic::Origin;
use crate::value::Value;

/// Byte range within the expression text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Smallest span covering both
    pub fn to(self, other: Span) -> Span {
        Span::new(self.start.min(other.start), self.end.max(other.end))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::FloorDiv => "//",
            BinOp::Mod => "%",
            BinOp::Pow => "** or pow()",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Is,
    IsNot,
}

impl CmpOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::NotEq => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::In => "in",
            CmpOp::NotIn => "not in",
            CmpOp::Is => "is",
            CmpOp::IsNot => "is not",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Literal(Value),
    /// Dotted name such as `pyscript.var1.old`; resolved at evaluation time
    Name(Vec<String>),
    Attribute {
        value: Box<Expr>,
        attr: String,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    BoolOp {
        op: BoolOp,
        values: Vec<Expr>,
    },
    Compare {
        left: Box<Expr>,
        ops: Vec<(CmpOp, Expr)>,
    },
    IfExp {
        test: Box<Expr>,
        body: Box<Expr>,
        orelse: Box<Expr>,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        keywords: Vec<(String, Expr)>,
    },
    Subscript {
        value: Box<Expr>,
        index: Box<Expr>,
    },
    List(Vec<Expr>),
    Tuple(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, span }
    }

    /// Constant-fold a literal expression (strings, numbers, containers)
    ///
    /// Decorator arguments must be literals; anything else returns None.
    pub fn as_literal(&self) -> Option<Value> {
        match &self.kind {
            ExprKind::Literal(v) => Some(v.clone()),
            ExprKind::Unary {
                op: UnaryOp::Neg,
                operand,
            } => match operand.as_literal()? {
                Value::Int(n) => Some(Value::Int(-n)),
                Value::Float(f) => Some(Value::Float(-f)),
                _ => None,
            },
            ExprKind::List(items) => items
                .iter()
                .map(Expr::as_literal)
                .collect::<Option<Vec<_>>>()
                .map(Value::List),
            ExprKind::Tuple(items) => items
                .iter()
                .map(Expr::as_literal)
                .collect::<Option<Vec<_>>>()
                .map(Value::Tuple),
            ExprKind::Dict(pairs) => pairs
                .iter()
                .map(|(k, v)| match k.as_literal()? {
                    Value::Str(key) => Some((key, v.as_literal()?)),
                    _ => None,
                })
                .collect::<Option<_>>()
                .map(Value::Dict),
            _ => None,
        }
    }
}

/// A parsed expression together with the text and origin it came from
#[derive(Debug, Clone)]
pub struct ConditionTree {
    source: Arc<str>,
    origin: Origin,
    root: Expr,
}

impl ConditionTree {
    pub(crate) fn new(source: Arc<str>, origin: Origin, root: Expr) -> Self {
        Self {
            source,
            origin,
            root,
        }
    }

    pub fn source(&self) -> &Arc<str> {
        &self.source
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn root(&self) -> &Expr {
        &self.root
    }
}
