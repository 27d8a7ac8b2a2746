//! Runtime values of the expression language
//!
//! Operators follow Python semantics closely enough that error messages match
//! what users see from ordinary script code: `bool` behaves as an int in
//! arithmetic, `/` always produces a float, `//` and `%` floor toward
//! negative infinity, and mismatched operands raise `TypeError` with the
//! familiar wording.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use crate::ast::{BinOp, CmpOp};
use crate::diagnostic::DiagnosticKind;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Dict(BTreeMap<String, Value>),
}

/// An exception raised while evaluating, before it is mapped to a diagnostic
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Raised {
    pub kind: DiagnosticKind,
    pub message: String,
}

impl Raised {
    pub fn new(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(DiagnosticKind::TypeError, message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(DiagnosticKind::ValueError, message)
    }

    pub fn zero_division(message: impl Into<String>) -> Self {
        Self::new(DiagnosticKind::ZeroDivisionError, message)
    }

    pub fn attribute_error(message: impl Into<String>) -> Self {
        Self::new(DiagnosticKind::AttributeError, message)
    }

    pub fn no_attribute(value: &Value, name: &str) -> Self {
        Self::attribute_error(format!(
            "'{}' object has no attribute '{}'",
            value.type_name(),
            name
        ))
    }
}

pub(crate) type RaiseResult<T> = Result<T, Raised>;

/// Longest string (in bytes) or sequence an operator may build
pub const MAX_SEQUENCE_LEN: usize = 1 << 20;

/// Checks the length of a string or sequence about to be built
pub(crate) fn bounded_len(len: Option<usize>, what: &str) -> RaiseResult<usize> {
    len.filter(|len| *len <= MAX_SEQUENCE_LEN).ok_or_else(|| {
        Raised::new(DiagnosticKind::OverflowError, format!("{what} is too long"))
    })
}

/// Numeric view of a value; bools count as ints
#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(n) => n as f64,
            Num::Float(f) => f,
        }
    }
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) | Value::Tuple(items) => !items.is_empty(),
            Value::Dict(map) => !map.is_empty(),
        }
    }

    /// `repr()` of the value
    pub fn repr(&self) -> String {
        match self {
            Value::Str(s) => {
                let quote = if s.contains('\'') && !s.contains('"') {
                    '"'
                } else {
                    '\''
                };
                let mut out = String::with_capacity(s.len() + 2);
                out.push(quote);
                for c in s.chars() {
                    match c {
                        '\\' => out.push_str("\\\\"),
                        '\n' => out.push_str("\\n"),
                        '\t' => out.push_str("\\t"),
                        '\r' => out.push_str("\\r"),
                        c if c == quote => {
                            out.push('\\');
                            out.push(c);
                        }
                        c => out.push(c),
                    }
                }
                out.push(quote);
                out
            }
            Value::List(items) => format!("[{}]", join_repr(items)),
            Value::Tuple(items) if items.len() == 1 => format!("({},)", items[0].repr()),
            Value::Tuple(items) => format!("({})", join_repr(items)),
            Value::Dict(map) => {
                let pairs: Vec<String> = map
                    .iter()
                    .map(|(k, v)| format!("{}: {}", Value::Str(k.clone()).repr(), v.repr()))
                    .collect();
                format!("{{{}}}", pairs.join(", "))
            }
            other => other.to_string(),
        }
    }

    /// Convert a JSON value from a state attribute or event payload
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::None,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Dict(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::None => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(n) => serde_json::Value::from(*n),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::List(items) | Value::Tuple(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Dict(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    fn as_num(&self) -> Option<Num> {
        match self {
            Value::Bool(b) => Some(Num::Int(*b as i64)),
            Value::Int(n) => Some(Num::Int(*n)),
            Value::Float(f) => Some(Num::Float(*f)),
            _ => None,
        }
    }

    pub(crate) fn as_index(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(*b as i64),
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub(crate) fn negate(&self) -> RaiseResult<Value> {
        match self.as_num() {
            Some(Num::Int(n)) => Ok(n
                .checked_neg()
                .map(Value::Int)
                .unwrap_or(Value::Float(-(n as f64)))),
            Some(Num::Float(f)) => Ok(Value::Float(-f)),
            None => Err(Raised::type_error(format!(
                "bad operand type for unary -: '{}'",
                self.type_name()
            ))),
        }
    }

    pub(crate) fn positive(&self) -> RaiseResult<Value> {
        match self.as_num() {
            Some(Num::Int(n)) => Ok(Value::Int(n)),
            Some(Num::Float(f)) => Ok(Value::Float(f)),
            None => Err(Raised::type_error(format!(
                "bad operand type for unary +: '{}'",
                self.type_name()
            ))),
        }
    }

    pub(crate) fn binary(&self, op: BinOp, rhs: &Value) -> RaiseResult<Value> {
        if let (Some(a), Some(b)) = (self.as_num(), rhs.as_num()) {
            return numeric(op, a, b);
        }
        match (op, self, rhs) {
            (BinOp::Add, Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{a}{b}"))),
            (BinOp::Add, Value::Str(_), other) => Err(Raised::type_error(format!(
                "can only concatenate str (not \"{}\") to str",
                other.type_name()
            ))),
            (BinOp::Add, Value::List(a), Value::List(b)) => {
                Ok(Value::List(a.iter().chain(b).cloned().collect()))
            }
            (BinOp::Add, Value::List(_), other) => Err(Raised::type_error(format!(
                "can only concatenate list (not \"{}\") to list",
                other.type_name()
            ))),
            (BinOp::Add, Value::Tuple(a), Value::Tuple(b)) => {
                Ok(Value::Tuple(a.iter().chain(b).cloned().collect()))
            }
            (BinOp::Mul, seq, count) | (BinOp::Mul, count, seq)
                if count.as_index().is_some()
                    && matches!(seq, Value::Str(_) | Value::List(_) | Value::Tuple(_)) =>
            {
                let n = usize::try_from(count.as_index().unwrap_or(0)).unwrap_or(0);
                let (len, what) = match seq {
                    Value::Str(s) => (s.len(), "repeated string"),
                    Value::List(items) | Value::Tuple(items) => {
                        (items.len(), "repeated sequence")
                    }
                    _ => (0, "repeated sequence"),
                };
                bounded_len(len.checked_mul(n), what)?;
                Ok(match seq {
                    Value::Str(s) => Value::Str(s.repeat(n)),
                    Value::List(items) => Value::List(repeat(items, n)),
                    Value::Tuple(items) => Value::Tuple(repeat(items, n)),
                    _ => unreachable!("matched above"),
                })
            }
            (BinOp::Mul, Value::Str(_) | Value::List(_) | Value::Tuple(_), other)
            | (BinOp::Mul, other, Value::Str(_) | Value::List(_) | Value::Tuple(_))
                if other.as_num().is_some() =>
            {
                Err(Raised::type_error(format!(
                    "can't multiply sequence by non-int of type '{}'",
                    other.type_name()
                )))
            }
            _ => Err(unsupported(op, self, rhs)),
        }
    }

    pub(crate) fn compare(&self, op: CmpOp, rhs: &Value) -> RaiseResult<bool> {
        match op {
            CmpOp::Eq => Ok(self.py_eq(rhs)),
            CmpOp::NotEq => Ok(!self.py_eq(rhs)),
            CmpOp::In => rhs.contains(self),
            CmpOp::NotIn => rhs.contains(self).map(|found| !found),
            CmpOp::Is => Ok(self.is_same(rhs)),
            CmpOp::IsNot => Ok(!self.is_same(rhs)),
            CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
                let ordering = self.py_cmp(rhs).ok_or_else(|| {
                    Raised::type_error(format!(
                        "'{}' not supported between instances of '{}' and '{}'",
                        op.symbol(),
                        self.type_name(),
                        rhs.type_name()
                    ))
                })?;
                Ok(match op {
                    CmpOp::Lt => ordering == Ordering::Less,
                    CmpOp::Le => ordering != Ordering::Greater,
                    CmpOp::Gt => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                })
            }
        }
    }

    fn py_eq(&self, rhs: &Value) -> bool {
        if let (Some(a), Some(b)) = (self.as_num(), rhs.as_num()) {
            return match (a, b) {
                (Num::Int(x), Num::Int(y)) => x == y,
                _ => a.as_f64() == b.as_f64(),
            };
        }
        match (self, rhs) {
            (Value::None, Value::None) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) | (Value::Tuple(a), Value::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.py_eq(y))
            }
            (Value::Dict(a), Value::Dict(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).is_some_and(|other| v.py_eq(other)))
            }
            _ => false,
        }
    }

    /// Ordering for `<`-style comparisons; None when the types don't order
    fn py_cmp(&self, rhs: &Value) -> Option<Ordering> {
        if let (Some(a), Some(b)) = (self.as_num(), rhs.as_num()) {
            return match (a, b) {
                (Num::Int(x), Num::Int(y)) => Some(x.cmp(&y)),
                // NaN compares false every way; report it as "equal to neither side"
                _ => Some(
                    a.as_f64()
                        .partial_cmp(&b.as_f64())
                        .unwrap_or(Ordering::Equal),
                ),
            };
        }
        match (self, rhs) {
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::List(a), Value::List(b)) | (Value::Tuple(a), Value::Tuple(b)) => {
                for (x, y) in a.iter().zip(b) {
                    if !x.py_eq(y) {
                        return x.py_cmp(y);
                    }
                }
                Some(a.len().cmp(&b.len()))
            }
            _ => None,
        }
    }

    fn is_same(&self, rhs: &Value) -> bool {
        match (self, rhs) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            _ => false,
        }
    }

    fn contains(&self, needle: &Value) -> RaiseResult<bool> {
        match self {
            Value::Str(haystack) => match needle {
                Value::Str(n) => Ok(haystack.contains(n.as_str())),
                other => Err(Raised::type_error(format!(
                    "'in <string>' requires string as left operand, not {}",
                    other.type_name()
                ))),
            },
            Value::List(items) | Value::Tuple(items) => {
                Ok(items.iter().any(|item| item.py_eq(needle)))
            }
            Value::Dict(map) => Ok(map.contains_key(&needle.key_string())),
            other => Err(Raised::type_error(format!(
                "argument of type '{}' is not iterable",
                other.type_name()
            ))),
        }
    }

    /// Dict keys are strings; other key values use their `str()` form
    pub(crate) fn key_string(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            other => other.to_string(),
        }
    }

    pub(crate) fn subscript(&self, index: &Value) -> RaiseResult<Value> {
        match self {
            Value::List(items) | Value::Tuple(items) => {
                let name = self.type_name();
                let i = index.as_index().ok_or_else(|| {
                    Raised::type_error(format!(
                        "{name} indices must be integers or slices, not {}",
                        index.type_name()
                    ))
                })?;
                resolve_index(i, items.len())
                    .map(|i| items[i].clone())
                    .ok_or_else(|| {
                        Raised::new(
                            DiagnosticKind::IndexError,
                            format!("{name} index out of range"),
                        )
                    })
            }
            Value::Str(s) => {
                let i = index.as_index().ok_or_else(|| {
                    Raised::type_error(format!(
                        "string indices must be integers, not '{}'",
                        index.type_name()
                    ))
                })?;
                let chars: Vec<char> = s.chars().collect();
                resolve_index(i, chars.len())
                    .map(|i| Value::Str(chars[i].to_string()))
                    .ok_or_else(|| {
                        Raised::new(DiagnosticKind::IndexError, "string index out of range")
                    })
            }
            Value::Dict(map) => map
                .get(&index.key_string())
                .cloned()
                .ok_or_else(|| Raised::new(DiagnosticKind::KeyError, index.repr())),
            other => Err(Raised::type_error(format!(
                "'{}' object is not subscriptable",
                other.type_name()
            ))),
        }
    }
}

impl fmt::Display for Value {
    /// `str()` of the value
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => f.write_str("None"),
            Value::Bool(true) => f.write_str("True"),
            Value::Bool(false) => f.write_str("False"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => f.write_str(&format_float(*x)),
            Value::Str(s) => f.write_str(s),
            other => f.write_str(&other.repr()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

fn join_repr(items: &[Value]) -> String {
    items.iter().map(Value::repr).collect::<Vec<_>>().join(", ")
}

fn repeat(items: &[Value], n: usize) -> Vec<Value> {
    if items.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(items.len().saturating_mul(n));
    for _ in 0..n {
        out.extend_from_slice(items);
    }
    out
}

fn resolve_index(i: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let i = if i < 0 { i + len } else { i };
    (0..len).contains(&i).then_some(i as usize)
}

/// Python's float formatting: always shows a fractional part or exponent
pub(crate) fn format_float(x: f64) -> String {
    if x.is_nan() {
        return "nan".to_string();
    }
    if x.is_infinite() {
        return if x > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if x != 0.0 && (x.abs() >= 1e16 || x.abs() < 1e-4) {
        let text = format!("{x:e}");
        let (mantissa, exponent) = text.split_once('e').unwrap_or((&text, "0"));
        let (sign, digits) = match exponent.strip_prefix('-') {
            Some(digits) => ('-', digits),
            None => ('+', exponent),
        };
        return format!("{mantissa}e{sign}{digits:0>2}");
    }
    let text = format!("{x}");
    if text.contains('.') {
        text
    } else {
        format!("{text}.0")
    }
}

fn unsupported(op: BinOp, lhs: &Value, rhs: &Value) -> Raised {
    Raised::type_error(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op.symbol(),
        lhs.type_name(),
        rhs.type_name()
    ))
}

fn numeric(op: BinOp, a: Num, b: Num) -> RaiseResult<Value> {
    if let (Num::Int(x), Num::Int(y)) = (a, b) {
        return int_op(op, x, y);
    }
    let (x, y) = (a.as_f64(), b.as_f64());
    let result = match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => {
            if y == 0.0 {
                return Err(Raised::zero_division("float division by zero"));
            }
            x / y
        }
        BinOp::FloorDiv => {
            if y == 0.0 {
                return Err(Raised::zero_division("float floor division by zero"));
            }
            (x / y).floor()
        }
        BinOp::Mod => {
            if y == 0.0 {
                return Err(Raised::zero_division("float modulo"));
            }
            let r = x % y;
            if r != 0.0 && (r < 0.0) != (y < 0.0) {
                r + y
            } else {
                r
            }
        }
        BinOp::Pow => {
            if x == 0.0 && y < 0.0 {
                return Err(Raised::zero_division(
                    "0.0 cannot be raised to a negative power",
                ));
            }
            x.powf(y)
        }
    };
    Ok(Value::Float(result))
}

fn int_op(op: BinOp, x: i64, y: i64) -> RaiseResult<Value> {
    // Overflowing results degrade to floats rather than wrapping
    let widen = |r: Option<i64>, f: fn(f64, f64) -> f64| {
        r.map(Value::Int)
            .unwrap_or_else(|| Value::Float(f(x as f64, y as f64)))
    };
    Ok(match op {
        BinOp::Add => widen(x.checked_add(y), |a, b| a + b),
        BinOp::Sub => widen(x.checked_sub(y), |a, b| a - b),
        BinOp::Mul => widen(x.checked_mul(y), |a, b| a * b),
        BinOp::Div => {
            if y == 0 {
                return Err(Raised::zero_division("division by zero"));
            }
            Value::Float(x as f64 / y as f64)
        }
        BinOp::FloorDiv | BinOp::Mod => {
            if y == 0 {
                return Err(Raised::zero_division("integer division or modulo by zero"));
            }
            let (mut q, mut r) = (x.wrapping_div(y), x.wrapping_rem(y));
            if r != 0 && (r < 0) != (y < 0) {
                q -= 1;
                r += y;
            }
            Value::Int(if op == BinOp::FloorDiv { q } else { r })
        }
        BinOp::Pow => {
            if y < 0 {
                if x == 0 {
                    return Err(Raised::zero_division(
                        "0.0 cannot be raised to a negative power",
                    ));
                }
                Value::Float((x as f64).powf(y as f64))
            } else {
                u32::try_from(y)
                    .ok()
                    .and_then(|e| x.checked_pow(e))
                    .map(Value::Int)
                    .unwrap_or_else(|| Value::Float((x as f64).powf(y as f64)))
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(result: RaiseResult<Value>) -> (DiagnosticKind, String) {
        let e = result.unwrap_err();
        (e.kind, e.message)
    }

    #[test]
    fn test_truthiness() {
        for falsy in [
            Value::None,
            Value::Bool(false),
            Value::Int(0),
            Value::Float(0.0),
            Value::Str(String::new()),
            Value::List(vec![]),
        ] {
            assert!(!falsy.is_truthy(), "{falsy:?}");
        }
        assert!(Value::Str("0".into()).is_truthy());
        assert!(Value::Int(-1).is_truthy());
    }

    #[test]
    fn test_division() {
        assert_eq!(
            Value::Int(1).binary(BinOp::Div, &Value::Int(2)).unwrap(),
            Value::Float(0.5)
        );
        assert_eq!(
            err(Value::Int(1).binary(BinOp::Div, &Value::Int(0))),
            (DiagnosticKind::ZeroDivisionError, "division by zero".into())
        );
        assert_eq!(
            err(Value::Float(1.0).binary(BinOp::Div, &Value::Int(0))),
            (
                DiagnosticKind::ZeroDivisionError,
                "float division by zero".into()
            )
        );
        assert_eq!(
            err(Value::Int(1).binary(BinOp::Div, &Value::Str("abc".into()))),
            (
                DiagnosticKind::TypeError,
                "unsupported operand type(s) for /: 'int' and 'str'".into()
            )
        );
    }

    #[test]
    fn test_floor_division_and_modulo_signs() {
        let fd = |a: i64, b: i64| Value::Int(a).binary(BinOp::FloorDiv, &Value::Int(b)).unwrap();
        let md = |a: i64, b: i64| Value::Int(a).binary(BinOp::Mod, &Value::Int(b)).unwrap();
        assert_eq!(fd(-7, 2), Value::Int(-4));
        assert_eq!(md(-7, 3), Value::Int(2));
        assert_eq!(md(7, -3), Value::Int(-2));
        assert_eq!(
            Value::Float(-7.0)
                .binary(BinOp::Mod, &Value::Int(3))
                .unwrap(),
            Value::Float(2.0)
        );
    }

    #[test]
    fn test_string_concatenation() {
        assert_eq!(
            Value::from("a").binary(BinOp::Add, &Value::from("b")).unwrap(),
            Value::from("ab")
        );
        assert_eq!(
            err(Value::from("1").binary(BinOp::Add, &Value::Int(1))),
            (
                DiagnosticKind::TypeError,
                "can only concatenate str (not \"int\") to str".into()
            )
        );
        assert_eq!(
            Value::from("ab").binary(BinOp::Mul, &Value::Int(2)).unwrap(),
            Value::from("abab")
        );
    }

    #[test]
    fn test_sequence_repetition_is_bounded() {
        let list = Value::List(vec![Value::Int(1)]);
        assert_eq!(
            list.binary(BinOp::Mul, &Value::Int(-3)).unwrap(),
            Value::List(vec![])
        );
        assert_eq!(
            Value::Int(2).binary(BinOp::Mul, &list).unwrap(),
            Value::List(vec![Value::Int(1), Value::Int(1)])
        );
        assert_eq!(
            err(list.binary(BinOp::Mul, &Value::Int(i64::MAX))),
            (
                DiagnosticKind::OverflowError,
                "repeated sequence is too long".into()
            )
        );
        assert_eq!(
            err(Value::from("ab").binary(BinOp::Mul, &Value::Int(MAX_SEQUENCE_LEN as i64))),
            (
                DiagnosticKind::OverflowError,
                "repeated string is too long".into()
            )
        );
        assert_eq!(
            Value::List(vec![]).binary(BinOp::Mul, &Value::Int(i64::MAX)).unwrap(),
            Value::List(vec![])
        );
        let tuple = Value::Tuple(vec![Value::None; 1024]);
        assert!(tuple.binary(BinOp::Mul, &Value::Int(1024)).is_ok());
        assert!(tuple.binary(BinOp::Mul, &Value::Int(1025)).is_err());
    }

    #[test]
    fn test_bool_is_numeric() {
        assert_eq!(
            Value::Bool(true).binary(BinOp::Add, &Value::Int(1)).unwrap(),
            Value::Int(2)
        );
        assert!(Value::Bool(true).compare(CmpOp::Eq, &Value::Int(1)).unwrap());
    }

    #[test]
    fn test_ordering_errors() {
        let e = Value::from("a").compare(CmpOp::Lt, &Value::Int(1)).unwrap_err();
        assert_eq!(
            e.message,
            "'<' not supported between instances of 'str' and 'int'"
        );
        assert!(!Value::from("1").compare(CmpOp::Eq, &Value::Int(1)).unwrap());
        assert!(Value::Int(1).compare(CmpOp::Lt, &Value::Float(1.5)).unwrap());
    }

    #[test]
    fn test_membership() {
        let list = Value::List(vec![Value::Int(1), Value::from("on")]);
        assert!(Value::from("on").compare(CmpOp::In, &list).unwrap());
        assert!(Value::Int(2).compare(CmpOp::NotIn, &list).unwrap());
        assert!(Value::from("ell").compare(CmpOp::In, &Value::from("hello")).unwrap());
        let e = Value::Int(1)
            .compare(CmpOp::In, &Value::Int(5))
            .unwrap_err();
        assert_eq!(e.message, "argument of type 'int' is not iterable");
    }

    #[test]
    fn test_subscript() {
        let list = Value::List(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(list.subscript(&Value::Int(-1)).unwrap(), Value::Int(2));
        assert_eq!(
            err(list.subscript(&Value::Int(5))),
            (DiagnosticKind::IndexError, "list index out of range".into())
        );
        let dict = Value::from_json(&serde_json::json!({"a": 1}));
        assert_eq!(
            err(dict.subscript(&Value::from("b"))),
            (DiagnosticKind::KeyError, "'b'".into())
        );
    }

    #[test]
    fn test_str_and_repr() {
        assert_eq!(Value::Float(1.0).to_string(), "1.0");
        assert_eq!(Value::Float(0.1).to_string(), "0.1");
        assert_eq!(Value::Float(1e20).to_string(), "1e+20");
        assert_eq!(Value::Bool(true).to_string(), "True");
        assert_eq!(Value::from("it's").repr(), "\"it's\"");
        assert_eq!(
            Value::List(vec![Value::from("a"), Value::None]).to_string(),
            "['a', None]"
        );
        assert_eq!(Value::Tuple(vec![Value::Int(1)]).repr(), "(1,)");
    }

    #[test]
    fn test_int_overflow_widens() {
        assert_eq!(
            Value::Int(i64::MAX).binary(BinOp::Add, &Value::Int(1)).unwrap(),
            Value::Float(i64::MAX as f64 + 1.0)
        );
        assert_eq!(
            Value::Int(2).binary(BinOp::Pow, &Value::Int(10)).unwrap(),
            Value::Int(1024)
        );
        assert_eq!(
            Value::Int(2).binary(BinOp::Pow, &Value::Int(-1)).unwrap(),
            Value::Float(0.5)
        );
    }
}
