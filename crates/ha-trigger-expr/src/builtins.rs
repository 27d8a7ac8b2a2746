//! Builtin functions and methods available to expressions

use crate::value::{bounded_len, RaiseResult, Raised, Value};

/// Names callable as plain functions
pub(crate) const BUILTINS: &[&str] = &[
    "int", "float", "str", "bool", "len", "abs", "min", "max", "round",
];

pub(crate) fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

/// Call a builtin by name
///
/// The caller has already checked [`is_builtin`].
pub(crate) fn call(name: &str, args: &[Value], keywords: &[(String, Value)]) -> RaiseResult<Value> {
    if !keywords.is_empty() {
        return Err(Raised::type_error(format!(
            "{name}() takes no keyword arguments"
        )));
    }
    match name {
        "int" => {
            at_most(name, args, 2)?;
            match args {
                [] => Ok(Value::Int(0)),
                [value] => to_int(value),
                [value, base] => to_int_base(value, base),
                _ => unreachable!("checked arity"),
            }
        }
        "float" => {
            at_most(name, args, 1)?;
            args.first().map_or(Ok(Value::Float(0.0)), to_float)
        }
        "str" => {
            at_most(name, args, 1)?;
            Ok(Value::Str(
                args.first().map(Value::to_string).unwrap_or_default(),
            ))
        }
        "bool" => {
            at_most(name, args, 1)?;
            Ok(Value::Bool(args.first().is_some_and(Value::is_truthy)))
        }
        "len" => {
            exactly(name, args, 1)?;
            len(&args[0])
        }
        "abs" => {
            exactly(name, args, 1)?;
            match &args[0] {
                Value::Bool(b) => Ok(Value::Int(*b as i64)),
                Value::Int(n) => Ok(n
                    .checked_abs()
                    .map(Value::Int)
                    .unwrap_or(Value::Float((*n as f64).abs()))),
                Value::Float(f) => Ok(Value::Float(f.abs())),
                other => Err(Raised::type_error(format!(
                    "bad operand type for abs(): '{}'",
                    other.type_name()
                ))),
            }
        }
        "min" | "max" => extreme(name, args),
        "round" => {
            if args.is_empty() {
                return Err(Raised::type_error(
                    "round() missing required argument 'number' (pos 1)",
                ));
            }
            at_most(name, args, 2)?;
            round(&args[0], args.get(1))
        }
        other => Err(Raised::new(
            crate::diagnostic::DiagnosticKind::NameError,
            format!("name '{other}' is not defined"),
        )),
    }
}

/// Call a method on a value, e.g. `pyscript.var1.lower()`
pub(crate) fn call_method(receiver: &Value, name: &str, args: &[Value]) -> RaiseResult<Value> {
    match (receiver, name) {
        (Value::Str(s), "lower") => no_args(name, args).map(|_| Value::Str(s.to_lowercase())),
        (Value::Str(s), "upper") => no_args(name, args).map(|_| Value::Str(s.to_uppercase())),
        (Value::Str(s), "strip") => no_args(name, args).map(|_| Value::Str(s.trim().to_string())),
        (Value::Str(s), "lstrip") => {
            no_args(name, args).map(|_| Value::Str(s.trim_start().to_string()))
        }
        (Value::Str(s), "rstrip") => {
            no_args(name, args).map(|_| Value::Str(s.trim_end().to_string()))
        }
        (Value::Str(s), "isdigit") => no_args(name, args)
            .map(|_| Value::Bool(!s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))),
        (Value::Str(s), "startswith") => {
            let prefix = str_arg(name, args)?;
            Ok(Value::Bool(s.starts_with(prefix)))
        }
        (Value::Str(s), "endswith") => {
            let suffix = str_arg(name, args)?;
            Ok(Value::Bool(s.ends_with(suffix)))
        }
        (Value::Str(s), "split") => {
            let parts: Vec<Value> = match args {
                [] => s.split_whitespace().map(Value::from).collect(),
                [Value::Str(sep)] if !sep.is_empty() => s.split(sep.as_str()).map(Value::from).collect(),
                [Value::Str(_)] => return Err(Raised::value_error("empty separator")),
                [other] => {
                    return Err(Raised::type_error(format!(
                        "must be str or None, not {}",
                        other.type_name()
                    )))
                }
                _ => return Err(arity_error(name, 1, args.len())),
            };
            Ok(Value::List(parts))
        }
        (Value::Str(s), "replace") => match args {
            [Value::Str(from), Value::Str(to)] => {
                let grown = s
                    .matches(from.as_str())
                    .count()
                    .checked_mul(to.len().saturating_sub(from.len()))
                    .and_then(|extra| extra.checked_add(s.len()));
                bounded_len(grown, "replace string")?;
                Ok(Value::Str(s.replace(from.as_str(), to)))
            }
            [_, _] => Err(Raised::type_error("replace() argument must be str")),
            _ => Err(Raised::type_error(format!(
                "replace expected 2 arguments, got {}",
                args.len()
            ))),
        },
        (Value::Dict(map), "get") => match args {
            [key] => Ok(map.get(&key.key_string()).cloned().unwrap_or(Value::None)),
            [key, default] => Ok(map
                .get(&key.key_string())
                .cloned()
                .unwrap_or_else(|| default.clone())),
            _ => Err(Raised::type_error(format!(
                "get expected at most 2 arguments, got {}",
                args.len()
            ))),
        },
        (Value::Dict(map), "keys") => no_args(name, args)
            .map(|_| Value::List(map.keys().cloned().map(Value::Str).collect())),
        (Value::Dict(map), "values") => {
            no_args(name, args).map(|_| Value::List(map.values().cloned().collect()))
        }
        (Value::List(items), "count") => match args {
            [needle] => {
                let mut count = 0;
                for item in items {
                    if item.compare(crate::ast::CmpOp::Eq, needle)? {
                        count += 1;
                    }
                }
                Ok(Value::Int(count))
            }
            _ => Err(arity_error(name, 1, args.len())),
        },
        (other, _) => Err(Raised::no_attribute(other, name)),
    }
}

fn arity_error(name: &str, expected: usize, given: usize) -> Raised {
    Raised::type_error(format!(
        "{name}() takes exactly {expected} argument{} ({given} given)",
        if expected == 1 { "" } else { "s" }
    ))
}

fn exactly(name: &str, args: &[Value], n: usize) -> RaiseResult<()> {
    if args.len() == n {
        Ok(())
    } else {
        Err(arity_error(name, n, args.len()))
    }
}

fn at_most(name: &str, args: &[Value], n: usize) -> RaiseResult<()> {
    if args.len() <= n {
        Ok(())
    } else {
        Err(Raised::type_error(format!(
            "{name}() takes at most {n} argument{} ({} given)",
            if n == 1 { "" } else { "s" },
            args.len()
        )))
    }
}

fn no_args(name: &str, args: &[Value]) -> RaiseResult<()> {
    if args.is_empty() {
        Ok(())
    } else {
        Err(Raised::type_error(format!(
            "{name}() takes no arguments ({} given)",
            args.len()
        )))
    }
}

fn str_arg<'a>(name: &str, args: &'a [Value]) -> RaiseResult<&'a str> {
    match args {
        [Value::Str(s)] => Ok(s),
        [other] => Err(Raised::type_error(format!(
            "{name} first arg must be str or a tuple of str, not {}",
            other.type_name()
        ))),
        _ => Err(arity_error(name, 1, args.len())),
    }
}

fn to_int(value: &Value) -> RaiseResult<Value> {
    match value {
        Value::Bool(b) => Ok(Value::Int(*b as i64)),
        Value::Int(n) => Ok(Value::Int(*n)),
        Value::Float(f) => {
            if f.is_nan() {
                Err(Raised::value_error("cannot convert float NaN to integer"))
            } else if f.is_infinite() {
                Err(Raised::value_error(
                    "cannot convert float infinity to integer",
                ))
            } else if f.trunc().abs() < i64::MAX as f64 {
                Ok(Value::Int(f.trunc() as i64))
            } else {
                Ok(Value::Float(f.trunc()))
            }
        }
        Value::Str(s) => parse_int(s, 10).map(Value::Int).ok_or_else(|| invalid_int(s, 10)),
        other => Err(Raised::type_error(format!(
            "int() argument must be a string, a bytes-like object or a real number, not '{}'",
            other.type_name()
        ))),
    }
}

fn to_int_base(value: &Value, base: &Value) -> RaiseResult<Value> {
    let base = match base.as_index() {
        Some(b) if b == 0 || (2..=36).contains(&b) => b as u32,
        Some(_) => return Err(Raised::value_error("int() base must be >= 2 and <= 36, or 0")),
        None => {
            return Err(Raised::type_error(format!(
                "'{}' object cannot be interpreted as an integer",
                base.type_name()
            )))
        }
    };
    match value {
        Value::Str(s) => parse_int(s, base)
            .map(Value::Int)
            .ok_or_else(|| invalid_int(s, base)),
        _ => Err(Raised::type_error(
            "int() can't convert non-string with explicit base",
        )),
    }
}

fn invalid_int(s: &str, base: u32) -> Raised {
    Raised::value_error(format!(
        "invalid literal for int() with base {base}: {}",
        Value::from(s).repr()
    ))
}

/// Parse an integer literal the way `int()` does: surrounding whitespace,
/// an optional sign and single underscores between digits are allowed
fn parse_int(s: &str, base: u32) -> Option<i64> {
    let s = s.trim();
    let (negative, digits) = match *s.as_bytes().first()? {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };
    let (base, digits) = if base == 0 {
        match digits.get(..2).map(str::to_ascii_lowercase).as_deref() {
            Some("0x") => (16, &digits[2..]),
            Some("0o") => (8, &digits[2..]),
            Some("0b") => (2, &digits[2..]),
            _ => (10, digits),
        }
    } else {
        (base, digits)
    };
    if digits.is_empty()
        || digits.starts_with('_')
        || digits.ends_with('_')
        || digits.contains("__")
    {
        return None;
    }
    let cleaned: String = digits.chars().filter(|c| *c != '_').collect();
    if cleaned.starts_with(['+', '-']) {
        return None;
    }
    let magnitude = i64::from_str_radix(&cleaned, base).ok()?;
    Some(if negative { -magnitude } else { magnitude })
}

fn to_float(value: &Value) -> RaiseResult<Value> {
    match value {
        Value::Bool(b) => Ok(Value::Float(*b as i64 as f64)),
        Value::Int(n) => Ok(Value::Float(*n as f64)),
        Value::Float(f) => Ok(Value::Float(*f)),
        Value::Str(s) => {
            let trimmed = s.trim();
            let cleaned = trimmed.replace('_', "");
            let valid = !trimmed.is_empty()
                && !trimmed.starts_with('_')
                && !trimmed.ends_with('_')
                && !trimmed.contains("__");
            cleaned
                .parse::<f64>()
                .ok()
                .filter(|_| valid)
                .map(Value::Float)
                .ok_or_else(|| {
                    Raised::value_error(format!(
                        "could not convert string to float: {}",
                        Value::from(s.as_str()).repr()
                    ))
                })
        }
        other => Err(Raised::type_error(format!(
            "float() argument must be a string or a real number, not '{}'",
            other.type_name()
        ))),
    }
}

fn len(value: &Value) -> RaiseResult<Value> {
    let n = match value {
        Value::Str(s) => s.chars().count(),
        Value::List(items) | Value::Tuple(items) => items.len(),
        Value::Dict(map) => map.len(),
        other => {
            return Err(Raised::type_error(format!(
                "object of type '{}' has no len()",
                other.type_name()
            )))
        }
    };
    Ok(Value::Int(n as i64))
}

fn extreme(name: &str, args: &[Value]) -> RaiseResult<Value> {
    let items: &[Value] = match args {
        [] => {
            return Err(Raised::type_error(format!(
                "{name} expected at least 1 argument, got 0"
            )))
        }
        [Value::List(items) | Value::Tuple(items)] => items,
        [Value::Str(_)] => {
            return Err(Raised::type_error(format!(
                "{name}() over a string is not supported"
            )))
        }
        [other] => {
            return Err(Raised::type_error(format!(
                "'{}' object is not iterable",
                other.type_name()
            )))
        }
        many => many,
    };
    let (first, rest) = items
        .split_first()
        .ok_or_else(|| Raised::value_error(format!("{name}() arg is an empty sequence")))?;
    let op = if name == "min" {
        crate::ast::CmpOp::Lt
    } else {
        crate::ast::CmpOp::Gt
    };
    let mut best = first;
    for item in rest {
        if item.compare(op, best)? {
            best = item;
        }
    }
    Ok(best.clone())
}

fn round(number: &Value, ndigits: Option<&Value>) -> RaiseResult<Value> {
    let digits = match ndigits {
        None | Some(Value::None) => None,
        Some(d) => Some(d.as_index().ok_or_else(|| {
            Raised::type_error(format!(
                "'{}' object cannot be interpreted as an integer",
                d.type_name()
            ))
        })?),
    };
    match (number, digits) {
        (Value::Bool(b), _) => Ok(Value::Int(*b as i64)),
        (Value::Int(n), None) => Ok(Value::Int(*n)),
        (Value::Int(n), Some(d)) if d >= 0 => Ok(Value::Int(*n)),
        (Value::Int(n), Some(d)) => {
            let scale = 10f64.powi((-d).min(18) as i32);
            Ok(Value::Int((round_half_even(*n as f64 / scale) * scale) as i64))
        }
        (Value::Float(f), None) => {
            if !f.is_finite() {
                return to_int(number);
            }
            Ok(Value::Int(round_half_even(*f) as i64))
        }
        (Value::Float(f), Some(d)) => {
            let scale = 10f64.powi(d.clamp(-308, 308) as i32);
            let scaled = f * scale;
            if !scaled.is_finite() {
                return Ok(Value::Float(*f));
            }
            Ok(Value::Float(round_half_even(scaled) / scale))
        }
        (other, _) => Err(Raised::type_error(format!(
            "type {} doesn't define __round__ method",
            other.type_name()
        ))),
    }
}

/// Round to nearest, ties to even
fn round_half_even(x: f64) -> f64 {
    let rounded = x.round();
    if (x - x.trunc()).abs() == 0.5 {
        2.0 * (x / 2.0).round()
    } else {
        rounded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::DiagnosticKind;

    fn ok(name: &str, args: &[Value]) -> Value {
        call(name, args, &[]).unwrap()
    }

    fn fail(name: &str, args: &[Value]) -> (DiagnosticKind, String) {
        let e = call(name, args, &[]).unwrap_err();
        (e.kind, e.message)
    }

    #[test]
    fn test_int_conversion() {
        assert_eq!(ok("int", &[Value::from(" 42 ")]), Value::Int(42));
        assert_eq!(ok("int", &[Value::from("-1_000")]), Value::Int(-1000));
        assert_eq!(ok("int", &[Value::Float(-2.7)]), Value::Int(-2));
        assert_eq!(
            ok("int", &[Value::from("ff"), Value::Int(16)]),
            Value::Int(255)
        );
        assert_eq!(
            fail("int", &[Value::from("abc")]),
            (
                DiagnosticKind::ValueError,
                "invalid literal for int() with base 10: 'abc'".into()
            )
        );
        assert_eq!(fail("int", &[Value::from("1.5")]).0, DiagnosticKind::ValueError);
        assert_eq!(fail("int", &[Value::None]).0, DiagnosticKind::TypeError);
    }

    #[test]
    fn test_float_conversion() {
        assert_eq!(ok("float", &[Value::from("2.5")]), Value::Float(2.5));
        assert_eq!(
            fail("float", &[Value::from("on")]),
            (
                DiagnosticKind::ValueError,
                "could not convert string to float: 'on'".into()
            )
        );
    }

    #[test]
    fn test_len_min_max() {
        assert_eq!(ok("len", &[Value::from("héllo")]), Value::Int(5));
        assert_eq!(ok("min", &[Value::Int(3), Value::Float(1.5)]), Value::Float(1.5));
        assert_eq!(
            ok("max", &[Value::List(vec![Value::Int(1), Value::Int(7)])]),
            Value::Int(7)
        );
        assert_eq!(
            fail("max", &[Value::List(vec![])]),
            (
                DiagnosticKind::ValueError,
                "max() arg is an empty sequence".into()
            )
        );
        assert_eq!(
            fail("len", &[Value::Int(1)]).1,
            "object of type 'int' has no len()"
        );
    }

    #[test]
    fn test_round_is_bankers() {
        assert_eq!(ok("round", &[Value::Float(2.5)]), Value::Int(2));
        assert_eq!(ok("round", &[Value::Float(3.5)]), Value::Int(4));
        assert_eq!(ok("round", &[Value::Float(-2.5)]), Value::Int(-2));
        assert_eq!(
            ok("round", &[Value::Float(1.256), Value::Int(2)]).to_string(),
            "1.26"
        );
    }

    #[test]
    fn test_keywords_rejected() {
        let e = call("int", &[], &[("base".into(), Value::Int(2))]).unwrap_err();
        assert_eq!(e.message, "int() takes no keyword arguments");
    }

    #[test]
    fn test_methods() {
        let s = Value::from(" On ");
        assert_eq!(call_method(&s, "strip", &[]).unwrap(), Value::from("On"));
        assert_eq!(call_method(&s, "lower", &[]).unwrap(), Value::from(" on "));
        assert_eq!(
            call_method(&Value::from("a,b"), "split", &[Value::from(",")]).unwrap(),
            Value::List(vec![Value::from("a"), Value::from("b")])
        );
        let dict = Value::from_json(&serde_json::json!({"a": 1}));
        assert_eq!(call_method(&dict, "get", &[Value::from("b")]).unwrap(), Value::None);
        let e = call_method(&Value::Int(1), "lower", &[]).unwrap_err();
        assert_eq!(e.message, "'int' object has no attribute 'lower'");
    }

    #[test]
    fn test_replace_growth_is_bounded() {
        let s = Value::from("ab");
        assert_eq!(
            call_method(&s, "replace", &[Value::from(""), Value::from("-")]).unwrap(),
            Value::from("-a-b-")
        );
        let wide = Value::Str("x".repeat(4096));
        let e = call_method(&wide, "replace", &[Value::from("x"), wide.clone()]).unwrap_err();
        assert_eq!(e.kind, DiagnosticKind::OverflowError);
        assert_eq!(e.message, "replace string is too long");
    }
}
