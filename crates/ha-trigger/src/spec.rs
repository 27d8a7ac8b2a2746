//! Turning scanned decorators into trigger and guard specs
//!
//! Everything that can be wrong with a decorated function is found here, at
//! load time, and reported as diagnostics for that function alone.

use ha_trigger_expr::{
    parse, parse_arguments, ConditionTree, Diagnostic, DiagnosticKind, Expr, Origin, Value,
};
use indexmap::IndexMap;
use std::time::Duration;

use crate::decorator::{Decorator, FunctionDef};
use crate::time_spec::{ActiveRange, TimeSpec};

pub const STATE_TRIGGER: &str = "state_trigger";
pub const EVENT_TRIGGER: &str = "event_trigger";
pub const TIME_TRIGGER: &str = "time_trigger";
pub const STATE_ACTIVE: &str = "state_active";
pub const TIME_ACTIVE: &str = "time_active";

const TRIGGERS: &[&str] = &[STATE_TRIGGER, EVENT_TRIGGER, TIME_TRIGGER];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    State,
    Event,
    Time,
}

/// Keyword options of `@state_trigger`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateOptions {
    /// Fire only if the expression stays true this long
    pub hold: Option<Duration>,
    /// Rising-edge mode: the expression must have been false this long
    pub hold_false: Option<Duration>,
    /// Evaluate once when the watcher arms
    pub check_now: bool,
}

#[derive(Debug, Clone)]
pub enum TriggerBody {
    /// Any of the expressions satisfied fires
    State {
        exprs: Vec<ConditionTree>,
        options: StateOptions,
    },
    Event {
        event_type: String,
        filter: Option<ConditionTree>,
    },
    Time { specs: Vec<TimeSpec> },
}

/// One trigger decorator of a function
#[derive(Debug, Clone)]
pub struct TriggerSpec {
    pub origin: Origin,
    pub kwargs: IndexMap<String, serde_json::Value>,
    pub body: TriggerBody,
}

impl TriggerSpec {
    pub fn kind(&self) -> TriggerKind {
        match self.body {
            TriggerBody::State { .. } => TriggerKind::State,
            TriggerBody::Event { .. } => TriggerKind::Event,
            TriggerBody::Time { .. } => TriggerKind::Time,
        }
    }

    /// `file.hello.func1 @state_trigger()`
    pub fn name(&self) -> String {
        self.origin.filename()
    }
}

#[derive(Debug, Clone)]
pub enum GuardSpec {
    StateActive(ConditionTree),
    TimeActive(Vec<ActiveRange>),
}

/// A decorated function ready to be armed
#[derive(Debug, Clone)]
pub struct FunctionSpec {
    pub module: String,
    pub name: String,
    pub line: usize,
    pub triggers: Vec<TriggerSpec>,
    pub guards: Vec<GuardSpec>,
}

impl FunctionSpec {
    /// `module.function`, the key handlers are registered under
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.module, self.name)
    }

    /// Build the spec of one scanned function
    ///
    /// Returns None for functions with no known decorators. All problems
    /// found are returned together.
    pub fn build(module: &str, def: &FunctionDef) -> Option<Result<Self, Vec<Diagnostic>>> {
        let known: Vec<&Decorator> = def
            .decorators
            .iter()
            .filter(|d| {
                TRIGGERS.contains(&d.name.as_str()) || d.name == STATE_ACTIVE || d.name == TIME_ACTIVE
            })
            .collect();
        if known.is_empty() {
            return None;
        }
        if !known.iter().any(|d| TRIGGERS.contains(&d.name.as_str())) {
            let line = known.first().map_or(def.line, |d| d.line);
            return Some(Err(vec![Diagnostic::missing_trigger(
                module, &def.name, line,
            )]));
        }

        let mut spec = FunctionSpec {
            module: module.to_string(),
            name: def.name.clone(),
            line: def.line,
            triggers: Vec::new(),
            guards: Vec::new(),
        };
        let mut errors = Vec::new();
        for decorator in known {
            let args = DecoratorArgs {
                module,
                function: &def.name,
                decorator,
            };
            let built = match decorator.name.as_str() {
                STATE_TRIGGER => args.state_trigger().map(|t| spec.triggers.push(t)),
                EVENT_TRIGGER => args.event_trigger().map(|t| spec.triggers.push(t)),
                TIME_TRIGGER => args.time_trigger().map(|t| spec.triggers.push(t)),
                STATE_ACTIVE => args.state_active().map(|g| spec.guards.push(g)),
                _ => args.time_active().map(|g| spec.guards.push(g)),
            };
            if let Err(diagnostic) = built {
                errors.push(diagnostic);
            }
        }
        Some(if errors.is_empty() { Ok(spec) } else { Err(errors) })
    }
}

/// Argument handling for one decorator
struct DecoratorArgs<'a> {
    module: &'a str,
    function: &'a str,
    decorator: &'a Decorator,
}

/// Positional strings with the expression offset each came from
type Strings = Vec<(String, usize)>;

impl DecoratorArgs<'_> {
    fn name(&self) -> &str {
        &self.decorator.name
    }

    fn origin(&self) -> Origin {
        Origin::decorator(
            self.module,
            self.function,
            self.name(),
            self.decorator.line,
            self.decorator.column,
        )
    }

    /// Origin of an expression found at byte `offset` of the argument text
    ///
    /// `offset` points at the opening quote, so the expression itself starts
    /// one column later.
    fn origin_at(&self, offset: usize) -> Origin {
        let text = &self.decorator.arguments[..offset];
        let mut origin = self.origin();
        match text.rfind('\n') {
            Some(newline) => {
                origin.script_line += text.matches('\n').count();
                origin.script_column = text[newline + 1..].chars().count() + 1;
            }
            None => origin.script_column += text.chars().count() + 1,
        }
        origin
    }

    fn type_error(&self, message: String) -> Diagnostic {
        Diagnostic::unpositioned(DiagnosticKind::TypeError, &self.origin(), message)
    }

    fn parse(&self) -> Result<(Strings, IndexMap<String, Value>), Diagnostic> {
        let source = &self.decorator.arguments;
        let args = parse_arguments(source).map_err(|e| {
            Diagnostic::syntax(&self.origin(), source, &e.message, e.offset)
        })?;

        let mut strings = Vec::new();
        for expr in &args.positional {
            self.collect_strings(expr, &mut strings)?;
        }
        let mut keywords = IndexMap::new();
        for (name, expr) in &args.keywords {
            let value = expr.as_literal().ok_or_else(|| {
                self.type_error(format!(
                    "{}() keyword argument '{name}' must be a literal",
                    self.name()
                ))
            })?;
            keywords.insert(name.clone(), value);
        }
        Ok((strings, keywords))
    }

    fn collect_strings(&self, expr: &Expr, out: &mut Strings) -> Result<(), Diagnostic> {
        match expr.as_literal() {
            Some(Value::Str(s)) => {
                out.push((s, expr.span.start));
                Ok(())
            }
            Some(Value::List(items)) | Some(Value::Tuple(items)) => {
                // List items lose their own spans; point at the list
                for item in items {
                    match item {
                        Value::Str(s) => out.push((s, expr.span.start)),
                        other => return Err(self.not_a_string(&other)),
                    }
                }
                Ok(())
            }
            Some(other) => Err(self.not_a_string(&other)),
            None => Err(self.type_error(format!(
                "{}() arguments must be string literals",
                self.name()
            ))),
        }
    }

    fn not_a_string(&self, value: &Value) -> Diagnostic {
        self.type_error(format!(
            "{}() expects string arguments, got {}",
            self.name(),
            value.type_name()
        ))
    }

    fn unexpected_keywords(
        &self,
        keywords: &IndexMap<String, Value>,
        allowed: &[&str],
    ) -> Result<(), Diagnostic> {
        match keywords.keys().find(|k| !allowed.contains(&k.as_str())) {
            Some(k) => Err(self.type_error(format!(
                "{}() got an unexpected keyword argument '{k}'",
                self.name()
            ))),
            None => Ok(()),
        }
    }

    fn kwargs(
        &self,
        keywords: &mut IndexMap<String, Value>,
    ) -> Result<IndexMap<String, serde_json::Value>, Diagnostic> {
        match keywords.shift_remove("kwargs") {
            None | Some(Value::None) => Ok(IndexMap::new()),
            Some(Value::Dict(map)) => Ok(map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()),
            Some(other) => Err(self.type_error(format!(
                "{}() kwargs must be a dict, got {}",
                self.name(),
                other.type_name()
            ))),
        }
    }

    fn seconds(&self, keyword: &str, value: Option<Value>) -> Result<Option<Duration>, Diagnostic> {
        let secs = match value {
            None | Some(Value::None) => return Ok(None),
            Some(Value::Int(n)) => n as f64,
            Some(Value::Float(f)) => f,
            Some(other) => {
                return Err(self.type_error(format!(
                    "{}() {keyword} must be a number, got {}",
                    self.name(),
                    other.type_name()
                )))
            }
        };
        if !secs.is_finite() || secs < 0.0 {
            return Err(Diagnostic::unpositioned(
                DiagnosticKind::ValueError,
                &self.origin(),
                format!("{}() {keyword} must be a non-negative number", self.name()),
            ));
        }
        Ok(Some(Duration::from_secs_f64(secs)))
    }

    fn expression(&self, text: &str, offset: usize) -> Result<ConditionTree, Diagnostic> {
        parse(text, &self.origin_at(offset))
    }

    fn state_trigger(&self) -> Result<TriggerSpec, Diagnostic> {
        let (strings, mut keywords) = self.parse()?;
        let kwargs = self.kwargs(&mut keywords)?;
        self.unexpected_keywords(&keywords, &["state_hold", "state_hold_false", "state_check_now"])?;
        if strings.is_empty() {
            return Err(self.type_error(format!(
                "{}() needs at least one expression",
                self.name()
            )));
        }
        let options = StateOptions {
            hold: self.seconds("state_hold", keywords.shift_remove("state_hold"))?,
            hold_false: self.seconds("state_hold_false", keywords.shift_remove("state_hold_false"))?,
            check_now: keywords
                .shift_remove("state_check_now")
                .is_some_and(|v| v.is_truthy()),
        };
        let exprs = strings
            .iter()
            .map(|(text, offset)| self.expression(text, *offset))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TriggerSpec {
            origin: self.origin(),
            kwargs,
            body: TriggerBody::State { exprs, options },
        })
    }

    fn event_trigger(&self) -> Result<TriggerSpec, Diagnostic> {
        let (strings, mut keywords) = self.parse()?;
        let kwargs = self.kwargs(&mut keywords)?;
        self.unexpected_keywords(&keywords, &[])?;
        let (event_type, filter) = match strings.as_slice() {
            [(event_type, _)] => (event_type.clone(), None),
            [(event_type, _), (filter, offset)] => {
                (event_type.clone(), Some(self.expression(filter, *offset)?))
            }
            _ => {
                return Err(self.type_error(format!(
                    "{}() takes an event type and an optional filter expression, got {} arguments",
                    self.name(),
                    strings.len()
                )))
            }
        };
        Ok(TriggerSpec {
            origin: self.origin(),
            kwargs,
            body: TriggerBody::Event { event_type, filter },
        })
    }

    fn time_trigger(&self) -> Result<TriggerSpec, Diagnostic> {
        let (strings, mut keywords) = self.parse()?;
        let kwargs = self.kwargs(&mut keywords)?;
        self.unexpected_keywords(&keywords, &[])?;
        let specs = if strings.is_empty() {
            vec![TimeSpec::Startup]
        } else {
            strings
                .iter()
                .map(|(text, _)| TimeSpec::parse(text).map_err(|e| self.value_error(e)))
                .collect::<Result<Vec<_>, _>>()?
        };
        Ok(TriggerSpec {
            origin: self.origin(),
            kwargs,
            body: TriggerBody::Time { specs },
        })
    }

    fn state_active(&self) -> Result<GuardSpec, Diagnostic> {
        let (strings, keywords) = self.parse()?;
        self.unexpected_keywords(&keywords, &[])?;
        match strings.as_slice() {
            [(text, offset)] => Ok(GuardSpec::StateActive(self.expression(text, *offset)?)),
            _ => Err(self.type_error(format!(
                "{}() takes exactly one expression, got {}",
                self.name(),
                strings.len()
            ))),
        }
    }

    fn time_active(&self) -> Result<GuardSpec, Diagnostic> {
        let (strings, keywords) = self.parse()?;
        self.unexpected_keywords(&keywords, &[])?;
        let ranges = strings
            .iter()
            .map(|(text, _)| ActiveRange::parse(text).map_err(|e| self.value_error(e)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(GuardSpec::TimeActive(ranges))
    }

    fn value_error(&self, e: impl std::fmt::Display) -> Diagnostic {
        Diagnostic::unpositioned(
            DiagnosticKind::ValueError,
            &self.origin(),
            format!("{}(): {e}", self.name()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decorator::ScriptSource;

    fn build(script: &str) -> Vec<Option<Result<FunctionSpec, Vec<Diagnostic>>>> {
        let scanned = ScriptSource::scan("file.hello", script).unwrap();
        scanned
            .functions()
            .iter()
            .map(|f| FunctionSpec::build("file.hello", f))
            .collect()
    }

    fn single(script: &str) -> Result<FunctionSpec, Vec<Diagnostic>> {
        build(script).remove(0).expect("function has decorators")
    }

    #[test]
    fn test_state_trigger_with_options() {
        let spec = single(
            "@state_trigger(\"pyscript.var1 == '1'\", state_hold=2.5, state_hold_false=0, kwargs={'room': 'den'})\n\
             @state_active(\"pyscript.mode == 'on'\")\n\
             def f():\n    pass\n",
        )
        .unwrap();
        assert_eq!(spec.qualified_name(), "file.hello.f");
        assert_eq!(spec.line, 3);
        assert_eq!(spec.triggers.len(), 1);
        assert_eq!(spec.guards.len(), 1);

        let trigger = &spec.triggers[0];
        assert_eq!(trigger.kind(), TriggerKind::State);
        assert_eq!(trigger.name(), "file.hello.f @state_trigger()");
        assert_eq!(trigger.kwargs["room"], "den");
        let TriggerBody::State { exprs, options } = &trigger.body else {
            panic!("expected a state trigger");
        };
        assert_eq!(exprs.len(), 1);
        assert_eq!(exprs[0].origin().script_line, 1);
        assert_eq!(exprs[0].origin().script_column, 16);
        assert_eq!(options.hold, Some(Duration::from_millis(2500)));
        assert_eq!(options.hold_false, Some(Duration::ZERO));
        assert!(!options.check_now);
    }

    #[test]
    fn test_syntax_errors_name_the_decorator() {
        let errors = single("@state_trigger(\"True\")\n@state_active(\"z + \")\ndef func3():\n    pass\n")
            .unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].render(),
            "SyntaxError: invalid syntax (file.hello.func3 @state_active(), line 1)"
        );
        assert_eq!(errors[0].script_line, 2);

        let errors =
            single("@event_trigger(\"some_event\", \"func(\")\ndef func2():\n    pass\n").unwrap_err();
        assert_eq!(
            errors[0].render(),
            "SyntaxError: unexpected EOF while parsing (file.hello.func2 @event_trigger(), line 1)"
        );
    }

    #[test]
    fn test_guards_only_is_missing_trigger() {
        let errors = single("@state_active(\"z + \")\ndef func4():\n    pass\n").unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, DiagnosticKind::MissingTriggerError);
        assert_eq!(errors[0].script_line, 1);
    }

    #[test]
    fn test_undecorated_and_unknown_decorators_skipped() {
        let built = build("def plain():\n    pass\n\n@service\ndef svc():\n    pass\n");
        assert!(built.iter().all(Option::is_none));
    }

    #[test]
    fn test_time_trigger_forms() {
        let spec = single(
            "@time_trigger\ndef a():\n    pass\n",
        )
        .unwrap();
        assert!(matches!(
            &spec.triggers[0].body,
            TriggerBody::Time { specs } if specs == &[TimeSpec::Startup]
        ));

        let spec = single(
            "@time_trigger([\"once(10:00)\", \"shutdown\"], \"cron(0 * * * *)\")\ndef b():\n    pass\n",
        )
        .unwrap();
        let TriggerBody::Time { specs } = &spec.triggers[0].body else {
            panic!("expected a time trigger");
        };
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[1], TimeSpec::Shutdown);

        let errors = single("@time_trigger(\"sometime\")\ndef c():\n    pass\n").unwrap_err();
        assert_eq!(errors[0].kind, DiagnosticKind::ValueError);
        assert!(errors[0].message.contains("sometime"));
    }

    #[test]
    fn test_bad_arguments_are_type_errors() {
        let errors = single("@state_trigger(1 + 2)\ndef a():\n    pass\n").unwrap_err();
        assert_eq!(errors[0].kind, DiagnosticKind::TypeError);

        let errors =
            single("@state_trigger(\"x.y\", hold=3)\ndef a():\n    pass\n").unwrap_err();
        assert!(errors[0]
            .message
            .contains("unexpected keyword argument 'hold'"));

        let errors = single("@event_trigger()\ndef a():\n    pass\n").unwrap_err();
        assert_eq!(errors[0].kind, DiagnosticKind::TypeError);
    }

    #[test]
    fn test_multiline_expression_origin() {
        let spec = single(
            "@state_trigger(\"a.b\",\n    \"c.d\")\n@time_active(\"range(8:00, 20:00)\")\ndef f():\n    pass\n",
        )
        .unwrap();
        let TriggerBody::State { exprs, .. } = &spec.triggers[0].body else {
            panic!("expected a state trigger");
        };
        assert_eq!(exprs[1].origin().script_line, 2);
        assert_eq!(exprs[1].origin().script_column, 5);
        assert!(matches!(&spec.guards[0], GuardSpec::TimeActive(r) if r.len() == 1));
    }
}
