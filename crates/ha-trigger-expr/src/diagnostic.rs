//! Positional diagnostics mapped back onto decorator source
//!
//! Every error that leaves this crate is a [`Diagnostic`]. The [`Origin`]
//! says where the expression text came from so the rendered message names
//! the script function and decorator instead of an internal location.

use serde::Serialize;
use std::fmt;

/// Where in a script function an expression was written
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum Site {
    /// A decorator such as `@state_trigger(...)`; holds the decorator name
    Decorator(String),
    /// A keyword argument of a call such as `wait_until(state_trigger=...)`
    Keyword(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Origin {
    /// Dotted module path, e.g. `file.hello`
    pub module: String,
    pub function: String,
    pub site: Site,
    /// 1-based line of the decorator in the script, 0 when unknown
    pub script_line: usize,
    /// 0-based column of the expression's first character on that line
    pub script_column: usize,
}

impl Origin {
    pub fn decorator(
        module: impl Into<String>,
        function: impl Into<String>,
        decorator: impl Into<String>,
        script_line: usize,
        script_column: usize,
    ) -> Self {
        Self {
            module: module.into(),
            function: function.into(),
            site: Site::Decorator(decorator.into()),
            script_line,
            script_column,
        }
    }

    pub fn keyword(
        module: impl Into<String>,
        function: impl Into<String>,
        keyword: impl Into<String>,
    ) -> Self {
        Self {
            module: module.into(),
            function: function.into(),
            site: Site::Keyword(keyword.into()),
            script_line: 0,
            script_column: 0,
        }
    }

    /// The pseudo file name shown in messages
    ///
    /// `file.hello.func1 @state_trigger()` for decorators,
    /// `file.hello.func7 state_trigger` for keyword arguments.
    pub fn filename(&self) -> String {
        match &self.site {
            Site::Decorator(name) => format!("{}.{} @{}()", self.module, self.function, name),
            Site::Keyword(name) => format!("{}.{} {}", self.module, self.function, name),
        }
    }

    /// Map a line within the expression text (1-based) to a script line
    fn map_line(&self, line: usize) -> usize {
        if self.script_line == 0 {
            0
        } else {
            self.script_line + line - 1
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DiagnosticKind {
    SyntaxError,
    TypeError,
    ZeroDivisionError,
    NameError,
    AttributeError,
    ValueError,
    IndexError,
    KeyError,
    OverflowError,
    MissingTriggerError,
}

impl DiagnosticKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DiagnosticKind::SyntaxError => "SyntaxError",
            DiagnosticKind::TypeError => "TypeError",
            DiagnosticKind::ZeroDivisionError => "ZeroDivisionError",
            DiagnosticKind::NameError => "NameError",
            DiagnosticKind::AttributeError => "AttributeError",
            DiagnosticKind::ValueError => "ValueError",
            DiagnosticKind::IndexError => "IndexError",
            DiagnosticKind::KeyError => "KeyError",
            DiagnosticKind::OverflowError => "OverflowError",
            DiagnosticKind::MissingTriggerError => "MissingTriggerError",
        }
    }
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured, positionally mapped error report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
    /// Pseudo file name from [`Origin::filename`]
    pub filename: String,
    /// 1-based line within the expression text, 0 when there is no position
    pub line: usize,
    /// 0-based column within that line
    pub column: usize,
    /// Line in the script file, 0 when unknown
    pub script_line: usize,
    /// The offending line of expression text, when there is a position
    pub excerpt: Option<String>,
}

impl Diagnostic {
    /// A syntax error at byte `offset` of `source`
    pub fn syntax(origin: &Origin, source: &str, message: &str, offset: usize) -> Self {
        Self::positioned(DiagnosticKind::SyntaxError, origin, source, message, offset)
    }

    /// A run-time exception raised while evaluating `source`
    pub fn runtime(
        kind: DiagnosticKind,
        origin: &Origin,
        source: &str,
        message: &str,
        offset: usize,
    ) -> Self {
        Self::positioned(kind, origin, source, message, offset)
    }

    /// An error with no position inside an expression (bad arguments)
    pub fn unpositioned(kind: DiagnosticKind, origin: &Origin, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            filename: origin.filename(),
            line: 0,
            column: 0,
            script_line: origin.script_line,
            excerpt: None,
        }
    }

    /// A function carries guard decorators but nothing that triggers it
    pub fn missing_trigger(module: &str, function: &str, script_line: usize) -> Self {
        Self {
            kind: DiagnosticKind::MissingTriggerError,
            message: format!(
                "{function} defined in {module}: needs at least one trigger decorator \
                 (ie: event_trigger, state_trigger, time_trigger)"
            ),
            filename: format!("{module}.{function}"),
            line: 0,
            column: 0,
            script_line,
            excerpt: None,
        }
    }

    fn positioned(
        kind: DiagnosticKind,
        origin: &Origin,
        source: &str,
        message: &str,
        offset: usize,
    ) -> Self {
        let (line, column, text) = locate(source, offset);
        Self {
            kind,
            message: message.to_string(),
            filename: origin.filename(),
            line,
            column,
            script_line: origin.map_line(line),
            excerpt: Some(text.to_string()),
        }
    }

    pub fn is_syntax_error(&self) -> bool {
        self.kind == DiagnosticKind::SyntaxError
    }

    /// Full log form of the diagnostic
    ///
    /// Syntax errors render on one line; run-time errors render as a
    /// traceback with the expression line and a caret under the offending
    /// position.
    pub fn render(&self) -> String {
        match (self.kind, &self.excerpt) {
            (DiagnosticKind::SyntaxError, _) => format!("SyntaxError: {self}"),
            (DiagnosticKind::MissingTriggerError, _) => self.message.clone(),
            (kind, Some(excerpt)) => {
                let caret_pad = excerpt
                    .chars()
                    .take(self.column)
                    .map(|c| if c == '\t' { '\t' } else { ' ' })
                    .collect::<String>();
                format!(
                    "Exception in <{}> line {}:\n    {}\n    {}^\n{}: {}",
                    self.filename, self.line, excerpt, caret_pad, kind, self.message
                )
            }
            (kind, None) => format!("{kind}: {}", self.message),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_syntax_error() {
            write!(f, "{} ({}, line {})", self.message, self.filename, self.line)
        } else {
            f.write_str(&self.message)
        }
    }
}

impl std::error::Error for Diagnostic {}

/// 1-based line, 0-based character column and the text of that line
fn locate(source: &str, offset: usize) -> (usize, usize, &str) {
    let offset = floor_char_boundary(source, offset.min(source.len()));
    let line_start = source[..offset].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let line_end = source[offset..]
        .find('\n')
        .map(|i| offset + i)
        .unwrap_or(source.len());
    let line = source[..offset].matches('\n').count() + 1;
    let column = source[line_start..offset].chars().count();
    (line, column, &source[line_start..line_end])
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
