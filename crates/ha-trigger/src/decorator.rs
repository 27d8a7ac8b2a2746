//! Script scanning
//!
//! Finds each function definition in a script together with the decorators
//! stacked directly above it. Only the decorator lines are read; function
//! bodies are never interpreted.

use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use tracing::trace;

use crate::error::{EngineError, EngineResult};

/// One `@name(...)` line (or lines, when the arguments span several)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decorator {
    pub name: String,
    /// 1-based script line of the `@`
    pub line: usize,
    /// 0-based column of the first character after the opening parenthesis
    pub column: usize,
    /// Text between the parentheses, newlines kept
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDef {
    pub name: String,
    /// 1-based script line of the `def`
    pub line: usize,
    /// Decorators in source order, top to bottom
    pub decorators: Vec<Decorator>,
}

/// The scanned shape of one script
#[derive(Debug, Clone)]
pub struct ScriptSource {
    module: String,
    functions: Vec<FunctionDef>,
}

fn def_pattern() -> &'static Regex {
    static DEF: OnceLock<Regex> = OnceLock::new();
    DEF.get_or_init(|| {
        Regex::new(r"^\s*(?:async\s+)?def\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(")
            .unwrap_or_else(|e| unreachable!("invalid def pattern: {e}"))
    })
}

/// Module path of a script file, e.g. `file.hello` for `pyscripts/hello.py`
pub fn module_name_for(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default();
    format!("file.{stem}")
}

impl ScriptSource {
    pub fn scan(module: impl Into<String>, text: &str) -> EngineResult<Self> {
        let module = module.into();
        let lines: Vec<&str> = text.lines().collect();
        let mut functions = Vec::new();
        let mut pending: Vec<Decorator> = Vec::new();
        let mut index = 0;

        while index < lines.len() {
            let line = lines[index];
            let trimmed = line.trim_start();

            if let Some(rest) = trimmed.strip_prefix('@') {
                let at = index;
                let name_len = rest
                    .find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '.'))
                    .unwrap_or(rest.len());
                let name = rest[..name_len].to_string();
                let after = &rest[name_len..];

                let (arguments, column) = if after.trim_start().starts_with('(') {
                    let open = line.len() - after.trim_start().len();
                    let column = line[..=open].chars().count();
                    let (arguments, last) =
                        collect_arguments(&lines, index, open + 1).ok_or_else(|| {
                            EngineError::UnterminatedDecorator {
                                module: module.clone(),
                                line: at + 1,
                            }
                        })?;
                    index = last;
                    (arguments, column)
                } else {
                    (String::new(), line.len() - after.len())
                };

                trace!(decorator = %name, line = at + 1, "Found decorator");
                pending.push(Decorator {
                    name,
                    line: at + 1,
                    column,
                    arguments,
                });
            } else if let Some(caps) = def_pattern().captures(line) {
                functions.push(FunctionDef {
                    name: caps[1].to_string(),
                    line: index + 1,
                    decorators: std::mem::take(&mut pending),
                });
            } else if !(trimmed.is_empty() || trimmed.starts_with('#')) {
                pending.clear();
            }
            index += 1;
        }

        Ok(Self { module, functions })
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn functions(&self) -> &[FunctionDef] {
        &self.functions
    }
}

/// Collect call arguments starting at byte `start` of `lines[first]` up to
/// the matching close parenthesis
///
/// Returns the text and the index of the line holding the close, or None
/// when the script ends first.
fn collect_arguments(lines: &[&str], first: usize, start: usize) -> Option<(String, usize)> {
    let mut text = String::new();
    let mut depth = 1usize;
    let mut quote: Option<char> = None;

    for (index, line) in lines.iter().enumerate().skip(first) {
        let segment = if index == first { &line[start..] } else { line };
        let mut chars = segment.char_indices();
        while let Some((i, c)) = chars.next() {
            match quote {
                Some(q) => {
                    if c == '\\' {
                        chars.next();
                    } else if c == q {
                        quote = None;
                    }
                }
                None => match c {
                    '\'' | '"' => quote = Some(c),
                    '(' | '[' | '{' => depth += 1,
                    ')' | ']' | '}' => {
                        depth -= 1;
                        if depth == 0 {
                            text.push_str(&segment[..i]);
                            return Some((text, index));
                        }
                    }
                    '#' => break,
                    _ => {}
                },
            }
        }
        // An unterminated string ends with its line; the parser reports it
        quote = None;
        text.push_str(segment);
        text.push('\n');
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = r#"
seq_num = 0

@time_trigger("startup")
def func_startup_sync(trigger_type=None, trigger_time=None):
    pass

@state_trigger("True")
@state_active("z + ")
def func3():
    pass

@state_trigger("pyscript.var1 == '1'",
               "pyscript.var2 == ')'")
async def func8():
    pass

@state_active("x")
x = 1
def undecorated():
    @state_trigger("inner")
    def nested():
        pass
"#;

    #[test]
    fn test_scan_collects_decorators() {
        let script = ScriptSource::scan("file.hello", SCRIPT).unwrap();
        assert_eq!(script.module(), "file.hello");
        let names: Vec<_> = script.functions().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            ["func_startup_sync", "func3", "func8", "undecorated", "nested"]
        );

        let startup = &script.functions()[0];
        assert_eq!(startup.line, 5);
        assert_eq!(startup.decorators.len(), 1);
        let d = &startup.decorators[0];
        assert_eq!(d.name, "time_trigger");
        assert_eq!(d.line, 4);
        assert_eq!(d.column, 14);
        assert_eq!(d.arguments, "\"startup\"");

        let func3 = &script.functions()[1];
        let names: Vec<_> = func3.decorators.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["state_trigger", "state_active"]);
        assert_eq!(func3.decorators[1].line, 9);
    }

    #[test]
    fn test_multiline_arguments() {
        let script = ScriptSource::scan("file.hello", SCRIPT).unwrap();
        let func8 = &script.functions()[2];
        assert_eq!(func8.line, 15);
        let d = &func8.decorators[0];
        assert_eq!(d.line, 13);
        assert_eq!(
            d.arguments,
            "\"pyscript.var1 == '1'\",\n               \"pyscript.var2 == ')'\""
        );
    }

    #[test]
    fn test_code_between_decorator_and_def_drops_it() {
        let script = ScriptSource::scan("file.hello", SCRIPT).unwrap();
        assert!(script.functions()[3].decorators.is_empty());
        let nested = &script.functions()[4];
        assert_eq!(nested.decorators[0].arguments, "\"inner\"");
        assert_eq!(nested.decorators[0].column, 19);
    }

    #[test]
    fn test_unterminated_decorator() {
        let err = ScriptSource::scan("file.bad", "\n@state_trigger(\"a\"\ndef f():\n    pass\n")
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::UnterminatedDecorator { ref module, line: 2 } if module == "file.bad"
        ));
    }

    #[test]
    fn test_module_name() {
        assert_eq!(
            module_name_for(Path::new("/config/pyscripts/hello.py")),
            "file.hello"
        );
    }
}
