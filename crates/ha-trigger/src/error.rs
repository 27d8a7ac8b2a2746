//! Error types for the trigger engine

use std::path::PathBuf;
use thiserror::Error;

use crate::config::ConfigError;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that stop a whole script (or the engine) from loading
///
/// Problems confined to one decorated function are not errors here: they are
/// reported as diagnostics and only that function is skipped.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Failed to read a script file
    #[error("failed to read script {path}: {source}")]
    ReadScript {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A decorator's argument list never closes
    #[error("unterminated decorator in {module} at line {line}")]
    UnterminatedDecorator { module: String, line: usize },

    /// Configuration problem
    #[error(transparent)]
    Config(#[from] ConfigError),
}
