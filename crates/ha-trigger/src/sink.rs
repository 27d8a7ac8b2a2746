//! Where diagnostics go

use ha_trigger_expr::Diagnostic;
use std::sync::{Arc, Mutex};
use tracing::error;

/// Receives every failed compile and every errored evaluation, once each
pub trait DiagnosticSink: Send + Sync {
    fn log_error(&self, diagnostic: &Diagnostic);
}

pub type SharedSink = Arc<dyn DiagnosticSink>;

/// Logs diagnostics at error level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn log_error(&self, diagnostic: &Diagnostic) {
        error!(
            kind = %diagnostic.kind,
            script_line = diagnostic.script_line,
            "{}",
            diagnostic.render()
        );
    }
}

/// Keeps rendered diagnostics in memory, and also logs them
#[derive(Debug, Default)]
pub struct CollectingSink {
    entries: Mutex<Vec<Diagnostic>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record without logging, e.g. an error a handler caught from `wait_until`
    pub fn push(&self, diagnostic: Diagnostic) {
        self.lock().push(diagnostic);
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.lock().clone()
    }

    /// All rendered diagnostics joined by newlines
    pub fn text(&self) -> String {
        self.lock()
            .iter()
            .map(Diagnostic::render)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lock().iter().any(|d| d.render().contains(needle))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Diagnostic>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DiagnosticSink for CollectingSink {
    fn log_error(&self, diagnostic: &Diagnostic) {
        TracingSink.log_error(diagnostic);
        self.push(diagnostic.clone());
    }
}
