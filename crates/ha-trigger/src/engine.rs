//! The trigger engine: loads scripts and owns their watchers

use dashmap::DashMap;
use futures::future::join_all;
use ha_host::Host;
use ha_trigger_expr::Diagnostic;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::{SharedClock, SystemClock};
use crate::config::EngineConfig;
use crate::decorator::{module_name_for, ScriptSource};
use crate::error::{EngineError, EngineResult};
use crate::handler::{HandlerRunner, LogHandler, TriggerHandler};
use crate::sink::{SharedSink, TracingSink};
use crate::spec::FunctionSpec;
use crate::wait::{WaitOptions, WaitOutcome, Waiter};
use crate::watcher::{self, Runtime, WatcherHandle, WatcherPhase};

/// What happened when a script was loaded
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub module: String,
    /// Functions armed, as `module.function`
    pub loaded: Vec<String>,
    /// Functions skipped because of diagnostics
    pub failed: Vec<String>,
    pub watchers: usize,
}

/// Registry of loaded scripts and their watchers
pub struct TriggerEngine {
    rt: Runtime,
    config: EngineConfig,
    /// Function bodies keyed by `module.function`
    handlers: DashMap<String, Arc<dyn TriggerHandler>>,
    /// Watchers keyed by module
    scripts: DashMap<String, Vec<WatcherHandle>>,
}

impl TriggerEngine {
    pub fn new(host: Arc<Host>, config: EngineConfig) -> Self {
        Self {
            rt: Runtime {
                host,
                clock: Arc::new(SystemClock),
                sink: Arc::new(TracingSink),
            },
            config,
            handlers: DashMap::new(),
            scripts: DashMap::new(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.rt.clock = clock;
        self
    }

    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.rt.sink = sink;
        self
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.rt.host
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register the body of script function `module.function`
    ///
    /// Takes effect for scripts loaded (or reloaded) afterwards.
    pub fn register_handler(
        &self,
        function: impl Into<String>,
        handler: impl TriggerHandler + 'static,
    ) {
        let function = function.into();
        debug!(function = %function, "Registered handler");
        self.handlers.insert(function, Arc::new(handler));
    }

    /// A cloneable handle for calling `wait_until` from handlers
    pub fn waiter(&self) -> Waiter {
        Waiter::new(self.rt.clone(), self.config.wait_until_timeout())
    }

    pub async fn wait_until(
        &self,
        module: &str,
        function: &str,
        options: WaitOptions,
    ) -> Result<WaitOutcome, Diagnostic> {
        self.waiter().wait_until(module, function, options).await
    }

    /// Load a script and arm every valid decorated function in it
    ///
    /// A module that is already loaded is unloaded first. Diagnostics go to
    /// the sink and skip only the function they belong to.
    #[instrument(skip(self, source))]
    pub async fn load_script(&self, module: &str, source: &str) -> EngineResult<LoadReport> {
        let script = ScriptSource::scan(module, source)?;
        if self.scripts.contains_key(module) {
            self.unload_script(module).await;
        }

        let mut report = LoadReport {
            module: module.to_string(),
            ..Default::default()
        };
        let mut handles = Vec::new();
        for def in script.functions() {
            let spec = match FunctionSpec::build(module, def) {
                None => continue,
                Some(Ok(spec)) => spec,
                Some(Err(diagnostics)) => {
                    for diagnostic in &diagnostics {
                        self.rt.sink.log_error(diagnostic);
                    }
                    report.failed.push(format!("{module}.{}", def.name));
                    continue;
                }
            };

            let runner = Arc::new(HandlerRunner::new(
                spec.qualified_name(),
                self.handler_for(&spec.qualified_name()),
                self.config.handler_mode,
            ));
            for trigger in &spec.triggers {
                handles.push(watcher::spawn(
                    self.rt.clone(),
                    trigger,
                    &spec.guards,
                    runner.clone(),
                ));
            }
            report.loaded.push(spec.qualified_name());
        }

        report.watchers = handles.len();
        info!(
            module = %module,
            functions = report.loaded.len(),
            failed = report.failed.len(),
            watchers = report.watchers,
            "Loaded script"
        );
        self.scripts.insert(module.to_string(), handles);
        Ok(report)
    }

    /// Cancel a script's watchers and load it again from new source
    pub async fn reload_script(&self, module: &str, source: &str) -> EngineResult<LoadReport> {
        info!(module = %module, "Reloading script");
        self.unload_script(module).await;
        self.load_script(module, source).await
    }

    /// Cancel every watcher of a script; returns false if it wasn't loaded
    ///
    /// Handler invocations already running are not interrupted.
    #[instrument(skip(self))]
    pub async fn unload_script(&self, module: &str) -> bool {
        let Some((_, handles)) = self.scripts.remove(module) else {
            return false;
        };
        let count = handles.len();
        join_all(handles.into_iter().map(WatcherHandle::stop)).await;
        info!(module = %module, watchers = count, "Unloaded script");
        true
    }

    /// Unload every script
    pub async fn unload_all(&self) {
        for module in self.loaded_modules() {
            self.unload_script(&module).await;
        }
    }

    /// Load `path` under the module name derived from its file name
    pub async fn load_file(&self, path: impl AsRef<Path>) -> EngineResult<LoadReport> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|e| EngineError::ReadScript {
            path: path.to_path_buf(),
            source: e,
        })?;
        self.load_script(&module_name_for(path), &source).await
    }

    /// Load every `*.py` file in a directory, in file name order
    ///
    /// A script that fails to load is logged and skipped; only an unreadable
    /// directory is an error.
    pub async fn load_dir(&self, dir: impl AsRef<Path>) -> EngineResult<Vec<LoadReport>> {
        let dir = dir.as_ref();
        let read_error = |e| EngineError::ReadScript {
            path: dir.to_path_buf(),
            source: e,
        };
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(read_error)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "py"))
            .collect();
        paths.sort();

        let mut reports = Vec::with_capacity(paths.len());
        for path in paths {
            match self.load_file(&path).await {
                Ok(report) => reports.push(report),
                Err(e) => error!(path = %path.display(), "Skipping script: {}", e),
            }
        }
        Ok(reports)
    }

    /// Load every configured script directory
    pub async fn load_configured(&self) -> EngineResult<Vec<LoadReport>> {
        let mut reports = Vec::new();
        for dir in &self.config.script_dirs {
            reports.extend(self.load_dir(dir).await?);
        }
        Ok(reports)
    }

    pub fn loaded_modules(&self) -> Vec<String> {
        let mut modules: Vec<String> = self.scripts.iter().map(|e| e.key().clone()).collect();
        modules.sort();
        modules
    }

    pub fn watcher_count(&self) -> usize {
        self.scripts.iter().map(|e| e.value().len()).sum()
    }

    /// Name and phase of each watcher of a module
    pub fn watchers(&self, module: &str) -> Vec<(String, WatcherPhase)> {
        self.scripts
            .get(module)
            .map(|handles| {
                handles
                    .iter()
                    .map(|h| (h.name().to_string(), h.phase()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn handler_for(&self, function: &str) -> Arc<dyn TriggerHandler> {
        match self.handlers.get(function) {
            Some(handler) => handler.value().clone(),
            None => {
                warn!(function = %function, "No handler registered, invocations will only be logged");
                Arc::new(LogHandler)
            }
        }
    }
}
