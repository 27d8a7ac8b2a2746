//! Trigger decorators for script functions
//!
//! Script functions are armed by decorators written above their `def`:
//!
//! ```text
//! @state_trigger("pyscript.var1 == '1'", state_hold=5)
//! @state_active("input_boolean.enabled == 'on'")
//! def func1(trigger_type=None, var_name=None, value=None):
//!     ...
//! ```
//!
//! The [`TriggerEngine`] scans each script for decorated functions, compiles
//! their trigger and guard expressions, and spawns one watcher task per
//! trigger decorator. Watchers listen on the [`ha_host::Host`] and hand a
//! [`TriggerArgs`] to the function's registered [`TriggerHandler`] whenever
//! the trigger fires and every guard allows it.
//!
//! Compile and evaluation errors never stop the engine. They are mapped back
//! onto the decorator they came from and handed to a [`DiagnosticSink`].
//!
//! [`Waiter::wait_until`] is the one-shot counterpart for code already
//! running inside a handler.

pub mod clock;
pub mod config;
pub mod context;
pub mod decorator;
pub mod engine;
pub mod error;
pub mod handler;
pub mod sink;
pub mod spec;
pub mod time_spec;
pub mod wait;

mod watcher;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{ConfigError, ConfigResult, EngineConfig};
pub use context::{TriggerArgs, TriggerType};
pub use decorator::{module_name_for, Decorator, FunctionDef, ScriptSource};
pub use engine::{LoadReport, TriggerEngine};
pub use error::{EngineError, EngineResult};
pub use handler::{handler_fn, ExecutionMode, FnHandler, LogHandler, TriggerHandler};
pub use sink::{CollectingSink, DiagnosticSink, SharedSink, TracingSink};
pub use spec::{FunctionSpec, GuardSpec, TriggerKind, TriggerSpec};
pub use time_spec::{ActiveRange, CronSpec, TimeSpec, TimeSpecError};
pub use wait::{WaitOptions, WaitOutcome, WaitTriggerType, Waiter};
pub use watcher::{WatcherHandle, WatcherPhase};

pub use ha_trigger_expr::{Diagnostic, DiagnosticKind};
