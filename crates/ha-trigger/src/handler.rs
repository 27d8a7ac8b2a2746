//! Handler invocation
//!
//! A script function's body is whatever the embedding application registers
//! for it. Every trigger decorator of the function dispatches through one
//! shared [`HandlerRunner`], which applies the configured [`ExecutionMode`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::context::TriggerArgs;

/// How invocations of one function may overlap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Ignore new triggers while a run is active
    Single,

    /// Abort the active run and start over
    Restart,

    /// Run one at a time in trigger order (up to max waiting or running)
    Queued {
        #[serde(default = "default_max_queued")]
        max: usize,
    },

    /// Run each trigger as its own task (up to max at once)
    Parallel {
        #[serde(default = "default_max_parallel")]
        max: usize,
    },
}

fn default_max_queued() -> usize {
    10
}

fn default_max_parallel() -> usize {
    64
}

impl Default for ExecutionMode {
    fn default() -> Self {
        ExecutionMode::Parallel {
            max: default_max_parallel(),
        }
    }
}

impl ExecutionMode {
    fn admits(self, active: usize) -> bool {
        match self {
            ExecutionMode::Single => active == 0,
            ExecutionMode::Restart => true,
            ExecutionMode::Queued { max } | ExecutionMode::Parallel { max } => active < max,
        }
    }
}

/// The body of a script function
#[async_trait]
pub trait TriggerHandler: Send + Sync {
    async fn call(&self, args: TriggerArgs) -> anyhow::Result<()>;
}

/// Adapter that lets an async closure act as a handler
pub struct FnHandler<F>(F);

/// Wrap an async closure as a [`TriggerHandler`]
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(TriggerArgs) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> TriggerHandler for FnHandler<F>
where
    F: Fn(TriggerArgs) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn call(&self, args: TriggerArgs) -> anyhow::Result<()> {
        (self.0)(args).await
    }
}

/// Stand-in for functions with no registered body; logs each invocation
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHandler;

#[async_trait]
impl TriggerHandler for LogHandler {
    async fn call(&self, args: TriggerArgs) -> anyhow::Result<()> {
        info!(
            function = %args.function,
            trigger_type = %args.trigger_type,
            var_name = args.var_name.as_deref().unwrap_or(""),
            "Trigger fired"
        );
        Ok(())
    }
}

/// Dispatches invocations of one function under its execution mode
pub struct HandlerRunner {
    function: String,
    handler: Arc<dyn TriggerHandler>,
    mode: ExecutionMode,
    active: Arc<AtomicUsize>,
    queue: Arc<tokio::sync::Mutex<()>>,
    current: Mutex<Option<JoinHandle<()>>>,
}

impl HandlerRunner {
    pub fn new(
        function: impl Into<String>,
        handler: Arc<dyn TriggerHandler>,
        mode: ExecutionMode,
    ) -> Self {
        Self {
            function: function.into(),
            handler,
            mode,
            active: Arc::new(AtomicUsize::new(0)),
            queue: Arc::new(tokio::sync::Mutex::new(())),
            current: Mutex::new(None),
        }
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    /// Invocations currently running or waiting in the queue
    pub fn active_runs(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Start an invocation as a new task
    ///
    /// Returns false when the execution mode turned the trigger away.
    pub fn dispatch(&self, args: TriggerArgs) -> bool {
        let mode = self.mode;
        let admitted = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                mode.admits(n).then_some(n + 1)
            })
            .is_ok();
        if !admitted {
            debug!(
                function = %self.function,
                mode = ?mode,
                active = self.active_runs(),
                "Skipping trigger due to execution mode limits"
            );
            return false;
        }

        let slot = RunSlot(self.active.clone());
        let handler = self.handler.clone();
        let function = self.function.clone();
        let queue = matches!(mode, ExecutionMode::Queued { .. }).then(|| self.queue.clone());

        let task = tokio::spawn(async move {
            let _slot = slot;
            let _turn = match queue {
                Some(queue) => Some(queue.lock_owned().await),
                None => None,
            };
            debug!(function = %function, trigger_type = %args.trigger_type, "Calling handler");
            if let Err(e) = handler.call(args).await {
                error!(function = %function, error = %e, "Handler failed");
            }
        });

        if mode == ExecutionMode::Restart {
            let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(previous) = current.replace(task) {
                if !previous.is_finished() {
                    debug!(function = %self.function, "Restarting handler");
                    previous.abort();
                }
            }
        }
        true
    }
}

/// Counts one active invocation until dropped, including on abort
struct RunSlot(Arc<AtomicUsize>);

impl Drop for RunSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::{mpsc, Notify};

    fn args() -> TriggerArgs {
        TriggerArgs::event("file.hello.func", "some_event", serde_json::json!({}))
    }

    /// A handler that reports its start and then blocks until released
    fn gated(
        started: mpsc::UnboundedSender<()>,
        release: Arc<Notify>,
    ) -> Arc<dyn TriggerHandler> {
        Arc::new(handler_fn(move |_args| {
            let started = started.clone();
            let release = release.clone();
            async move {
                let _ = started.send(());
                release.notified().await;
                Ok(())
            }
        }))
    }

    async fn settle(runner: &HandlerRunner, expected: usize) {
        for _ in 0..100 {
            if runner.active_runs() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {expected} active runs, found {}", runner.active_runs());
    }

    #[test]
    fn test_mode_serde() {
        let mode: ExecutionMode = serde_yaml::from_str("mode: queued").unwrap();
        assert_eq!(mode, ExecutionMode::Queued { max: 10 });
        let mode: ExecutionMode = serde_yaml::from_str("mode: parallel\nmax: 2").unwrap();
        assert_eq!(mode, ExecutionMode::Parallel { max: 2 });
        assert_eq!(
            serde_json::to_value(ExecutionMode::Restart).unwrap(),
            serde_json::json!({"mode": "restart"})
        );
    }

    #[tokio::test]
    async fn test_single_skips_while_running() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let release = Arc::new(Notify::new());
        let runner = HandlerRunner::new("f", gated(tx, release.clone()), ExecutionMode::Single);

        assert!(runner.dispatch(args()));
        rx.recv().await.unwrap();
        assert!(!runner.dispatch(args()));

        release.notify_one();
        settle(&runner, 0).await;
        assert!(runner.dispatch(args()));
    }

    #[tokio::test]
    async fn test_parallel_respects_max() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let release = Arc::new(Notify::new());
        let runner = HandlerRunner::new(
            "f",
            gated(tx, release.clone()),
            ExecutionMode::Parallel { max: 2 },
        );

        assert!(runner.dispatch(args()));
        assert!(runner.dispatch(args()));
        assert!(!runner.dispatch(args()));
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        release.notify_waiters();
        settle(&runner, 0).await;
    }

    #[tokio::test]
    async fn test_queued_runs_one_at_a_time() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let release = Arc::new(Notify::new());
        let runner = HandlerRunner::new(
            "f",
            gated(tx, release.clone()),
            ExecutionMode::Queued { max: 5 },
        );

        assert!(runner.dispatch(args()));
        assert!(runner.dispatch(args()));
        rx.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(runner.active_runs(), 2);

        release.notify_one();
        rx.recv().await.unwrap();
        release.notify_one();
        settle(&runner, 0).await;
    }

    #[tokio::test]
    async fn test_restart_aborts_previous() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let release = Arc::new(Notify::new());
        let runner = HandlerRunner::new("f", gated(tx, release.clone()), ExecutionMode::Restart);

        assert!(runner.dispatch(args()));
        rx.recv().await.unwrap();
        assert!(runner.dispatch(args()));
        rx.recv().await.unwrap();
        settle(&runner, 1).await;

        release.notify_one();
        settle(&runner, 0).await;
    }

    #[tokio::test]
    async fn test_handler_error_is_contained() {
        let runner = HandlerRunner::new(
            "f",
            Arc::new(handler_fn(|_args| async { anyhow::bail!("boom") })),
            ExecutionMode::default(),
        );
        assert!(runner.dispatch(args()));
        settle(&runner, 0).await;
        assert!(runner.dispatch(args()));
    }
}
