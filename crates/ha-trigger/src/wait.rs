//! `wait_until`: suspend a handler until a trigger is satisfied
//!
//! Arguments are checked and parsed before anything subscribes, so a bad
//! call fails without side effects. A one-shot watcher then races the
//! timeout; whichever finishes first decides the outcome and the other side
//! is dropped.

use chrono::{DateTime, Utc};
use ha_host::{Notification, Subscription, Topic};
use ha_trigger_expr::{
    compile, evaluate, parse, CompiledGuard, ContextShape, Diagnostic, DiagnosticKind,
    EvalContext, GuardOutcome, Origin,
};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, instrument};

use crate::context::StoreView;
use crate::time_spec::TimeSpec;
use crate::watcher::{
    bare_changed, event_context, next_fire_utc, next_or_pending, sleep_until, to_chrono, Runtime,
};

/// Arguments of one `wait_until` call
#[derive(Debug, Clone, PartialEq)]
pub struct WaitOptions {
    pub state_trigger: Option<String>,
    /// Event type, optionally followed by a filter expression
    pub event_trigger: Option<Vec<String>>,
    pub time_trigger: Option<Vec<String>>,
    pub timeout: Option<Duration>,
    /// Evaluate the state expression once before waiting
    pub state_check_now: bool,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            state_trigger: None,
            event_trigger: None,
            time_trigger: None,
            timeout: None,
            state_check_now: true,
        }
    }
}

impl WaitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state_trigger(mut self, expr: impl Into<String>) -> Self {
        self.state_trigger = Some(expr.into());
        self
    }

    pub fn event_trigger<I, S>(mut self, parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_trigger = Some(parts.into_iter().map(Into::into).collect());
        self
    }

    pub fn time_trigger<I, S>(mut self, specs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.time_trigger = Some(specs.into_iter().map(Into::into).collect());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn state_check_now(mut self, check: bool) -> Self {
        self.state_check_now = check;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitTriggerType {
    State,
    Event,
    Time,
    Timeout,
    /// The notification stream closed before anything fired
    None,
}

/// Why `wait_until` returned
#[derive(Debug, Clone, Serialize)]
pub struct WaitOutcome {
    pub trigger_type: WaitTriggerType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub var_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_time: Option<DateTime<Utc>>,
}

impl WaitOutcome {
    fn new(trigger_type: WaitTriggerType) -> Self {
        Self {
            trigger_type,
            var_name: None,
            value: None,
            old_value: None,
            event_type: None,
            payload: None,
            trigger_time: None,
        }
    }

    fn state(notification: Option<&Notification>) -> Self {
        let mut outcome = Self::new(WaitTriggerType::State);
        if let Some(n) = notification {
            outcome.var_name = Some(n.id.clone());
            outcome.value = n.new_value.as_ref().map(|s| s.state.clone());
            outcome.old_value = n.old_value.as_ref().map(|s| s.state.clone());
        }
        outcome
    }
}

/// Validated, compiled form of a call
struct Plan {
    state: Option<CompiledGuard>,
    event: Option<(String, Option<CompiledGuard>)>,
    time: Vec<TimeSpec>,
}

impl Plan {
    fn build(module: &str, function: &str, options: &WaitOptions) -> Result<Self, Diagnostic> {
        let origin = |keyword: &str| Origin::keyword(module, function, keyword);
        let type_error = |keyword: &str, message: String| {
            Diagnostic::unpositioned(DiagnosticKind::TypeError, &origin(keyword), message)
        };

        if options.state_trigger.is_none()
            && options.event_trigger.is_none()
            && options.time_trigger.is_none()
            && options.timeout.is_none()
        {
            return Err(type_error(
                "wait_until",
                "wait_until() needs at least one of state_trigger, event_trigger, \
                 time_trigger or timeout"
                    .to_string(),
            ));
        }

        let event = match options.event_trigger.as_deref() {
            None => None,
            Some([event_type]) => Some((event_type.clone(), None)),
            Some([event_type, filter]) => {
                let tree = parse(filter, &origin("event_trigger"))?;
                Some((event_type.clone(), Some(compile(&tree, ContextShape::Event))))
            }
            Some(parts) => {
                return Err(type_error(
                    "event_trigger",
                    format!(
                        "wait_until() event_trigger takes an event type and an optional \
                         filter expression, got {} items",
                        parts.len()
                    ),
                ))
            }
        };

        let mut time = Vec::new();
        for text in options.time_trigger.iter().flatten() {
            let spec = TimeSpec::parse(text).map_err(|e| {
                Diagnostic::unpositioned(
                    DiagnosticKind::ValueError,
                    &origin("time_trigger"),
                    format!("wait_until() time_trigger: {e}"),
                )
            })?;
            if spec.is_lifecycle() {
                return Err(type_error(
                    "time_trigger",
                    format!("wait_until() time_trigger does not support '{}'", text.trim()),
                ));
            }
            time.push(spec);
        }

        let state = match &options.state_trigger {
            Some(expr) => {
                let tree = parse(expr, &origin("state_trigger"))?;
                Some(compile(&tree, ContextShape::State))
            }
            None => None,
        };

        Ok(Plan { state, event, time })
    }
}

/// Handle handlers use to call `wait_until`
#[derive(Clone)]
pub struct Waiter {
    rt: Runtime,
    default_timeout: Option<Duration>,
}

impl Waiter {
    pub(crate) fn new(rt: Runtime, default_timeout: Option<Duration>) -> Self {
        Self {
            rt,
            default_timeout,
        }
    }

    /// Wait on behalf of script function `module.function`
    ///
    /// Bad arguments and parse failures are returned before any
    /// subscription. With `state_check_now` an evaluation error of the
    /// immediate check is returned too; later evaluation errors are logged
    /// and the wait goes on.
    #[instrument(skip(self, options))]
    pub async fn wait_until(
        &self,
        module: &str,
        function: &str,
        options: WaitOptions,
    ) -> Result<WaitOutcome, Diagnostic> {
        let plan = Plan::build(module, function, &options)?;
        let host = &self.rt.host;

        // Subscribe before the immediate check so no change slips between them
        let state_sub = plan
            .state
            .as_ref()
            .map(|guard| host.subscribe(Topic::States(guard.entities().clone())));
        let event_sub = plan
            .event
            .as_ref()
            .map(|(event_type, _)| host.subscribe(Topic::event(event_type.as_str())));

        if let Some(guard) = plan.state.as_ref().filter(|g| g.bare().is_none()) {
            if options.state_check_now {
                let view = StoreView::new(host.states());
                match evaluate(guard, &EvalContext::new(ContextShape::State, &view)) {
                    GuardOutcome::Satisfied => {
                        debug!("State already satisfied");
                        return Ok(WaitOutcome::state(None));
                    }
                    GuardOutcome::NotSatisfied => {}
                    GuardOutcome::Errored(diagnostic) => return Err(diagnostic),
                }
            }
        }

        let clock = self.rt.clock.clone();
        let deadline = options
            .timeout
            .or(self.default_timeout)
            .map(|t| clock.now() + to_chrono(t));
        let watcher = OneShot {
            rt: self.rt.clone(),
            next_time: next_fire_utc(&plan.time, clock.now()),
            plan,
        };

        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(watcher.run(tx, state_sub, event_sub));

        tokio::select! {
            outcome = rx => Ok(outcome.unwrap_or_else(|_| WaitOutcome::new(WaitTriggerType::None))),
            _ = sleep_until(clock.as_ref(), deadline) => {
                task.abort();
                debug!("Timed out");
                Ok(WaitOutcome::new(WaitTriggerType::Timeout))
            }
        }
    }
}

/// The watcher behind one `wait_until` call
struct OneShot {
    rt: Runtime,
    plan: Plan,
    next_time: Option<DateTime<Utc>>,
}

impl OneShot {
    async fn run(
        self,
        mut tx: oneshot::Sender<WaitOutcome>,
        state_sub: Option<Subscription>,
        event_sub: Option<Subscription>,
    ) {
        let outcome = tokio::select! {
            // The caller gave up
            _ = tx.closed() => return,
            outcome = self.watch(state_sub, event_sub) => outcome,
        };
        let _ = tx.send(outcome);
    }

    async fn watch(
        &self,
        mut state_sub: Option<Subscription>,
        mut event_sub: Option<Subscription>,
    ) -> WaitOutcome {
        loop {
            tokio::select! {
                n = next_or_pending(&mut state_sub) => match n {
                    Some(n) if self.state_fires(&n) => return WaitOutcome::state(Some(&n)),
                    Some(_) => {}
                    None => return WaitOutcome::new(WaitTriggerType::None),
                },
                n = next_or_pending(&mut event_sub) => match n {
                    Some(n) => {
                        let payload = n.payload.unwrap_or_else(|| serde_json::json!({}));
                        if let Some(event_type) = self.event_matches(&payload) {
                            let mut outcome = WaitOutcome::new(WaitTriggerType::Event);
                            outcome.event_type = Some(event_type);
                            outcome.payload = Some(payload);
                            return outcome;
                        }
                    }
                    None => return WaitOutcome::new(WaitTriggerType::None),
                },
                _ = sleep_until(self.rt.clock.as_ref(), self.next_time) => {
                    let mut outcome = WaitOutcome::new(WaitTriggerType::Time);
                    outcome.trigger_time = self.next_time;
                    return outcome;
                }
            }
        }
    }

    fn state_fires(&self, n: &Notification) -> bool {
        let Some(guard) = &self.plan.state else {
            return false;
        };
        if let Some(bare) = guard.bare() {
            return bare_changed(bare, n);
        }
        let view = StoreView::for_notification(self.rt.host.states(), n);
        self.satisfied(guard, &EvalContext::new(ContextShape::State, &view))
    }

    /// The event type when the payload passes the filter
    fn event_matches(&self, payload: &serde_json::Value) -> Option<String> {
        let (event_type, filter) = self.plan.event.as_ref()?;
        let passes = match filter {
            None => true,
            Some(filter) => {
                let view = StoreView::new(self.rt.host.states());
                let mut ctx = event_context(&view, event_type, payload);
                ctx.set_local("trigger_type", "event");
                self.satisfied(filter, &ctx)
            }
        };
        passes.then(|| event_type.clone())
    }

    fn satisfied(&self, guard: &CompiledGuard, ctx: &EvalContext<'_>) -> bool {
        match evaluate(guard, ctx) {
            GuardOutcome::Satisfied => true,
            GuardOutcome::NotSatisfied => false,
            GuardOutcome::Errored(diagnostic) => {
                self.rt.sink.log_error(&diagnostic);
                false
            }
        }
    }
}
