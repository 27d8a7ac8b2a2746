//! Trigger watchers
//!
//! One tokio task per trigger decorator. A watcher subscribes when it is
//! spawned (so nothing fired after a script load is missed), then loops:
//! wait for a notification or deadline, evaluate, and dispatch the handler
//! when the trigger qualifies and every guard holds.
//!
//! ```text
//! Idle ──spawn──▶ Armed ──notification──▶ Evaluating ──▶ Armed
//!                   │
//!                   └──cancel / stream closed──▶ Cancelled
//! ```

use chrono::{DateTime, Local, TimeZone, Utc};
use ha_host::events::{HOMEASSISTANT_STARTED, HOMEASSISTANT_STOP};
use ha_host::{Host, Notification, Subscription, Topic};
use ha_trigger_expr::{
    compile, evaluate, BareRef, CompiledGuard, ContextShape, EvalContext, GuardOutcome, Value,
};
use indexmap::IndexMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::clock::{Clock, SharedClock};
use crate::context::{StoreView, TriggerArgs};
use crate::handler::HandlerRunner;
use crate::sink::SharedSink;
use crate::spec::{GuardSpec, StateOptions, TriggerBody, TriggerKind, TriggerSpec};
use crate::time_spec::{self, ActiveRange, TimeSpec};

/// Everything a watcher needs from the engine
#[derive(Clone)]
pub(crate) struct Runtime {
    pub host: Arc<Host>,
    pub clock: SharedClock,
    pub sink: SharedSink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherPhase {
    Idle,
    Armed,
    Evaluating,
    Cancelled,
}

impl WatcherPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WatcherPhase::Idle,
            1 => WatcherPhase::Armed,
            2 => WatcherPhase::Evaluating,
            _ => WatcherPhase::Cancelled,
        }
    }
}

/// Owner's side of a running watcher
///
/// Dropping the handle cancels the watcher as well.
pub struct WatcherHandle {
    name: String,
    kind: TriggerKind,
    phase: Arc<AtomicU8>,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    /// `module.function @decorator()`
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TriggerKind {
        self.kind
    }

    pub fn phase(&self) -> WatcherPhase {
        WatcherPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Ask the watcher to stop; handlers already running are left alone
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Cancel and wait for the watcher task to exit
    pub async fn stop(self) {
        self.cancel();
        if let Err(e) = self.task.await {
            if e.is_panic() {
                warn!(watcher = %self.name, "Watcher task panicked");
            }
        }
    }
}

/// Compiled `@state_active` and `@time_active` guards of one watcher
pub(crate) struct Guards {
    state: Vec<CompiledGuard>,
    time: Vec<Vec<ActiveRange>>,
}

impl Guards {
    pub fn compile(specs: &[GuardSpec]) -> Self {
        let mut guards = Guards {
            state: Vec::new(),
            time: Vec::new(),
        };
        for spec in specs {
            match spec {
                GuardSpec::StateActive(tree) => {
                    guards.state.push(compile(tree, ContextShape::State))
                }
                GuardSpec::TimeActive(ranges) => guards.time.push(ranges.clone()),
            }
        }
        guards
    }

    /// Run every guard in declaration order, logging every error
    fn allow(&self, rt: &Runtime, changed: Option<&Notification>, at: DateTime<Utc>) -> bool {
        let view = match changed {
            Some(n) => StoreView::for_notification(rt.host.states(), n),
            None => StoreView::new(rt.host.states()),
        };
        let ctx = EvalContext::new(ContextShape::State, &view);
        let mut allowed = true;
        for guard in &self.state {
            match evaluate(guard, &ctx) {
                GuardOutcome::Satisfied => {}
                GuardOutcome::NotSatisfied => allowed = false,
                GuardOutcome::Errored(diagnostic) => {
                    rt.sink.log_error(&diagnostic);
                    allowed = false;
                }
            }
        }
        let local = at.with_timezone(&Local).time();
        for ranges in &self.time {
            if !time_spec::time_active(ranges, local) {
                allowed = false;
            }
        }
        allowed
    }
}

/// Parts shared by every kind of watcher
struct Watcher {
    name: String,
    rt: Runtime,
    kwargs: IndexMap<String, serde_json::Value>,
    guards: Guards,
    runner: Arc<HandlerRunner>,
    phase: Arc<AtomicU8>,
}

impl Watcher {
    fn set_phase(&self, phase: WatcherPhase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    fn function(&self) -> &str {
        self.runner.function()
    }

    fn fire(&self, args: TriggerArgs, changed: Option<&Notification>, at: DateTime<Utc>) {
        if !self.guards.allow(&self.rt, changed, at) {
            debug!(watcher = %self.name, "Guards not satisfied");
            return;
        }
        debug!(watcher = %self.name, trigger_type = %args.trigger_type, "Trigger fired");
        self.runner.dispatch(args.with_kwargs(&self.kwargs));
    }
}

/// Arm a watcher for one trigger decorator
pub(crate) fn spawn(
    rt: Runtime,
    spec: &TriggerSpec,
    guards: &[GuardSpec],
    runner: Arc<HandlerRunner>,
) -> WatcherHandle {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let phase = Arc::new(AtomicU8::new(WatcherPhase::Idle as u8));
    let base = Watcher {
        name: spec.name(),
        rt: rt.clone(),
        kwargs: spec.kwargs.clone(),
        guards: Guards::compile(guards),
        runner,
        phase: phase.clone(),
    };
    let name = base.name.clone();

    let task = match &spec.body {
        TriggerBody::State { exprs, options } => {
            let exprs: Vec<CompiledGuard> = exprs
                .iter()
                .map(|tree| compile(tree, ContextShape::State))
                .collect();
            let entities: BTreeSet<String> = exprs
                .iter()
                .flat_map(|guard| guard.entities().iter().cloned())
                .collect();
            debug!(watcher = %name, entities = ?entities, "Arming state trigger");
            let sub = if entities.is_empty() {
                warn!(
                    watcher = %name,
                    "State trigger references no entities and will never fire on a change"
                );
                None
            } else {
                Some(rt.host.subscribe(Topic::States(entities)))
            };
            let watcher = StateWatcher {
                edge: options.hold_false.map(Edge::new),
                options: options.clone(),
                exprs,
                pending: None,
                base,
            };
            tokio::spawn(watcher.run(sub, cancel_rx))
        }
        TriggerBody::Event { event_type, filter } => {
            debug!(watcher = %name, event_type = %event_type, "Arming event trigger");
            let sub = rt.host.subscribe(Topic::event(event_type.as_str()));
            let watcher = EventWatcher {
                event_type: event_type.clone(),
                filter: filter.as_ref().map(|tree| compile(tree, ContextShape::Event)),
                base,
            };
            tokio::spawn(watcher.run(sub, cancel_rx))
        }
        TriggerBody::Time { specs } => {
            debug!(watcher = %name, specs = ?specs, "Arming time trigger");
            let startup = specs
                .contains(&TimeSpec::Startup)
                .then(|| rt.host.subscribe(Topic::event(HOMEASSISTANT_STARTED)));
            let shutdown = specs
                .contains(&TimeSpec::Shutdown)
                .then(|| rt.host.subscribe(Topic::event(HOMEASSISTANT_STOP)));
            let watcher = TimeWatcher {
                specs: specs.iter().filter(|s| !s.is_lifecycle()).cloned().collect(),
                base,
            };
            tokio::spawn(watcher.run(startup, shutdown, cancel_rx))
        }
    };

    WatcherHandle {
        name,
        kind: spec.kind(),
        phase,
        cancel: cancel_tx,
        task,
    }
}

/// Resolve at `deadline`, or never
pub(crate) async fn sleep_until(clock: &dyn Clock, deadline: Option<DateTime<Utc>>) {
    match deadline {
        Some(deadline) => clock.sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Next notification of an optional subscription; never resolves for None
pub(crate) async fn next_or_pending(sub: &mut Option<Subscription>) -> Option<Notification> {
    match sub {
        Some(sub) => sub.next().await,
        None => std::future::pending().await,
    }
}

/// Whether a notification changed what a bare reference names
pub(crate) fn bare_changed(bare: &BareRef, n: &Notification) -> bool {
    if n.id != bare.entity_id {
        return false;
    }
    match &bare.attribute {
        None => n.old_value.as_ref().map(|s| &s.state) != n.new_value.as_ref().map(|s| &s.state),
        Some(attr) => {
            n.old_value.as_ref().and_then(|s| s.attributes.get(attr))
                != n.new_value.as_ref().and_then(|s| s.attributes.get(attr))
        }
    }
}

/// Next scheduled fire time in UTC, with the specs read as local wall time
pub(crate) fn next_fire_utc(specs: &[TimeSpec], after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let local = after.with_timezone(&Local).naive_local();
    let next = time_spec::next_fire(specs, local)?;
    Local
        .from_local_datetime(&next)
        .earliest()
        // Skipped by a DST jump; fire when the clock resumes
        .or_else(|| {
            Local
                .from_local_datetime(&(next + chrono::Duration::hours(1)))
                .earliest()
        })
        .map(|t| t.with_timezone(&Utc))
}

pub(crate) fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36500))
}

/// Rising-edge bookkeeping for `state_hold_false`
struct Edge {
    hold_false: chrono::Duration,
    false_since: Option<DateTime<Utc>>,
    /// Nothing has been evaluated yet; counts as having been false
    primed: bool,
}

impl Edge {
    fn new(hold_false: std::time::Duration) -> Self {
        Self {
            hold_false: to_chrono(hold_false),
            false_since: None,
            primed: true,
        }
    }

    /// Feed one evaluation; returns whether it is a qualifying rising edge
    fn observe(&mut self, satisfied: bool, now: DateTime<Utc>) -> bool {
        if !satisfied {
            self.false_since.get_or_insert(now);
            return false;
        }
        let ready = self.primed
            || self
                .false_since
                .is_some_and(|since| now - since >= self.hold_false);
        self.primed = false;
        self.false_since = None;
        ready
    }
}

/// A `state_hold` waiting to see whether the expression stays true
struct Pending {
    deadline: DateTime<Utc>,
    notification: Option<Notification>,
}

struct StateWatcher {
    base: Watcher,
    exprs: Vec<CompiledGuard>,
    options: StateOptions,
    edge: Option<Edge>,
    pending: Option<Pending>,
}

/// Next state change, or never without a subscription
async fn next_change(sub: Option<&mut Subscription>) -> Option<Notification> {
    match sub {
        Some(sub) => sub.next().await,
        None => std::future::pending().await,
    }
}

impl StateWatcher {
    async fn run(mut self, mut sub: Option<Subscription>, mut cancel: watch::Receiver<bool>) {
        self.base.set_phase(WatcherPhase::Armed);
        let clock = self.base.rt.clock.clone();
        if self.options.check_now {
            self.on_change(None);
        }
        loop {
            let deadline = self.pending.as_ref().map(|p| p.deadline);
            tokio::select! {
                biased;
                _ = cancel.changed() => break,
                _ = sleep_until(clock.as_ref(), deadline) => {
                    if let Some(pending) = self.pending.take() {
                        trace!(watcher = %self.base.name, "Hold elapsed");
                        self.dispatch(pending.notification.as_ref(), pending.deadline);
                    }
                }
                notification = next_change(sub.as_mut()) => match notification {
                    Some(n) => self.on_change(Some(n)),
                    None => break,
                },
            }
        }
        self.base.set_phase(WatcherPhase::Cancelled);
        debug!(watcher = %self.base.name, "State trigger stopped");
    }

    fn on_change(&mut self, notification: Option<Notification>) {
        self.base.set_phase(WatcherPhase::Evaluating);
        let now = self.base.rt.clock.now();
        let satisfied = self.evaluate(notification.as_ref());
        let qualifies = match &mut self.edge {
            Some(edge) => edge.observe(satisfied, now),
            None => satisfied,
        };

        match self.options.hold {
            Some(hold) if qualifies => {
                if self.pending.is_none() {
                    self.pending = Some(Pending {
                        deadline: now + to_chrono(hold),
                        notification,
                    });
                }
            }
            Some(_) => {
                let has_bare = self.exprs.iter().any(|e| e.bare().is_some());
                if !satisfied && !has_bare && self.pending.take().is_some() {
                    trace!(watcher = %self.base.name, "Hold broken");
                }
            }
            None if qualifies => self.dispatch(notification.as_ref(), now),
            None => {}
        }
        self.base.set_phase(WatcherPhase::Armed);
    }

    /// Any expression satisfied; errors are logged and count as false
    fn evaluate(&self, changed: Option<&Notification>) -> bool {
        let view = match changed {
            Some(n) => StoreView::for_notification(self.base.rt.host.states(), n),
            None => StoreView::new(self.base.rt.host.states()),
        };
        let ctx = EvalContext::new(ContextShape::State, &view);
        for expr in &self.exprs {
            if let (Some(bare), Some(n)) = (expr.bare(), changed) {
                if bare_changed(bare, n) {
                    return true;
                }
                continue;
            }
            match evaluate(expr, &ctx) {
                GuardOutcome::Satisfied => return true,
                GuardOutcome::NotSatisfied => {}
                GuardOutcome::Errored(diagnostic) => self.base.rt.sink.log_error(&diagnostic),
            }
        }
        false
    }

    fn dispatch(&self, changed: Option<&Notification>, at: DateTime<Utc>) {
        let args = TriggerArgs::state(self.base.function(), changed);
        self.base.fire(args, changed, at);
    }
}

struct EventWatcher {
    base: Watcher,
    event_type: String,
    filter: Option<CompiledGuard>,
}

impl EventWatcher {
    async fn run(self, mut sub: Subscription, mut cancel: watch::Receiver<bool>) {
        self.base.set_phase(WatcherPhase::Armed);
        loop {
            tokio::select! {
                biased;
                _ = cancel.changed() => break,
                notification = sub.next() => match notification {
                    Some(n) => self.on_event(n),
                    None => break,
                },
            }
        }
        self.base.set_phase(WatcherPhase::Cancelled);
        debug!(watcher = %self.base.name, "Event trigger stopped");
    }

    fn on_event(&self, n: Notification) {
        self.base.set_phase(WatcherPhase::Evaluating);
        trace!(watcher = %self.base.name, at = %n.timestamp, "Event received");
        let payload = n.payload.unwrap_or_else(|| serde_json::json!({}));
        if self.matches(&payload) {
            let args = TriggerArgs::event(self.base.function(), &self.event_type, payload);
            self.base.fire(args, None, self.base.rt.clock.now());
        }
        self.base.set_phase(WatcherPhase::Armed);
    }

    fn matches(&self, payload: &serde_json::Value) -> bool {
        let Some(filter) = &self.filter else {
            return true;
        };
        let view = StoreView::new(self.base.rt.host.states());
        let mut ctx = event_context(&view, &self.event_type, payload);
        ctx.set_local("trigger_type", "event");
        match evaluate(filter, &ctx) {
            GuardOutcome::Satisfied => true,
            GuardOutcome::NotSatisfied => false,
            GuardOutcome::Errored(diagnostic) => {
                self.base.rt.sink.log_error(&diagnostic);
                false
            }
        }
    }
}

/// Event filters see payload fields and the event type as local names
pub(crate) fn event_context<'a>(
    view: &'a StoreView<'a>,
    event_type: &str,
    payload: &serde_json::Value,
) -> EvalContext<'a> {
    let mut ctx = EvalContext::new(ContextShape::Event, view);
    if let Some(fields) = payload.as_object() {
        for (name, value) in fields {
            ctx.set_local(name.clone(), Value::from_json(value));
        }
    }
    ctx.set_local("event_type", event_type);
    ctx
}

struct TimeWatcher {
    base: Watcher,
    /// Clock-driven specs; startup and shutdown arrive as subscriptions
    specs: Vec<TimeSpec>,
}

impl TimeWatcher {
    async fn run(
        self,
        mut startup: Option<Subscription>,
        mut shutdown: Option<Subscription>,
        mut cancel: watch::Receiver<bool>,
    ) {
        self.base.set_phase(WatcherPhase::Armed);
        let clock = self.base.rt.clock.clone();

        // Subscribed before this check, so a start racing with it is seen
        // either here or as a notification, and the flag dedups the two
        let mut started = false;
        if startup.is_some() && self.base.rt.host.is_started() {
            started = true;
            self.fire_at(clock.now());
        }

        let mut next = next_fire_utc(&self.specs, clock.now());
        loop {
            tokio::select! {
                biased;
                _ = cancel.changed() => break,
                n = next_or_pending(&mut startup) => {
                    if n.is_none() {
                        break;
                    }
                    if !started {
                        started = true;
                        self.fire_at(clock.now());
                    }
                }
                n = next_or_pending(&mut shutdown) => {
                    if n.is_none() {
                        break;
                    }
                    self.fire_at(clock.now());
                }
                _ = sleep_until(clock.as_ref(), next) => {
                    if let Some(at) = next {
                        self.fire_at(at);
                        next = next_fire_utc(&self.specs, clock.now().max(at));
                        trace!(watcher = %self.base.name, next = ?next, "Rescheduled");
                    }
                }
            }
        }
        self.base.set_phase(WatcherPhase::Cancelled);
        debug!(watcher = %self.base.name, "Time trigger stopped");
    }

    fn fire_at(&self, at: DateTime<Utc>) {
        self.base.set_phase(WatcherPhase::Evaluating);
        self.base
            .fire(TriggerArgs::time(self.base.function(), at), None, at);
        self.base.set_phase(WatcherPhase::Armed);
    }
}
