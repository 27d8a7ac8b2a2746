//! What watchers evaluate against and what handlers receive

use chrono::{DateTime, Utc};
use ha_host::{Notification, State, StateStore};
use ha_trigger_expr::{StateLookup, StateSnapshot};
use indexmap::IndexMap;
use serde::Serialize;
use std::fmt;

/// Live state view for one evaluation
///
/// The entity that caused the notification is read from the notification
/// itself so that every watcher sees the same value for it, even if the
/// store has moved on. `.old` is only known for that entity.
pub struct StoreView<'a> {
    store: &'a StateStore,
    changed: Option<&'a Notification>,
}

impl<'a> StoreView<'a> {
    pub fn new(store: &'a StateStore) -> Self {
        Self {
            store,
            changed: None,
        }
    }

    pub fn for_notification(store: &'a StateStore, notification: &'a Notification) -> Self {
        Self {
            store,
            changed: Some(notification),
        }
    }

    fn changed(&self, entity_id: &str) -> Option<&'a Notification> {
        self.changed.filter(|n| n.id == entity_id)
    }
}

impl StateLookup for StoreView<'_> {
    fn state(&self, entity_id: &str) -> Option<StateSnapshot> {
        match self.changed(entity_id) {
            Some(n) => n.new_value.as_ref().map(snapshot),
            None => self.store.get(entity_id).as_ref().map(snapshot),
        }
    }

    fn old_state(&self, entity_id: &str) -> Option<StateSnapshot> {
        self.changed(entity_id)
            .and_then(|n| n.old_value.as_ref())
            .map(snapshot)
    }
}

pub fn snapshot(state: &State) -> StateSnapshot {
    StateSnapshot {
        value: state.state.clone(),
        attributes: state.attributes.clone(),
        last_changed: Some(state.last_changed),
        last_updated: Some(state.last_updated),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    State,
    Event,
    Time,
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TriggerType::State => "state",
            TriggerType::Event => "event",
            TriggerType::Time => "time",
        })
    }
}

/// Arguments passed to a handler when its trigger fires
#[derive(Debug, Clone, Serialize)]
pub struct TriggerArgs {
    pub trigger_type: TriggerType,

    /// `module.function` of the script function being called
    pub function: String,

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

    /// The decorator's `kwargs={...}`
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub kwargs: IndexMap<String, serde_json::Value>,
}

impl TriggerArgs {
    fn new(trigger_type: TriggerType, function: impl Into<String>) -> Self {
        Self {
            trigger_type,
            function: function.into(),
            var_name: None,
            value: None,
            old_value: None,
            event_type: None,
            payload: None,
            trigger_time: None,
            kwargs: IndexMap::new(),
        }
    }

    /// A state trigger, from the notification that satisfied it if any
    pub fn state(function: impl Into<String>, notification: Option<&Notification>) -> Self {
        let mut args = Self::new(TriggerType::State, function);
        if let Some(n) = notification {
            args.var_name = Some(n.id.clone());
            args.value = n.new_value.as_ref().map(|s| s.state.clone());
            args.old_value = n.old_value.as_ref().map(|s| s.state.clone());
        }
        args
    }

    pub fn event(
        function: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let mut args = Self::new(TriggerType::Event, function);
        args.event_type = Some(event_type.into());
        args.payload = Some(payload);
        args
    }

    pub fn time(function: impl Into<String>, trigger_time: DateTime<Utc>) -> Self {
        let mut args = Self::new(TriggerType::Time, function);
        args.trigger_time = Some(trigger_time);
        args
    }

    pub fn with_kwargs(mut self, kwargs: &IndexMap<String, serde_json::Value>) -> Self {
        self.kwargs.extend(kwargs.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ha_host::{EventBus, Topic};
    use std::sync::Arc;

    fn notification(id: &str, old: Option<State>, new: Option<State>) -> Notification {
        Notification {
            id: id.to_string(),
            old_value: old,
            new_value: new,
            payload: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_view_prefers_notification_values() {
        let store = StateStore::new(Arc::new(EventBus::new()));
        let old = store.set_value("pyscript.var1", "1").unwrap();
        let new = store.set_value("pyscript.var1", "2").unwrap();
        store.set_value("pyscript.var1", "3").unwrap();
        store.set_value("pyscript.other", "x").unwrap();

        let n = notification("pyscript.var1", Some(old), Some(new));
        let view = StoreView::for_notification(&store, &n);
        assert_eq!(view.state("pyscript.var1").unwrap().value, "2");
        assert_eq!(view.old_state("pyscript.var1").unwrap().value, "1");
        assert_eq!(view.state("pyscript.other").unwrap().value, "x");
        assert!(view.old_state("pyscript.other").is_none());

        let plain = StoreView::new(&store);
        assert_eq!(plain.state("pyscript.var1").unwrap().value, "3");
        assert!(plain.old_state("pyscript.var1").is_none());
    }

    #[tokio::test]
    async fn test_state_args_from_notification() {
        let host = ha_host::Host::new();
        let mut sub = host.subscribe(Topic::states(["pyscript.var1"]));
        host.states().set_value("pyscript.var1", "on").unwrap();
        let n = sub.next().await.unwrap();

        let mut kwargs = IndexMap::new();
        kwargs.insert("room".to_string(), serde_json::json!("kitchen"));
        let args = TriggerArgs::state("file.hello.func", Some(&n)).with_kwargs(&kwargs);

        assert_eq!(args.trigger_type, TriggerType::State);
        assert_eq!(args.var_name.as_deref(), Some("pyscript.var1"));
        assert_eq!(args.value.as_deref(), Some("on"));
        assert!(args.old_value.is_none());

        let json = serde_json::to_value(&args).unwrap();
        assert_eq!(json["trigger_type"], "state");
        assert_eq!(json["kwargs"]["room"], "kitchen");
        assert!(json.get("payload").is_none());
    }
}
