//! Notification streams consumed by trigger watchers
//!
//! A watcher never reads the bus directly. It asks the [`Host`] for a
//! [`Subscription`] to a [`Topic`] and pulls [`Notification`]s from it in the
//! order the bus delivered them.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::events::{StateChangedData, HOMEASSISTANT_STARTED, HOMEASSISTANT_STOP, STATE_CHANGED};
use crate::{Context, Event, EventBus, EventType, ListenerId, State, StateStore};

/// What a subscription listens to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    /// State changes of any of the named entities
    States(BTreeSet<String>),
    /// Every event of one type
    Event(EventType),
}

impl Topic {
    pub fn states<I, S>(entity_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Topic::States(entity_ids.into_iter().map(Into::into).collect())
    }

    pub fn event(event_type: impl Into<EventType>) -> Self {
        Topic::Event(event_type.into())
    }

    fn bus_event_type(&self) -> EventType {
        match self {
            Topic::States(_) => EventType::from(STATE_CHANGED),
            Topic::Event(event_type) => event_type.clone(),
        }
    }
}

/// One delivery from a subscribed stream
#[derive(Debug, Clone)]
pub struct Notification {
    /// Entity id for state changes, event type for events
    pub id: String,
    pub old_value: Option<State>,
    pub new_value: Option<State>,
    /// Event data, for event topics
    pub payload: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// A live stream of notifications for one topic
///
/// Dropping the subscription (or calling [`Subscription::unsubscribe`])
/// releases the underlying bus receiver.
pub struct Subscription {
    id: ListenerId,
    topic: Topic,
    rx: broadcast::Receiver<Event>,
}

impl Subscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Wait for the next notification matching the topic
    ///
    /// Returns None once the bus has been dropped.
    pub async fn next(&mut self) -> Option<Notification> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if let Some(notification) = self.accept(event) {
                        return Some(notification);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(listener = ?self.id, "Subscription lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {
        debug!(listener = ?self.id, topic = ?self.topic, "Unsubscribing");
    }

    fn accept(&self, event: Event) -> Option<Notification> {
        match &self.topic {
            Topic::States(entity_ids) => {
                let data: StateChangedData = match serde_json::from_value(event.data) {
                    Ok(data) => data,
                    Err(e) => {
                        warn!(error = %e, "Malformed state_changed payload");
                        return None;
                    }
                };
                let id = data.entity_id.to_string();
                if !entity_ids.contains(&id) {
                    return None;
                }
                trace!(entity_id = %id, "State notification");
                Some(Notification {
                    id,
                    old_value: data.old_state,
                    new_value: data.new_state,
                    payload: None,
                    timestamp: event.time_fired,
                })
            }
            Topic::Event(event_type) => Some(Notification {
                id: event_type.to_string(),
                old_value: None,
                new_value: None,
                payload: Some(event.data),
                timestamp: event.time_fired,
            }),
        }
    }
}

/// The running host: bus, state store and lifecycle signals
pub struct Host {
    bus: Arc<EventBus>,
    states: Arc<StateStore>,
    started: AtomicBool,
}

impl Host {
    pub fn new() -> Self {
        Self::from_bus(Arc::new(EventBus::new()))
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::from_bus(Arc::new(EventBus::with_capacity(capacity)))
    }

    fn from_bus(bus: Arc<EventBus>) -> Self {
        let states = Arc::new(StateStore::new(bus.clone()));
        Self {
            bus,
            states,
            started: AtomicBool::new(false),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn states(&self) -> &Arc<StateStore> {
        &self.states
    }

    /// Open a notification stream for a topic
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let rx = self.bus.subscribe(topic.bus_event_type());
        let id = self.bus.next_listener_id();
        debug!(listener = ?id, topic = ?topic, "Subscribed");
        Subscription { id, topic, rx }
    }

    /// Fire an arbitrary event
    pub fn fire_event(&self, event_type: impl Into<EventType>, data: serde_json::Value) {
        self.bus.fire(Event::new(event_type, data, Context::new()));
    }

    /// Signal that the host has started; only the first call fires
    pub fn start(&self) {
        if !self.started.swap(true, Ordering::SeqCst) {
            self.fire_event(HOMEASSISTANT_STARTED, serde_json::json!({}));
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Signal host shutdown
    pub fn stop(&self) {
        self.fire_event(HOMEASSISTANT_STOP, serde_json::json!({}));
    }
}

impl Default for Host {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::{assert_pending, assert_ready};

    #[tokio::test]
    async fn test_state_topic_filters_entities() {
        let host = Host::new();
        let mut sub = host.subscribe(Topic::states(["pyscript.var1"]));

        host.states().set_value("pyscript.other", "5").unwrap();
        host.states().set_value("pyscript.var1", "1").unwrap();

        let n = sub.next().await.unwrap();
        assert_eq!(n.id, "pyscript.var1");
        assert!(n.old_value.is_none());
        assert_eq!(n.new_value.unwrap().state, "1");
    }

    #[tokio::test]
    async fn test_event_topic_carries_payload() {
        let host = Host::new();
        let mut sub = host.subscribe(Topic::event("some_event"));

        host.fire_event("some_event", json!({"arg1": 20}));

        let n = sub.next().await.unwrap();
        assert_eq!(n.id, "some_event");
        assert_eq!(n.payload.unwrap()["arg1"], 20);
    }

    #[tokio::test]
    async fn test_start_fires_once() {
        let host = Host::new();
        let mut sub = host.subscribe(Topic::event(HOMEASSISTANT_STARTED));

        assert!(!host.is_started());
        host.start();
        host.start();
        assert!(host.is_started());

        assert!(sub.next().await.is_some());
        host.fire_event("sentinel", json!({}));
        assert!(sub.rx.try_recv().is_err());
    }

    #[test]
    fn test_next_waits_for_matching_entity() {
        let host = Host::new();
        let mut sub = host.subscribe(Topic::states(["pyscript.var1"]));
        let mut next = tokio_test::task::spawn(sub.next());
        assert_pending!(next.poll());

        host.states().set_value("pyscript.other", "5").unwrap();
        assert_pending!(next.poll());

        host.states().set_value("pyscript.var1", "1").unwrap();
        let n = assert_ready!(next.poll()).unwrap();
        assert_eq!(n.id, "pyscript.var1");
    }

    #[test]
    fn test_unsubscribe_releases_receiver() {
        let host = Host::new();
        let sub = host.subscribe(Topic::event("some_event"));
        assert_eq!(host.bus().receiver_count("some_event"), 1);
        sub.unsubscribe();
        assert_eq!(host.bus().receiver_count("some_event"), 0);
    }
}
