//! Entity state storage
//!
//! The StateStore holds the current state of every entity and fires a
//! `state_changed` event on the bus for every write.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::events::{StateChangedData, STATE_CHANGED};
use crate::{Attributes, Context, EntityId, EntityIdError, Event, EventBus, State};

pub struct StateStore {
    /// All entity states keyed by entity_id string
    states: DashMap<String, State>,
    event_bus: Arc<EventBus>,
}

impl StateStore {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            states: DashMap::new(),
            event_bus,
        }
    }

    /// Set the state of an entity and fire STATE_CHANGED
    #[instrument(skip(self, state, attributes, context), fields(entity_id = %entity_id))]
    pub fn set(
        &self,
        entity_id: EntityId,
        state: impl Into<String>,
        attributes: Attributes,
        context: Context,
    ) -> State {
        let key = entity_id.to_string();
        let old_state = self.states.get(&key).map(|s| s.clone());

        let new_state = match &old_state {
            Some(existing) => existing.with_update(state, attributes, context.clone()),
            None => State::new(entity_id.clone(), state, attributes, context.clone()),
        };

        debug!(state = %new_state.state, "Setting entity state");
        self.states.insert(key, new_state.clone());

        self.fire_changed(entity_id, old_state, Some(new_state.clone()), context);
        new_state
    }

    /// Set an entity's value by its string id with no attributes
    pub fn set_value(
        &self,
        entity_id: &str,
        value: impl Into<String>,
    ) -> Result<State, EntityIdError> {
        let entity_id: EntityId = entity_id.parse()?;
        let attributes = self
            .get(&entity_id.to_string())
            .map(|s| s.attributes)
            .unwrap_or_default();
        Ok(self.set(entity_id, value, attributes, Context::new()))
    }

    /// Remove an entity, firing STATE_CHANGED with no new state
    pub fn remove(&self, entity_id: &EntityId, context: Context) -> Option<State> {
        let old_state = self.states.remove(&entity_id.to_string()).map(|(_, s)| s);
        if old_state.is_some() {
            self.fire_changed(entity_id.clone(), old_state.clone(), None, context);
        }
        old_state
    }

    pub fn get(&self, entity_id: &str) -> Option<State> {
        self.states.get(entity_id).map(|s| s.clone())
    }

    /// The state value string, or None if the entity doesn't exist
    pub fn get_state(&self, entity_id: &str) -> Option<String> {
        self.states.get(entity_id).map(|s| s.state.clone())
    }

    pub fn entity_count(&self) -> usize {
        self.states.len()
    }

    fn fire_changed(
        &self,
        entity_id: EntityId,
        old_state: Option<State>,
        new_state: Option<State>,
        context: Context,
    ) {
        let data = StateChangedData {
            entity_id,
            old_state,
            new_state,
        };
        let data = serde_json::to_value(&data).unwrap_or_default();
        self.event_bus.fire(Event::new(STATE_CHANGED, data, context));
    }
}

/// Thread-safe wrapper for StateStore
pub type SharedStateStore = Arc<StateStore>;
