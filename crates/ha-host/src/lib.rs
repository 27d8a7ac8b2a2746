//! Host boundary for the trigger engine
//!
//! The trigger engine never owns entity state or event transport. This crate
//! is the boundary it consumes: an [`EventBus`] for pub/sub, a [`StateStore`]
//! that fires `state_changed` events, and a [`Host`] that turns both into
//! per-topic [`Subscription`] streams of [`Notification`]s.

mod bus;
mod entity_id;
mod event;
mod notify;
mod state;
mod store;

pub use bus::{EventBus, ListenerId, SharedEventBus};
pub use entity_id::{EntityId, EntityIdError};
pub use event::{Context, Event, EventType};
pub use notify::{Host, Notification, Subscription, Topic};
pub use state::{Attributes, State};
pub use store::{SharedStateStore, StateStore};

/// Standard event types fired by the host
pub mod events {
    use serde::{Deserialize, Serialize};

    use crate::{EntityId, State};

    /// Fired by the state store whenever an entity is set or removed
    pub const STATE_CHANGED: &str = "state_changed";

    /// Fired once the host has finished starting up
    pub const HOMEASSISTANT_STARTED: &str = "homeassistant_started";

    /// Fired when the host begins shutting down
    pub const HOMEASSISTANT_STOP: &str = "homeassistant_stop";

    /// Payload of STATE_CHANGED events
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct StateChangedData {
        pub entity_id: EntityId,
        pub old_state: Option<State>,
        pub new_state: Option<State>,
    }
}
