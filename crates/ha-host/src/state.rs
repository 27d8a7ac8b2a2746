//! State type representing an entity's current value

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Context, EntityId};

/// Attributes attached to a state
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// The state of an entity at a point in time
///
/// The value is always a string, exactly as the host stores it. Trigger
/// expressions see `pyscript.var1` as that string and must convert it
/// explicitly (`int(pyscript.var1)`) to do arithmetic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub entity_id: EntityId,

    pub state: String,

    #[serde(default)]
    pub attributes: Attributes,

    /// When the value last changed
    pub last_changed: DateTime<Utc>,

    /// When the state was last written, changed or not
    pub last_updated: DateTime<Utc>,

    pub context: Context,
}

impl State {
    pub fn new(
        entity_id: EntityId,
        state: impl Into<String>,
        attributes: Attributes,
        context: Context,
    ) -> Self {
        let now = Utc::now();
        Self {
            entity_id,
            state: state.into(),
            attributes,
            last_changed: now,
            last_updated: now,
            context,
        }
    }

    /// Successor state, keeping `last_changed` when the value is unchanged
    pub fn with_update(
        &self,
        state: impl Into<String>,
        attributes: Attributes,
        context: Context,
    ) -> Self {
        let now = Utc::now();
        let state = state.into();
        Self {
            entity_id: self.entity_id.clone(),
            last_changed: if state == self.state {
                self.last_changed
            } else {
                now
            },
            state,
            attributes,
            last_updated: now,
            context,
        }
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        // Timestamps and context are not part of state identity
        self.entity_id == other.entity_id
            && self.state == other.state
            && self.attributes == other.attributes
    }
}
