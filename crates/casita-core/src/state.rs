//! State type representing an entity's current state

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Context, EntityId, STATE_UNAVAILABLE, STATE_UNKNOWN};

/// Snapshot of an entity at a point in time
///
/// Holds the state value as a string, the attribute map, and timestamps
/// for the last change and the last write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    /// The entity this state belongs to
    pub entity_id: EntityId,

    /// The state value (e.g., "open", "closing", "unavailable")
    pub state: String,

    /// Attributes associated with the state
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,

    /// When the state value last changed to a different value
    pub last_changed: DateTime<Utc>,

    /// When the state was last written, even if the value was unchanged
    pub last_updated: DateTime<Utc>,

    /// Context of the write that produced this state
    pub context: Context,
}

impl State {
    /// Create a new state stamped with the current time
    pub fn new(
        entity_id: EntityId,
        state: impl Into<String>,
        attributes: HashMap<String, serde_json::Value>,
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

    /// Create an updated state, keeping `last_changed` if the value is the same
    pub fn with_update(
        &self,
        new_state: impl Into<String>,
        new_attributes: HashMap<String, serde_json::Value>,
        context: Context,
    ) -> Self {
        let now = Utc::now();
        let new_state = new_state.into();
        let state_changed = self.state != new_state;

        Self {
            entity_id: self.entity_id.clone(),
            state: new_state,
            attributes: new_attributes,
            last_changed: if state_changed {
                now
            } else {
                self.last_changed
            },
            last_updated: now,
            context,
        }
    }

    /// Whether the state value marks the entity unavailable
    pub fn is_unavailable(&self) -> bool {
        self.state == STATE_UNAVAILABLE
    }

    /// Whether the state value is unknown
    pub fn is_unknown(&self) -> bool {
        self.state == STATE_UNKNOWN
    }

    /// Get an attribute deserialized into the requested type
    pub fn attribute<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.attributes
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

impl PartialEq for State {
    // Timestamps and context are not compared; two writes of the same
    // value with the same attributes are the same state.
    fn eq(&self, other: &Self) -> bool {
        self.entity_id == other.entity_id
            && self.state == other.state
            && self.attributes == other.attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity() -> EntityId {
        "cover.garage_door".parse().unwrap()
    }

    #[test]
    fn test_with_update_preserves_last_changed_on_same_value() {
        let first = State::new(entity(), "open", HashMap::new(), Context::new());
        let second = first.with_update("open", HashMap::new(), Context::new());

        assert_eq!(second.last_changed, first.last_changed);
        assert!(second.last_updated >= first.last_updated);
    }

    #[test]
    fn test_with_update_advances_last_changed_on_new_value() {
        let first = State::new(entity(), "open", HashMap::new(), Context::new());
        let second = first.with_update("closed", HashMap::new(), Context::new());

        assert!(second.last_changed >= first.last_changed);
        assert_eq!(second.state, "closed");
    }

    #[test]
    fn test_attribute_accessor() {
        let mut attrs = HashMap::new();
        attrs.insert("current_position".to_string(), json!(70));
        let state = State::new(entity(), "open", attrs, Context::new());

        assert_eq!(state.attribute::<u8>("current_position"), Some(70));
        assert_eq!(state.attribute::<u8>("missing"), None);
        // Wrong type also comes back as None
        assert_eq!(state.attribute::<String>("current_position"), None);
    }

    #[test]
    fn test_equality_ignores_timestamps() {
        let a = State::new(entity(), "closed", HashMap::new(), Context::new());
        let b = State::new(entity(), "closed", HashMap::new(), Context::new());
        assert_eq!(a, b);

        let c = State::new(entity(), "open", HashMap::new(), Context::new());
        assert_ne!(a, c);
    }

    #[test]
    fn test_availability_helpers() {
        let gone = State::new(entity(), STATE_UNAVAILABLE, HashMap::new(), Context::new());
        assert!(gone.is_unavailable());
        assert!(!gone.is_unknown());

        let unknown = State::new(entity(), STATE_UNKNOWN, HashMap::new(), Context::new());
        assert!(unknown.is_unknown());
    }
}
