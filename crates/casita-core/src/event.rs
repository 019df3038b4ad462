//! Event types for the casita event bus

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Context;

/// Trait for typed event payloads
///
/// Implemented by any data type carried on the bus; ties the payload type
/// to its wire-level event type string.
pub trait EventData: Clone + Send + Sync + 'static {
    /// The event type string for this payload type
    fn event_type() -> &'static str;
}

/// Event type identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventType(String);

impl EventType {
    /// Create a new event type
    pub fn new(event_type: impl Into<String>) -> Self {
        Self(event_type.into())
    }

    /// The event type as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The wildcard event type matching every event
    pub fn match_all() -> Self {
        Self("*".to_string())
    }

    /// Check whether this is the wildcard type
    pub fn is_match_all(&self) -> bool {
        self.0 == "*"
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An event fired on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event<T = serde_json::Value> {
    /// The type of event
    pub event_type: EventType,

    /// The event payload
    pub data: T,

    /// When the event was fired
    pub time_fired: DateTime<Utc>,

    /// Context tracking origin and causality
    pub context: Context,
}

impl<T> Event<T> {
    /// Create a new event stamped with the current time
    pub fn new(event_type: impl Into<EventType>, data: T, context: Context) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            time_fired: Utc::now(),
            context,
        }
    }
}

impl<T: EventData> Event<T> {
    /// Create an event whose type comes from the payload's EventData impl
    pub fn typed(data: T, context: Context) -> Self {
        Self::new(T::event_type(), data, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::StateChangedData;
    use serde_json::json;

    #[test]
    fn test_event_type_wildcard() {
        assert!(EventType::match_all().is_match_all());
        assert!(!EventType::new("state_changed").is_match_all());
    }

    #[test]
    fn test_typed_event_takes_payload_type() {
        let data = StateChangedData {
            entity_id: "cover.test".parse().unwrap(),
            old_state: None,
            new_state: None,
        };
        let event = Event::typed(data, Context::new());
        assert_eq!(event.event_type.as_str(), "state_changed");
    }

    #[test]
    fn test_event_serde_roundtrip() {
        let event = Event::new("custom_event", json!({"n": 3}), Context::new());
        let encoded = serde_json::to_string(&event).unwrap();
        let decoded: Event = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.event_type, event.event_type);
        assert_eq!(decoded.data["n"], 3);
    }
}
