//! Core types for casita
//!
//! Fundamental types shared by every crate in the workspace: EntityId,
//! State, Event, Context, and ServiceCall, plus the well-known state
//! values entity platforms write to the state store.

mod context;
mod entity_id;
mod event;
mod service_call;
mod state;

pub use context::Context;
pub use entity_id::{EntityId, EntityIdError};
pub use event::{Event, EventData, EventType};
pub use service_call::ServiceCall;
pub use state::State;

/// Maximum length for a state value
pub const MAX_STATE_LENGTH: usize = 255;

/// State value for an entity whose state cannot be determined
pub const STATE_UNKNOWN: &str = "unknown";

/// State value for an entity whose backing source is gone
pub const STATE_UNAVAILABLE: &str = "unavailable";

/// Cover is fully open
pub const STATE_OPEN: &str = "open";

/// Cover is fully closed
pub const STATE_CLOSED: &str = "closed";

/// Cover is moving toward open
pub const STATE_OPENING: &str = "opening";

/// Cover is moving toward closed
pub const STATE_CLOSING: &str = "closing";

/// Standard event types fired on the bus
pub mod events {
    use super::*;

    /// Event type fired whenever an entity's state is set or removed
    pub const STATE_CHANGED: &str = "state_changed";

    /// Event type fired for every dispatched service call
    pub const CALL_SERVICE: &str = "call_service";

    /// Payload of STATE_CHANGED events
    ///
    /// `old_state` is None for a brand new entity; `new_state` is None when
    /// the entity was removed from the store.
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct StateChangedData {
        pub entity_id: EntityId,
        pub old_state: Option<State>,
        pub new_state: Option<State>,
    }

    impl EventData for StateChangedData {
        fn event_type() -> &'static str {
            STATE_CHANGED
        }
    }

    /// Payload of CALL_SERVICE events
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct CallServiceData {
        pub domain: String,
        pub service: String,
        pub service_data: serde_json::Value,
    }

    impl EventData for CallServiceData {
        fn event_type() -> &'static str {
            CALL_SERVICE
        }
    }
}
