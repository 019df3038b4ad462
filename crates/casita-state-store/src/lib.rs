//! Entity state storage with domain indexing for casita
//!
//! The StateStore tracks the current state of every entity, keeps a
//! per-domain index for domain queries, and fires a `state_changed`
//! event on the bus for every write and removal.

use casita_core::events::StateChangedData;
use casita_core::{Context, EntityId, State, MAX_STATE_LENGTH, STATE_UNKNOWN};
use casita_event_bus::EventBus;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, instrument, trace, warn};

/// Tracks the current state of all entities
///
/// Reads always see the latest written snapshot; there is no history.
/// Integrations that need change notifications subscribe to
/// `state_changed` on the bus instead of polling.
pub struct StateStore {
    /// All entity states keyed by entity_id string
    states: DashMap<String, State>,
    /// Entity_ids grouped by domain
    domain_index: DashMap<String, Vec<String>>,
    /// Bus for firing state change events
    event_bus: Arc<EventBus>,
}

impl StateStore {
    /// Create a new state store wired to the given event bus
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            states: DashMap::new(),
            domain_index: DashMap::new(),
            event_bus,
        }
    }

    /// Set the state of an entity
    ///
    /// `last_changed` is carried over from the previous state when the
    /// value is unchanged. State values longer than MAX_STATE_LENGTH are
    /// replaced with `unknown`. Fires `state_changed` with the old and
    /// new snapshot.
    #[instrument(skip(self, state, attributes, context), fields(entity_id = %entity_id))]
    pub fn set(
        &self,
        entity_id: EntityId,
        state: impl Into<String>,
        attributes: std::collections::HashMap<String, serde_json::Value>,
        context: Context,
    ) -> State {
        let mut state = state.into();
        if state.len() > MAX_STATE_LENGTH {
            warn!(
                length = state.len(),
                "State value exceeds maximum length, storing as unknown"
            );
            state = STATE_UNKNOWN.to_string();
        }

        let entity_id_str = entity_id.to_string();
        let domain = entity_id.domain().to_string();

        let old_state = self.states.get(&entity_id_str).map(|s| s.clone());

        let new_state = match &old_state {
            Some(existing) => existing.with_update(state, attributes, context.clone()),
            None => State::new(entity_id.clone(), state, attributes, context.clone()),
        };

        debug!(
            state = %new_state.state,
            changed = old_state.as_ref().map(|s| s.state != new_state.state).unwrap_or(true),
            "Setting entity state"
        );

        self.states.insert(entity_id_str.clone(), new_state.clone());

        if old_state.is_none() {
            self.domain_index
                .entry(domain)
                .or_default()
                .push(entity_id_str);
        }

        self.event_bus.fire_typed(
            StateChangedData {
                entity_id,
                old_state,
                new_state: Some(new_state.clone()),
            },
            context,
        );

        new_state
    }

    /// Get the current state of an entity
    pub fn get(&self, entity_id: &str) -> Option<State> {
        self.states.get(entity_id).map(|s| s.clone())
    }

    /// Get the state value as a string, or None if the entity doesn't exist
    pub fn get_state(&self, entity_id: &str) -> Option<String> {
        self.states.get(entity_id).map(|s| s.state.clone())
    }

    /// Check whether an entity is in a specific state
    pub fn is_state(&self, entity_id: &str, state: &str) -> bool {
        self.get_state(entity_id).as_deref() == Some(state)
    }

    /// All entity IDs in a domain
    pub fn entity_ids(&self, domain: &str) -> Vec<String> {
        self.domain_index
            .get(domain)
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// All states in a domain
    pub fn domain_states(&self, domain: &str) -> Vec<State> {
        self.entity_ids(domain)
            .iter()
            .filter_map(|id| self.get(id))
            .collect()
    }

    /// All states in the store
    pub fn all(&self) -> Vec<State> {
        self.states.iter().map(|r| r.value().clone()).collect()
    }

    /// Remove an entity's state
    ///
    /// Fires `state_changed` with `new_state: None` so subscribers see
    /// the entity disappear.
    #[instrument(skip(self, context), fields(entity_id = %entity_id))]
    pub fn remove(&self, entity_id: &EntityId, context: Context) -> Option<State> {
        let entity_id_str = entity_id.to_string();
        let domain = entity_id.domain();

        let old_state = self.states.remove(&entity_id_str).map(|(_, s)| s);

        if let Some(ref state) = old_state {
            trace!("Removing entity state");

            if let Some(mut ids) = self.domain_index.get_mut(domain) {
                ids.retain(|id| id != &entity_id_str);
            }

            self.event_bus.fire_typed(
                StateChangedData {
                    entity_id: entity_id.clone(),
                    old_state: Some(state.clone()),
                    new_state: None,
                },
                context,
            );
        }

        old_state
    }

    /// Total number of entities in the store
    pub fn entity_count(&self) -> usize {
        self.states.len()
    }
}

/// Thread-safe wrapper for StateStore
pub type SharedStateStore = Arc<StateStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn store() -> (Arc<EventBus>, StateStore) {
        let bus = Arc::new(EventBus::new());
        let store = StateStore::new(bus.clone());
        (bus, store)
    }

    fn cover(object_id: &str) -> EntityId {
        EntityId::new("cover", object_id).unwrap()
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let (_bus, store) = store();
        store.set(cover("garage_door"), "open", HashMap::new(), Context::new());

        assert_eq!(
            store.get_state("cover.garage_door").as_deref(),
            Some("open")
        );
        assert!(store.is_state("cover.garage_door", "open"));
        assert_eq!(store.entity_count(), 1);
    }

    #[tokio::test]
    async fn test_set_fires_state_changed_with_old_and_new() {
        let (bus, store) = store();
        let mut rx = bus.subscribe_typed::<StateChangedData>();

        store.set(cover("blind"), "open", HashMap::new(), Context::new());
        store.set(cover("blind"), "closed", HashMap::new(), Context::new());

        let first = rx.recv().await.unwrap();
        assert!(first.data.old_state.is_none());
        assert_eq!(first.data.new_state.unwrap().state, "open");

        let second = rx.recv().await.unwrap();
        assert_eq!(second.data.old_state.unwrap().state, "open");
        assert_eq!(second.data.new_state.unwrap().state, "closed");
    }

    #[tokio::test]
    async fn test_unchanged_value_keeps_last_changed() {
        let (_bus, store) = store();
        let first = store.set(cover("blind"), "open", HashMap::new(), Context::new());
        let second = store.set(cover("blind"), "open", HashMap::new(), Context::new());

        assert_eq!(second.last_changed, first.last_changed);
        assert!(second.last_updated >= first.last_updated);
    }

    #[tokio::test]
    async fn test_domain_index() {
        let (_bus, store) = store();
        store.set(cover("left"), "open", HashMap::new(), Context::new());
        store.set(cover("right"), "closed", HashMap::new(), Context::new());
        store.set(
            EntityId::new("sensor", "hallway").unwrap(),
            "21.5",
            HashMap::new(),
            Context::new(),
        );

        let mut ids = store.entity_ids("cover");
        ids.sort();
        assert_eq!(ids, vec!["cover.left", "cover.right"]);
        assert_eq!(store.domain_states("cover").len(), 2);
        assert_eq!(store.all().len(), 3);
    }

    #[tokio::test]
    async fn test_remove_fires_event_with_none_new_state() {
        let (bus, store) = store();
        store.set(cover("blind"), "open", HashMap::new(), Context::new());

        let mut rx = bus.subscribe_typed::<StateChangedData>();
        let removed = store.remove(&cover("blind"), Context::new());

        assert_eq!(removed.unwrap().state, "open");
        assert!(store.get("cover.blind").is_none());
        assert!(store.entity_ids("cover").is_empty());

        let event = rx.recv().await.unwrap();
        assert!(event.data.new_state.is_none());
        assert_eq!(event.data.old_state.unwrap().state, "open");
    }

    #[tokio::test]
    async fn test_remove_missing_entity_is_silent() {
        let (bus, store) = store();
        let mut rx = bus.subscribe_typed::<StateChangedData>();

        assert!(store.remove(&cover("ghost"), Context::new()).is_none());
        // No event fired for an entity that was never there
        store.set(cover("real"), "open", HashMap::new(), Context::new());
        let event = rx.recv().await.unwrap();
        assert_eq!(event.data.entity_id.to_string(), "cover.real");
    }

    #[tokio::test]
    async fn test_overlong_state_becomes_unknown() {
        let (_bus, store) = store();
        let long_value = "x".repeat(MAX_STATE_LENGTH + 1);
        let state = store.set(cover("blind"), long_value, HashMap::new(), Context::new());

        assert_eq!(state.state, STATE_UNKNOWN);
    }

    #[tokio::test]
    async fn test_attributes_round_trip() {
        let (_bus, store) = store();
        let mut attrs = HashMap::new();
        attrs.insert("current_position".to_string(), json!(55));

        store.set(cover("blind"), "open", attrs, Context::new());
        let state = store.get("cover.blind").unwrap();
        assert_eq!(state.attribute::<u8>("current_position"), Some(55));
    }
}
