//! The reverse cover proxy entity
//!
//! Derives every property fresh from the source cover's current state
//! and forwards its own commands to the source with the direction
//! flipped. The only thing it owns is the reference to the source.

use std::sync::Arc;

use async_trait::async_trait;
use casita_core::{Context, EntityId, State, STATE_CLOSING, STATE_OPENING, STATE_UNKNOWN};
use casita_service_registry::ServiceRegistry;
use casita_state_store::StateStore;
use serde_json::json;
use tracing::debug;

use crate::cover::{
    Cover, CoverCommand, CoverError, ATTR_CURRENT_POSITION, ATTR_POSITION, DOMAIN as COVER_DOMAIN,
    SUPPORT_CLOSE, SUPPORT_OPEN, SUPPORT_SET_POSITION, SUPPORT_STOP,
};
use super::{invert_position, invert_state};

/// A cover that mirrors one source cover with inverted state
pub struct ReverseCover {
    entity_id: EntityId,
    unique_id: String,
    name: String,
    source_entity_id: String,
    states: Arc<StateStore>,
    services: Arc<ServiceRegistry>,
}

impl ReverseCover {
    /// Create a proxy over a source cover entity
    pub fn new(
        entity_id: EntityId,
        unique_id: impl Into<String>,
        name: impl Into<String>,
        source_entity_id: impl Into<String>,
        states: Arc<StateStore>,
        services: Arc<ServiceRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            entity_id,
            unique_id: unique_id.into(),
            name: name.into(),
            source_entity_id: source_entity_id.into(),
            states,
            services,
        })
    }

    /// The entity this proxy mirrors
    pub fn source_entity_id(&self) -> &str {
        &self.source_entity_id
    }

    fn source_state(&self) -> Option<State> {
        self.states.get(&self.source_entity_id)
    }

    /// Forward a service call to the source cover
    async fn forward(
        &self,
        service: &str,
        service_data: serde_json::Value,
        context: Context,
    ) -> Result<(), CoverError> {
        debug!(
            source = %self.source_entity_id,
            service = %service,
            "Forwarding inverted command to source"
        );

        self.services
            .call(COVER_DOMAIN, service, service_data, context.child())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Cover for ReverseCover {
    fn entity_id(&self) -> EntityId {
        self.entity_id.clone()
    }

    fn unique_id(&self) -> String {
        self.unique_id.clone()
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn available(&self) -> bool {
        self.source_state().is_some()
    }

    fn current_position(&self) -> Option<u8> {
        self.source_state()?
            .attribute::<u8>(ATTR_CURRENT_POSITION)
            .map(invert_position)
    }

    fn is_opening(&self) -> bool {
        // The proxy opens while the source closes
        self.source_state()
            .map(|s| s.state == STATE_CLOSING)
            .unwrap_or(false)
    }

    fn is_closing(&self) -> bool {
        self.source_state()
            .map(|s| s.state == STATE_OPENING)
            .unwrap_or(false)
    }

    fn is_closed(&self) -> Option<bool> {
        self.current_position().map(|p| p == 0)
    }

    fn state(&self) -> String {
        match self.source_state() {
            Some(source) => invert_state(&source.state).to_string(),
            None => STATE_UNKNOWN.to_string(),
        }
    }

    fn supported_features(&self) -> u32 {
        SUPPORT_OPEN | SUPPORT_CLOSE | SUPPORT_SET_POSITION | SUPPORT_STOP
    }

    async fn execute(&self, command: CoverCommand, context: Context) -> Result<(), CoverError> {
        let target = json!({"entity_id": self.source_entity_id});

        match command {
            CoverCommand::Open => {
                self.forward(CoverCommand::Close.service(), target, context)
                    .await
            }
            CoverCommand::Close => {
                self.forward(CoverCommand::Open.service(), target, context)
                    .await
            }
            // Stop has no directional inverse
            CoverCommand::Stop => {
                self.forward(CoverCommand::Stop.service(), target, context)
                    .await
            }
            CoverCommand::SetPosition { position } => {
                self.forward(
                    command.service(),
                    json!({
                        "entity_id": self.source_entity_id,
                        ATTR_POSITION: invert_position(position),
                    }),
                    context,
                )
                .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casita_core::events::CallServiceData;
    use casita_core::{STATE_CLOSED, STATE_OPEN};
    use casita_event_bus::EventBus;
    use casita_service_registry::ServiceError;
    use std::collections::HashMap;

    fn harness() -> (Arc<EventBus>, Arc<StateStore>, Arc<ServiceRegistry>, Arc<ReverseCover>) {
        let bus = Arc::new(EventBus::new());
        let states = Arc::new(StateStore::new(bus.clone()));
        let services = Arc::new(ServiceRegistry::new(bus.clone()));

        let proxy = ReverseCover::new(
            "cover.reverse_garage_door".parse().unwrap(),
            "reverse_cover.garage_door",
            "Reverse cover.garage_door",
            "cover.garage_door",
            states.clone(),
            services.clone(),
        );

        (bus, states, services, proxy)
    }

    fn set_source(states: &StateStore, state: &str, position: Option<u8>) {
        let mut attrs = HashMap::new();
        if let Some(p) = position {
            attrs.insert(ATTR_CURRENT_POSITION.to_string(), json!(p));
        }
        states.set(
            "cover.garage_door".parse().unwrap(),
            state,
            attrs,
            Context::new(),
        );
    }

    #[tokio::test]
    async fn test_state_is_inverted() {
        let (_bus, states, _services, proxy) = harness();

        set_source(&states, STATE_OPEN, Some(30));
        assert_eq!(proxy.state(), STATE_CLOSED);
        assert_eq!(proxy.current_position(), Some(70));
        assert!(proxy.available());

        set_source(&states, STATE_OPENING, None);
        assert_eq!(proxy.state(), STATE_CLOSING);
        assert!(proxy.is_closing());
        assert!(!proxy.is_opening());
    }

    #[tokio::test]
    async fn test_unmapped_state_passes_through() {
        let (_bus, states, _services, proxy) = harness();

        set_source(&states, "jammed", None);
        assert_eq!(proxy.state(), "jammed");
    }

    #[tokio::test]
    async fn test_absent_source_reports_unknown() {
        let (_bus, _states, _services, proxy) = harness();

        assert!(!proxy.available());
        assert_eq!(proxy.state(), STATE_UNKNOWN);
        assert_eq!(proxy.current_position(), None);
        assert_eq!(proxy.is_closed(), None);
        assert!(!proxy.is_opening());
        assert!(!proxy.is_closing());
    }

    #[tokio::test]
    async fn test_position_without_attribute_is_none() {
        let (_bus, states, _services, proxy) = harness();

        set_source(&states, STATE_OPEN, None);
        assert!(proxy.available());
        assert_eq!(proxy.current_position(), None);
    }

    #[tokio::test]
    async fn test_open_forwards_close_to_source() {
        let (bus, _states, services, proxy) = harness();
        let mut calls = bus.subscribe_typed::<CallServiceData>();

        services.register(COVER_DOMAIN, "close_cover", |_| async { Ok(()) });
        proxy
            .execute(CoverCommand::Open, Context::new())
            .await
            .unwrap();

        let call = calls.recv().await.unwrap();
        assert_eq!(call.data.service, "close_cover");
        assert_eq!(call.data.service_data["entity_id"], "cover.garage_door");
    }

    #[tokio::test]
    async fn test_stop_forwards_unchanged() {
        let (bus, _states, services, proxy) = harness();
        let mut calls = bus.subscribe_typed::<CallServiceData>();

        services.register(COVER_DOMAIN, "stop_cover", |_| async { Ok(()) });
        proxy
            .execute(CoverCommand::Stop, Context::new())
            .await
            .unwrap();

        assert_eq!(calls.recv().await.unwrap().data.service, "stop_cover");
    }

    #[tokio::test]
    async fn test_set_position_inverts_value() {
        let (bus, _states, services, proxy) = harness();
        let mut calls = bus.subscribe_typed::<CallServiceData>();

        services.register(COVER_DOMAIN, "set_cover_position", |_| async { Ok(()) });
        proxy
            .execute(CoverCommand::SetPosition { position: 30 }, Context::new())
            .await
            .unwrap();

        let call = calls.recv().await.unwrap();
        assert_eq!(call.data.service_data[ATTR_POSITION], 70);
    }

    #[tokio::test]
    async fn test_forward_propagates_dispatch_failure() {
        let (_bus, _states, _services, proxy) = harness();

        // Nothing registered for cover.close_cover
        let result = proxy.execute(CoverCommand::Open, Context::new()).await;
        assert!(matches!(
            result,
            Err(CoverError::Service(ServiceError::NotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_forwarded_context_is_a_child() {
        let (bus, _states, services, proxy) = harness();
        let mut calls = bus.subscribe_typed::<CallServiceData>();

        services.register(COVER_DOMAIN, "open_cover", |_| async { Ok(()) });
        let origin = Context::new();
        proxy
            .execute(CoverCommand::Close, origin.clone())
            .await
            .unwrap();

        let call = calls.recv().await.unwrap();
        assert_eq!(call.context.parent_id.as_deref(), Some(origin.id.as_str()));
    }
}
