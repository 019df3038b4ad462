//! Cover platform
//!
//! The capability surface for cover entities: typed commands, the
//! `Cover` trait, and the platform that owns registered covers, writes
//! their states to the store, and routes the `cover.*` services to
//! them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use casita_core::{
    Context, EntityId, ServiceCall, STATE_CLOSED, STATE_CLOSING, STATE_OPEN, STATE_OPENING,
    STATE_UNAVAILABLE, STATE_UNKNOWN,
};
use casita_service_registry::{ServiceError, ServiceRegistry, ServiceResult};
use casita_state_store::StateStore;
use dashmap::DashMap;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// The cover domain
pub const DOMAIN: &str = "cover";

/// Open a cover
pub const SERVICE_OPEN_COVER: &str = "open_cover";
/// Close a cover
pub const SERVICE_CLOSE_COVER: &str = "close_cover";
/// Move a cover to a specific position
pub const SERVICE_SET_COVER_POSITION: &str = "set_cover_position";
/// Stop a moving cover
pub const SERVICE_STOP_COVER: &str = "stop_cover";

/// State attribute holding the cover's current position (0 closed, 100 open)
pub const ATTR_CURRENT_POSITION: &str = "current_position";
/// Service data field for the target position
pub const ATTR_POSITION: &str = "position";
/// State attribute holding the display name
pub const ATTR_FRIENDLY_NAME: &str = "friendly_name";
/// State attribute holding the supported features bitmask
pub const ATTR_SUPPORTED_FEATURES: &str = "supported_features";

/// The cover can open
pub const SUPPORT_OPEN: u32 = 1;
/// The cover can close
pub const SUPPORT_CLOSE: u32 = 2;
/// The cover can move to a specific position
pub const SUPPORT_SET_POSITION: u32 = 4;
/// The cover can stop mid-travel
pub const SUPPORT_STOP: u32 = 8;

/// Cover platform errors
#[derive(Debug, Error)]
pub enum CoverError {
    #[error("Cover entity not found: {0}")]
    EntityNotFound(String),

    #[error("Invalid entity id: {0}")]
    InvalidEntityId(#[from] casita_core::EntityIdError),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl From<CoverError> for ServiceError {
    fn from(err: CoverError) -> Self {
        match err {
            // A forwarded call's failure reaches the caller unchanged
            CoverError::Service(inner) => inner,
            other => ServiceError::CallFailed(other.to_string()),
        }
    }
}

/// A typed cover command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverCommand {
    Open,
    Close,
    Stop,
    SetPosition { position: u8 },
}

impl CoverCommand {
    /// Parse a cover service call into a command
    ///
    /// Returns None for a `set_cover_position` call without a position
    /// and for services outside the cover command set.
    pub fn from_service_call(call: &ServiceCall) -> Option<Self> {
        match call.service.as_str() {
            SERVICE_OPEN_COVER => Some(Self::Open),
            SERVICE_CLOSE_COVER => Some(Self::Close),
            SERVICE_STOP_COVER => Some(Self::Stop),
            SERVICE_SET_COVER_POSITION => call
                .get::<u8>(ATTR_POSITION)
                .map(|position| Self::SetPosition { position }),
            _ => None,
        }
    }

    /// The service name that dispatches this command
    pub fn service(&self) -> &'static str {
        match self {
            Self::Open => SERVICE_OPEN_COVER,
            Self::Close => SERVICE_CLOSE_COVER,
            Self::Stop => SERVICE_STOP_COVER,
            Self::SetPosition { .. } => SERVICE_SET_COVER_POSITION,
        }
    }
}

/// The cover capability
///
/// Everything the platform needs to publish a cover's state and drive
/// it with commands. State is derived on demand; implementations hold
/// no copy of what the store already knows.
#[async_trait]
pub trait Cover: Send + Sync {
    /// The entity id this cover is published under
    fn entity_id(&self) -> EntityId;

    /// Platform-scoped unique identifier
    fn unique_id(&self) -> String;

    /// Display name
    fn name(&self) -> String;

    /// Whether the cover can currently be read and controlled
    fn available(&self) -> bool {
        true
    }

    /// Position from 0 (closed) to 100 (open), when known
    fn current_position(&self) -> Option<u8>;

    /// Whether the cover is moving toward open
    fn is_opening(&self) -> bool {
        false
    }

    /// Whether the cover is moving toward closed
    fn is_closing(&self) -> bool {
        false
    }

    /// Whether the cover is fully closed, when known
    fn is_closed(&self) -> Option<bool> {
        self.current_position().map(|p| p == 0)
    }

    /// The state value to publish
    fn state(&self) -> String {
        if !self.available() {
            return STATE_UNAVAILABLE.to_string();
        }
        if self.is_opening() {
            return STATE_OPENING.to_string();
        }
        if self.is_closing() {
            return STATE_CLOSING.to_string();
        }
        match self.is_closed() {
            Some(true) => STATE_CLOSED.to_string(),
            Some(false) => STATE_OPEN.to_string(),
            None => STATE_UNKNOWN.to_string(),
        }
    }

    /// Bitmask of SUPPORT_* flags
    fn supported_features(&self) -> u32;

    /// Execute a command, returning once the cover has acted on it
    async fn execute(&self, command: CoverCommand, context: Context) -> Result<(), CoverError>;
}

/// Owns cover entities and routes the `cover.*` services to them
pub struct CoverPlatform {
    states: Arc<StateStore>,
    /// Covers keyed by entity_id string
    entities: DashMap<String, Arc<dyn Cover>>,
}

impl CoverPlatform {
    /// Create a new cover platform
    pub fn new(states: Arc<StateStore>) -> Arc<Self> {
        Arc::new(Self {
            states,
            entities: DashMap::new(),
        })
    }

    /// Register the four cover services on the registry
    ///
    /// `set_cover_position` carries a schema bounding the position to
    /// 0..=100; the field itself stays optional so a call without it is
    /// ignored rather than rejected.
    pub fn register_services(
        self: &Arc<Self>,
        services: &ServiceRegistry,
    ) -> Result<(), ServiceError> {
        for service in [SERVICE_OPEN_COVER, SERVICE_CLOSE_COVER, SERVICE_STOP_COVER] {
            let platform = Arc::clone(self);
            services.register(DOMAIN, service, move |call: ServiceCall| {
                let platform = platform.clone();
                async move { platform.handle_call(call).await }
            });
        }

        let platform = Arc::clone(self);
        services.register_with_schema(
            DOMAIN,
            SERVICE_SET_COVER_POSITION,
            json!({
                "type": "object",
                "properties": {
                    "position": {"type": "integer", "minimum": 0, "maximum": 100}
                }
            }),
            move |call: ServiceCall| {
                let platform = platform.clone();
                async move { platform.handle_call(call).await }
            },
        )
    }

    /// Add a cover and publish its state immediately
    #[instrument(skip(self, entity, context), fields(entity_id = %entity.entity_id()))]
    pub fn add_entity(&self, entity: Arc<dyn Cover>, context: Context) {
        let entity_id = entity.entity_id().to_string();
        debug!("Adding cover entity");

        self.write_state(entity.as_ref(), context);
        self.entities.insert(entity_id, entity);
    }

    /// Remove a cover and its state
    pub fn remove_entity(&self, entity_id: &str, context: Context) -> Option<Arc<dyn Cover>> {
        let removed = self.entities.remove(entity_id).map(|(_, e)| e);

        if let Some(ref entity) = removed {
            debug!(entity_id = %entity_id, "Removing cover entity");
            self.states.remove(&entity.entity_id(), context);
        }

        removed
    }

    /// Get a registered cover by entity_id
    pub fn get_entity(&self, entity_id: &str) -> Option<Arc<dyn Cover>> {
        self.entities.get(entity_id).map(|e| e.value().clone())
    }

    /// Number of registered covers
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Re-derive and publish a cover's state
    pub fn update_entity(&self, entity_id: &str, context: Context) {
        if let Some(entity) = self.get_entity(entity_id) {
            self.write_state(entity.as_ref(), context);
        }
    }

    /// Write a cover's derived state and attributes to the store
    pub fn write_state(&self, entity: &dyn Cover, context: Context) {
        let mut attributes = HashMap::new();
        attributes.insert(ATTR_FRIENDLY_NAME.to_string(), json!(entity.name()));
        attributes.insert(
            ATTR_SUPPORTED_FEATURES.to_string(),
            json!(entity.supported_features()),
        );
        if let Some(position) = entity.current_position() {
            attributes.insert(ATTR_CURRENT_POSITION.to_string(), json!(position));
        }

        self.states
            .set(entity.entity_id(), entity.state(), attributes, context);
    }

    /// Handle a cover service call against every targeted entity
    #[instrument(skip(self, call), fields(service = %call.service))]
    async fn handle_call(&self, call: ServiceCall) -> ServiceResult {
        let command = match CoverCommand::from_service_call(&call) {
            Some(command) => command,
            None => {
                // A position service without a position is a no-op
                debug!("Cover call carries no actionable command, ignoring");
                return Ok(());
            }
        };

        for entity_id in call.entity_ids() {
            let entity = self.get_entity(&entity_id).ok_or_else(|| {
                warn!(entity_id = %entity_id, "Cover call targets unknown entity");
                ServiceError::from(CoverError::EntityNotFound(entity_id.clone()))
            })?;

            entity
                .execute(command, call.context.clone())
                .await
                .map_err(ServiceError::from)?;

            // Commands take effect synchronously, republish right away
            self.write_state(entity.as_ref(), call.context.child());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casita_event_bus::EventBus;
    use std::sync::atomic::{AtomicU8, Ordering};

    struct FixedCover {
        entity_id: EntityId,
        position: AtomicU8,
    }

    impl FixedCover {
        fn new(object_id: &str, position: u8) -> Arc<Self> {
            Arc::new(Self {
                entity_id: EntityId::new(DOMAIN, object_id).unwrap(),
                position: AtomicU8::new(position),
            })
        }
    }

    #[async_trait]
    impl Cover for FixedCover {
        fn entity_id(&self) -> EntityId {
            self.entity_id.clone()
        }

        fn unique_id(&self) -> String {
            format!("fixed_{}", self.entity_id.object_id())
        }

        fn name(&self) -> String {
            "Fixed".to_string()
        }

        fn current_position(&self) -> Option<u8> {
            Some(self.position.load(Ordering::SeqCst))
        }

        fn supported_features(&self) -> u32 {
            SUPPORT_OPEN | SUPPORT_CLOSE | SUPPORT_SET_POSITION | SUPPORT_STOP
        }

        async fn execute(&self, command: CoverCommand, _context: Context) -> Result<(), CoverError> {
            match command {
                CoverCommand::Open => self.position.store(100, Ordering::SeqCst),
                CoverCommand::Close => self.position.store(0, Ordering::SeqCst),
                CoverCommand::SetPosition { position } => {
                    self.position.store(position, Ordering::SeqCst)
                }
                CoverCommand::Stop => {}
            }
            Ok(())
        }
    }

    fn platform() -> (Arc<ServiceRegistry>, Arc<StateStore>, Arc<CoverPlatform>) {
        let bus = Arc::new(EventBus::new());
        let states = Arc::new(StateStore::new(bus.clone()));
        let services = Arc::new(ServiceRegistry::new(bus));
        let platform = CoverPlatform::new(states.clone());
        platform.register_services(&services).unwrap();
        (services, states, platform)
    }

    #[test]
    fn test_command_from_service_call() {
        let open = ServiceCall::simple(DOMAIN, SERVICE_OPEN_COVER, Context::new());
        assert_eq!(
            CoverCommand::from_service_call(&open),
            Some(CoverCommand::Open)
        );

        let set = ServiceCall::new(
            DOMAIN,
            SERVICE_SET_COVER_POSITION,
            json!({"position": 40}),
            Context::new(),
        );
        assert_eq!(
            CoverCommand::from_service_call(&set),
            Some(CoverCommand::SetPosition { position: 40 })
        );

        // No position, no command
        let empty = ServiceCall::simple(DOMAIN, SERVICE_SET_COVER_POSITION, Context::new());
        assert_eq!(CoverCommand::from_service_call(&empty), None);
    }

    #[test]
    fn test_default_state_derivation() {
        let closed = FixedCover::new("blind", 0);
        assert_eq!(closed.state(), STATE_CLOSED);
        assert_eq!(closed.is_closed(), Some(true));

        let open = FixedCover::new("blind", 60);
        assert_eq!(open.state(), STATE_OPEN);
        assert_eq!(open.is_closed(), Some(false));
    }

    #[tokio::test]
    async fn test_add_entity_publishes_state_and_attributes() {
        let (_services, states, platform) = platform();
        platform.add_entity(FixedCover::new("blind", 70), Context::new());

        let state = states.get("cover.blind").unwrap();
        assert_eq!(state.state, STATE_OPEN);
        assert_eq!(state.attribute::<u8>(ATTR_CURRENT_POSITION), Some(70));
        assert_eq!(state.attribute::<u32>(ATTR_SUPPORTED_FEATURES), Some(15));
        assert_eq!(
            state.attribute::<String>(ATTR_FRIENDLY_NAME).as_deref(),
            Some("Fixed")
        );
    }

    #[tokio::test]
    async fn test_service_call_executes_and_republishes() {
        let (services, states, platform) = platform();
        platform.add_entity(FixedCover::new("blind", 70), Context::new());

        services
            .call(
                DOMAIN,
                SERVICE_SET_COVER_POSITION,
                json!({"entity_id": "cover.blind", "position": 0}),
                Context::new(),
            )
            .await
            .unwrap();

        let state = states.get("cover.blind").unwrap();
        assert_eq!(state.state, STATE_CLOSED);
        assert_eq!(state.attribute::<u8>(ATTR_CURRENT_POSITION), Some(0));
    }

    #[tokio::test]
    async fn test_missing_position_is_silent_noop() {
        let (services, states, platform) = platform();
        platform.add_entity(FixedCover::new("blind", 70), Context::new());

        services
            .call(
                DOMAIN,
                SERVICE_SET_COVER_POSITION,
                json!({"entity_id": "cover.blind"}),
                Context::new(),
            )
            .await
            .unwrap();

        // Position untouched
        let state = states.get("cover.blind").unwrap();
        assert_eq!(state.attribute::<u8>(ATTR_CURRENT_POSITION), Some(70));
    }

    #[tokio::test]
    async fn test_unknown_target_fails_the_call() {
        let (services, _states, _platform) = platform();

        let result = services
            .call(
                DOMAIN,
                SERVICE_OPEN_COVER,
                json!({"entity_id": "cover.ghost"}),
                Context::new(),
            )
            .await;

        assert!(matches!(result, Err(ServiceError::CallFailed(_))));
    }

    #[tokio::test]
    async fn test_remove_entity_clears_state() {
        let (_services, states, platform) = platform();
        platform.add_entity(FixedCover::new("blind", 70), Context::new());

        assert!(platform.remove_entity("cover.blind", Context::new()).is_some());
        assert!(states.get("cover.blind").is_none());
        assert_eq!(platform.entity_count(), 0);
    }
}
