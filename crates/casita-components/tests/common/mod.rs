//! Shared test hub for integration tests
//!
//! Builds the full runtime (bus, states, services, registries, config
//! entries, cover platform) on a temp storage dir, with the
//! reverse_cover integration registered.

use std::sync::Arc;

use casita_components::cover::CoverPlatform;
use casita_components::demo::DemoCover;
use casita_components::reverse_cover::{self, ReverseCoverIntegration, CONF_SOURCE_ENTITY_ID};
use casita_config_entries::{ConfigEntries, FlowManager, FlowResult};
use casita_core::{Context, EntityId};
use casita_event_bus::EventBus;
use casita_registries::Registries;
use casita_service_registry::ServiceRegistry;
use casita_state_store::StateStore;
use serde_json::json;
use tempfile::TempDir;

pub struct TestHub {
    pub bus: Arc<EventBus>,
    pub states: Arc<StateStore>,
    pub services: Arc<ServiceRegistry>,
    pub registries: Arc<Registries>,
    pub entries: Arc<ConfigEntries>,
    pub flows: FlowManager,
    pub platform: Arc<CoverPlatform>,
    _dir: TempDir,
}

impl TestHub {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();

        let bus = Arc::new(EventBus::new());
        let states = Arc::new(StateStore::new(bus.clone()));
        let services = Arc::new(ServiceRegistry::new(bus.clone()));
        let registries = Arc::new(Registries::new(dir.path()));
        let entries = Arc::new(ConfigEntries::new(registries.storage.clone()));
        let flows = FlowManager::new(entries.clone());

        let platform = CoverPlatform::new(states.clone());
        platform.register_services(&services).unwrap();

        let integration = ReverseCoverIntegration::new(
            bus.clone(),
            states.clone(),
            services.clone(),
            registries.clone(),
            platform.clone(),
        );
        reverse_cover::register(integration, &entries, &flows);

        Self {
            bus,
            states,
            services,
            registries,
            entries,
            flows,
            platform,
            _dir: dir,
        }
    }

    /// Add an instant-transition demo cover as an upstream fixture
    pub fn add_demo_cover(&self, object_id: &str, name: &str, position: u8) {
        let entity_id = EntityId::new("cover", object_id).unwrap();
        self.platform
            .add_entity(DemoCover::new(entity_id, name, position), Context::new());
    }

    /// Run the reverse cover flow end to end for a source entity
    pub async fn configure_reverse(&self, source: &str) -> FlowResult {
        let flow_id = match self.flows.start(reverse_cover::DOMAIN).await.unwrap() {
            FlowResult::Form { flow_id, .. } => flow_id,
            other => panic!("expected form, got {:?}", other),
        };

        self.flows
            .progress(&flow_id, json!({ CONF_SOURCE_ENTITY_ID: source }))
            .await
            .unwrap()
    }

    /// Let spawned subscription tasks catch up with fired events
    pub async fn settle(&self) {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}
