//! Reverse cover integration
//!
//! Mirrors one source cover as a proxy entity with inverted state:
//! open reads as closed, opening as closing, position as its
//! complement. Commands sent to the proxy are forwarded to the source
//! with the direction flipped; stop passes through unchanged.

pub mod entity;
pub mod flow;

use std::sync::Arc;

use async_trait::async_trait;
use casita_config_entries::{ConfigEntry, EntryHandler};
use casita_core::events::StateChangedData;
use casita_core::{Context, EntityId, STATE_CLOSED, STATE_CLOSING, STATE_OPEN, STATE_OPENING};
use casita_event_bus::EventBus;
use casita_registries::{DeviceIdentifier, Registries};
use casita_service_registry::ServiceRegistry;
use casita_state_store::StateStore;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::cover::{self, CoverPlatform};
use entity::ReverseCover;

/// The integration domain
pub const DOMAIN: &str = "reverse_cover";

/// Config entry data field holding the source entity id
pub const CONF_SOURCE_ENTITY_ID: &str = "source_entity_id";

/// Invert a cover state value
///
/// Values outside the four directional states pass through unchanged.
pub fn invert_state(state: &str) -> &str {
    match state {
        STATE_OPEN => STATE_CLOSED,
        STATE_CLOSED => STATE_OPEN,
        STATE_OPENING => STATE_CLOSING,
        STATE_CLOSING => STATE_OPENING,
        other => other,
    }
}

/// Reflect a position across the 0..=100 range
pub fn invert_position(position: u8) -> u8 {
    100u8.saturating_sub(position)
}

/// Unique id of the proxy entity for a source
pub fn proxy_unique_id(source_entity_id: &str) -> String {
    format!("reverse_{}", source_entity_id)
}

/// Display name of the proxy for a source
pub fn proxy_name(source_entity_id: &str) -> String {
    format!("Reverse {}", source_entity_id)
}

/// The reverse_cover entry handler
///
/// Per loaded entry it creates registry and device entries, publishes
/// the proxy on the cover platform, and runs one task that re-derives
/// the proxy state whenever the source changes.
pub struct ReverseCoverIntegration {
    bus: Arc<EventBus>,
    states: Arc<StateStore>,
    services: Arc<ServiceRegistry>,
    registries: Arc<Registries>,
    platform: Arc<CoverPlatform>,

    /// Subscription tasks keyed by entry_id
    tasks: DashMap<String, JoinHandle<()>>,
}

impl ReverseCoverIntegration {
    /// Create the integration over the hub's shared pieces
    pub fn new(
        bus: Arc<EventBus>,
        states: Arc<StateStore>,
        services: Arc<ServiceRegistry>,
        registries: Arc<Registries>,
        platform: Arc<CoverPlatform>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            states,
            services,
            registries,
            platform,
            tasks: DashMap::new(),
        })
    }

    fn source_of(entry: &ConfigEntry) -> Result<String, String> {
        entry
            .get::<String>(CONF_SOURCE_ENTITY_ID)
            .ok_or_else(|| format!("config entry {} has no {}", entry.entry_id, CONF_SOURCE_ENTITY_ID))
    }

    /// Spawn the task that mirrors source changes onto the proxy
    fn spawn_subscription(&self, entry_id: &str, source: String, proxy_entity_id: String) {
        let mut rx = self.bus.subscribe_typed::<StateChangedData>();
        let platform = self.platform.clone();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if event.data.entity_id.to_string() != source {
                            continue;
                        }
                        // Skip our own writes, they would echo forever
                        if event.data.entity_id.to_string() == proxy_entity_id {
                            continue;
                        }
                        debug!(
                            source = %source,
                            proxy = %proxy_entity_id,
                            "Source changed, republishing proxy state"
                        );
                        platform.update_entity(&proxy_entity_id, event.context.child());
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        // State is re-derived in full, a missed event
                        // only delays the next refresh
                        warn!(missed = missed, proxy = %proxy_entity_id, "Subscription lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.tasks.insert(entry_id.to_string(), handle);
    }
}

#[async_trait]
impl EntryHandler for ReverseCoverIntegration {
    #[instrument(skip(self, entry), fields(entry_id = %entry.entry_id))]
    async fn setup(&self, entry: &ConfigEntry) -> Result<(), String> {
        let source = Self::source_of(entry)?;
        let source_id: EntityId = source.parse().map_err(|e| format!("{}", e))?;

        let unique_id = proxy_unique_id(&source);
        let name = proxy_name(&source);

        let device = self.registries.devices.get_or_create(
            &[DeviceIdentifier::new(DOMAIN, &source)],
            Some(&entry.entry_id),
            Some(&name),
        );

        let registered = self.registries.entities.get_or_create(
            cover::DOMAIN,
            DOMAIN,
            &unique_id,
            &format!("reverse_{}", source_id.object_id()),
            Some(&entry.entry_id),
            Some(&device.id),
        );
        self.registries
            .entities
            .update(&registered.entity_id, |e| {
                e.name = Some(name.clone());
                e.supported_features = cover::SUPPORT_OPEN
                    | cover::SUPPORT_CLOSE
                    | cover::SUPPORT_SET_POSITION
                    | cover::SUPPORT_STOP;
            })
            .map_err(|e| e.to_string())?;
        self.registries.save_all().await.map_err(|e| e.to_string())?;

        let proxy_entity_id: EntityId = registered
            .entity_id
            .parse()
            .map_err(|e| format!("{}", e))?;

        let proxy = ReverseCover::new(
            proxy_entity_id.clone(),
            unique_id,
            name,
            source.clone(),
            self.states.clone(),
            self.services.clone(),
        );

        // First publish happens before any source event arrives
        self.platform.add_entity(proxy, Context::new());
        self.spawn_subscription(&entry.entry_id, source.clone(), proxy_entity_id.to_string());

        info!(source = %source, proxy = %proxy_entity_id, "Reverse cover ready");
        Ok(())
    }

    #[instrument(skip(self, entry), fields(entry_id = %entry.entry_id))]
    async fn unload(&self, entry: &ConfigEntry) -> Result<(), String> {
        if let Some((_, handle)) = self.tasks.remove(&entry.entry_id) {
            handle.abort();
        }

        for registered in self
            .registries
            .entities
            .get_by_config_entry_id(&entry.entry_id)
        {
            // Registry entries survive an unload, only the live state goes
            self.platform
                .remove_entity(&registered.entity_id, Context::new());
        }

        info!("Reverse cover unloaded");
        Ok(())
    }

    async fn remove(&self, entry: &ConfigEntry) -> Result<(), String> {
        let entities = self.registries.entities.clear_config_entry(&entry.entry_id);
        let devices = self.registries.devices.clear_config_entry(&entry.entry_id);
        self.registries.save_all().await.map_err(|e| e.to_string())?;

        info!(
            entry_id = %entry.entry_id,
            entities = entities.len(),
            devices = devices.len(),
            "Cleared registries for removed entry"
        );
        Ok(())
    }
}

/// Wire the integration into the hub
///
/// Registers the entry handler on the config entries manager and the
/// config flow factory on the flow manager.
pub fn register(
    integration: Arc<ReverseCoverIntegration>,
    entries: &casita_config_entries::ConfigEntries,
    flows: &casita_config_entries::FlowManager,
) {
    let states = integration.states.clone();
    entries.register_handler(DOMAIN, integration);

    let factory: casita_config_entries::FlowFactory = Arc::new(move || {
        let flow: Arc<dyn casita_config_entries::ConfigFlow> =
            flow::ReverseCoverFlow::new(states.clone());
        flow
    });
    flows.register_flow(DOMAIN, factory);
}
