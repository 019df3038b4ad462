//! Casita demo server
//!
//! Builds the hub, loads demo covers from YAML, wires up the
//! reverse_cover integration, restores persisted config entries, and
//! serves until ctrl-c.

mod config;

use std::sync::Arc;

use anyhow::Context as _;
use casita_components::cover::CoverPlatform;
use casita_components::reverse_cover::{self, ReverseCoverIntegration};
use casita_components::demo;
use casita_config_entries::{ConfigEntries, FlowManager, FlowResult};
use casita_core::Context;
use casita_event_bus::EventBus;
use casita_registries::Registries;
use casita_service_registry::ServiceRegistry;
use casita_state_store::StateStore;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::ServerConfig;

/// The central casita instance
pub struct Casita {
    pub bus: Arc<EventBus>,
    pub states: Arc<StateStore>,
    pub services: Arc<ServiceRegistry>,
    pub registries: Arc<Registries>,
    pub entries: Arc<ConfigEntries>,
    pub flows: FlowManager,
    pub platform: Arc<CoverPlatform>,
}

impl Casita {
    /// Build the hub and restore persisted registries and entries
    pub async fn new(config: &ServerConfig) -> anyhow::Result<Self> {
        let bus = Arc::new(EventBus::new());
        let states = Arc::new(StateStore::new(bus.clone()));
        let services = Arc::new(ServiceRegistry::new(bus.clone()));

        let registries = Arc::new(Registries::new(&config.config_dir));
        registries
            .load_all()
            .await
            .context("loading registries from storage")?;

        let entries = Arc::new(ConfigEntries::new(registries.storage.clone()));
        entries
            .load()
            .await
            .context("loading config entries from storage")?;

        let flows = FlowManager::new(entries.clone());

        let platform = CoverPlatform::new(states.clone());
        platform
            .register_services(&services)
            .context("registering cover services")?;

        let integration = ReverseCoverIntegration::new(
            bus.clone(),
            states.clone(),
            services.clone(),
            registries.clone(),
            platform.clone(),
        );
        reverse_cover::register(integration, &entries, &flows);

        Ok(Self {
            bus,
            states,
            services,
            registries,
            entries,
            flows,
            platform,
        })
    }

    /// Run the reverse cover flow for each configured source
    async fn configure_reverse_covers(&self, sources: &[String]) {
        for source in sources {
            let result = match self.flows.start(reverse_cover::DOMAIN).await {
                Ok(FlowResult::Form { flow_id, .. }) => {
                    self.flows
                        .progress(
                            &flow_id,
                            serde_json::json!({
                                reverse_cover::CONF_SOURCE_ENTITY_ID: source
                            }),
                        )
                        .await
                }
                Ok(other) => Ok(other),
                Err(e) => Err(e),
            };

            match result {
                Ok(FlowResult::CreateEntry { entry_id, .. }) => {
                    info!(source = %source, entry_id = %entry_id, "Configured reverse cover")
                }
                Ok(FlowResult::Abort { reason, .. }) => {
                    info!(source = %source, reason = %reason, "Reverse cover flow aborted")
                }
                Ok(FlowResult::Form { errors, .. }) => {
                    warn!(source = %source, errors = ?errors, "Reverse cover flow rejected input")
                }
                Err(e) => warn!(source = %source, error = %e, "Reverse cover flow failed"),
            }
        }
    }

    /// Unload every loaded entry and persist the registries
    async fn shutdown(&self) {
        for entry_id in self.entries.entry_ids() {
            if let Err(e) = self.entries.unload(&entry_id).await {
                warn!(entry_id = %entry_id, error = %e, "Unload failed during shutdown");
            }
        }

        if let Err(e) = self.registries.save_all().await {
            warn!(error = %e, "Saving registries failed during shutdown");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "casita.yaml".to_string());

    let config = match ServerConfig::load(&config_path) {
        Ok(config) => config,
        Err(config::ServerConfigError::Read { path, .. }) => {
            warn!(path = %path.display(), "No config file, starting with defaults");
            ServerConfig::default()
        }
        Err(e) => return Err(e).context("loading server config"),
    };

    info!("Starting casita");
    let casita = Casita::new(&config).await?;

    let demo_count = demo::setup(&casita.platform, &config.demo_covers, Context::new())
        .context("setting up demo covers")?;

    for (entry_id, result) in casita.entries.setup_all().await {
        if let Err(e) = result {
            warn!(entry_id = %entry_id, error = %e, "Entry setup failed");
        }
    }

    casita.configure_reverse_covers(&config.reverse_covers).await;

    info!(
        demo_covers = demo_count,
        entries = casita.entries.len(),
        entities = casita.states.entity_count(),
        "Casita is running"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    casita.shutdown().await;

    Ok(())
}
