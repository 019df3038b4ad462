//! Demo covers
//!
//! In-memory covers configured from YAML. Transitions are instant: a
//! command lands the cover at its target position immediately, so there
//! is never anything for stop to interrupt.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use casita_core::{Context, EntityId};
use serde::Deserialize;
use tracing::info;

use crate::cover::{
    Cover, CoverCommand, CoverError, CoverPlatform, DOMAIN, SUPPORT_CLOSE, SUPPORT_OPEN,
    SUPPORT_SET_POSITION, SUPPORT_STOP,
};

/// Platform name demo covers register under
pub const PLATFORM: &str = "demo";

/// One demo cover from the server config
#[derive(Debug, Clone, Deserialize)]
pub struct DemoCoverConfig {
    /// Object id of the cover entity (the part after `cover.`)
    pub id: String,
    /// Display name
    pub name: String,
    /// Initial position, 0 closed to 100 open
    #[serde(default)]
    pub position: u8,
}

/// An in-memory cover holding only its position
pub struct DemoCover {
    entity_id: EntityId,
    name: String,
    position: AtomicU8,
}

impl DemoCover {
    /// Create a demo cover at an initial position
    pub fn new(entity_id: EntityId, name: impl Into<String>, position: u8) -> Arc<Self> {
        Arc::new(Self {
            entity_id,
            name: name.into(),
            position: AtomicU8::new(position.min(100)),
        })
    }
}

#[async_trait]
impl Cover for DemoCover {
    fn entity_id(&self) -> EntityId {
        self.entity_id.clone()
    }

    fn unique_id(&self) -> String {
        format!("demo_{}", self.entity_id.object_id())
    }

    fn name(&self) -> String {
        self.name.clone()
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
                self.position.store(position.min(100), Ordering::SeqCst)
            }
            // Instant transitions leave nothing in flight to stop
            CoverCommand::Stop => {}
        }
        Ok(())
    }
}

/// Create the configured demo covers on the platform
pub fn setup(
    platform: &CoverPlatform,
    configs: &[DemoCoverConfig],
    context: Context,
) -> Result<usize, CoverError> {
    for config in configs {
        let entity_id = EntityId::new(DOMAIN, &config.id)?;
        platform.add_entity(
            DemoCover::new(entity_id, &config.name, config.position),
            context.clone(),
        );
    }

    if !configs.is_empty() {
        info!("Loaded {} demo covers", configs.len());
    }
    Ok(configs.len())
}
