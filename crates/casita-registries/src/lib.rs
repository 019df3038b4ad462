//! Persistent registries for casita
//!
//! Tracks registered entities and devices with JSON persistence in the
//! `.storage/` directory. Registry entries give integration entities
//! stable ids across restarts; the state store holds only live state.

pub mod device_registry;
pub mod entity_registry;
pub mod storage;

pub use device_registry::{DeviceEntry, DeviceIdentifier, DeviceRegistry, DeviceRegistryData};
pub use entity_registry::{EntityEntry, EntityRegistry, EntityRegistryData, EntityRegistryError};
pub use storage::{Storable, Storage, StorageError, StorageFile, StorageResult};

use std::sync::Arc;

/// Entity and device registries bundled over one storage backend
pub struct Registries {
    pub storage: Arc<Storage>,
    pub entities: EntityRegistry,
    pub devices: DeviceRegistry,
}

impl Registries {
    /// Create registries rooted at the given config directory
    pub fn new(config_dir: impl AsRef<std::path::Path>) -> Self {
        let storage = Arc::new(Storage::new(config_dir));

        Self {
            entities: EntityRegistry::new(storage.clone()),
            devices: DeviceRegistry::new(storage.clone()),
            storage,
        }
    }

    /// Load all registries from storage
    pub async fn load_all(&self) -> StorageResult<()> {
        self.entities.load().await?;
        self.devices.load().await?;
        Ok(())
    }

    /// Save all registries to storage
    pub async fn save_all(&self) -> StorageResult<()> {
        self.entities.save().await?;
        self.devices.save().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_registries_bundle_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let registries = Registries::new(temp_dir.path());

        let device = registries.devices.get_or_create(
            &[DeviceIdentifier::new("reverse_cover", "cover.garage_door")],
            Some("entry1"),
            Some("Reverse cover.garage_door"),
        );

        registries.entities.get_or_create(
            "cover",
            "reverse_cover",
            "reverse_cover.garage_door",
            "reverse_garage_door",
            Some("entry1"),
            Some(&device.id),
        );

        registries.save_all().await.unwrap();

        let reloaded = Registries::new(temp_dir.path());
        reloaded.load_all().await.unwrap();

        assert_eq!(reloaded.entities.len(), 1);
        assert_eq!(reloaded.devices.len(), 1);

        let entity = reloaded.entities.get("cover.reverse_garage_door").unwrap();
        assert_eq!(entity.device_id.as_deref(), Some(device.id.as_str()));
    }
}
