//! Device registry
//!
//! Tracks registered devices keyed by identifier tuples. A proxy
//! integration registers one device per config entry so its entities
//! group together in the device view; re-registration under the same
//! identifier merges config entry ids instead of creating a duplicate.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::storage::{Storable, Storage, StorageFile, StorageResult};

/// Storage key for the device registry
pub const STORAGE_KEY: &str = "core.device_registry";
/// Current storage version
pub const STORAGE_VERSION: u32 = 1;
/// Current minor version
pub const STORAGE_MINOR_VERSION: u32 = 1;

/// A device identifier (domain, id) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentifier(pub String, pub String);

impl DeviceIdentifier {
    pub fn new(domain: impl Into<String>, id: impl Into<String>) -> Self {
        Self(domain.into(), id.into())
    }

    pub fn domain(&self) -> &str {
        &self.0
    }

    pub fn id(&self) -> &str {
        &self.1
    }

    /// Key used for indexing
    pub fn key(&self) -> String {
        format!("{}:{}", self.0, self.1)
    }
}

/// A registered device entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// Internal registry id
    pub id: String,

    /// Identifier tuples claiming this device
    #[serde(default)]
    pub identifiers: Vec<DeviceIdentifier>,

    /// Config entries associated with this device
    #[serde(default)]
    pub config_entries: Vec<String>,

    /// Device name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Creation timestamp
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Last modified timestamp
    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

impl DeviceEntry {
    /// Create a new device entry
    pub fn new(name: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            identifiers: Vec::new(),
            config_entries: Vec::new(),
            name: name.map(String::from),
            created_at: now,
            modified_at: now,
        }
    }
}

/// Device registry data for storage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceRegistryData {
    pub devices: Vec<DeviceEntry>,
}

impl Storable for DeviceRegistryData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

/// Device registry with identifier and config-entry indexes
pub struct DeviceRegistry {
    storage: Arc<Storage>,

    /// Primary index: device_id -> entry
    by_id: DashMap<String, Arc<DeviceEntry>>,

    /// Index: identifier key -> device_id
    by_identifier: DashMap<String, String>,

    /// Index: config_entry_id -> set of device_ids
    by_config_entry_id: DashMap<String, HashSet<String>>,
}

impl DeviceRegistry {
    /// Create a new device registry
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            by_id: DashMap::new(),
            by_identifier: DashMap::new(),
            by_config_entry_id: DashMap::new(),
        }
    }

    /// Load entries from storage
    pub async fn load(&self) -> StorageResult<()> {
        if let Some(storage_file) = self.storage.load::<DeviceRegistryData>(STORAGE_KEY).await? {
            storage_file.require_version(STORAGE_VERSION)?;
            info!(
                "Loading {} devices from storage (v{}.{})",
                storage_file.data.devices.len(),
                storage_file.version,
                storage_file.minor_version
            );

            for entry in storage_file.data.devices {
                self.index_entry(Arc::new(entry));
            }
        }
        Ok(())
    }

    /// Save entries to storage
    pub async fn save(&self) -> StorageResult<()> {
        let devices: Vec<DeviceEntry> = self.by_id.iter().map(|r| (**r.value()).clone()).collect();
        let count = devices.len();

        self.storage
            .save(&StorageFile::new(
                STORAGE_KEY,
                DeviceRegistryData { devices },
                STORAGE_VERSION,
                STORAGE_MINOR_VERSION,
            ))
            .await?;

        debug!("Saved {} devices to storage", count);
        Ok(())
    }

    fn index_entry(&self, entry: Arc<DeviceEntry>) {
        let device_id = entry.id.clone();

        for identifier in &entry.identifiers {
            self.by_identifier.insert(identifier.key(), device_id.clone());
        }

        for config_entry_id in &entry.config_entries {
            self.by_config_entry_id
                .entry(config_entry_id.clone())
                .or_default()
                .insert(device_id.clone());
        }

        self.by_id.insert(device_id, entry);
    }

    fn unindex_entry(&self, entry: &DeviceEntry) {
        for identifier in &entry.identifiers {
            self.by_identifier.remove(&identifier.key());
        }

        for config_entry_id in &entry.config_entries {
            if let Some(mut ids) = self.by_config_entry_id.get_mut(config_entry_id) {
                ids.remove(&entry.id);
            }
        }

        self.by_id.remove(&entry.id);
    }

    /// Get a device by id
    pub fn get(&self, device_id: &str) -> Option<Arc<DeviceEntry>> {
        self.by_id.get(device_id).map(|r| Arc::clone(r.value()))
    }

    /// Get a device by one of its identifiers
    pub fn get_by_identifier(&self, domain: &str, id: &str) -> Option<Arc<DeviceEntry>> {
        let key = format!("{}:{}", domain, id);
        self.by_identifier
            .get(&key)
            .and_then(|device_id| self.get(&device_id))
    }

    /// All devices associated with a config entry
    pub fn get_by_config_entry_id(&self, config_entry_id: &str) -> Vec<Arc<DeviceEntry>> {
        self.by_config_entry_id
            .get(config_entry_id)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    /// Get or create a device for a set of identifiers
    ///
    /// An existing device claiming any of the identifiers is reused; the
    /// config entry id is merged into it if new. Otherwise a fresh
    /// device is created.
    pub fn get_or_create(
        &self,
        identifiers: &[DeviceIdentifier],
        config_entry_id: Option<&str>,
        name: Option<&str>,
    ) -> Arc<DeviceEntry> {
        for identifier in identifiers {
            if let Some(existing) = self.get_by_identifier(identifier.domain(), identifier.id()) {
                debug!("Found existing device by identifier: {}", existing.id);

                let needs_entry = config_entry_id
                    .map(|ce| !existing.config_entries.contains(&ce.to_string()))
                    .unwrap_or(false);
                if needs_entry {
                    let ce = config_entry_id.map(String::from);
                    if let Some(updated) = self.update(&existing.id, |e| {
                        if let Some(ce) = ce {
                            e.config_entries.push(ce);
                        }
                    }) {
                        return updated;
                    }
                }
                return existing;
            }
        }

        let mut entry = DeviceEntry::new(name);
        entry.identifiers = identifiers.to_vec();
        if let Some(ce) = config_entry_id {
            entry.config_entries.push(ce.to_string());
        }

        let arc_entry = Arc::new(entry);
        self.index_entry(Arc::clone(&arc_entry));

        info!("Registered new device: {:?} ({})", name, arc_entry.id);
        arc_entry
    }

    /// Update a device in place, bumping `modified_at`
    pub fn update<F>(&self, device_id: &str, f: F) -> Option<Arc<DeviceEntry>>
    where
        F: FnOnce(&mut DeviceEntry),
    {
        let (_, arc_entry) = self.by_id.remove(device_id)?;
        let mut entry = (*arc_entry).clone();
        self.unindex_entry(&entry);

        f(&mut entry);
        entry.modified_at = Utc::now();

        let new_arc = Arc::new(entry);
        self.index_entry(Arc::clone(&new_arc));
        Some(new_arc)
    }

    /// Remove a device
    pub fn remove(&self, device_id: &str) -> Option<Arc<DeviceEntry>> {
        let entry = self.get(device_id)?;
        self.unindex_entry(&entry);
        info!("Removed device: {}", device_id);
        Some(entry)
    }

    /// Detach a config entry from every device referencing it
    ///
    /// Devices whose last config entry vanishes are removed entirely.
    /// Returns the ids of removed devices.
    pub fn clear_config_entry(&self, config_entry_id: &str) -> Vec<String> {
        let device_ids: Vec<String> = self
            .get_by_config_entry_id(config_entry_id)
            .iter()
            .map(|d| d.id.clone())
            .collect();

        let mut removed = Vec::new();
        for device_id in device_ids {
            let last_entry = self
                .get(&device_id)
                .map(|d| d.config_entries.len() <= 1)
                .unwrap_or(false);

            if last_entry {
                self.remove(&device_id);
                removed.push(device_id);
            } else {
                let ce = config_entry_id.to_string();
                self.update(&device_id, |entry| {
                    entry.config_entries.retain(|id| id != &ce);
                });
            }
        }

        removed
    }

    /// Number of registered devices
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry() -> (TempDir, DeviceRegistry) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(temp_dir.path()));
        (temp_dir, DeviceRegistry::new(storage))
    }

    fn ident(id: &str) -> DeviceIdentifier {
        DeviceIdentifier::new("reverse_cover", id)
    }

    #[tokio::test]
    async fn test_get_or_create_new_device() {
        let (_dir, registry) = registry();

        let device = registry.get_or_create(
            &[ident("cover.garage_door")],
            Some("entry1"),
            Some("Reverse cover.garage_door"),
        );

        assert_eq!(device.name.as_deref(), Some("Reverse cover.garage_door"));
        assert_eq!(device.config_entries, vec!["entry1"]);
        assert_eq!(registry.len(), 1);
        assert!(registry
            .get_by_identifier("reverse_cover", "cover.garage_door")
            .is_some());
    }

    #[tokio::test]
    async fn test_same_identifier_merges_config_entries() {
        let (_dir, registry) = registry();

        let first = registry.get_or_create(&[ident("cover.blind")], Some("entry1"), Some("Blind"));
        let second = registry.get_or_create(&[ident("cover.blind")], Some("entry2"), Some("Blind"));

        assert_eq!(first.id, second.id);
        assert_eq!(registry.len(), 1);
        assert_eq!(second.config_entries, vec!["entry1", "entry2"]);
    }

    #[tokio::test]
    async fn test_reregistration_is_idempotent() {
        let (_dir, registry) = registry();

        let first = registry.get_or_create(&[ident("cover.blind")], Some("entry1"), Some("Blind"));
        let second = registry.get_or_create(&[ident("cover.blind")], Some("entry1"), Some("Blind"));

        assert_eq!(first.id, second.id);
        assert_eq!(second.config_entries, vec!["entry1"]);
    }

    #[tokio::test]
    async fn test_clear_config_entry_removes_orphaned_device() {
        let (_dir, registry) = registry();

        let device = registry.get_or_create(&[ident("cover.blind")], Some("entry1"), None);
        let shared = registry.get_or_create(&[ident("cover.shared")], Some("entry1"), None);
        registry.get_or_create(&[ident("cover.shared")], Some("entry2"), None);

        let removed = registry.clear_config_entry("entry1");
        assert_eq!(removed, vec![device.id.clone()]);

        // The shared device survives with the other config entry
        let surviving = registry.get(&shared.id).unwrap();
        assert_eq!(surviving.config_entries, vec!["entry2"]);
        assert!(registry
            .get_by_identifier("reverse_cover", "cover.blind")
            .is_none());
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(temp_dir.path()));

        let registry = DeviceRegistry::new(storage.clone());
        registry.get_or_create(&[ident("cover.garage_door")], Some("entry1"), Some("Garage"));
        registry.save().await.unwrap();

        let reloaded = DeviceRegistry::new(storage);
        reloaded.load().await.unwrap();

        assert_eq!(reloaded.len(), 1);
        let device = reloaded
            .get_by_identifier("reverse_cover", "cover.garage_door")
            .unwrap();
        assert_eq!(device.name.as_deref(), Some("Garage"));
        assert_eq!(device.config_entries, vec!["entry1"]);
    }
}
