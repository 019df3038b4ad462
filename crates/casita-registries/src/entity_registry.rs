//! Entity registry
//!
//! Tracks registered entities with unique_id indexing, device linking,
//! and `.storage/` persistence. This is where an integration's entities
//! get their stable entity_id: registration by (platform, unique_id)
//! always returns the same entry, and entity_id collisions between
//! different unique_ids are resolved with a numeric suffix.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::storage::{Storable, Storage, StorageFile, StorageResult};

/// Errors that can occur in the entity registry
#[derive(Debug, Error, Clone)]
pub enum EntityRegistryError {
    #[error("Entity not found: {0}")]
    NotFound(String),
}

/// Storage key for the entity registry
pub const STORAGE_KEY: &str = "core.entity_registry";
/// Current storage version
pub const STORAGE_VERSION: u32 = 1;
/// Current minor version
pub const STORAGE_MINOR_VERSION: u32 = 2;

/// A registered entity entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityEntry {
    /// Internal registry id
    pub id: String,
    /// Full entity ID (domain.object_id)
    pub entity_id: String,
    /// Platform-scoped unique identifier
    pub unique_id: String,
    /// Platform that provides this entity
    pub platform: String,

    /// Parent device ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Config entry that created this entity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_entry_id: Option<String>,

    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Bitmask of supported features
    #[serde(default)]
    pub supported_features: u32,

    /// Creation timestamp
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Last modified timestamp
    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

impl EntityEntry {
    /// Create a new entry with the minimal required fields
    pub fn new(
        entity_id: impl Into<String>,
        platform: impl Into<String>,
        unique_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ulid::Ulid::new().to_string().to_lowercase(),
            entity_id: entity_id.into(),
            unique_id: unique_id.into(),
            platform: platform.into(),
            device_id: None,
            config_entry_id: None,
            name: None,
            supported_features: 0,
            created_at: now,
            modified_at: now,
        }
    }

    /// The domain part of the entity_id
    pub fn domain(&self) -> &str {
        self.entity_id.split('.').next().unwrap_or(&self.entity_id)
    }

    /// The object_id part of the entity_id
    pub fn object_id(&self) -> &str {
        self.entity_id.split('.').nth(1).unwrap_or(&self.entity_id)
    }
}

/// Entity registry data for storage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityRegistryData {
    pub entities: Vec<EntityEntry>,
}

impl Storable for EntityRegistryData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

/// Entity registry with multi-index lookups
///
/// Entries are stored as `Arc<EntityEntry>` so reads never clone the
/// entry itself. The primary index preserves insertion order, which
/// keeps the persisted file stable across save/load cycles.
pub struct EntityRegistry {
    storage: Arc<Storage>,

    /// Primary index: entity_id -> entry, in insertion order
    by_entity_id: RwLock<IndexMap<String, Arc<EntityEntry>>>,

    /// Index: "platform:unique_id" -> entity_id
    by_unique_id: DashMap<String, String>,

    /// Index: config_entry_id -> set of entity_ids
    by_config_entry_id: DashMap<String, HashSet<String>>,

    /// Index: platform -> set of entity_ids
    by_platform: DashMap<String, HashSet<String>>,
}

fn unique_id_key(platform: &str, unique_id: &str) -> String {
    format!("{}:{}", platform, unique_id)
}

impl EntityRegistry {
    /// Create a new entity registry
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            by_entity_id: RwLock::new(IndexMap::new()),
            by_unique_id: DashMap::new(),
            by_config_entry_id: DashMap::new(),
            by_platform: DashMap::new(),
        }
    }

    /// Load entries from storage
    pub async fn load(&self) -> StorageResult<()> {
        if let Some(storage_file) = self.storage.load::<EntityRegistryData>(STORAGE_KEY).await? {
            storage_file.require_version(STORAGE_VERSION)?;
            info!(
                "Loading {} entities from storage (v{}.{})",
                storage_file.data.entities.len(),
                storage_file.version,
                storage_file.minor_version
            );

            for entry in storage_file.data.entities {
                self.index_entry(Arc::new(entry));
            }
        }
        Ok(())
    }

    /// Save entries to storage
    pub async fn save(&self) -> StorageResult<()> {
        let entities: Vec<EntityEntry> = self
            .by_entity_id
            .read()
            .map(|e| e.values().map(|v| (**v).clone()).collect())
            .unwrap_or_default();

        let count = entities.len();
        let data = EntityRegistryData { entities };
        self.storage
            .save(&StorageFile::new(
                STORAGE_KEY,
                data,
                STORAGE_VERSION,
                STORAGE_MINOR_VERSION,
            ))
            .await?;

        debug!("Saved {} entities to storage", count);
        Ok(())
    }

    fn index_entry(&self, entry: Arc<EntityEntry>) {
        let entity_id = entry.entity_id.clone();

        self.by_unique_id.insert(
            unique_id_key(&entry.platform, &entry.unique_id),
            entity_id.clone(),
        );

        if let Some(ref config_entry_id) = entry.config_entry_id {
            self.by_config_entry_id
                .entry(config_entry_id.clone())
                .or_default()
                .insert(entity_id.clone());
        }

        self.by_platform
            .entry(entry.platform.clone())
            .or_default()
            .insert(entity_id.clone());

        if let Ok(mut idx) = self.by_entity_id.write() {
            idx.insert(entity_id, entry);
        }
    }

    fn unindex_entry(&self, entry: &EntityEntry) {
        let entity_id = &entry.entity_id;

        self.by_unique_id
            .remove(&unique_id_key(&entry.platform, &entry.unique_id));

        if let Some(ref config_entry_id) = entry.config_entry_id {
            if let Some(mut ids) = self.by_config_entry_id.get_mut(config_entry_id) {
                ids.remove(entity_id);
            }
        }

        if let Some(mut ids) = self.by_platform.get_mut(&entry.platform) {
            ids.remove(entity_id);
        }
    }

    /// Get an entry by entity_id
    pub fn get(&self, entity_id: &str) -> Option<Arc<EntityEntry>> {
        self.by_entity_id
            .read()
            .ok()
            .and_then(|idx| idx.get(entity_id).cloned())
    }

    /// Get an entry by its platform-scoped unique_id
    pub fn get_by_unique_id(&self, platform: &str, unique_id: &str) -> Option<Arc<EntityEntry>> {
        self.by_unique_id
            .get(&unique_id_key(platform, unique_id))
            .and_then(|entity_id| self.get(&entity_id))
    }

    /// All entries created by a config entry
    pub fn get_by_config_entry_id(&self, config_entry_id: &str) -> Vec<Arc<EntityEntry>> {
        self.by_config_entry_id
            .get(config_entry_id)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    /// All entries provided by a platform
    pub fn get_by_platform(&self, platform: &str) -> Vec<Arc<EntityEntry>> {
        self.by_platform
            .get(platform)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    /// Get or create an entry for a (platform, unique_id) pair
    ///
    /// Re-registering the same pair returns the existing entry with its
    /// entity_id untouched. A new pair gets an entity_id derived from
    /// the suggested object_id, suffixed when that id is already taken.
    pub fn get_or_create(
        &self,
        domain: &str,
        platform: &str,
        unique_id: &str,
        suggested_object_id: &str,
        config_entry_id: Option<&str>,
        device_id: Option<&str>,
    ) -> Arc<EntityEntry> {
        if let Some(existing) = self.get_by_unique_id(platform, unique_id) {
            debug!(
                "Found existing entity by unique_id: {}",
                existing.entity_id
            );
            return existing;
        }

        let entity_id = self.generate_entity_id(domain, suggested_object_id);

        let mut entry = EntityEntry::new(entity_id.clone(), platform, unique_id);
        entry.config_entry_id = config_entry_id.map(String::from);
        entry.device_id = device_id.map(String::from);

        let arc_entry = Arc::new(entry);
        self.index_entry(Arc::clone(&arc_entry));

        info!("Registered new entity: {}", entity_id);
        arc_entry
    }

    /// Generate an entity_id that doesn't collide with a registered one
    ///
    /// Returns `{domain}.{suggested_object_id}` when free, otherwise
    /// appends `_2`, `_3`, ... until an unused id is found.
    pub fn generate_entity_id(&self, domain: &str, suggested_object_id: &str) -> String {
        let preferred = format!("{}.{}", domain, suggested_object_id);
        if !self.is_registered(&preferred) {
            return preferred;
        }

        let mut tries = 1;
        loop {
            tries += 1;
            let candidate = format!("{}_{}", preferred, tries);
            if !self.is_registered(&candidate) {
                return candidate;
            }
        }
    }

    /// Update an entry in place
    ///
    /// The closure gets a mutable copy; the modified entry replaces the
    /// stored one and all indexes are refreshed. `modified_at` is bumped
    /// automatically.
    pub fn update<F>(&self, entity_id: &str, f: F) -> Result<Arc<EntityEntry>, EntityRegistryError>
    where
        F: FnOnce(&mut EntityEntry),
    {
        let arc_entry = self
            .by_entity_id
            .write()
            .ok()
            .and_then(|mut idx| idx.shift_remove(entity_id));

        match arc_entry {
            Some(arc_entry) => {
                let mut entry = (*arc_entry).clone();
                self.unindex_entry(&entry);

                f(&mut entry);
                entry.modified_at = Utc::now();

                let new_arc = Arc::new(entry);
                self.index_entry(Arc::clone(&new_arc));
                Ok(new_arc)
            }
            None => Err(EntityRegistryError::NotFound(entity_id.to_string())),
        }
    }

    /// Remove an entry
    pub fn remove(&self, entity_id: &str) -> Option<Arc<EntityEntry>> {
        let arc_entry = self
            .by_entity_id
            .write()
            .ok()
            .and_then(|mut idx| idx.shift_remove(entity_id));

        if let Some(arc_entry) = arc_entry {
            self.unindex_entry(&arc_entry);
            info!("Removed entity: {}", entity_id);
            Some(arc_entry)
        } else {
            None
        }
    }

    /// Remove every entry created by a config entry
    ///
    /// Returns the entity_ids that were removed.
    pub fn clear_config_entry(&self, config_entry_id: &str) -> Vec<String> {
        let entity_ids: Vec<String> = self
            .get_by_config_entry_id(config_entry_id)
            .iter()
            .map(|e| e.entity_id.clone())
            .collect();

        for entity_id in &entity_ids {
            self.remove(entity_id);
        }

        if !entity_ids.is_empty() {
            debug!(
                config_entry_id = %config_entry_id,
                count = entity_ids.len(),
                "Cleared config entry entities"
            );
        }

        entity_ids
    }

    /// All registered entity_ids, in insertion order
    pub fn entity_ids(&self) -> Vec<String> {
        self.by_entity_id
            .read()
            .map(|idx| idx.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of registered entities
    pub fn len(&self) -> usize {
        self.by_entity_id.read().map(|idx| idx.len()).unwrap_or(0)
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check whether an entity_id is registered
    pub fn is_registered(&self, entity_id: &str) -> bool {
        self.by_entity_id
            .read()
            .map(|idx| idx.contains_key(entity_id))
            .unwrap_or(false)
    }

    /// All entries, in insertion order
    pub fn iter(&self) -> Vec<Arc<EntityEntry>> {
        self.by_entity_id
            .read()
            .map(|idx| idx.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry() -> (TempDir, EntityRegistry) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(temp_dir.path()));
        (temp_dir, EntityRegistry::new(storage))
    }

    #[tokio::test]
    async fn test_get_or_create_registers_new_entity() {
        let (_dir, registry) = registry();

        let entry = registry.get_or_create(
            "cover",
            "reverse_cover",
            "reverse_cover.garage_door",
            "reverse_garage_door",
            Some("entry1"),
            None,
        );

        assert_eq!(entry.entity_id, "cover.reverse_garage_door");
        assert_eq!(entry.platform, "reverse_cover");
        assert!(registry.is_registered("cover.reverse_garage_door"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_same_unique_id_returns_existing() {
        let (_dir, registry) = registry();

        let first = registry.get_or_create("cover", "reverse_cover", "uid1", "blind", None, None);
        let second = registry.get_or_create(
            "cover",
            "reverse_cover",
            "uid1",
            "different_suggestion",
            None,
            None,
        );

        assert_eq!(first.entity_id, second.entity_id);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_entity_id_collision_gets_suffix() {
        let (_dir, registry) = registry();

        let first = registry.get_or_create("cover", "reverse_cover", "uid1", "blind", None, None);
        let second = registry.get_or_create("cover", "reverse_cover", "uid2", "blind", None, None);
        let third = registry.get_or_create("cover", "reverse_cover", "uid3", "blind", None, None);

        assert_eq!(first.entity_id, "cover.blind");
        assert_eq!(second.entity_id, "cover.blind_2");
        assert_eq!(third.entity_id, "cover.blind_3");
    }

    #[tokio::test]
    async fn test_update_reindexes_unique_id() {
        let (_dir, registry) = registry();

        registry.get_or_create("cover", "reverse_cover", "old_uid", "blind", None, None);
        let updated = registry
            .update("cover.blind", |e| {
                e.unique_id = "new_uid".to_string();
                e.supported_features = 15;
            })
            .unwrap();

        assert_eq!(updated.supported_features, 15);
        assert!(registry.get_by_unique_id("reverse_cover", "old_uid").is_none());
        assert!(registry.get_by_unique_id("reverse_cover", "new_uid").is_some());
    }

    #[tokio::test]
    async fn test_update_missing_entity_errors() {
        let (_dir, registry) = registry();
        let result = registry.update("cover.ghost", |_| {});
        assert!(matches!(result, Err(EntityRegistryError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_clear_config_entry() {
        let (_dir, registry) = registry();

        registry.get_or_create("cover", "reverse_cover", "uid1", "one", Some("entry1"), None);
        registry.get_or_create("cover", "reverse_cover", "uid2", "two", Some("entry1"), None);
        registry.get_or_create("cover", "reverse_cover", "uid3", "three", Some("entry2"), None);

        let mut removed = registry.clear_config_entry("entry1");
        removed.sort();
        assert_eq!(removed, vec!["cover.one", "cover.two"]);
        assert_eq!(registry.len(), 1);
        assert!(registry.is_registered("cover.three"));
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(temp_dir.path()));

        let registry = EntityRegistry::new(storage.clone());
        registry.get_or_create(
            "cover",
            "reverse_cover",
            "reverse_cover.garage_door",
            "reverse_garage_door",
            Some("entry1"),
            Some("device1"),
        );
        registry.save().await.unwrap();

        let reloaded = EntityRegistry::new(storage);
        reloaded.load().await.unwrap();

        assert_eq!(reloaded.len(), 1);
        let entry = reloaded.get("cover.reverse_garage_door").unwrap();
        assert_eq!(entry.unique_id, "reverse_cover.garage_door");
        assert_eq!(entry.device_id.as_deref(), Some("device1"));
        assert!(reloaded
            .get_by_unique_id("reverse_cover", "reverse_cover.garage_door")
            .is_some());
    }
}
