//! Config entries manager
//!
//! Owns every configured integration instance: persistence, duplicate
//! prevention, and driving each entry through its lifecycle by calling
//! the integration's registered EntryHandler.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use casita_registries::{Storable, Storage, StorageFile, StorageResult};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::entry::{ConfigEntry, ConfigEntryState};

/// Storage key for config entries
pub const STORAGE_KEY: &str = "core.config_entries";
/// Current storage version
pub const STORAGE_VERSION: u32 = 1;
/// Current minor version
pub const STORAGE_MINOR_VERSION: u32 = 1;

/// Config entries errors
#[derive(Debug, Error)]
pub enum ConfigEntriesError {
    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Entry already exists for domain {domain} with unique_id {unique_id}")]
    AlreadyExists { domain: String, unique_id: String },

    #[error("Cannot unload entry in state {0:?}")]
    CannotUnload(ConfigEntryState),

    #[error("Setup failed: {0}")]
    SetupFailed(String),

    #[error("Unload failed: {0}")]
    UnloadFailed(String),

    #[error("Storage error: {0}")]
    Storage(#[from] casita_registries::StorageError),
}

pub type ConfigEntriesResult<T> = Result<T, ConfigEntriesError>;

/// Lifecycle hooks an integration registers for its domain
///
/// `setup` wires the entry's runtime pieces (entities, subscriptions);
/// `unload` tears them down again. `remove` runs after unload when the
/// entry is deleted for good, for cleanup that outlives a plain unload
/// such as registry entries.
#[async_trait]
pub trait EntryHandler: Send + Sync {
    /// Set up a config entry
    async fn setup(&self, entry: &ConfigEntry) -> Result<(), String>;

    /// Unload a config entry
    async fn unload(&self, entry: &ConfigEntry) -> Result<(), String>;

    /// Clean up after an entry is permanently removed
    async fn remove(&self, _entry: &ConfigEntry) -> Result<(), String> {
        Ok(())
    }
}

/// Config entries data for storage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigEntriesData {
    pub entries: Vec<ConfigEntry>,
}

impl Storable for ConfigEntriesData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

/// Manager for config entry lifecycle
pub struct ConfigEntries {
    storage: Arc<Storage>,

    /// Primary index: entry_id -> ConfigEntry
    entries: DashMap<String, ConfigEntry>,

    /// Index: domain -> set of entry_ids
    by_domain: DashMap<String, HashSet<String>>,

    /// Index: (domain, unique_id) -> entry_id
    by_unique_id: DashMap<(String, String), String>,

    /// Serializes setup/unload so they never interleave
    setup_lock: Mutex<()>,

    /// Entry handlers by domain
    handlers: DashMap<String, Arc<dyn EntryHandler>>,
}

impl ConfigEntries {
    /// Create a new config entries manager
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            entries: DashMap::new(),
            by_domain: DashMap::new(),
            by_unique_id: DashMap::new(),
            setup_lock: Mutex::new(()),
            handlers: DashMap::new(),
        }
    }

    /// Load entries from storage
    pub async fn load(&self) -> StorageResult<()> {
        if let Some(storage_file) = self.storage.load::<ConfigEntriesData>(STORAGE_KEY).await? {
            info!(
                "Loading {} config entries from storage (v{}.{})",
                storage_file.data.entries.len(),
                storage_file.version,
                storage_file.minor_version
            );

            for entry in storage_file.data.entries {
                self.index_entry(&entry);
            }
        }
        Ok(())
    }

    /// Save entries to storage
    pub async fn save(&self) -> StorageResult<()> {
        let data = ConfigEntriesData {
            entries: self.entries.iter().map(|r| r.value().clone()).collect(),
        };

        self.storage
            .save(&StorageFile::new(
                STORAGE_KEY,
                data,
                STORAGE_VERSION,
                STORAGE_MINOR_VERSION,
            ))
            .await?;

        debug!("Saved {} config entries to storage", self.entries.len());
        Ok(())
    }

    fn index_entry(&self, entry: &ConfigEntry) {
        let entry_id = entry.entry_id.clone();

        self.entries.insert(entry_id.clone(), entry.clone());

        self.by_domain
            .entry(entry.domain.clone())
            .or_default()
            .insert(entry_id.clone());

        if let Some(ref unique_id) = entry.unique_id {
            self.by_unique_id
                .insert((entry.domain.clone(), unique_id.clone()), entry_id);
        }
    }

    fn unindex_entry(&self, entry: &ConfigEntry) {
        if let Some(mut ids) = self.by_domain.get_mut(&entry.domain) {
            ids.remove(&entry.entry_id);
        }

        if let Some(ref unique_id) = entry.unique_id {
            self.by_unique_id
                .remove(&(entry.domain.clone(), unique_id.clone()));
        }

        self.entries.remove(&entry.entry_id);
    }

    /// Get an entry by id
    pub fn get(&self, entry_id: &str) -> Option<ConfigEntry> {
        self.entries.get(entry_id).map(|r| r.value().clone())
    }

    /// All entries for a domain
    pub fn get_by_domain(&self, domain: &str) -> Vec<ConfigEntry> {
        self.by_domain
            .get(domain)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    /// Get an entry by its domain-scoped unique_id
    pub fn get_by_unique_id(&self, domain: &str, unique_id: &str) -> Option<ConfigEntry> {
        self.by_unique_id
            .get(&(domain.to_string(), unique_id.to_string()))
            .and_then(|entry_id| self.get(&entry_id))
    }

    /// Add a new config entry
    ///
    /// Rejects the entry when another one with the same
    /// (domain, unique_id) pair already exists.
    pub async fn add(&self, entry: ConfigEntry) -> ConfigEntriesResult<ConfigEntry> {
        if let Some(ref unique_id) = entry.unique_id {
            if self.get_by_unique_id(&entry.domain, unique_id).is_some() {
                return Err(ConfigEntriesError::AlreadyExists {
                    domain: entry.domain.clone(),
                    unique_id: unique_id.clone(),
                });
            }
        }

        self.index_entry(&entry);
        self.save().await?;

        info!(
            "Added config entry: {} ({}) [{}]",
            entry.title, entry.domain, entry.entry_id
        );

        Ok(entry)
    }

    /// Remove an entry for good
    ///
    /// Unloads first when loaded, then runs the handler's `remove` hook
    /// and drops the entry from storage. Returns the removed entry.
    pub async fn remove(&self, entry_id: &str) -> ConfigEntriesResult<ConfigEntry> {
        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        if entry.is_loaded() {
            self.unload(entry_id).await?;
        }

        let entry = self.get(entry_id).unwrap_or(entry);

        if let Some(handler) = self.handler_for(&entry.domain) {
            if let Err(reason) = handler.remove(&entry).await {
                warn!(
                    entry_id = %entry_id,
                    reason = %reason,
                    "Remove hook failed, dropping entry anyway"
                );
            }
        }

        self.unindex_entry(&entry);
        self.save().await?;

        info!(
            "Removed config entry: {} ({}) [{}]",
            entry.title, entry.domain, entry_id
        );

        Ok(entry)
    }

    /// Register the entry handler for a domain
    pub fn register_handler(&self, domain: &str, handler: Arc<dyn EntryHandler>) {
        debug!(domain = %domain, "Registered entry handler");
        self.handlers.insert(domain.to_string(), handler);
    }

    fn handler_for(&self, domain: &str) -> Option<Arc<dyn EntryHandler>> {
        self.handlers.get(domain).map(|h| h.value().clone())
    }

    fn set_state(&self, entry_id: &str, state: ConfigEntryState, reason: Option<String>) {
        if let Some(mut entry) = self.entries.get_mut(entry_id) {
            match entry.try_set_state(state, reason) {
                Ok(()) => debug!(entry_id = %entry_id, state = ?state, "Entry state changed"),
                Err(e) => warn!(entry_id = %entry_id, error = %e, "Rejected state change"),
            }
        }
    }

    /// Set up an entry by calling its domain's handler
    pub async fn setup(&self, entry_id: &str) -> ConfigEntriesResult<()> {
        let _lock = self.setup_lock.lock().await;

        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        self.set_state(entry_id, ConfigEntryState::SetupInProgress, None);

        match self.handler_for(&entry.domain) {
            Some(handler) => match handler.setup(&entry).await {
                Ok(()) => {
                    self.set_state(entry_id, ConfigEntryState::Loaded, None);
                    info!("Setup completed for entry: {} ({})", entry.title, entry_id);
                    Ok(())
                }
                Err(reason) => {
                    warn!("Setup failed for entry {}: {}", entry_id, reason);
                    self.set_state(entry_id, ConfigEntryState::SetupError, Some(reason.clone()));
                    Err(ConfigEntriesError::SetupFailed(reason))
                }
            },
            None => {
                // No integration claims the domain, nothing to wire up
                self.set_state(entry_id, ConfigEntryState::Loaded, None);
                debug!(
                    "No entry handler for domain {}, marking as loaded",
                    entry.domain
                );
                Ok(())
            }
        }
    }

    /// Unload an entry by calling its domain's handler
    pub async fn unload(&self, entry_id: &str) -> ConfigEntriesResult<()> {
        let _lock = self.setup_lock.lock().await;

        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        if !entry.supports_unload() {
            return Err(ConfigEntriesError::CannotUnload(entry.state));
        }

        if entry.state == ConfigEntryState::NotLoaded {
            debug!("Entry {} is not loaded, nothing to unload", entry_id);
            return Ok(());
        }

        self.set_state(entry_id, ConfigEntryState::UnloadInProgress, None);

        if let Some(handler) = self.handler_for(&entry.domain) {
            if let Err(reason) = handler.unload(&entry).await {
                warn!("Unload failed for entry {}: {}", entry_id, reason);
                self.set_state(
                    entry_id,
                    ConfigEntryState::FailedUnload,
                    Some(reason.clone()),
                );
                return Err(ConfigEntriesError::UnloadFailed(reason));
            }
        }

        self.set_state(entry_id, ConfigEntryState::NotLoaded, None);
        info!("Unloaded entry: {} ({})", entry.title, entry_id);
        Ok(())
    }

    /// Reload an entry (unload then setup)
    pub async fn reload(&self, entry_id: &str) -> ConfigEntriesResult<()> {
        self.unload(entry_id).await?;
        self.setup(entry_id).await
    }

    /// Set up every entry, returning one result per entry
    pub async fn setup_all(&self) -> Vec<(String, ConfigEntriesResult<()>)> {
        let entry_ids = self.entry_ids();
        let mut results = Vec::with_capacity(entry_ids.len());

        for entry_id in entry_ids {
            let result = self.setup(&entry_id).await;
            results.push((entry_id, result));
        }

        results
    }

    /// All entry ids
    pub fn entry_ids(&self) -> Vec<String> {
        self.entries.iter().map(|r| r.key().clone()).collect()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
