//! Config entry types
//!
//! A ConfigEntry is one configured instance of an integration: the
//! record a config flow creates, persisted across restarts. Its data is
//! immutable after creation; only the lifecycle state changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::state_machine::InvalidTransition;

/// Config entry lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntryState {
    /// Initial state, not yet set up
    #[default]
    NotLoaded,
    /// Setup handler running
    SetupInProgress,
    /// Successfully set up
    Loaded,
    /// Setup failed, can be retried or unloaded
    SetupError,
    /// Unload handler running
    UnloadInProgress,
    /// Unload failed (terminal)
    FailedUnload,
}

impl ConfigEntryState {
    /// Whether the entry can be unloaded or re-setup from this state
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ConfigEntryState::NotLoaded | ConfigEntryState::Loaded | ConfigEntryState::SetupError
        )
    }
}

/// A configuration entry for an integration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEntry {
    /// Unique identifier (ULID)
    pub entry_id: String,

    /// Integration domain (e.g., "reverse_cover")
    pub domain: String,

    /// Human-readable display name
    pub title: String,

    /// Immutable configuration data
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,

    /// Optional unique identifier for duplicate prevention
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,

    /// Current lifecycle state (not persisted)
    #[serde(skip, default)]
    pub state: ConfigEntryState,

    /// Human-readable explanation for failed states (not persisted)
    #[serde(skip, default)]
    pub reason: Option<String>,

    /// Creation timestamp
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp
    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

impl ConfigEntry {
    /// Create a new config entry
    pub fn new(domain: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            entry_id: ulid::Ulid::new().to_string(),
            domain: domain.into(),
            title: title.into(),
            data: HashMap::new(),
            unique_id: None,
            state: ConfigEntryState::NotLoaded,
            reason: None,
            created_at: now,
            modified_at: now,
        }
    }

    /// Set entry data
    pub fn with_data(mut self, data: HashMap<String, serde_json::Value>) -> Self {
        self.data = data;
        self
    }

    /// Set unique_id
    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }

    /// Get a value from entry data deserialized into the requested type
    pub fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.data
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Check whether the entry is loaded
    pub fn is_loaded(&self) -> bool {
        self.state == ConfigEntryState::Loaded
    }

    /// Check whether the entry can be unloaded
    pub fn supports_unload(&self) -> bool {
        self.state.is_recoverable()
    }

    /// Transition to a new state with validation
    pub fn try_set_state(
        &mut self,
        new_state: ConfigEntryState,
        reason: Option<String>,
    ) -> Result<(), InvalidTransition> {
        self.state.try_transition(new_state)?;
        self.state = new_state;
        self.reason = reason;
        Ok(())
    }
}
