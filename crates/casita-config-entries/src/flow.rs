//! Configuration flow engine
//!
//! A config flow walks the user through creating a config entry. An
//! integration registers a flow factory for its domain; the manager
//! tracks in-progress flows and turns a finished flow into a config
//! entry, enforcing the unique-id invariant along the way.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::entry::ConfigEntry;
use crate::manager::{ConfigEntries, ConfigEntriesError};

/// Step id of the initial user-driven step
pub const STEP_USER: &str = "user";

/// Abort reason when the unique id is already configured
pub const ABORT_ALREADY_CONFIGURED: &str = "already_configured";

/// Flow errors
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("No config flow registered for domain: {0}")]
    UnknownDomain(String),

    #[error("No flow in progress with id: {0}")]
    UnknownFlow(String),

    #[error(transparent)]
    ConfigEntries(#[from] ConfigEntriesError),
}

/// Input selector for a form field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
    /// Entity picker constrained to one domain
    Entity { domain: String },
    /// Free-form text input
    Text,
}

/// One field of a form step's schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    pub required: bool,
    pub selector: Selector,
}

impl FormField {
    /// A required entity-selector field constrained to a domain
    pub fn entity(name: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
            selector: Selector::Entity {
                domain: domain.into(),
            },
        }
    }
}

/// What a flow step produced, before the manager resolves it
#[derive(Debug, Clone)]
pub enum FlowStep {
    /// Show a form and wait for input
    Form {
        step_id: String,
        data_schema: Vec<FormField>,
        errors: HashMap<String, String>,
    },
    /// Finish the flow by creating a config entry
    CreateEntry {
        title: String,
        data: HashMap<String, serde_json::Value>,
    },
    /// Terminate the flow without creating anything
    Abort { reason: String },
}

/// Final result of driving a flow one step forward
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowResult {
    Form {
        flow_id: String,
        handler: String,
        step_id: String,
        data_schema: Vec<FormField>,
        errors: HashMap<String, String>,
    },
    CreateEntry {
        flow_id: String,
        handler: String,
        title: String,
        entry_id: String,
    },
    Abort {
        flow_id: String,
        handler: String,
        reason: String,
    },
}

/// Per-flow state handed to the flow implementation
pub struct FlowContext {
    pub flow_id: String,
    pub domain: String,
    unique_id: Option<String>,
    entries: Arc<ConfigEntries>,
}

impl FlowContext {
    /// Claim a unique id for the entry this flow will create
    pub fn set_unique_id(&mut self, unique_id: impl Into<String>) {
        self.unique_id = Some(unique_id.into());
    }

    /// Whether an existing entry already holds the claimed unique id
    pub fn unique_id_configured(&self) -> bool {
        self.unique_id
            .as_ref()
            .map(|uid| self.entries.get_by_unique_id(&self.domain, uid).is_some())
            .unwrap_or(false)
    }

    /// Show a form for a step
    pub fn show_form(
        &self,
        step_id: impl Into<String>,
        data_schema: Vec<FormField>,
        errors: HashMap<String, String>,
    ) -> FlowStep {
        FlowStep::Form {
            step_id: step_id.into(),
            data_schema,
            errors,
        }
    }

    /// Finish the flow with a new entry
    pub fn create_entry(
        &self,
        title: impl Into<String>,
        data: HashMap<String, serde_json::Value>,
    ) -> FlowStep {
        FlowStep::CreateEntry {
            title: title.into(),
            data,
        }
    }

    /// Terminate the flow
    pub fn abort(&self, reason: impl Into<String>) -> FlowStep {
        FlowStep::Abort {
            reason: reason.into(),
        }
    }
}

/// A configuration flow implementation for one domain
#[async_trait]
pub trait ConfigFlow: Send + Sync {
    /// Handle the user step; `user_input` is None on the first call
    async fn step_user(
        &self,
        ctx: &mut FlowContext,
        user_input: Option<serde_json::Value>,
    ) -> FlowStep;
}

/// Factory producing flow instances for a domain
pub type FlowFactory = Arc<dyn Fn() -> Arc<dyn ConfigFlow> + Send + Sync>;

struct ActiveFlow {
    ctx: FlowContext,
    flow: Arc<dyn ConfigFlow>,
}

/// Tracks in-progress flows and resolves finished ones into entries
pub struct FlowManager {
    entries: Arc<ConfigEntries>,
    factories: DashMap<String, FlowFactory>,
    flows: DashMap<String, ActiveFlow>,
}

impl FlowManager {
    /// Create a new flow manager over a config entries manager
    pub fn new(entries: Arc<ConfigEntries>) -> Self {
        Self {
            entries,
            factories: DashMap::new(),
            flows: DashMap::new(),
        }
    }

    /// Register the flow factory for a domain
    pub fn register_flow(&self, domain: &str, factory: FlowFactory) {
        debug!(domain = %domain, "Registered config flow");
        self.factories.insert(domain.to_string(), factory);
    }

    /// Start a new flow for a domain
    pub async fn start(&self, domain: &str) -> Result<FlowResult, FlowError> {
        let factory = self
            .factories
            .get(domain)
            .map(|f| f.value().clone())
            .ok_or_else(|| FlowError::UnknownDomain(domain.to_string()))?;

        let flow = factory();
        let mut ctx = FlowContext {
            flow_id: ulid::Ulid::new().to_string(),
            domain: domain.to_string(),
            unique_id: None,
            entries: self.entries.clone(),
        };

        debug!(domain = %domain, flow_id = %ctx.flow_id, "Starting config flow");

        let step = flow.step_user(&mut ctx, None).await;
        self.resolve(ctx, flow, step).await
    }

    /// Advance an in-progress flow with user input
    pub async fn progress(
        &self,
        flow_id: &str,
        user_input: serde_json::Value,
    ) -> Result<FlowResult, FlowError> {
        let (_, active) = self
            .flows
            .remove(flow_id)
            .ok_or_else(|| FlowError::UnknownFlow(flow_id.to_string()))?;

        let ActiveFlow { mut ctx, flow } = active;
        let step = flow.step_user(&mut ctx, Some(user_input)).await;
        self.resolve(ctx, flow, step).await
    }

    async fn resolve(
        &self,
        ctx: FlowContext,
        flow: Arc<dyn ConfigFlow>,
        step: FlowStep,
    ) -> Result<FlowResult, FlowError> {
        let flow_id = ctx.flow_id.clone();
        let handler = ctx.domain.clone();

        match step {
            FlowStep::Form {
                step_id,
                data_schema,
                errors,
            } => {
                // Flow stays in progress until the form comes back
                self.flows.insert(flow_id.clone(), ActiveFlow { ctx, flow });
                Ok(FlowResult::Form {
                    flow_id,
                    handler,
                    step_id,
                    data_schema,
                    errors,
                })
            }
            FlowStep::Abort { reason } => {
                info!(flow_id = %flow_id, reason = %reason, "Config flow aborted");
                Ok(FlowResult::Abort {
                    flow_id,
                    handler,
                    reason,
                })
            }
            FlowStep::CreateEntry { title, data } => {
                let mut entry = ConfigEntry::new(&handler, &title).with_data(data);
                if let Some(unique_id) = ctx.unique_id {
                    entry = entry.with_unique_id(unique_id);
                }

                let entry = match self.entries.add(entry).await {
                    Ok(entry) => entry,
                    // Backstop for flows that skip the configured check
                    Err(ConfigEntriesError::AlreadyExists { .. }) => {
                        return Ok(FlowResult::Abort {
                            flow_id,
                            handler,
                            reason: ABORT_ALREADY_CONFIGURED.to_string(),
                        });
                    }
                    Err(e) => return Err(e.into()),
                };

                if let Err(e) = self.entries.setup(&entry.entry_id).await {
                    // The entry exists with its error state recorded
                    warn!(entry_id = %entry.entry_id, error = %e, "Setup of new entry failed");
                }

                info!(flow_id = %flow_id, entry_id = %entry.entry_id, "Config flow created entry");
                Ok(FlowResult::CreateEntry {
                    flow_id,
                    handler,
                    title,
                    entry_id: entry.entry_id,
                })
            }
        }
    }

    /// Number of flows waiting for input
    pub fn in_progress(&self) -> usize {
        self.flows.len()
    }
}
