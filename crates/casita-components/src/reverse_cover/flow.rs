//! Reverse cover config flow
//!
//! One screen, one field: pick the source cover. The source entity id
//! doubles as the entry's unique id, so a second flow for the same
//! source aborts instead of creating a duplicate.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use casita_config_entries::{ConfigFlow, FlowContext, FlowStep, FormField, STEP_USER};
use casita_state_store::StateStore;
use serde_json::json;
use tracing::debug;

use super::{proxy_name, CONF_SOURCE_ENTITY_ID};
use crate::cover;

/// Form error when the picked entity is not in the state store
pub const ERROR_ENTITY_NOT_FOUND: &str = "entity_not_found";

/// The one-step reverse cover flow
pub struct ReverseCoverFlow {
    states: Arc<StateStore>,
}

impl ReverseCoverFlow {
    /// Create the flow over the live state store
    pub fn new(states: Arc<StateStore>) -> Arc<Self> {
        Arc::new(Self { states })
    }

    fn schema() -> Vec<FormField> {
        vec![FormField::entity(CONF_SOURCE_ENTITY_ID, cover::DOMAIN)]
    }
}

#[async_trait]
impl ConfigFlow for ReverseCoverFlow {
    async fn step_user(
        &self,
        ctx: &mut FlowContext,
        user_input: Option<serde_json::Value>,
    ) -> FlowStep {
        let input = match user_input {
            Some(input) => input,
            None => return ctx.show_form(STEP_USER, Self::schema(), HashMap::new()),
        };

        let source = match input.get(CONF_SOURCE_ENTITY_ID).and_then(|v| v.as_str()) {
            Some(source) => source.to_string(),
            None => {
                let mut errors = HashMap::new();
                errors.insert(CONF_SOURCE_ENTITY_ID.to_string(), "required".to_string());
                return ctx.show_form(STEP_USER, Self::schema(), errors);
            }
        };

        if self.states.get(&source).is_none() {
            debug!(source = %source, "Picked source is not a known entity");
            let mut errors = HashMap::new();
            errors.insert(
                CONF_SOURCE_ENTITY_ID.to_string(),
                ERROR_ENTITY_NOT_FOUND.to_string(),
            );
            return ctx.show_form(STEP_USER, Self::schema(), errors);
        }

        ctx.set_unique_id(&source);
        if ctx.unique_id_configured() {
            return ctx.abort(casita_config_entries::ABORT_ALREADY_CONFIGURED);
        }

        let mut data = HashMap::new();
        data.insert(CONF_SOURCE_ENTITY_ID.to_string(), json!(source));
        ctx.create_entry(proxy_name(&source), data)
    }
}
