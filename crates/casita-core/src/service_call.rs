//! Service call type for invoking registered services

use crate::Context;
use serde::{Deserialize, Serialize};

/// A call to a registered service
///
/// Services are how entities are controlled. Each service belongs to a
/// domain and carries a JSON payload of service data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCall {
    /// The domain the service belongs to (e.g., "cover")
    pub domain: String,

    /// The service name (e.g., "open_cover", "set_cover_position")
    pub service: String,

    /// Data passed to the service (e.g., entity_id, position)
    pub service_data: serde_json::Value,

    /// Context tracking who initiated this call
    pub context: Context,
}

impl ServiceCall {
    /// Create a new service call
    pub fn new(
        domain: impl Into<String>,
        service: impl Into<String>,
        service_data: serde_json::Value,
        context: Context,
    ) -> Self {
        Self {
            domain: domain.into(),
            service: service.into(),
            service_data,
            context,
        }
    }

    /// Create a service call with empty service data
    pub fn simple(domain: impl Into<String>, service: impl Into<String>, context: Context) -> Self {
        Self::new(
            domain,
            service,
            serde_json::Value::Object(Default::default()),
            context,
        )
    }

    /// The full service identifier (domain.service)
    pub fn service_id(&self) -> String {
        format!("{}.{}", self.domain, self.service)
    }

    /// Get a value from service_data deserialized into the requested type
    pub fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.service_data
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Entity IDs targeted by this call
    ///
    /// Accepts both the single-string and the array form of `entity_id`.
    pub fn entity_ids(&self) -> Vec<String> {
        match self.service_data.get("entity_id") {
            Some(serde_json::Value::String(s)) => vec![s.clone()],
            Some(serde_json::Value::Array(arr)) => arr
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            _ => vec![],
        }
    }
}
