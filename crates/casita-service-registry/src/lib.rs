//! Service registry with async handlers for casita
//!
//! The ServiceRegistry routes service calls to registered async
//! handlers. A call is awaited to completion, so callers observe the
//! handler's result. Services may register a JSON schema for their
//! service data; payloads failing validation are rejected before the
//! handler runs.

use casita_core::events::CallServiceData;
use casita_core::{Context, ServiceCall};
use casita_event_bus::EventBus;
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Result type for service calls
pub type ServiceResult = Result<(), ServiceError>;

/// Future type for async service handlers
pub type ServiceFuture = Pin<Box<dyn Future<Output = ServiceResult> + Send>>;

/// Service handler function type
pub type ServiceHandler = Arc<dyn Fn(ServiceCall) -> ServiceFuture + Send + Sync>;

/// Errors that can occur when working with services
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("service not found: {domain}.{service}")]
    NotFound { domain: String, service: String },

    #[error("service call failed: {0}")]
    CallFailed(String),

    #[error("invalid service data: {0}")]
    InvalidData(String),

    #[error("invalid service schema: {0}")]
    InvalidSchema(String),
}

struct RegisteredService {
    handler: ServiceHandler,
    schema: Option<Arc<jsonschema::JSONSchema>>,
}

/// Routes service calls to their registered handlers
///
/// Every dispatched call also fires a `call_service` event on the bus,
/// so observers can watch service traffic without wrapping handlers.
pub struct ServiceRegistry {
    /// Services indexed by "domain.service" key
    services: DashMap<String, RegisteredService>,
    /// Bus for firing call_service events
    event_bus: Arc<EventBus>,
}

impl ServiceRegistry {
    /// Create a new service registry wired to the given event bus
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            services: DashMap::new(),
            event_bus,
        }
    }

    /// Register a service without a service data schema
    #[instrument(skip(self, domain, service, handler))]
    pub fn register<F, Fut>(&self, domain: impl Into<String>, service: impl Into<String>, handler: F)
    where
        F: Fn(ServiceCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ServiceResult> + Send + 'static,
    {
        let domain = domain.into();
        let service = service.into();
        let key = format!("{}.{}", domain, service);

        debug!(domain = %domain, service = %service, "Registering service");

        let handler: ServiceHandler =
            Arc::new(move |call| Box::pin(handler(call)) as ServiceFuture);

        self.services.insert(
            key,
            RegisteredService {
                handler,
                schema: None,
            },
        );
    }

    /// Register a service whose service data is validated against a JSON schema
    ///
    /// The schema is compiled once at registration; a malformed schema is
    /// a registration error, not a call-time one.
    #[instrument(skip(self, domain, service, schema, handler))]
    pub fn register_with_schema<F, Fut>(
        &self,
        domain: impl Into<String>,
        service: impl Into<String>,
        schema: serde_json::Value,
        handler: F,
    ) -> Result<(), ServiceError>
    where
        F: Fn(ServiceCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ServiceResult> + Send + 'static,
    {
        let domain = domain.into();
        let service = service.into();
        let key = format!("{}.{}", domain, service);

        let compiled = jsonschema::JSONSchema::compile(&schema)
            .map_err(|e| ServiceError::InvalidSchema(e.to_string()))?;

        debug!(domain = %domain, service = %service, "Registering service with schema");

        let handler: ServiceHandler =
            Arc::new(move |call| Box::pin(handler(call)) as ServiceFuture);

        self.services.insert(
            key,
            RegisteredService {
                handler,
                schema: Some(Arc::new(compiled)),
            },
        );

        Ok(())
    }

    /// Call a service and await its handler
    ///
    /// Unknown services fail with `NotFound`; schema violations fail with
    /// `InvalidData` before the handler runs. Handler errors propagate to
    /// the caller unchanged.
    #[instrument(skip(self, service_data, context))]
    pub async fn call(
        &self,
        domain: &str,
        service: &str,
        service_data: serde_json::Value,
        context: Context,
    ) -> ServiceResult {
        let key = format!("{}.{}", domain, service);

        let registered = self.services.get(&key).ok_or_else(|| {
            warn!(domain = %domain, service = %service, "Service not found");
            ServiceError::NotFound {
                domain: domain.to_string(),
                service: service.to_string(),
            }
        })?;

        if let Some(schema) = &registered.schema {
            if let Err(mut errors) = schema.validate(&service_data) {
                let detail = errors
                    .next()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "schema validation failed".to_string());
                warn!(domain = %domain, service = %service, error = %detail, "Rejecting service data");
                return Err(ServiceError::InvalidData(detail));
            }
        }

        debug!(domain = %domain, service = %service, "Calling service");

        let handler = registered.handler.clone();
        drop(registered); // Release the map entry before awaiting the handler

        self.event_bus.fire_typed(
            CallServiceData {
                domain: domain.to_string(),
                service: service.to_string(),
                service_data: service_data.clone(),
            },
            context.clone(),
        );

        let call = ServiceCall::new(domain, service, service_data, context);
        handler(call).await
    }

    /// Check whether a service exists
    pub fn has_service(&self, domain: &str, service: &str) -> bool {
        let key = format!("{}.{}", domain, service);
        self.services.contains_key(&key)
    }

    /// Names of all services registered for a domain
    pub fn domain_services(&self, domain: &str) -> Vec<String> {
        let prefix = format!("{}.", domain);
        let mut names: Vec<String> = self
            .services
            .iter()
            .filter_map(|s| s.key().strip_prefix(&prefix).map(String::from))
            .collect();
        names.sort();
        names
    }

    /// Unregister a service
    #[instrument(skip(self))]
    pub fn unregister(&self, domain: &str, service: &str) -> bool {
        let key = format!("{}.{}", domain, service);
        let removed = self.services.remove(&key).is_some();

        if removed {
            debug!(domain = %domain, service = %service, "Unregistered service");
        }

        removed
    }

    /// Unregister every service in a domain, returning how many were removed
    #[instrument(skip(self))]
    pub fn unregister_domain(&self, domain: &str) -> usize {
        let prefix = format!("{}.", domain);
        let keys_to_remove: Vec<_> = self
            .services
            .iter()
            .filter(|s| s.key().starts_with(&prefix))
            .map(|s| s.key().clone())
            .collect();

        let count = keys_to_remove.len();
        for key in keys_to_remove {
            self.services.remove(&key);
        }

        debug!(domain = %domain, count = count, "Unregistered domain services");
        count
    }

    /// Total number of registered services
    pub fn service_count(&self) -> usize {
        self.services.len()
    }
}

/// Thread-safe wrapper for ServiceRegistry
pub type SharedServiceRegistry = Arc<ServiceRegistry>;
