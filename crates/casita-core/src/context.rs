//! Context type for tracking request origin and causality

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Tracks who initiated an action and which action caused it
///
/// Every event and service call carries a Context. Follow-on operations
/// (a proxy entity forwarding a command, for example) derive a child
/// context so the causality chain stays traceable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    /// Unique identifier for this context (ULID)
    pub id: String,

    /// User that initiated the action, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Parent context ID when this action was caused by another
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl Context {
    /// Create a new context with a fresh ULID
    pub fn new() -> Self {
        Self {
            id: Ulid::new().to_string(),
            user_id: None,
            parent_id: None,
        }
    }

    /// Create a new context attributed to a user
    pub fn with_user(user_id: impl Into<String>) -> Self {
        Self {
            id: Ulid::new().to_string(),
            user_id: Some(user_id.into()),
            parent_id: None,
        }
    }

    /// Derive a child context with this context as parent
    pub fn child(&self) -> Self {
        Self {
            id: Ulid::new().to_string(),
            user_id: self.user_id.clone(),
            parent_id: Some(self.id.clone()),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
