//! Expert handlers and their per-role registry.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Input handed to an expert handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    /// Task ID.
    pub task_id: String,
    /// Expert ID.
    pub expert_id: String,
    /// Handler role.
    pub role: String,
    /// Model the expert runs on.
    pub model: String,
    /// Session the task belongs to.
    pub session_id: String,
    /// Task input.
    pub payload: serde_json::Value,
    /// Tools the handler may use. Always empty for standard handlers.
    pub enabled_tools: Vec<String>,
}

/// What an expert handler returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpertResponse {
    /// Response text.
    pub response: String,
    /// Tools the handler used.
    #[serde(default)]
    pub tools_used: Vec<String>,
    /// Self-reported confidence in `[0, 1]`.
    #[serde(default)]
    pub confidence: f64,
}

/// Failures of a single expert task.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HandlerError {
    /// The handler reported a failure.
    #[error("Handler failed: {0}")]
    Failed(String),

    /// No handler is registered for the role.
    #[error("No handler registered for role '{0}'")]
    UnknownRole(String),

    /// The task's model is not in the catalog.
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    /// The model's cost exceeds its category's total capacity.
    #[error("Model '{model}' needs {cost} units but its category has {capacity}")]
    NeverPlaceable {
        /// Model name.
        model: String,
        /// Units one slot consumes.
        cost: u32,
        /// Total units of the category.
        capacity: u32,
    },

    /// The task exceeded its time budget.
    #[error("Task timed out after {0:?}")]
    Timeout(Duration),

    /// The executor was stopped while the task ran.
    #[error("Task cancelled: executor stopped")]
    Cancelled,

    /// The handler panicked.
    #[error("Handler panicked: {0}")]
    Panicked(String),
}

/// Runs one expert's work.
#[async_trait]
pub trait ExpertHandler: Send + Sync {
    /// Handles a task.
    ///
    /// # Errors
    /// Returns a `HandlerError` if the expert could not produce a response.
    async fn handle(&self, context: &TaskContext) -> Result<ExpertResponse, HandlerError>;
}

/// How a role's handler is invoked.
#[derive(Clone)]
pub enum ExpertDispatch {
    /// Receives the session's enabled tools.
    ToolAugmented(Arc<dyn ExpertHandler>),
    /// Receives no tools.
    Standard(Arc<dyn ExpertHandler>),
}

impl fmt::Debug for ExpertDispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ToolAugmented(_) => f.write_str("ToolAugmented"),
            Self::Standard(_) => f.write_str("Standard"),
        }
    }
}

impl ExpertDispatch {
    /// Invokes the handler, stripping tools for standard handlers.
    ///
    /// # Errors
    /// Propagates the handler's error.
    pub async fn dispatch(&self, mut context: TaskContext) -> Result<ExpertResponse, HandlerError> {
        match self {
            Self::ToolAugmented(handler) => handler.handle(&context).await,
            Self::Standard(handler) => {
                context.enabled_tools.clear();
                handler.handle(&context).await
            }
        }
    }
}

/// Handlers keyed by expert role.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, ExpertDispatch>>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler that receives the session's enabled tools.
    ///
    /// # Returns
    /// `true` if the role was new, `false` if an existing handler was replaced.
    pub async fn register_tool_augmented(&self, role: impl Into<String>, handler: Arc<dyn ExpertHandler>) -> bool {
        self.register(role.into(), ExpertDispatch::ToolAugmented(handler)).await
    }

    /// Registers a handler that receives no tools.
    ///
    /// # Returns
    /// `true` if the role was new, `false` if an existing handler was replaced.
    pub async fn register_standard(&self, role: impl Into<String>, handler: Arc<dyn ExpertHandler>) -> bool {
        self.register(role.into(), ExpertDispatch::Standard(handler)).await
    }

    async fn register(&self, role: String, dispatch: ExpertDispatch) -> bool {
        debug!(role = %role, kind = ?dispatch, "Registering expert handler");
        let mut handlers = self.handlers.write().await;
        let replaced = handlers.insert(role.clone(), dispatch).is_some();
        if replaced {
            warn!(role = %role, "Expert handler replaced in registry");
        }
        !replaced
    }

    /// Looks up the handler for a role.
    pub async fn get(&self, role: &str) -> Option<ExpertDispatch> {
        self.handlers.read().await.get(role).cloned()
    }

    /// Registered roles, sorted.
    pub async fn roles(&self) -> Vec<String> {
        let mut roles: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        roles.sort();
        roles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ToolCounter;

    #[async_trait]
    impl ExpertHandler for ToolCounter {
        async fn handle(&self, context: &TaskContext) -> Result<ExpertResponse, HandlerError> {
            Ok(ExpertResponse {
                response: format!("{} tools", context.enabled_tools.len()),
                tools_used: context.enabled_tools.clone(),
                confidence: 1.0,
            })
        }
    }

    fn context() -> TaskContext {
        TaskContext {
            task_id: "t".into(),
            expert_id: "e".into(),
            role: "r".into(),
            model: "m".into(),
            session_id: "s".into(),
            payload: serde_json::Value::Null,
            enabled_tools: vec!["search".into(), "calc".into()],
        }
    }

    #[tokio::test]
    async fn test_dispatch_passes_tools_by_kind() {
        let handler: Arc<dyn ExpertHandler> = Arc::new(ToolCounter);

        let augmented = ExpertDispatch::ToolAugmented(Arc::clone(&handler)).dispatch(context()).await.unwrap();
        assert_eq!(augmented.response, "2 tools");

        let standard = ExpertDispatch::Standard(handler).dispatch(context()).await.unwrap();
        assert_eq!(standard.response, "0 tools");
        assert!(standard.tools_used.is_empty());
    }

    #[tokio::test]
    async fn test_registry_register_and_replace() {
        let registry = HandlerRegistry::new();
        assert!(registry.register_standard("analyst", Arc::new(ToolCounter)).await);
        assert!(!registry.register_tool_augmented("analyst", Arc::new(ToolCounter)).await);
        assert!(registry.register_standard("critic", Arc::new(ToolCounter)).await);

        assert!(matches!(registry.get("analyst").await, Some(ExpertDispatch::ToolAugmented(_))));
        assert!(registry.get("ghost").await.is_none());
        assert_eq!(registry.roles().await, vec!["analyst", "critic"]);
    }
}
