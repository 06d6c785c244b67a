//! Model requests and their lifecycle.

use crate::catalog::ModelCategory;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Priority for admission (higher value = admitted first).
pub type Priority = u32;

/// Lifecycle state of a model request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    /// Queued, waiting for a slot.
    Waiting,
    /// Holding a slot and executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Runner reported an error.
    Failed,
    /// Cancelled explicitly, evicted, or timed out by its caller.
    Cancelled,
    /// Waited past the configured maximum.
    Expired,
}

impl RequestStatus {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled | Self::Expired)
    }

    /// Checks if the request can transition to the given state.
    #[must_use]
    pub fn can_transition_to(&self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Waiting, Self::Running | Self::Expired | Self::Cancelled)
                | (Self::Running, Self::Completed | Self::Failed | Self::Cancelled)
        )
    }
}

/// A request for one model execution, tracked from enqueue to terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    /// Request ID.
    pub id: String,
    /// Expert (agent) the request is made on behalf of.
    pub agent_id: String,
    /// Model to run.
    pub model: String,
    /// Category resolved from the catalog at enqueue time.
    pub category: ModelCategory,
    /// Attribution only.
    pub user_id: String,
    /// Attribution only.
    pub session_id: String,
    /// Admission priority.
    pub priority: Priority,
    /// When the request was enqueued.
    pub created_at: DateTime<Utc>,
    /// When the request was admitted.
    pub started_at: Option<DateTime<Utc>>,
    /// When the request reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Caller's estimate of run time.
    pub estimated_duration: Duration,
    /// Opaque caller metadata.
    pub metadata: serde_json::Value,
    /// Current state.
    pub status: RequestStatus,
    /// Error message for non-successful terminal states.
    pub error: Option<String>,
}

impl ModelRequest {
    pub(crate) fn from_spec(spec: RequestSpec, category: ModelCategory) -> Self {
        Self {
            id: format!("req-{}", uuid::Uuid::new_v4()),
            agent_id: spec.expert_id,
            model: spec.model,
            category,
            user_id: spec.user_id,
            session_id: spec.session_id,
            priority: spec.priority,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            estimated_duration: spec.estimated_duration,
            metadata: spec.metadata,
            status: RequestStatus::Waiting,
            error: None,
        }
    }

    /// Time spent waiting so far, or until admission.
    #[must_use]
    pub fn waited(&self, now: DateTime<Utc>) -> Duration {
        let until = self.started_at.unwrap_or(now);
        (until - self.created_at).to_std().unwrap_or_default()
    }
}

/// Caller-supplied fields of a new request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpec {
    /// Expert the request runs for.
    pub expert_id: String,
    /// Model to run.
    pub model: String,
    /// Attribution only.
    pub user_id: String,
    /// Attribution only.
    pub session_id: String,
    /// Admission priority.
    pub priority: Priority,
    /// Caller's estimate of run time.
    pub estimated_duration: Duration,
    /// Opaque caller metadata.
    pub metadata: serde_json::Value,
}

impl RequestSpec {
    /// Describes a request with priority 1, a 60s estimate and empty metadata.
    #[must_use]
    pub fn new(
        expert_id: impl Into<String>,
        model: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            expert_id: expert_id.into(),
            model: model.into(),
            user_id: user_id.into(),
            session_id: session_id.into(),
            priority: 1,
            estimated_duration: Duration::from_secs(60),
            metadata: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the estimated duration.
    #[must_use]
    pub fn with_estimated_duration(mut self, estimated_duration: Duration) -> Self {
        self.estimated_duration = estimated_duration;
        self
    }

    /// Sets the metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Performs the model call for an admitted request.
#[async_trait]
pub trait RequestRunner: Send + Sync {
    /// Runs the request to completion.
    ///
    /// # Errors
    /// Returns a message describing the failure; the request is marked failed.
    async fn run(&self, request: &ModelRequest) -> std::result::Result<serde_json::Value, String>;
}

/// Lifecycle events broadcast by the queue manager, in the order applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    /// A request joined its category queue.
    Enqueued {
        /// Request ID.
        request_id: String,
        /// Category queue.
        category: ModelCategory,
        /// Priority.
        priority: Priority,
    },
    /// A request was granted a slot.
    Admitted {
        /// Request ID.
        request_id: String,
        /// Category queue.
        category: ModelCategory,
    },
    /// A request finished successfully.
    Completed {
        /// Request ID.
        request_id: String,
    },
    /// A request's runner failed.
    Failed {
        /// Request ID.
        request_id: String,
        /// Error message.
        error: String,
    },
    /// A request was cancelled.
    Cancelled {
        /// Request ID.
        request_id: String,
    },
    /// A request expired while waiting.
    Expired {
        /// Request ID.
        request_id: String,
    },
    /// A request was evicted to make room for another.
    Evicted {
        /// Evicted request ID.
        request_id: String,
        /// Request admitted in its place.
        replaced_by: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use RequestStatus::*;

        assert!(Waiting.can_transition_to(Running));
        assert!(Waiting.can_transition_to(Expired));
        assert!(Waiting.can_transition_to(Cancelled));
        assert!(!Waiting.can_transition_to(Completed));

        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));
        assert!(!Running.can_transition_to(Expired));

        for terminal in [Completed, Failed, Cancelled, Expired] {
            assert!(terminal.is_terminal());
            for to in [Waiting, Running, Completed, Failed, Cancelled, Expired] {
                assert!(!terminal.can_transition_to(to));
            }
        }
    }

    #[test]
    fn test_spec_builder() {
        let spec = RequestSpec::new("coder", "llama", "user-1", "session-1")
            .with_priority(3)
            .with_estimated_duration(Duration::from_secs(5))
            .with_metadata(serde_json::json!({"k": "v"}));
        let request = ModelRequest::from_spec(spec, ModelCategory::Large);

        assert!(request.id.starts_with("req-"));
        assert_eq!(request.agent_id, "coder");
        assert_eq!(request.priority, 3);
        assert_eq!(request.status, RequestStatus::Waiting);
        assert_eq!(request.metadata["k"], "v");
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&RequestStatus::Expired).unwrap();
        assert_eq!(json, "\"EXPIRED\"");
    }
}
