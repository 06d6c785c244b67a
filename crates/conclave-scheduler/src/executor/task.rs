//! Expert tasks run by the parallel executor.

use super::handler::ExpertResponse;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Lifecycle state of an expert task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Planned, not yet attempted.
    Pending,
    /// No slot was available when its group ran.
    Queued,
    /// Holding a slot and executing.
    Running,
    /// Handler returned a response.
    Completed,
    /// Handler error, timeout, panic or cancellation.
    Failed,
}

impl TaskStatus {
    /// Checks if the task can transition to the given state.
    #[must_use]
    pub fn can_transition_to(&self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Queued | Self::Running | Self::Failed)
                | (Self::Running, Self::Completed | Self::Failed)
        )
    }
}

/// Caller description of one expert's unit of work in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpertTaskSpec {
    /// Expert ID.
    pub expert_id: String,
    /// Role used to look up the handler.
    pub role: String,
    /// Model the expert runs on.
    pub model: String,
    /// Opaque input for the handler.
    pub payload: serde_json::Value,
}

impl ExpertTaskSpec {
    /// Describes an expert task with an empty object payload.
    #[must_use]
    pub fn new(expert_id: impl Into<String>, role: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            expert_id: expert_id.into(),
            role: role.into(),
            model: model.into(),
            payload: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// A planned expert task and its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpertExecutionTask {
    /// Task ID, also the ledger holder ID while it runs.
    pub task_id: String,
    /// Expert ID.
    pub expert_id: String,
    /// Handler role.
    pub role: String,
    /// Model.
    pub model: String,
    /// Handler input.
    pub payload: serde_json::Value,
    /// Current state.
    pub status: TaskStatus,
    /// When execution began.
    pub started_at: Option<DateTime<Utc>>,
    /// When execution ended.
    pub ended_at: Option<DateTime<Utc>>,
    /// Handler response on success.
    pub result: Option<ExpertResponse>,
    /// Failure or queueing reason.
    pub error: Option<String>,
}

impl ExpertExecutionTask {
    /// Plans a pending task from its spec.
    #[must_use]
    pub fn from_spec(spec: ExpertTaskSpec) -> Self {
        Self {
            task_id: format!("task-{}", uuid::Uuid::new_v4()),
            expert_id: spec.expert_id,
            role: spec.role,
            model: spec.model,
            payload: spec.payload,
            status: TaskStatus::Pending,
            started_at: None,
            ended_at: None,
            result: None,
            error: None,
        }
    }

    /// Wall time between start and end, if both are known.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => (end - start).to_std().ok(),
            _ => None,
        }
    }

    /// Moves to `to` if the lifecycle allows it.
    fn transition(&mut self, to: TaskStatus) -> bool {
        if !self.status.can_transition_to(to) {
            warn!(task_id = %self.task_id, from = ?self.status, to = ?to, "Invalid task transition");
            return false;
        }
        self.status = to;
        true
    }

    pub(crate) fn mark_running(&mut self) -> bool {
        if !self.transition(TaskStatus::Running) {
            return false;
        }
        self.started_at = Some(Utc::now());
        true
    }

    pub(crate) fn mark_queued(&mut self, reason: impl Into<String>) -> bool {
        if !self.transition(TaskStatus::Queued) {
            return false;
        }
        self.error = Some(reason.into());
        true
    }

    pub(crate) fn complete(&mut self, response: ExpertResponse) -> bool {
        if !self.transition(TaskStatus::Completed) {
            return false;
        }
        self.ended_at = Some(Utc::now());
        self.result = Some(response);
        true
    }

    pub(crate) fn fail(&mut self, error: impl Into<String>) -> bool {
        if !self.transition(TaskStatus::Failed) {
            return false;
        }
        self.ended_at = Some(Utc::now());
        self.error = Some(error.into());
        true
    }
}
