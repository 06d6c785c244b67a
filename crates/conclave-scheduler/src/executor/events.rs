//! Progress events streamed from a parallel session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of execution event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionEventType {
    /// A group is about to run.
    GroupStart,
    /// A task could not get a slot.
    TaskQueued,
    /// A task completed.
    TaskResponse,
    /// A task failed.
    TaskError,
    /// All tasks of a group finished.
    GroupComplete,
    /// The session finished; metadata carries the summary.
    ExecutionComplete,
}

/// One progress event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    /// Event kind.
    #[serde(rename = "type")]
    pub event_type: ExecutionEventType,
    /// Human-readable content (the response text for `task_response`).
    pub content: String,
    /// Structured details.
    pub metadata: serde_json::Value,
    /// When the event was produced.
    pub timestamp: DateTime<Utc>,
}

impl ExecutionEvent {
    /// Creates an event stamped now.
    #[must_use]
    pub fn new(event_type: ExecutionEventType, content: impl Into<String>, metadata: serde_json::Value) -> Self {
        Self { event_type, content: content.into(), metadata, timestamp: Utc::now() }
    }
}
