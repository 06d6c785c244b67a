//! Aggregate outcome of a parallel session.

use super::task::{ExpertExecutionTask, TaskStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Counts and histograms for one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Session ID.
    pub session_id: String,
    /// Tasks that completed.
    pub completed: usize,
    /// Tasks that failed.
    pub failed: usize,
    /// Tasks that could not get a slot.
    pub queued: usize,
    /// Tasks that started executing, per model.
    pub model_usage: BTreeMap<String, usize>,
    /// Invocations per tool across completed tasks.
    pub tool_usage: BTreeMap<String, usize>,
    /// Execution time per task ID, in milliseconds.
    pub task_durations_ms: BTreeMap<String, u64>,
    /// Number of groups planned.
    pub group_count: usize,
    /// Wall time of the whole session, in milliseconds.
    pub total_duration_ms: u64,
}

impl SessionSummary {
    /// Creates an empty summary for a session.
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self { session_id: session_id.into(), ..Self::default() }
    }

    /// Folds a finished task into the summary.
    pub fn record(&mut self, task: &ExpertExecutionTask) {
        match task.status {
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Queued => {
                self.queued += 1;
                return;
            }
            TaskStatus::Pending | TaskStatus::Running => return,
        }

        if task.started_at.is_some() {
            *self.model_usage.entry(task.model.clone()).or_default() += 1;
        }
        if let Some(response) = &task.result {
            for tool in &response.tools_used {
                *self.tool_usage.entry(tool.clone()).or_default() += 1;
            }
        }
        if let Some(duration) = task.duration() {
            self.task_durations_ms.insert(task.task_id.clone(), duration_ms(duration));
        }
    }

    /// Sets the session wall time.
    pub fn finish(&mut self, elapsed: Duration) {
        self.total_duration_ms = duration_ms(elapsed);
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
