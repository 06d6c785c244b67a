//! Queue statistics and status snapshots.

use crate::catalog::ModelCategory;
use crate::ledger::ResourceStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Running counters kept by the queue manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Requests accepted by `enqueue_request`.
    pub total_requests: u64,
    /// Requests that completed successfully.
    pub completed_requests: u64,
    /// Requests whose runner failed.
    pub failed_requests: u64,
    /// Requests cancelled, including evictions.
    pub cancelled_requests: u64,
    /// Requests that expired while waiting.
    pub expired_requests: u64,
    /// Requests evicted by a higher-or-equal priority arrival.
    pub evicted_requests: u64,
    /// Moving average of time from enqueue to admission, in seconds.
    pub average_wait_secs: f64,
    /// Largest total number of waiting requests observed.
    pub peak_queue_length: usize,
    /// Current admission loop period.
    pub current_interval_ms: u64,
}

/// Serializable point-in-time view of the queue manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Waiting requests per category.
    pub queue_lengths: BTreeMap<ModelCategory, usize>,
    /// Waiting requests across all categories.
    pub queue_length: usize,
    /// Requests currently holding a slot.
    pub active_executions: usize,
    /// Whether the admission loop is running.
    pub running: bool,
    /// Counters.
    pub stats: QueueStats,
    /// Ledger usage.
    pub resources: ResourceStatus,
    /// When the snapshot was taken.
    pub captured_at: DateTime<Utc>,
}
