// Error types for scheduling

use std::time::Duration;

use thiserror::Error;

use crate::catalog::ModelCategory;
use crate::config::ConfigError;

/// Result type for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Scheduler errors
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No free capacity for the model's category
    #[error("Admission denied for model '{model}': {reason}")]
    AdmissionDenied {
        /// Model that was requested
        model: String,
        /// Why the ledger refused
        reason: String,
    },

    /// Category queue saturated; request rejected or evicted
    #[error("Queue for category '{category}' is full (limit {limit})")]
    QueueFull {
        /// Saturated category
        category: ModelCategory,
        /// Configured queue limit
        limit: usize,
    },

    /// Request waited longer than the configured maximum
    #[error("Request {request_id} expired after waiting {waited_secs}s")]
    RequestExpired {
        /// Request ID
        request_id: String,
        /// Seconds spent waiting
        waited_secs: u64,
    },

    /// Explicit cancellation, shutdown, or result timeout
    #[error("Request {request_id} cancelled: {reason}")]
    RequestCancelled {
        /// Request ID
        request_id: String,
        /// Reason for the cancellation
        reason: String,
    },

    /// Caller stopped waiting for a result
    #[error("Timed out after {timeout:?} waiting for request {request_id}")]
    Timeout {
        /// Request ID
        request_id: String,
        /// How long the caller waited
        timeout: Duration,
    },

    /// The request runner reported a failure
    #[error("Execution failed: {0}")]
    ExecutionError(String),

    /// Model is not present in the catalog
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    /// Request ID not tracked, or its result was already claimed
    #[error("Unknown request: {0}")]
    UnknownRequest(String),

    /// Start/stop called in the wrong state
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),
}
