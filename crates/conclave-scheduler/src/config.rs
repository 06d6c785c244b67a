//! TOML configuration for the scheduler.
//!
//! Every field has a default, so an empty file is a valid configuration with
//! an empty model catalog.

use crate::catalog::{ModelCatalog, ModelCategory, ModelDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading the file.
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("Failed to parse TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error.
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Top-level scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Concurrency units per category. Missing categories have no capacity.
    #[serde(default = "default_capacity")]
    pub capacity: BTreeMap<ModelCategory, u32>,

    /// Queue manager settings.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Parallel executor settings.
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Model catalog entries.
    #[serde(default)]
    pub models: Vec<ModelDescriptor>,
}

fn default_capacity() -> BTreeMap<ModelCategory, u32> {
    BTreeMap::from([(ModelCategory::Large, 1), (ModelCategory::Medium, 2), (ModelCategory::Small, 4)])
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            queue: QueueConfig::default(),
            executor: ExecutorConfig::default(),
            models: Vec::new(),
        }
    }
}

/// Queue manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum waiting requests per category.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Waiting longer than this expires the request.
    #[serde(default = "default_max_wait_minutes")]
    pub max_wait_time_minutes: u64,
    /// Starting admission loop period.
    #[serde(default = "default_base_interval_ms")]
    pub base_interval_ms: u64,
    /// Lower bound for adaptive tuning.
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    /// Upper bound for adaptive tuning.
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    /// Period of the expiry sweep.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Average wait above which the loop speeds up.
    #[serde(default = "default_high_wait_threshold_secs")]
    pub high_wait_threshold_secs: u64,
    /// Whether the loop period adapts to load.
    #[serde(default = "default_true")]
    pub adaptive_tuning: bool,
    /// Terminal requests retained for lookup.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Broadcast buffer for queue events.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_max_queue_size() -> usize { 100 }
fn default_max_wait_minutes() -> u64 { 30 }
fn default_base_interval_ms() -> u64 { 1000 }
fn default_min_interval_ms() -> u64 { 500 }
fn default_max_interval_ms() -> u64 { 2000 }
fn default_cleanup_interval_secs() -> u64 { 60 }
fn default_high_wait_threshold_secs() -> u64 { 30 }
fn default_true() -> bool { true }
fn default_history_limit() -> usize { 1000 }
fn default_event_capacity() -> usize { 256 }

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            max_wait_time_minutes: default_max_wait_minutes(),
            base_interval_ms: default_base_interval_ms(),
            min_interval_ms: default_min_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            high_wait_threshold_secs: default_high_wait_threshold_secs(),
            adaptive_tuning: default_true(),
            history_limit: default_history_limit(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl QueueConfig {
    /// Maximum time a request may wait before it expires.
    #[must_use]
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_time_minutes.saturating_mul(60))
    }

    /// Initial admission loop period.
    #[must_use]
    pub fn base_interval(&self) -> Duration {
        Duration::from_millis(self.base_interval_ms)
    }

    /// Expiry sweep period.
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Parallel executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Default per-task timeout.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    /// Capacity of a session's event channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_task_timeout_secs() -> u64 { 300 }
fn default_event_buffer() -> usize { 64 }

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { task_timeout_secs: default_task_timeout_secs(), event_buffer: default_event_buffer() }
    }
}

impl SchedulerConfig {
    /// Loads and validates configuration from a TOML file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read, parsed, or fails validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parses and validates configuration from TOML text.
    ///
    /// # Errors
    /// Returns error if parsing or validation fails.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field constraints.
    ///
    /// # Errors
    /// Returns `ConfigError::Validation` describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let q = &self.queue;
        if q.min_interval_ms == 0 {
            return Err(ConfigError::Validation("queue.min_interval_ms must be > 0".to_string()));
        }
        if q.min_interval_ms > q.base_interval_ms || q.base_interval_ms > q.max_interval_ms {
            return Err(ConfigError::Validation(format!(
                "queue intervals must satisfy min <= base <= max (got {} / {} / {})",
                q.min_interval_ms, q.base_interval_ms, q.max_interval_ms
            )));
        }
        if q.max_queue_size == 0 {
            return Err(ConfigError::Validation("queue.max_queue_size must be > 0".to_string()));
        }
        if q.event_capacity == 0 || self.executor.event_buffer == 0 {
            return Err(ConfigError::Validation("event buffers must be > 0".to_string()));
        }

        let mut seen = HashSet::new();
        for model in &self.models {
            if model.name.trim().is_empty() {
                return Err(ConfigError::Validation("model name must not be empty".to_string()));
            }
            if model.concurrency_cost == 0 {
                return Err(ConfigError::Validation(format!(
                    "model '{}' must have concurrency_cost >= 1",
                    model.name
                )));
            }
            if !seen.insert(model.name.as_str()) {
                return Err(ConfigError::Validation(format!("duplicate model '{}'", model.name)));
            }
        }

        Ok(())
    }

    /// Builds the model catalog from the configured entries.
    #[must_use]
    pub fn catalog(&self) -> ModelCatalog {
        ModelCatalog::new(self.models.iter().cloned())
    }

    /// Sets one category's capacity.
    #[must_use]
    pub fn with_capacity(mut self, category: ModelCategory, units: u32) -> Self {
        self.capacity.insert(category, units);
        self
    }

    /// Adds a model to the catalog.
    #[must_use]
    pub fn with_model(mut self, descriptor: ModelDescriptor) -> Self {
        self.models.push(descriptor);
        self
    }
}
