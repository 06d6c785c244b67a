//! Bounded-concurrency scheduling for expert model tasks.
//!
//! Three cooperating parts share one [`ResourceLedger`]:
//! the [`QueueManager`] admits individual model requests in priority order,
//! and the [`ParallelExecutor`] runs whole expert sessions in
//! resource-compatible groups. [`Scheduler`] wires them together.

pub mod catalog;
pub mod config;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod queue;

use std::sync::Arc;

pub use catalog::{ModelCatalog, ModelCategory, ModelDescriptor};
pub use config::{ConfigError, ExecutorConfig, QueueConfig, SchedulerConfig};
pub use error::{Result, SchedulerError};
pub use executor::{
    ExecutionEvent, ExecutionEventType, ExecutionSettings, ExpertDispatch, ExpertExecutionTask, ExpertHandler,
    ExpertResponse, ExpertTaskSpec, HandlerError, HandlerRegistry, ParallelExecutor, SessionReport, SessionSummary,
    TaskContext, TaskStatus,
};
pub use ledger::{Availability, CategoryStatus, ExecutionSlot, ResourceLedger, ResourceStatus, SlotGuard};
pub use queue::{
    ModelRequest, Priority, QueueEvent, QueueManager, QueueStats, QueueStatus, RequestRunner, RequestSpec,
    RequestStatus,
};

/// Owns the ledger, queue manager and executor of one deployment.
#[derive(Debug)]
pub struct Scheduler {
    config: SchedulerConfig,
    ledger: Arc<ResourceLedger>,
    queue: QueueManager,
    executor: Arc<ParallelExecutor>,
}

impl Scheduler {
    /// Builds a scheduler from validated configuration.
    ///
    /// # Errors
    /// Returns `Config` if the configuration is invalid.
    pub fn new(config: SchedulerConfig, runner: Arc<dyn RequestRunner>, handlers: HandlerRegistry) -> Result<Self> {
        config.validate()?;
        let ledger = Arc::new(ResourceLedger::from_config(&config));
        let queue = QueueManager::new(config.queue.clone(), Arc::clone(&ledger), runner);
        let executor = Arc::new(ParallelExecutor::new(config.executor.clone(), Arc::clone(&ledger), handlers));
        tracing::info!(models = ledger.catalog().len(), "Scheduler created");
        Ok(Self { config, ledger, queue, executor })
    }

    /// Starts the queue manager's admission loop.
    ///
    /// # Errors
    /// Returns `Lifecycle` if already started.
    pub fn start(&self) -> Result<()> {
        self.queue.start()
    }

    /// Stops admission, cancels every outstanding request and in-flight session.
    ///
    /// # Errors
    /// Returns `Lifecycle` if not started.
    pub async fn stop(&self) -> Result<()> {
        self.executor.stop();
        self.queue.stop().await
    }

    /// Whether the admission loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.queue.is_running()
    }

    /// Configuration the scheduler was built from.
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// The shared resource ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    /// The queue manager.
    #[must_use]
    pub fn queue(&self) -> &QueueManager {
        &self.queue
    }

    /// The parallel executor.
    #[must_use]
    pub fn executor(&self) -> &Arc<ParallelExecutor> {
        &self.executor
    }
}
