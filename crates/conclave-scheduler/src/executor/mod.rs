//! Parallel execution of expert tasks in resource-compatible groups.
//!
//! A session's tasks are planned into groups with
//! [`planner::group_by_resource_compatibility`]. Groups run one after
//! another; the tasks inside a group run concurrently, each holding its own
//! ledger slot through a guard owned by the spawned task, so a failure,
//! timeout or panic affects only that task and always returns its slot.

pub mod events;
pub mod handler;
pub mod planner;
pub mod summary;
pub mod task;

pub use events::{ExecutionEvent, ExecutionEventType};
pub use handler::{ExpertDispatch, ExpertHandler, ExpertResponse, HandlerError, HandlerRegistry, TaskContext};
pub use planner::group_by_resource_compatibility;
pub use summary::SessionSummary;
pub use task::{ExpertExecutionTask, ExpertTaskSpec, TaskStatus};

use crate::config::ExecutorConfig;
use crate::ledger::{ResourceLedger, SlotGuard};
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Options for one parallel session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSettings {
    /// Time budget per task.
    pub task_timeout: Duration,
    /// Tools offered to tool-augmented handlers.
    pub enabled_tools: Vec<String>,
}

impl ExecutionSettings {
    /// Settings using the configured task timeout and no tools.
    #[must_use]
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self { task_timeout: Duration::from_secs(config.task_timeout_secs), enabled_tools: Vec::new() }
    }

    /// Sets the per-task timeout.
    #[must_use]
    pub fn with_task_timeout(mut self, task_timeout: Duration) -> Self {
        self.task_timeout = task_timeout;
        self
    }

    /// Sets the enabled tools.
    #[must_use]
    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enabled_tools = tools.into_iter().map(Into::into).collect();
        self
    }
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self::from_config(&ExecutorConfig::default())
    }
}

/// Finished tasks and the summary of a session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    /// Every task, in group order; within a group in completion order.
    pub tasks: Vec<ExpertExecutionTask>,
    /// Aggregate counts.
    pub summary: SessionSummary,
}

type EventSink<'a> = Option<&'a mpsc::Sender<ExecutionEvent>>;

/// Runs expert sessions against the resource ledger.
pub struct ParallelExecutor {
    ledger: Arc<ResourceLedger>,
    handlers: HandlerRegistry,
    config: ExecutorConfig,
    /// Parent of every session's token; replaced on `stop`.
    shutdown: Mutex<CancellationToken>,
}

impl fmt::Debug for ParallelExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelExecutor")
            .field("config", &self.config)
            .field("handlers", &self.handlers)
            .finish_non_exhaustive()
    }
}

impl ParallelExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(config: ExecutorConfig, ledger: Arc<ResourceLedger>, handlers: HandlerRegistry) -> Self {
        Self { ledger, handlers, config, shutdown: Mutex::new(CancellationToken::new()) }
    }

    /// The handler registry.
    #[must_use]
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Settings derived from this executor's configuration.
    #[must_use]
    pub fn default_settings(&self) -> ExecutionSettings {
        ExecutionSettings::from_config(&self.config)
    }

    /// Creates tasks from specs and plans them into groups.
    #[must_use]
    pub fn plan(&self, specs: Vec<ExpertTaskSpec>) -> Vec<Vec<ExpertExecutionTask>> {
        let tasks = specs.into_iter().map(ExpertExecutionTask::from_spec).collect();
        group_by_resource_compatibility(&self.ledger, tasks)
    }

    /// Cancels every in-flight session. Their running tasks fail; later
    /// sessions are unaffected.
    pub fn stop(&self) {
        let mut token = self.shutdown.lock().unwrap_or_else(PoisonError::into_inner);
        token.cancel();
        *token = CancellationToken::new();
        info!("Parallel executor stopped in-flight sessions");
    }

    fn session_token(&self) -> CancellationToken {
        self.shutdown.lock().unwrap_or_else(PoisonError::into_inner).child_token()
    }

    /// Runs one group to completion.
    ///
    /// Tasks that cannot get a slot are returned as `Queued`; every other
    /// task ends `Completed` or `Failed`.
    pub async fn execute_group(
        &self,
        group: Vec<ExpertExecutionTask>,
        settings: &ExecutionSettings,
        session_id: &str,
    ) -> Vec<ExpertExecutionTask> {
        let cancel = self.session_token();
        self.run_group(group, settings, session_id, &cancel, None).await
    }

    /// Plans and runs a whole session, optionally streaming events.
    pub async fn execute_session(
        &self,
        specs: Vec<ExpertTaskSpec>,
        settings: &ExecutionSettings,
        session_id: &str,
        events: EventSink<'_>,
    ) -> SessionReport {
        let started = Instant::now();
        let cancel = self.session_token();
        let groups = self.plan(specs);
        let group_count = groups.len();

        info!(session_id = %session_id, groups = group_count, "Starting parallel expert session");
        let mut summary = SessionSummary::new(session_id);
        summary.group_count = group_count;
        let mut tasks = Vec::new();

        for (index, group) in groups.into_iter().enumerate() {
            let experts: Vec<&str> = group.iter().map(|t| t.expert_id.as_str()).collect();
            emit(
                events,
                ExecutionEvent::new(
                    ExecutionEventType::GroupStart,
                    format!("Running group {} of {group_count} with {} experts", index + 1, group.len()),
                    json!({ "group_index": index, "group_count": group_count, "experts": experts }),
                ),
            )
            .await;

            let finished = self.run_group(group, settings, session_id, &cancel, events).await;
            let count = |status: TaskStatus| finished.iter().filter(|t| t.status == status).count();
            let (completed, failed, queued) =
                (count(TaskStatus::Completed), count(TaskStatus::Failed), count(TaskStatus::Queued));
            debug!(session_id = %session_id, group = index, completed, failed, queued, "Group finished");
            emit(
                events,
                ExecutionEvent::new(
                    ExecutionEventType::GroupComplete,
                    format!("Group {} finished", index + 1),
                    json!({ "group_index": index, "completed": completed, "failed": failed, "queued": queued }),
                ),
            )
            .await;

            for task in &finished {
                summary.record(task);
            }
            tasks.extend(finished);
        }

        summary.finish(started.elapsed());
        info!(
            session_id = %session_id,
            completed = summary.completed,
            failed = summary.failed,
            queued = summary.queued,
            duration_ms = summary.total_duration_ms,
            "Parallel expert session finished"
        );
        emit(
            events,
            ExecutionEvent::new(
                ExecutionEventType::ExecutionComplete,
                format!("{} of {} experts completed", summary.completed, tasks.len()),
                serde_json::to_value(&summary).unwrap_or_default(),
            ),
        )
        .await;

        SessionReport { tasks, summary }
    }

    /// Runs a session in the background and streams its events.
    ///
    /// Must be called from within a Tokio runtime. The stream ends after the
    /// `execution_complete` event.
    pub fn execute_experts_in_parallel(
        self: &Arc<Self>,
        specs: Vec<ExpertTaskSpec>,
        settings: ExecutionSettings,
        session_id: impl Into<String>,
    ) -> ReceiverStream<ExecutionEvent> {
        let (tx, rx) = mpsc::channel(self.config.event_buffer.max(1));
        let executor = Arc::clone(self);
        let session_id = session_id.into();
        tokio::spawn(async move {
            executor.execute_session(specs, &settings, &session_id, Some(&tx)).await;
        });
        ReceiverStream::new(rx)
    }

    /// Why a task on `model` can never get a slot, if it cannot.
    fn placement_error(&self, model: &str) -> Option<HandlerError> {
        let Some(descriptor) = self.ledger.catalog().get(model) else {
            return Some(HandlerError::UnknownModel(model.to_string()));
        };
        let capacity = self.ledger.capacity_of(descriptor.category);
        (descriptor.concurrency_cost > capacity).then(|| HandlerError::NeverPlaceable {
            model: model.to_string(),
            cost: descriptor.concurrency_cost,
            capacity,
        })
    }

    async fn run_group(
        &self,
        group: Vec<ExpertExecutionTask>,
        settings: &ExecutionSettings,
        session_id: &str,
        cancel: &CancellationToken,
        events: EventSink<'_>,
    ) -> Vec<ExpertExecutionTask> {
        let mut finished = Vec::with_capacity(group.len());
        let mut runnable = Vec::with_capacity(group.len());

        for mut task in group {
            let error = match self.handlers.get(&task.role).await {
                Some(dispatch) => match self.placement_error(&task.model) {
                    None => {
                        runnable.push((task, dispatch));
                        continue;
                    }
                    Some(error) => error,
                },
                None => HandlerError::UnknownRole(task.role.clone()),
            };
            warn!(task_id = %task.task_id, role = %task.role, model = %task.model, error = %error, "Task cannot run");
            task.fail(error.to_string());
            emit(events, task_error_event(&task)).await;
            finished.push(task);
        }

        // Every reserved slot is owned by a guard before the next await point
        let pairs: Vec<(String, String)> =
            runnable.iter().map(|(t, _)| (t.task_id.clone(), t.model.clone())).collect();
        let mut slots: HashMap<String, SlotGuard> = self
            .ledger
            .batch_reserve_slots(&pairs)
            .into_iter()
            .map(|(task_id, model)| {
                let slot = self.ledger.adopt_slot(&model, &task_id);
                (task_id, slot)
            })
            .collect();

        let mut running = FuturesUnordered::new();
        for (mut task, dispatch) in runnable {
            let Some(slot) = slots.remove(&task.task_id) else {
                task.mark_queued(format!("no capacity for model '{}'", task.model));
                info!(task_id = %task.task_id, model = %task.model, "Task queued, no slot available");
                emit(
                    events,
                    ExecutionEvent::new(
                        ExecutionEventType::TaskQueued,
                        format!("Expert {} is waiting for capacity on {}", task.expert_id, task.model),
                        json!({ "task_id": task.task_id, "expert_id": task.expert_id, "model": task.model }),
                    ),
                )
                .await;
                finished.push(task);
                continue;
            };

            task.mark_running();
            let context = TaskContext {
                task_id: task.task_id.clone(),
                expert_id: task.expert_id.clone(),
                role: task.role.clone(),
                model: task.model.clone(),
                session_id: session_id.to_string(),
                payload: task.payload.clone(),
                enabled_tools: settings.enabled_tools.clone(),
            };
            let timeout = settings.task_timeout;
            let cancel = cancel.clone();

            let handle = tokio::spawn(async move {
                let _slot = slot;
                tokio::select! {
                    result = time::timeout(timeout, dispatch.dispatch(context)) => {
                        result.unwrap_or(Err(HandlerError::Timeout(timeout)))
                    }
                    () = cancel.cancelled() => Err(HandlerError::Cancelled),
                }
            });
            running.push(async move { (task, handle.await) });
        }

        while let Some((mut task, joined)) = running.next().await {
            let outcome = joined.unwrap_or_else(|e| Err(HandlerError::Panicked(e.to_string())));
            match outcome {
                Ok(response) => {
                    task.complete(response);
                    debug!(task_id = %task.task_id, expert_id = %task.expert_id, "Task completed");
                    emit(events, task_response_event(&task)).await;
                }
                Err(error) => {
                    warn!(task_id = %task.task_id, expert_id = %task.expert_id, error = %error, "Task failed");
                    task.fail(error.to_string());
                    emit(events, task_error_event(&task)).await;
                }
            }
            finished.push(task);
        }

        finished
    }
}

fn task_response_event(task: &ExpertExecutionTask) -> ExecutionEvent {
    let (content, tools_used, confidence) = task
        .result
        .as_ref()
        .map(|r| (r.response.clone(), r.tools_used.clone(), r.confidence))
        .unwrap_or_default();
    ExecutionEvent::new(
        ExecutionEventType::TaskResponse,
        content,
        json!({
            "task_id": task.task_id,
            "expert_id": task.expert_id,
            "role": task.role,
            "model": task.model,
            "tools_used": tools_used,
            "confidence": confidence,
            "duration_ms": task.duration().map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        }),
    )
}

fn task_error_event(task: &ExpertExecutionTask) -> ExecutionEvent {
    ExecutionEvent::new(
        ExecutionEventType::TaskError,
        task.error.clone().unwrap_or_default(),
        json!({ "task_id": task.task_id, "expert_id": task.expert_id, "model": task.model }),
    )
}

async fn emit(events: EventSink<'_>, event: ExecutionEvent) {
    if let Some(tx) = events {
        if tx.send(event).await.is_err() {
            debug!("Execution event receiver dropped");
        }
    }
}
