//! Queue manager: per-category priority queues and the request lifecycle.
//!
//! Requests wait in an [`OrderedQueue`] per category until the background
//! admission loop obtains a ledger slot for them. The slot guard lives in the
//! manager's active table, so whichever path retires a running request
//! (completion, failure, cancellation, shutdown) removes the entry and
//! releases the slot exactly once.

use super::ordered::OrderedQueue;
use super::request::{ModelRequest, QueueEvent, RequestRunner, RequestSpec, RequestStatus};
use super::stats::{QueueStats, QueueStatus};
use super::tuning::{self, TuningPolicy, WAIT_EMA_ALPHA};
use crate::catalog::ModelCategory;
use crate::config::QueueConfig;
use crate::error::{Result, SchedulerError};
use crate::ledger::{ResourceLedger, SlotGuard};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Outcome = Result<serde_json::Value>;

struct ActiveExecution {
    slot: SlotGuard,
    cancel: CancellationToken,
}

struct QueueState {
    queues: BTreeMap<ModelCategory, OrderedQueue>,
    /// Non-terminal requests.
    requests: HashMap<String, ModelRequest>,
    outcomes: HashMap<String, oneshot::Sender<Outcome>>,
    receivers: HashMap<String, oneshot::Receiver<Outcome>>,
    active: HashMap<String, ActiveExecution>,
    history: VecDeque<ModelRequest>,
    stats: QueueStats,
    avg_wait: Option<f64>,
    interval: Duration,
}

impl QueueState {
    fn new(interval: Duration) -> Self {
        Self {
            queues: ModelCategory::ALL.into_iter().map(|c| (c, OrderedQueue::new())).collect(),
            requests: HashMap::new(),
            outcomes: HashMap::new(),
            receivers: HashMap::new(),
            active: HashMap::new(),
            history: VecDeque::new(),
            stats: QueueStats {
                current_interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
                ..QueueStats::default()
            },
            avg_wait: None,
            interval,
        }
    }

    fn queue_mut(&mut self, category: ModelCategory) -> &mut OrderedQueue {
        self.queues.entry(category).or_default()
    }

    fn waiting(&self) -> usize {
        self.queues.values().map(OrderedQueue::len).sum()
    }

    /// Moves a request to its terminal state and resolves its result.
    fn retire(&mut self, id: &str, status: RequestStatus, outcome: Outcome, history_limit: usize) -> bool {
        let Some(mut request) = self.requests.remove(id) else {
            return false;
        };
        if !request.status.can_transition_to(status) {
            warn!(request_id = %id, from = ?request.status, to = ?status, "Invalid request transition");
            self.requests.insert(id.to_string(), request);
            return false;
        }

        request.status = status;
        request.completed_at = Some(Utc::now());
        request.error = outcome.as_ref().err().map(ToString::to_string);
        match status {
            RequestStatus::Completed => self.stats.completed_requests += 1,
            RequestStatus::Failed => self.stats.failed_requests += 1,
            RequestStatus::Cancelled => self.stats.cancelled_requests += 1,
            RequestStatus::Expired => self.stats.expired_requests += 1,
            RequestStatus::Waiting | RequestStatus::Running => {}
        }

        if let Some(tx) = self.outcomes.remove(id) {
            // Receiver may have been dropped by a caller that gave up
            let _ = tx.send(outcome);
        }

        self.history.push_back(request);
        while self.history.len() > history_limit {
            if let Some(old) = self.history.pop_front() {
                self.receivers.remove(&old.id);
            }
        }
        true
    }
}

struct Shared {
    config: QueueConfig,
    ledger: Arc<ResourceLedger>,
    runner: Arc<dyn RequestRunner>,
    state: tokio::sync::Mutex<QueueState>,
    events: broadcast::Sender<QueueEvent>,
}

impl Shared {
    fn emit(&self, event: QueueEvent) {
        debug!(event = ?event, "Queue event");
        let _ = self.events.send(event);
    }

    /// Cancels a waiting or running request while the state lock is held.
    fn cancel_locked(&self, state: &mut QueueState, id: &str, reason: &str) -> bool {
        let Some((status, category)) = state.requests.get(id).map(|r| (r.status, r.category)) else {
            return false;
        };

        match status {
            RequestStatus::Waiting => {
                state.queue_mut(category).remove(id);
            }
            RequestStatus::Running => {
                if let Some(active) = state.active.remove(id) {
                    // Slot goes back before the caller's result resolves
                    active.slot.release();
                    active.cancel.cancel();
                }
            }
            _ => return false,
        }

        let error = SchedulerError::RequestCancelled { request_id: id.to_string(), reason: reason.to_string() };
        if state.retire(id, RequestStatus::Cancelled, Err(error), self.config.history_limit) {
            info!(request_id = %id, reason = %reason, "Request cancelled");
            self.emit(QueueEvent::Cancelled { request_id: id.to_string() });
            true
        } else {
            false
        }
    }

    async fn admit_ready(self: &Arc<Self>) -> usize {
        let mut state = self.state.lock().await;
        let mut admitted = 0;

        for category in ModelCategory::ALL {
            loop {
                let Some(id) = state.queues.get(&category).and_then(OrderedQueue::peek).map(|(_, id)| id.to_string())
                else {
                    break;
                };
                let Some(model) = state.requests.get(&id).map(|r| r.model.clone()) else {
                    warn!(request_id = %id, "Dropping queue entry without a request record");
                    state.queue_mut(category).remove(&id);
                    continue;
                };

                // Head-of-line blocking: never skip ahead of the head request
                let slot = match self.ledger.try_reserve(&model, &id) {
                    Ok(slot) => slot,
                    Err(e) => {
                        debug!(category = %category, request_id = %id, error = %e, "Head of queue not admitted");
                        break;
                    }
                };

                state.queue_mut(category).pop();
                let now = Utc::now();
                let Some(request) = state.requests.get_mut(&id) else {
                    continue;
                };
                request.status = RequestStatus::Running;
                request.started_at = Some(now);
                let waited = request.waited(now).as_secs_f64();
                let snapshot = request.clone();

                let avg = tuning::ema(state.avg_wait, waited, WAIT_EMA_ALPHA);
                state.avg_wait = Some(avg);
                state.stats.average_wait_secs = avg;

                let cancel = CancellationToken::new();
                state.active.insert(id.clone(), ActiveExecution { slot, cancel: cancel.clone() });
                info!(request_id = %id, category = %category, waited_secs = waited, "Request admitted");
                self.emit(QueueEvent::Admitted { request_id: id, category });

                self.spawn_execution(snapshot, cancel);
                admitted += 1;
            }
        }

        admitted
    }

    fn spawn_execution(self: &Arc<Self>, request: ModelRequest, cancel: CancellationToken) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let runner = Arc::clone(&shared.runner);
            let task_request = request.clone();
            let run = tokio::spawn(async move { runner.run(&task_request).await });
            let abort = run.abort_handle();

            let result = tokio::select! {
                joined = run => match joined {
                    Ok(result) => result,
                    Err(e) => Err(format!("request runner aborted: {e}")),
                },
                () = cancel.cancelled() => {
                    abort.abort();
                    debug!(request_id = %request.id, "Execution stopped after cancellation");
                    return;
                }
            };

            shared.complete(&request.id, result).await;
        });
    }

    async fn complete(&self, id: &str, result: std::result::Result<serde_json::Value, String>) {
        let mut state = self.state.lock().await;
        let Some(active) = state.active.remove(id) else {
            debug!(request_id = %id, "Execution finished after request was retired");
            return;
        };
        active.slot.release();

        let limit = self.config.history_limit;
        match result {
            Ok(value) => {
                if state.retire(id, RequestStatus::Completed, Ok(value), limit) {
                    info!(request_id = %id, "Request completed");
                    self.emit(QueueEvent::Completed { request_id: id.to_string() });
                }
            }
            Err(error) => {
                warn!(request_id = %id, error = %error, "Request failed");
                if state.retire(id, RequestStatus::Failed, Err(SchedulerError::ExecutionError(error.clone())), limit) {
                    self.emit(QueueEvent::Failed { request_id: id.to_string(), error });
                }
            }
        }
    }

    async fn expire_stale(&self) -> usize {
        let Ok(max_wait) = chrono::Duration::from_std(self.config.max_wait()) else {
            return 0;
        };
        let now = Utc::now();
        let Some(cutoff) = now.checked_sub_signed(max_wait) else {
            return 0;
        };

        let mut state = self.state.lock().await;
        let mut expired = 0;
        for category in ModelCategory::ALL {
            let stale = state.queues.get(&category).map(|q| q.created_before(cutoff)).unwrap_or_default();
            for id in stale {
                state.queue_mut(category).remove(&id);
                let waited_secs = state.requests.get(&id).map_or(0, |r| r.waited(now).as_secs());
                let error = SchedulerError::RequestExpired { request_id: id.clone(), waited_secs };
                if state.retire(&id, RequestStatus::Expired, Err(error), self.config.history_limit) {
                    warn!(request_id = %id, category = %category, waited_secs, "Request expired");
                    self.emit(QueueEvent::Expired { request_id: id });
                    expired += 1;
                }
            }
        }
        expired
    }

    async fn retune(&self, policy: &TuningPolicy) {
        let mut state = self.state.lock().await;
        let next = tuning::next_interval(
            state.interval,
            state.avg_wait.unwrap_or(0.0),
            state.waiting(),
            state.active.len(),
            policy,
        );
        if next != state.interval {
            debug!(from_ms = state.interval.as_millis(), to_ms = next.as_millis(), "Admission interval retuned");
            state.interval = next;
            state.stats.current_interval_ms = u64::try_from(next.as_millis()).unwrap_or(u64::MAX);
        }
    }

    async fn run_loop(self: Arc<Self>, shutdown: CancellationToken) {
        info!("Queue manager admission loop started");
        let policy = TuningPolicy {
            min_interval: Duration::from_millis(self.config.min_interval_ms),
            max_interval: Duration::from_millis(self.config.max_interval_ms),
            high_wait: Duration::from_secs(self.config.high_wait_threshold_secs),
            ..TuningPolicy::default()
        };
        let mut last_sweep = Instant::now();

        loop {
            let interval = self.state.lock().await.interval;
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = time::sleep(interval) => {}
            }

            self.admit_ready().await;
            if last_sweep.elapsed() >= self.config.cleanup_interval() {
                self.expire_stale().await;
                last_sweep = Instant::now();
            }
            if self.config.adaptive_tuning {
                self.retune(&policy).await;
            }
        }

        info!("Queue manager admission loop stopped");
    }
}

struct LoopHandle {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// Admits, tracks and resolves model requests against the resource ledger.
pub struct QueueManager {
    shared: Arc<Shared>,
    loop_handle: Mutex<Option<LoopHandle>>,
}

impl fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueManager")
            .field("config", &self.shared.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl QueueManager {
    /// Creates a stopped queue manager.
    #[must_use]
    pub fn new(config: QueueConfig, ledger: Arc<ResourceLedger>, runner: Arc<dyn RequestRunner>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let state = QueueState::new(config.base_interval());
        Self {
            shared: Arc::new(Shared { config, ledger, runner, state: tokio::sync::Mutex::new(state), events }),
            loop_handle: Mutex::new(None),
        }
    }

    /// Starts the background admission loop.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// Returns `Lifecycle` if the loop is already running.
    pub fn start(&self) -> Result<()> {
        let mut handle = self.loop_handle.lock().unwrap_or_else(PoisonError::into_inner);
        if handle.is_some() {
            return Err(SchedulerError::Lifecycle("queue manager is already running".to_string()));
        }

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&self.shared).run_loop(shutdown.clone()));
        *handle = Some(LoopHandle { shutdown, task });
        Ok(())
    }

    /// Stops the admission loop and cancels every waiting or running request.
    ///
    /// # Errors
    /// Returns `Lifecycle` if the loop is not running.
    pub async fn stop(&self) -> Result<()> {
        let handle = self.loop_handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(LoopHandle { shutdown, task }) = handle else {
            return Err(SchedulerError::Lifecycle("queue manager is not running".to_string()));
        };

        shutdown.cancel();
        if let Err(e) = task.await {
            warn!(error = %e, "Admission loop ended abnormally");
        }

        let mut state = self.shared.state.lock().await;
        let pending: Vec<String> = state.requests.keys().cloned().collect();
        let mut cancelled = 0;
        for id in pending {
            if self.shared.cancel_locked(&mut state, &id, "queue manager stopped") {
                cancelled += 1;
            }
        }
        info!(cancelled, "Queue manager stopped");
        Ok(())
    }

    /// Whether the admission loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.loop_handle.lock().map(|h| h.is_some()).unwrap_or(false)
    }

    /// Queues a request for admission.
    ///
    /// When the category queue is full, the lowest-priority newest waiting
    /// request is evicted if the new request's priority is at least as high.
    ///
    /// # Errors
    /// Returns `UnknownModel` if the model is not in the catalog, or `QueueFull`
    /// if the queue is full and nothing can be evicted.
    pub async fn enqueue_request(&self, spec: RequestSpec) -> Result<String> {
        let category = self
            .shared
            .ledger
            .catalog()
            .category_of(&spec.model)
            .ok_or_else(|| SchedulerError::UnknownModel(spec.model.clone()))?;
        let request = ModelRequest::from_spec(spec, category);
        let id = request.id.clone();
        let limit = self.shared.config.max_queue_size;

        let mut state = self.shared.state.lock().await;
        let queued = state.queues.get(&category).map_or(0, OrderedQueue::len);
        if queued >= limit {
            let victim = state
                .queues
                .get(&category)
                .and_then(OrderedQueue::lowest)
                .map(|(key, victim_id)| (key.priority(), victim_id.to_string()));

            match victim {
                Some((victim_priority, victim_id)) if request.priority >= victim_priority => {
                    state.queue_mut(category).remove(&victim_id);
                    let error = SchedulerError::QueueFull { category, limit };
                    let history_limit = self.shared.config.history_limit;
                    if state.retire(&victim_id, RequestStatus::Cancelled, Err(error), history_limit) {
                        state.stats.evicted_requests += 1;
                        warn!(
                            request_id = %victim_id,
                            replaced_by = %id,
                            category = %category,
                            "Evicted lower-priority request from full queue"
                        );
                        self.shared.emit(QueueEvent::Evicted { request_id: victim_id, replaced_by: id.clone() });
                    }
                }
                _ => {
                    warn!(category = %category, limit, priority = request.priority, "Queue full, request rejected");
                    return Err(SchedulerError::QueueFull { category, limit });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        state.queue_mut(category).push(&id, request.priority, request.created_at);
        state.outcomes.insert(id.clone(), tx);
        state.receivers.insert(id.clone(), rx);
        let priority = request.priority;
        state.requests.insert(id.clone(), request);

        state.stats.total_requests += 1;
        let waiting = state.waiting();
        state.stats.peak_queue_length = state.stats.peak_queue_length.max(waiting);

        debug!(request_id = %id, category = %category, priority, "Request enqueued");
        self.shared.emit(QueueEvent::Enqueued { request_id: id.clone(), category, priority });
        Ok(id)
    }

    /// Waits for a request's terminal outcome.
    ///
    /// The outcome can be claimed once. If `timeout` elapses first, the
    /// request is cancelled and `Timeout` is returned.
    ///
    /// # Errors
    /// `UnknownRequest`, `Timeout`, or the request's own terminal error
    /// (`RequestCancelled`, `RequestExpired`, `QueueFull`, `ExecutionError`).
    pub async fn get_request_result(&self, request_id: &str, timeout: Duration) -> Result<serde_json::Value> {
        let receiver = self.shared.state.lock().await.receivers.remove(request_id);
        let Some(mut receiver) = receiver else {
            return Err(SchedulerError::UnknownRequest(request_id.to_string()));
        };

        match time::timeout(timeout, &mut receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(SchedulerError::RequestCancelled {
                request_id: request_id.to_string(),
                reason: "result channel closed".to_string(),
            }),
            Err(_) => {
                if self.cancel_request(request_id).await {
                    return Err(SchedulerError::Timeout { request_id: request_id.to_string(), timeout });
                }
                // Finished between the deadline and the cancel attempt
                match receiver.try_recv() {
                    Ok(outcome) => outcome,
                    Err(_) => Err(SchedulerError::Timeout { request_id: request_id.to_string(), timeout }),
                }
            }
        }
    }

    /// Cancels a waiting or running request.
    ///
    /// # Returns
    /// `true` if the request was cancelled; `false` if it is unknown or
    /// already terminal, in which case nothing changes.
    pub async fn cancel_request(&self, request_id: &str) -> bool {
        let mut state = self.shared.state.lock().await;
        self.shared.cancel_locked(&mut state, request_id, "cancelled by caller")
    }

    /// Looks up a live or recently retired request.
    pub async fn get_request(&self, request_id: &str) -> Option<ModelRequest> {
        let state = self.shared.state.lock().await;
        state
            .requests
            .get(request_id)
            .cloned()
            .or_else(|| state.history.iter().rev().find(|r| r.id == request_id).cloned())
    }

    /// Returns a serializable snapshot of queues, executions and counters.
    pub async fn get_queue_status(&self) -> QueueStatus {
        let running = self.is_running();
        let state = self.shared.state.lock().await;
        let queue_lengths: BTreeMap<ModelCategory, usize> =
            state.queues.iter().map(|(category, queue)| (*category, queue.len())).collect();

        QueueStatus {
            queue_length: queue_lengths.values().sum(),
            queue_lengths,
            active_executions: state.active.len(),
            running,
            stats: state.stats.clone(),
            resources: self.shared.ledger.get_resource_status(),
            captured_at: Utc::now(),
        }
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.shared.events.subscribe()
    }

    /// Runs one admission pass immediately.
    ///
    /// # Returns
    /// The number of requests admitted.
    pub async fn admit_ready(&self) -> usize {
        self.shared.admit_ready().await
    }

    /// Runs one expiry sweep immediately.
    ///
    /// # Returns
    /// The number of requests expired.
    pub async fn expire_stale(&self) -> usize {
        self.shared.expire_stale().await
    }
}

impl Drop for QueueManager {
    fn drop(&mut self) {
        if let Ok(mut handle) = self.loop_handle.lock() {
            if let Some(handle) = handle.take() {
                handle.shutdown.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ModelCatalog, ModelDescriptor};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoRunner {
        delay: Duration,
        calls: AtomicUsize,
    }

    impl EchoRunner {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self { delay, calls: AtomicUsize::new(0) })
        }
    }

    #[async_trait]
    impl RequestRunner for EchoRunner {
        async fn run(&self, request: &ModelRequest) -> std::result::Result<serde_json::Value, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            time::sleep(self.delay).await;
            if request.metadata.get("fail").is_some() {
                return Err("boom".to_string());
            }
            Ok(serde_json::json!({ "echo": request.agent_id }))
        }
    }

    fn fast_config() -> QueueConfig {
        QueueConfig {
            base_interval_ms: 10,
            min_interval_ms: 10,
            max_interval_ms: 10,
            cleanup_interval_secs: 0,
            adaptive_tuning: false,
            ..QueueConfig::default()
        }
    }

    fn ledger(large: u32) -> Arc<ResourceLedger> {
        let catalog = ModelCatalog::new([
            ModelDescriptor::new("big", ModelCategory::Large),
            ModelDescriptor::new("tiny", ModelCategory::Small),
        ]);
        let capacity = BTreeMap::from([(ModelCategory::Large, large), (ModelCategory::Small, 4)]);
        Arc::new(ResourceLedger::new(catalog, capacity))
    }

    fn spec(priority: u32) -> RequestSpec {
        RequestSpec::new("expert", "big", "user", "session").with_priority(priority)
    }

    #[tokio::test]
    async fn test_enqueue_unknown_model() {
        let manager = QueueManager::new(fast_config(), ledger(1), EchoRunner::new(Duration::ZERO));
        let err = manager.enqueue_request(RequestSpec::new("e", "ghost", "u", "s")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownModel(model) if model == "ghost"));
    }

    #[tokio::test]
    async fn test_admit_and_complete() {
        let runner = EchoRunner::new(Duration::from_millis(5));
        let manager = QueueManager::new(fast_config(), ledger(1), runner.clone());
        let id = manager.enqueue_request(spec(1)).await.unwrap();

        assert_eq!(manager.admit_ready().await, 1);
        let value = manager.get_request_result(&id, Duration::from_secs(2)).await.unwrap();
        assert_eq!(value["echo"], "expert");

        let request = manager.get_request(&id).await.unwrap();
        assert_eq!(request.status, RequestStatus::Completed);
        assert!(request.started_at.is_some());
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);

        let status = manager.get_queue_status().await;
        assert_eq!(status.stats.completed_requests, 1);
        assert_eq!(status.active_executions, 0);
        assert_eq!(status.resources.slots_held, 0);
    }

    #[tokio::test]
    async fn test_runner_failure_marks_failed() {
        let manager = QueueManager::new(fast_config(), ledger(1), EchoRunner::new(Duration::ZERO));
        let id = manager
            .enqueue_request(spec(1).with_metadata(serde_json::json!({ "fail": true })))
            .await
            .unwrap();
        manager.admit_ready().await;

        let err = manager.get_request_result(&id, Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::ExecutionError(msg) if msg == "boom"));
        assert_eq!(manager.get_request(&id).await.unwrap().status, RequestStatus::Failed);
        assert_eq!(manager.get_queue_status().await.resources.slots_held, 0);
    }

    #[tokio::test]
    async fn test_head_of_line_is_not_skipped() {
        let manager = QueueManager::new(fast_config(), ledger(0), EchoRunner::new(Duration::ZERO));
        manager.enqueue_request(spec(5)).await.unwrap();
        manager.enqueue_request(RequestSpec::new("e", "tiny", "u", "s")).await.unwrap();

        // Large has no capacity; small is an independent pool
        assert_eq!(manager.admit_ready().await, 1);
        let status = manager.get_queue_status().await;
        assert_eq!(status.queue_lengths[&ModelCategory::Large], 1);
        assert_eq!(status.queue_lengths[&ModelCategory::Small], 0);
    }

    #[tokio::test]
    async fn test_cancel_waiting_request() {
        let manager = QueueManager::new(fast_config(), ledger(0), EchoRunner::new(Duration::ZERO));
        let id = manager.enqueue_request(spec(1)).await.unwrap();

        assert!(manager.cancel_request(&id).await);
        assert!(!manager.cancel_request(&id).await);

        let err = manager.get_request_result(&id, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::RequestCancelled { .. }));
        assert_eq!(manager.get_queue_status().await.queue_length, 0);
    }

    #[tokio::test]
    async fn test_cancel_running_request_releases_slot() {
        let ledger = ledger(1);
        let manager = QueueManager::new(fast_config(), Arc::clone(&ledger), EchoRunner::new(Duration::from_secs(30)));
        let id = manager.enqueue_request(spec(1)).await.unwrap();
        manager.admit_ready().await;
        assert!(ledger.holds("big", &id));

        assert!(manager.cancel_request(&id).await);
        assert!(!ledger.holds("big", &id));
        assert_eq!(manager.get_request(&id).await.unwrap().status, RequestStatus::Cancelled);
        assert_eq!(manager.get_queue_status().await.active_executions, 0);
    }

    #[tokio::test]
    async fn test_result_timeout_cancels() {
        let manager = QueueManager::new(fast_config(), ledger(0), EchoRunner::new(Duration::ZERO));
        let id = manager.enqueue_request(spec(1)).await.unwrap();

        let err = manager.get_request_result(&id, Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Timeout { .. }));
        assert_eq!(manager.get_request(&id).await.unwrap().status, RequestStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_result_claimed_once() {
        let manager = QueueManager::new(fast_config(), ledger(0), EchoRunner::new(Duration::ZERO));
        let id = manager.enqueue_request(spec(1)).await.unwrap();
        manager.cancel_request(&id).await;

        assert!(manager.get_request_result(&id, Duration::from_millis(10)).await.is_err());
        assert!(matches!(
            manager.get_request_result(&id, Duration::from_millis(10)).await,
            Err(SchedulerError::UnknownRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_eviction_when_full() {
        let config = QueueConfig { max_queue_size: 2, ..fast_config() };
        let manager = QueueManager::new(config, ledger(0), EchoRunner::new(Duration::ZERO));
        let low = manager.enqueue_request(spec(1)).await.unwrap();
        let mid = manager.enqueue_request(spec(2)).await.unwrap();

        // Lower than everything queued: rejected
        assert!(matches!(manager.enqueue_request(spec(0)).await, Err(SchedulerError::QueueFull { limit: 2, .. })));

        let high = manager.enqueue_request(spec(3)).await.unwrap();
        let err = manager.get_request_result(&low, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::QueueFull { .. }));

        let status = manager.get_queue_status().await;
        assert_eq!(status.queue_length, 2);
        assert_eq!(status.stats.evicted_requests, 1);
        assert_eq!(manager.get_request(&mid).await.unwrap().status, RequestStatus::Waiting);
        assert_eq!(manager.get_request(&high).await.unwrap().status, RequestStatus::Waiting);
    }

    #[tokio::test]
    async fn test_expire_stale_with_zero_wait() {
        let config = QueueConfig { max_wait_time_minutes: 0, ..fast_config() };
        let manager = QueueManager::new(config, ledger(0), EchoRunner::new(Duration::ZERO));
        let id = manager.enqueue_request(spec(1)).await.unwrap();
        time::sleep(Duration::from_millis(5)).await;

        assert_eq!(manager.expire_stale().await, 1);
        let err = manager.get_request_result(&id, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::RequestExpired { .. }));
        assert_eq!(manager.get_queue_status().await.stats.expired_requests, 1);
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let manager = QueueManager::new(fast_config(), ledger(0), EchoRunner::new(Duration::ZERO));
        assert!(!manager.is_running());
        manager.start().unwrap();
        assert!(manager.is_running());
        assert!(matches!(manager.start(), Err(SchedulerError::Lifecycle(_))));

        let id = manager.enqueue_request(spec(1)).await.unwrap();
        manager.stop().await.unwrap();
        assert!(!manager.is_running());
        assert!(matches!(manager.stop().await, Err(SchedulerError::Lifecycle(_))));

        let err = manager.get_request_result(&id, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::RequestCancelled { .. }));
    }

    #[tokio::test]
    async fn test_history_limit_bounds_records() {
        let config = QueueConfig { history_limit: 1, ..fast_config() };
        let manager = QueueManager::new(config, ledger(0), EchoRunner::new(Duration::ZERO));
        let first = manager.enqueue_request(spec(1)).await.unwrap();
        let second = manager.enqueue_request(spec(1)).await.unwrap();
        manager.cancel_request(&first).await;
        manager.cancel_request(&second).await;

        assert!(manager.get_request(&first).await.is_none());
        assert!(manager.get_request(&second).await.is_some());
        assert!(matches!(
            manager.get_request_result(&first, Duration::from_millis(10)).await,
            Err(SchedulerError::UnknownRequest(_))
        ));
    }
}
