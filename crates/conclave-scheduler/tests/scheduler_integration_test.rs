//! Integration tests for queue admission, expiry and shared capacity
//!
//! Drives a full `Scheduler` with its admission loop running and checks the
//! observable ordering and capacity guarantees end to end.

use async_trait::async_trait;
use conclave_scheduler::{
    ExecutionSettings, ExpertHandler, ExpertResponse, ExpertTaskSpec, HandlerError, HandlerRegistry, ModelCategory,
    ModelDescriptor, ModelRequest, QueueConfig, QueueEvent, RequestRunner, RequestSpec, RequestStatus, Scheduler,
    SchedulerConfig, SchedulerError, TaskContext,
};
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::time::{sleep, Duration};

/// Runner that records how many requests run at once
struct TrackingRunner {
    delay: Duration,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl TrackingRunner {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self { delay, current: AtomicUsize::new(0), peak: AtomicUsize::new(0) })
    }
}

#[async_trait]
impl RequestRunner for TrackingRunner {
    async fn run(&self, request: &ModelRequest) -> Result<serde_json::Value, String> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        sleep(self.delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(serde_json::json!({ "request_id": request.id }))
    }
}

struct EchoHandler;

#[async_trait]
impl ExpertHandler for EchoHandler {
    async fn handle(&self, context: &TaskContext) -> Result<ExpertResponse, HandlerError> {
        sleep(Duration::from_millis(5)).await;
        Ok(ExpertResponse { response: format!("{} done", context.expert_id), tools_used: Vec::new(), confidence: 1.0 })
    }
}

fn fast_queue() -> QueueConfig {
    QueueConfig {
        base_interval_ms: 10,
        min_interval_ms: 10,
        max_interval_ms: 50,
        cleanup_interval_secs: 0,
        adaptive_tuning: false,
        ..QueueConfig::default()
    }
}

fn config(large: u32, queue: QueueConfig) -> SchedulerConfig {
    SchedulerConfig { queue, ..SchedulerConfig::default() }
        .with_capacity(ModelCategory::Large, large)
        .with_model(ModelDescriptor::new("big", ModelCategory::Large))
        .with_model(ModelDescriptor::new("small", ModelCategory::Small))
}

async fn scheduler(large: u32, queue: QueueConfig, runner: Arc<TrackingRunner>) -> Scheduler {
    let handlers = HandlerRegistry::new();
    handlers.register_standard("analyst", Arc::new(EchoHandler)).await;
    Scheduler::new(config(large, queue), runner, handlers).unwrap()
}

fn request(priority: u32) -> RequestSpec {
    RequestSpec::new("expert", "big", "user-1", "session-1").with_priority(priority)
}

/// Priorities [1,1,3,2,1] with capacity 2 are admitted 3, 2, then the 1s in arrival order
#[tokio::test]
async fn test_admission_order_by_priority_then_arrival() {
    let runner = TrackingRunner::new(Duration::from_millis(30));
    let scheduler = scheduler(2, fast_queue(), runner.clone()).await;
    let mut events = scheduler.queue().subscribe();

    let mut ids = Vec::new();
    for priority in [1, 1, 3, 2, 1] {
        ids.push(scheduler.queue().enqueue_request(request(priority)).await.unwrap());
    }
    scheduler.start().unwrap();

    for id in &ids {
        scheduler.queue().get_request_result(id, Duration::from_secs(5)).await.unwrap();
    }

    let mut admitted = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let QueueEvent::Admitted { request_id, .. } = event {
            admitted.push(request_id);
        }
    }
    let expected: Vec<String> = [2, 3, 0, 1, 4].iter().map(|&i| ids[i].clone()).collect();
    assert_eq!(admitted, expected);
    assert!(runner.peak.load(Ordering::SeqCst) <= 2);

    scheduler.stop().await.unwrap();
}

/// Zero capacity with a zero wait budget expires on the next sweep
#[tokio::test]
async fn test_zero_capacity_requests_expire() {
    let queue = QueueConfig { max_wait_time_minutes: 0, ..fast_queue() };
    let scheduler = scheduler(0, queue, TrackingRunner::new(Duration::ZERO)).await;
    scheduler.start().unwrap();

    let id = scheduler.queue().enqueue_request(request(1)).await.unwrap();
    let err = scheduler.queue().get_request_result(&id, Duration::from_secs(2)).await.unwrap_err();
    assert!(matches!(err, SchedulerError::RequestExpired { .. }), "unexpected error: {err}");

    let record = scheduler.queue().get_request(&id).await.unwrap();
    assert_eq!(record.status, RequestStatus::Expired);
    scheduler.stop().await.unwrap();
}

/// Requests against zero capacity stay queued and nothing runs
#[tokio::test]
async fn test_zero_capacity_keeps_requests_waiting() {
    let runner = TrackingRunner::new(Duration::ZERO);
    let scheduler = scheduler(0, fast_queue(), runner.clone()).await;
    scheduler.start().unwrap();

    for _ in 0..7 {
        scheduler.queue().enqueue_request(request(1)).await.unwrap();
    }
    sleep(Duration::from_millis(60)).await;

    let status = scheduler.queue().get_queue_status().await;
    assert_eq!(status.queue_length, 7);
    assert_eq!(status.queue_lengths[&ModelCategory::Large], 7);
    assert_eq!(status.active_executions, 0);
    assert!(status.running);
    assert_eq!(runner.peak.load(Ordering::SeqCst), 0);

    // Stopping resolves every waiting request
    scheduler.stop().await.unwrap();
    let status = scheduler.queue().get_queue_status().await;
    assert_eq!(status.queue_length, 0);
    assert_eq!(status.stats.cancelled_requests, 7);
}

/// Every request reaches exactly one terminal state and capacity holds under load
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_request_terminates_under_load() {
    let runner = TrackingRunner::new(Duration::from_millis(5));
    let scheduler = Arc::new(scheduler(2, fast_queue(), runner.clone()).await);
    scheduler.start().unwrap();

    let mut handles = Vec::new();
    for i in 0..24u32 {
        let scheduler = Arc::clone(&scheduler);
        handles.push(tokio::spawn(async move {
            let id = scheduler.queue().enqueue_request(request(i % 4)).await.unwrap();
            if i % 5 == 0 {
                scheduler.queue().cancel_request(&id).await;
            }
            let outcome = scheduler.queue().get_request_result(&id, Duration::from_secs(10)).await;
            (id, outcome.is_ok())
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        let (id, ok) = handle.await.unwrap();
        let record = scheduler.queue().get_request(&id).await.unwrap();
        assert!(record.status.is_terminal(), "{id} left in {:?}", record.status);
        assert!(!scheduler.queue().cancel_request(&id).await);
        if ok {
            succeeded += 1;
            assert_eq!(record.status, RequestStatus::Completed);
        }
    }

    let status = scheduler.queue().get_queue_status().await;
    let stats = &status.stats;
    assert_eq!(stats.total_requests, 24);
    assert_eq!(stats.completed_requests + stats.cancelled_requests, 24);
    assert_eq!(stats.completed_requests, succeeded);
    assert_eq!(status.resources.slots_held, 0);
    assert!(runner.peak.load(Ordering::SeqCst) <= 2);

    scheduler.stop().await.unwrap();
}

/// The queue and a parallel session draw on the same ledger
#[tokio::test]
async fn test_session_shares_ledger_with_queue() {
    let runner = TrackingRunner::new(Duration::from_secs(30));
    let scheduler = scheduler(1, fast_queue(), runner).await;
    let id = scheduler.queue().enqueue_request(request(1)).await.unwrap();
    assert_eq!(scheduler.queue().admit_ready().await, 1);
    assert!(scheduler.ledger().holds("big", &id));

    let specs = vec![ExpertTaskSpec::new("a", "analyst", "big"), ExpertTaskSpec::new("b", "analyst", "small")];
    let report = scheduler.executor().execute_session(specs, &ExecutionSettings::default(), "s1", None).await;

    assert_eq!(report.summary.queued, 1);
    assert_eq!(report.summary.completed, 1);

    assert!(scheduler.queue().cancel_request(&id).await);
    assert_eq!(scheduler.ledger().get_resource_status().slots_held, 0);
}

#[tokio::test]
async fn test_scheduler_from_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[capacity]
large = 1
small = 2

[queue]
base_interval_ms = 20
min_interval_ms = 10
max_interval_ms = 40

[[models]]
name = "llama-3-70b"
category = "large"

[[models]]
name = "phi-3"
category = "small"
concurrency_cost = 2
"#
    )
    .unwrap();

    let config = SchedulerConfig::load(file.path()).unwrap();
    let scheduler = Scheduler::new(config, TrackingRunner::new(Duration::ZERO), HandlerRegistry::new()).unwrap();

    assert_eq!(scheduler.ledger().catalog().len(), 2);
    assert_eq!(scheduler.ledger().capacity_of(ModelCategory::Medium), 0);
    assert!(scheduler.ledger().check_execution_availability("phi-3").available);
    assert!(!scheduler.ledger().check_execution_availability("unknown").available);
}

#[tokio::test]
async fn test_scheduler_rejects_invalid_config() {
    let bad = SchedulerConfig {
        queue: QueueConfig { min_interval_ms: 3_000, ..QueueConfig::default() },
        ..SchedulerConfig::default()
    };
    let result = Scheduler::new(bad, TrackingRunner::new(Duration::ZERO), HandlerRegistry::new());
    assert!(matches!(result, Err(SchedulerError::Config(_))));
}
