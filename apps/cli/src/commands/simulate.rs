//! Simulate command implementation.
//!
//! Runs a scheduler end to end with collaborators that echo their input
//! after a fixed delay.

use anyhow::{bail, Context};
use async_trait::async_trait;
use conclave_scheduler::{
    ExpertHandler, ExpertResponse, ExpertTaskSpec, HandlerError, HandlerRegistry, ModelCategory,
    ModelDescriptor, ModelRequest, RequestRunner, RequestSpec, Scheduler, SchedulerConfig, TaskContext,
};
use futures::StreamExt;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::info;

const RESULT_TIMEOUT: Duration = Duration::from_secs(120);

struct EchoRunner {
    work: Duration,
}

#[async_trait]
impl RequestRunner for EchoRunner {
    async fn run(&self, request: &ModelRequest) -> Result<serde_json::Value, String> {
        sleep(self.work).await;
        Ok(json!({
            "expert_id": request.agent_id,
            "model": request.model,
            "priority": request.priority,
        }))
    }
}

struct EchoHandler {
    work: Duration,
}

#[async_trait]
impl ExpertHandler for EchoHandler {
    async fn handle(&self, context: &TaskContext) -> Result<ExpertResponse, HandlerError> {
        sleep(self.work).await;
        Ok(ExpertResponse {
            response: format!("{} ({}) reviewed the request on {}", context.expert_id, context.role, context.model),
            tools_used: context.enabled_tools.iter().take(1).cloned().collect(),
            confidence: 0.75,
        })
    }
}

fn demo_config() -> SchedulerConfig {
    let mut config = SchedulerConfig::default()
        .with_model(ModelDescriptor::new("llama-3-70b", ModelCategory::Large))
        .with_model(ModelDescriptor::new("mixtral-8x7b", ModelCategory::Medium))
        .with_model(ModelDescriptor::new("phi-3-mini", ModelCategory::Small));
    config.queue.base_interval_ms = 50;
    config.queue.min_interval_ms = 20;
    config.queue.max_interval_ms = 200;
    config
}

fn print_line(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

/// Execute the simulate command.
pub async fn execute(config: Option<&Path>, requests: usize, tasks: usize, work: Duration) -> anyhow::Result<()> {
    let config = match config {
        Some(path) => SchedulerConfig::load(path).with_context(|| format!("failed to load {}", path.display()))?,
        None => demo_config(),
    };
    let models: Vec<String> = config.catalog().descriptors().into_iter().map(|m| m.name.clone()).collect();
    if models.is_empty() {
        bail!("configuration declares no models to simulate");
    }

    let handlers = HandlerRegistry::new();
    handlers.register_tool_augmented("researcher", Arc::new(EchoHandler { work })).await;
    handlers.register_standard("reviewer", Arc::new(EchoHandler { work })).await;

    let scheduler = Scheduler::new(config, Arc::new(EchoRunner { work }), handlers)?;
    scheduler.start()?;
    info!(requests, tasks, models = models.len(), "Starting simulation");

    let mut ids = Vec::with_capacity(requests);
    for i in 0..requests {
        let spec = RequestSpec::new(format!("expert-{i}"), models[i % models.len()].clone(), "simulator", "sim-session")
            .with_priority(u32::try_from(i % 3).unwrap_or(0) + 1);
        match scheduler.queue().enqueue_request(spec).await {
            Ok(id) => ids.push(id),
            Err(e) => print_line(&json!({ "type": "enqueue_error", "error": e.to_string() }))?,
        }
    }

    for id in &ids {
        let line = match scheduler.queue().get_request_result(id, RESULT_TIMEOUT).await {
            Ok(result) => json!({ "type": "request_result", "request_id": id, "result": result }),
            Err(e) => json!({ "type": "request_error", "request_id": id, "error": e.to_string() }),
        };
        print_line(&line)?;
    }
    print_line(&json!({ "type": "queue_status", "status": scheduler.queue().get_queue_status().await }))?;

    let roles = ["researcher", "reviewer"];
    let specs: Vec<ExpertTaskSpec> = (0..tasks)
        .map(|i| ExpertTaskSpec::new(format!("expert-{i}"), roles[i % roles.len()], models[i % models.len()].clone()))
        .collect();
    let settings = scheduler.executor().default_settings().with_tools(["web_search", "calculator"]);
    let mut events = scheduler.executor().execute_experts_in_parallel(specs, settings, "sim-session");
    while let Some(event) = events.next().await {
        print_line(&serde_json::to_value(&event)?)?;
    }

    scheduler.stop().await?;
    info!("Simulation finished");
    Ok(())
}
