//! Check command implementation.

use anyhow::Context;
use colored::Colorize;
use conclave_scheduler::{ModelCategory, SchedulerConfig};
use serde_json::json;
use std::path::Path;

/// Execute the check command.
///
/// Loads and validates the configuration, then prints what it declares.
pub fn execute(path: &Path, json_output: bool) -> anyhow::Result<()> {
    let config = SchedulerConfig::load(path).with_context(|| format!("failed to load {}", path.display()))?;
    if json_output { print_json(&config) } else { print_human(path, &config) }
}

fn print_human(path: &Path, config: &SchedulerConfig) -> anyhow::Result<()> {
    let catalog = config.catalog();
    println!("{} {}", "Configuration OK:".bold().green(), path.display());
    println!();

    println!("{}", "Capacity:".bold());
    for category in ModelCategory::ALL {
        let units = config.capacity.get(&category).copied().unwrap_or(0);
        let rendered = if units == 0 { units.to_string().yellow() } else { units.to_string().green() };
        println!("  {:<8} {} units", category.as_str().cyan(), rendered);
    }
    println!();

    println!("{}", "Models:".bold());
    if catalog.is_empty() {
        println!("  {}", "No models configured".yellow());
    }
    for model in catalog.descriptors() {
        println!("  {:<24} {:<8} cost {}", model.name, model.category.as_str().cyan(), model.concurrency_cost);
    }
    println!();

    let queue = &config.queue;
    println!("{}", "Queue:".bold());
    println!("  max size per category: {}", queue.max_queue_size);
    println!("  max wait: {} min", queue.max_wait_time_minutes);
    println!(
        "  admission interval: {} ms ({}..{} ms, adaptive {})",
        queue.base_interval_ms, queue.min_interval_ms, queue.max_interval_ms, queue.adaptive_tuning
    );
    println!("  task timeout: {} s", config.executor.task_timeout_secs);
    Ok(())
}

fn print_json(config: &SchedulerConfig) -> anyhow::Result<()> {
    let report = json!({
        "valid": true,
        "capacity": config.capacity,
        "models": config.catalog().descriptors(),
        "queue": config.queue,
        "executor": config.executor,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
