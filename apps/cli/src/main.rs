//! Conclave CLI - inspect scheduler configurations and run simulated workloads
//!
//! Provides a `conclave` command that validates a TOML configuration and
//! drives a full scheduler with echo collaborators.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::time::Duration;
use tracing_subscriber::EnvFilter;

/// Conclave - bounded-concurrency scheduling for expert model tasks
#[derive(Parser, Debug)]
#[command(
    name = "conclave",
    author,
    version,
    about = "Conclave - bounded-concurrency scheduling for expert model tasks"
)]
struct Args {
    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides it
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a configuration file
    ///
    /// Parses and validates the TOML file, then prints the model catalog
    /// and per-category capacities.
    Check {
        /// Path to the TOML configuration
        #[arg(short, long)]
        config: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a simulated workload
    ///
    /// Pushes requests with cycling priorities through the queue manager,
    /// then runs a parallel expert session, printing results and events as
    /// JSON lines.
    Simulate {
        /// Path to the TOML configuration (a built-in demo catalog if omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of queued model requests
        #[arg(long, default_value_t = 8)]
        requests: usize,

        /// Number of expert tasks in the parallel session
        #[arg(long, default_value_t = 5)]
        tasks: usize,

        /// Simulated work per request or task, in milliseconds
        #[arg(long, default_value_t = 50)]
        work_ms: u64,
    },
}

fn init_tracing(level: &str, json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    // stdout carries command output; logs go to stderr
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).with_target(false);
    let installed = if json { builder.json().try_init() } else { builder.without_time().try_init() };
    installed.map_err(|e| anyhow::anyhow!(e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level, args.json_logs)?;

    match args.command {
        Command::Check { config, json } => commands::check::execute(&config, json),
        Command::Simulate { config, requests, tasks, work_ms } => {
            commands::simulate::execute(config.as_deref(), requests, tasks, Duration::from_millis(work_ms)).await
        }
    }
}
