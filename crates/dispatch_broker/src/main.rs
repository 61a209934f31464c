use std::time::Duration;

use clap::Parser;
use dispatch_broker::{Broker, BrokerConfig};
use dispatch_logging::{init_logging, LogConfig};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "dispatch-broker", about = "Job dispatch broker")]
struct Cli {
    /// ZeroMQ endpoint clients and workers exchange jobs over.
    #[arg(long, env = "DISPATCH_FRONTEND", default_value = "ipc:///tmp/master-routing.ipc")]
    frontend: String,

    /// ZeroMQ endpoint workers register and send heartbeats on.
    #[arg(long, env = "DISPATCH_REGISTRATION", default_value = "ipc://master-routing.ipc")]
    registration: String,

    /// Attempts made per job before giving up (first attempt plus retries).
    #[arg(long, env = "DISPATCH_RETRIES", default_value_t = 3)]
    retries: u32,

    /// Milliseconds to wait for a worker's reply before evicting it.
    #[arg(long, env = "DISPATCH_TIMEOUT_MS", default_value_t = 2000)]
    dispatch_timeout_ms: u64,

    /// Milliseconds to wait for an idle worker before requeueing a job.
    #[arg(long, env = "DISPATCH_ACQUISITION_TIMEOUT_MS", default_value_t = 500)]
    acquisition_timeout_ms: u64,

    /// Maximum number of workers the registry will accept.
    #[arg(long, env = "DISPATCH_MAX_WORKERS", default_value_t = 256)]
    max_workers: usize,

    /// Seconds of silence before a worker is considered dead.
    #[arg(long, env = "DISPATCH_WORKER_TIMEOUT_SECS", default_value_t = 15)]
    worker_timeout_secs: u64,

    /// Seconds between stale-worker sweeps.
    #[arg(long, env = "DISPATCH_CLEANUP_INTERVAL_SECS", default_value_t = 5)]
    cleanup_interval_secs: u64,

    /// Emit debug-level logs.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(LogConfig {
        app_name: "dispatch-broker",
        verbose: cli.verbose,
    })?;

    info!("Starting dispatch broker");

    let config = BrokerConfig {
        frontend: cli.frontend,
        registration_endpoint: cli.registration,
        retries: cli.retries,
        dispatch_timeout: Duration::from_millis(cli.dispatch_timeout_ms),
        acquisition_timeout: Duration::from_millis(cli.acquisition_timeout_ms),
        max_workers: cli.max_workers,
        worker_timeout: Duration::from_secs(cli.worker_timeout_secs),
        cleanup_interval: Duration::from_secs(cli.cleanup_interval_secs),
    };

    let mut broker = Broker::bind(config)?;
    broker.run()
}
