//! Submits a single `square` job through the client call fabric and prints
//! the result, or the error kind if the call failed.

use clap::Parser;
use dispatch_client::{ClientFabric, ClientFabricConfig};
use dispatch_protocol::Job;

#[derive(Parser, Debug)]
#[command(name = "demo-client", about = "Submit a square job to the broker")]
struct Cli {
    #[arg(long, env = "DISPATCH_FRONTEND", default_value = "ipc:///tmp/master-routing.ipc")]
    frontend: String,

    /// Value to square.
    #[arg(default_value_t = 7)]
    n: i64,

    #[arg(long, default_value_t = 1000)]
    soft_timeout_ms: u64,

    #[arg(long, default_value_t = 1500)]
    hard_timeout_ms: u64,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    dispatch_logging::init_logging(dispatch_logging::LogConfig {
        app_name: "demo-client",
        verbose: false,
    })?;

    let config = ClientFabricConfig {
        endpoint: cli.frontend,
        soft_timeout: std::time::Duration::from_millis(cli.soft_timeout_ms),
        hard_timeout: std::time::Duration::from_millis(cli.hard_timeout_ms),
        overflow_budget: 1,
    };
    let fabric = ClientFabric::connect_with_config(config)?;

    let job = Job::new("square", vec![cli.n.to_string().into_bytes()]);
    match fabric.execute(&job) {
        Ok(result) => {
            println!("{}", String::from_utf8_lossy(&result));
        }
        Err(e) => {
            eprintln!("job failed: {}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}
