use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use mapreduce_ft::mr::config::CoordinatorConfig;
use mapreduce_ft::mr::coordinator as cd;
use mapreduce_ft::util::log;
use tracing::error;

/// Serves map and reduce tasks for one job until every reduce partition is done.
#[derive(Parser, Debug)]
#[command(name = "mrcoordinator")]
struct Args {
    /// Address to listen on; defaults to a loopback port derived from the uid.
    #[arg(long, env = "MR_ADDR")]
    addr: Option<SocketAddr>,

    /// Number of reduce partitions.
    #[arg(short = 'r', long, env = "MR_N_REDUCE", default_value_t = 10)]
    n_reduce: u32,

    #[arg(long, env = "MR_TASK_TIMEOUT_MS", default_value_t = 10_000)]
    task_timeout_ms: u64,

    #[arg(long, env = "MR_SWEEP_INTERVAL_MS", default_value_t = 2_000)]
    sweep_interval_ms: u64,

    #[arg(long, env = "MR_SHUTDOWN_GRACE_MS", default_value_t = 3_000)]
    shutdown_grace_ms: u64,

    /// Input files, one map task each.
    #[arg(required = true)]
    files: Vec<String>,
}

#[tokio::main]
async fn main() {
    log::init();
    let args = Args::parse();

    let mut config = CoordinatorConfig {
        n_reduce: args.n_reduce,
        task_timeout: Duration::from_millis(args.task_timeout_ms),
        sweep_interval: Duration::from_millis(args.sweep_interval_ms),
        shutdown_grace: Duration::from_millis(args.shutdown_grace_ms),
        ..Default::default()
    };
    if let Some(addr) = args.addr {
        config.addr = addr;
    }

    if let Err(e) = cd::MutexMRCoordinator::run(args.files, config).await {
        error!("coordinator failed: {:#}", e);
        std::process::exit(1);
    }
}
